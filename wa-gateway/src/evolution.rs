use crate::error::{GatewayError, Result};
use crate::traits::MessagingGateway;
use crate::types::{ChatId, MessageId, SentMessage};
use serde::Deserialize;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for one Evolution API instance.
#[derive(Clone)]
pub struct EvolutionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    instance: String,
}

impl EvolutionClient {
    pub fn new(base_url: &str, api_key: &str, instance: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(GatewayError::InvalidInput(
                "evolution api url is required".to_string(),
            ));
        }
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(GatewayError::InvalidInput(
                "evolution api key is required".to_string(),
            ));
        }
        let instance = instance.trim();
        if instance.is_empty() {
            return Err(GatewayError::InvalidInput(
                "evolution instance is required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key: api_key.to_string(),
            instance: instance.to_string(),
        })
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, path, self.instance)
    }

    async fn post(&self, path: &str, payload: &serde_json::Value) -> Result<String> {
        let response = self
            .http
            .post(self.url(path))
            .header("apikey", &self.api_key)
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl MessagingGateway for EvolutionClient {
    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %to))]
    async fn send_text(&self, to: &ChatId, text: &str) -> Result<SentMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GatewayError::InvalidInput(
                "message text is empty".to_string(),
            ));
        }
        let payload = serde_json::json!({
            "number": to.as_str(),
            "text": text,
        });
        let body = self.post("message/sendText", &payload).await?;
        Ok(parse_sent_message(&body))
    }

    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %to))]
    async fn set_typing(&self, to: &ChatId, duration: Duration) -> Result<()> {
        let payload = serde_json::json!({
            "number": to.as_str(),
            "presence": "composing",
            "delay": duration.as_millis() as u64,
        });
        self.post("chat/presence", &payload).await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all, fields(chat_id = %chat))]
    async fn mark_read(&self, chat: &ChatId, message_id: &MessageId) -> Result<()> {
        let payload = serde_json::json!({
            "readMessages": [
                {
                    "remoteJid": chat.as_str(),
                    "fromMe": false,
                    "id": message_id.as_str(),
                }
            ]
        });
        self.post("chat/markMessageAsRead", &payload).await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SendTextResponse {
    #[serde(default)]
    key: Option<SentKey>,
}

#[derive(Debug, Deserialize)]
struct SentKey {
    #[serde(default)]
    id: Option<String>,
}

// The send succeeded once the status is 2xx; a body we cannot read only loses the id.
fn parse_sent_message(body: &str) -> SentMessage {
    let message_id = serde_json::from_str::<SendTextResponse>(body)
        .ok()
        .and_then(|r| r.key)
        .and_then(|k| k.id)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .map(MessageId::new);
    SentMessage { message_id }
}
