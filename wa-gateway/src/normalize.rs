use crate::types::{ChatId, IncomingMessage, MessageId, Origin};
use serde::Deserialize;
use serde_json::Value;

pub const MESSAGES_UPSERT: &str = "messages.upsert";

const STATUS_BROADCAST_JID: &str = "status@broadcast";

/// Envelope of an Evolution API webhook event.
///
/// Only the fields the relay looks at are typed; `data` stays raw until the
/// event is known to carry a message.
#[derive(Debug, Clone, Deserialize)]
pub struct EvolutionWebhook {
    #[serde(default)]
    pub event: String,
    #[serde(default)]
    pub instance: Option<String>,
    #[serde(default)]
    pub apikey: Option<String>,
    #[serde(default)]
    data: Value,
}

impl EvolutionWebhook {
    pub fn is_message_event(&self) -> bool {
        let event = self.event.trim().to_ascii_lowercase().replace('_', ".");
        event == MESSAGES_UPSERT
    }

    /// Extract the message carried by this event.
    ///
    /// Returns `None` for non-message events and for messages without usable
    /// text (media without caption, reactions, protocol messages, status posts).
    pub fn message(&self) -> Option<IncomingMessage> {
        if !self.is_message_event() {
            return None;
        }
        let data: UpsertData = serde_json::from_value(self.data.clone()).ok()?;

        let chat_id = data.key.remote_jid.trim();
        if chat_id.is_empty() || chat_id == STATUS_BROADCAST_JID {
            return None;
        }
        let message_id = data.key.id.trim();
        if message_id.is_empty() {
            return None;
        }
        let text = data.message.as_ref().and_then(extract_text)?;

        let chat_id = ChatId::new(chat_id);
        let is_group = chat_id.is_group();
        let sender = if is_group {
            data.key
                .participant
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .unwrap_or(chat_id.as_str())
                .to_string()
        } else {
            chat_id.to_string()
        };

        Some(IncomingMessage {
            message_id: MessageId::new(message_id),
            chat_id,
            sender,
            text,
            origin: Origin::from_me(data.key.from_me),
            is_group,
            timestamp: data.message_timestamp.as_ref().and_then(parse_timestamp),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpsertData {
    key: MessageKey,
    #[serde(default)]
    message: Option<MessageContent>,
    #[serde(default)]
    message_timestamp: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageKey {
    #[serde(default)]
    remote_jid: String,
    #[serde(default)]
    from_me: bool,
    #[serde(default)]
    id: String,
    #[serde(default)]
    participant: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageContent {
    #[serde(default)]
    conversation: Option<String>,
    #[serde(default)]
    extended_text_message: Option<TextBody>,
    #[serde(default)]
    image_message: Option<Captioned>,
    #[serde(default)]
    video_message: Option<Captioned>,
}

#[derive(Debug, Deserialize)]
struct TextBody {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Captioned {
    #[serde(default)]
    caption: Option<String>,
}

fn extract_text(message: &MessageContent) -> Option<String> {
    [
        message.conversation.as_deref(),
        message
            .extended_text_message
            .as_ref()
            .and_then(|m| m.text.as_deref()),
        message.image_message.as_ref().and_then(|m| m.caption.as_deref()),
        message.video_message.as_ref().and_then(|m| m.caption.as_deref()),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|text| !text.is_empty())
    .map(ToOwned::to_owned)
}

// Baileys serializes Long timestamps either as numbers or as decimal strings.
fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
