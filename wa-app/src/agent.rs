//! Conversational agent: one persistent thread per chat, backed by the LLM.

use crate::db::ThreadStore;
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::sync::Arc;
use wa_gateway::ChatId;
use wa_llm::{ChatMessage, LlmClient};

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are texting on WhatsApp on behalf of a busy person who owns this number. \
Write like a real person, not an assistant: short, casual, mostly lowercase, \
no bullet lists, no markdown, no sign-offs. Keep answers brief and to the point. \
When a reply reads better as several separate messages, put ||| between them, \
for example: sure|||give me 5 min. Never say you are an AI. If you do not know \
something, say you will check and get back to them.";

#[async_trait]
pub trait ConversationAgent: Send + Sync {
    /// Record `input` as a user turn, generate a reply and record it too.
    async fn invoke(&self, thread_id: &str, input: &str) -> Result<String>;

    /// Record a turn without generating anything.
    async fn append(&self, thread_id: &str, message: ChatMessage) -> Result<()>;
}

pub fn thread_id(chat_id: &ChatId) -> String {
    format!("wa:{chat_id}")
}

pub struct LlmAgent {
    llm: LlmClient,
    threads: Arc<dyn ThreadStore>,
    system_prompt: String,
    history_limit: usize,
}

impl LlmAgent {
    pub fn new(
        llm: LlmClient,
        threads: Arc<dyn ThreadStore>,
        system_prompt: Option<String>,
        history_limit: usize,
    ) -> Self {
        let system_prompt = system_prompt
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        Self {
            llm,
            threads,
            system_prompt,
            history_limit,
        }
    }
}

#[async_trait]
impl ConversationAgent for LlmAgent {
    #[tracing::instrument(level = "info", skip_all, fields(thread_id = %thread_id, model = %self.llm.model()))]
    async fn invoke(&self, thread_id: &str, input: &str) -> Result<String> {
        let history = self
            .threads
            .load_turns(thread_id, self.history_limit)
            .await?;
        let user = ChatMessage::user(input);

        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt.clone()));
        messages.extend(history);
        messages.push(user.clone());

        let response = self
            .llm
            .chat(&messages)
            .await
            .context("agent chat completion")?;
        let reply = response.message.content.trim().to_string();
        tracing::debug!(
            history_turns = messages.len() - 2,
            reply_chars = reply.chars().count(),
            "agent reply generated"
        );

        self.threads
            .append_turns(thread_id, &[user, ChatMessage::assistant(reply.clone())])
            .await?;
        Ok(reply)
    }

    async fn append(&self, thread_id: &str, message: ChatMessage) -> Result<()> {
        self.threads.append_turns(thread_id, &[message]).await
    }
}
