use crate::error::Result;
use crate::types::{ChatId, MessageId, SentMessage};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Deliver one text bubble to a chat.
    async fn send_text(&self, to: &ChatId, text: &str) -> Result<SentMessage>;

    /// Show the "typing..." presence for roughly `duration`.
    /// The indicator expires on its own, so long waits need repeated calls.
    async fn set_typing(&self, to: &ChatId, duration: Duration) -> Result<()>;

    async fn mark_read(&self, chat: &ChatId, message_id: &MessageId) -> Result<()>;
}
