//! Relational store: inbound/outbound message log, conversation turns, per-chat locks.

#[cfg(test)]
pub mod memory;
mod postgres;

pub use postgres::PgStore;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use wa_gateway::{ChatId, MessageId, Origin};
use wa_llm::ChatMessage;

/// An inbound message about to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInboundMessage {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub text: String,
    pub origin: Origin,
    pub gateway_timestamp: Option<i64>,
    pub received_at: DateTime<Utc>,
}

/// An inbound message that has not been consumed by a processing pass yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub id: i64,
    pub message_id: MessageId,
    pub text: String,
    pub origin: Origin,
    pub received_at: DateTime<Utc>,
    /// Operator message that is really one of our own outbound sends coming back.
    pub is_echo: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboundMessage {
    pub chat_id: ChatId,
    pub text: String,
    pub gateway_message_id: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Insert unless a row with the same gateway message id exists.
    /// Returns false for duplicates.
    async fn insert_inbound(&self, message: &NewInboundMessage) -> Result<bool>;

    async fn last_inbound_at(&self, chat_id: &ChatId) -> Result<Option<DateTime<Utc>>>;

    /// Unprocessed messages for a chat, oldest first.
    async fn fetch_unprocessed(&self, chat_id: &ChatId) -> Result<Vec<InboundRecord>>;

    async fn mark_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> Result<()>;

    async fn insert_outbound(&self, message: &NewOutboundMessage) -> Result<i64>;

    /// Block until the exclusive lock for `chat_id` is held.
    async fn lock_chat(&self, chat_id: &ChatId) -> Result<Box<dyn ChatLock>>;
}

/// Held per-chat lock. Call `release`; dropping without it still frees the
/// lock, just less promptly.
#[async_trait]
pub trait ChatLock: Send {
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Durable per-thread conversation history consumed by the agent.
#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// The most recent `limit` turns, oldest first.
    async fn load_turns(&self, thread_id: &str, limit: usize) -> Result<Vec<ChatMessage>>;

    async fn append_turns(&self, thread_id: &str, turns: &[ChatMessage]) -> Result<()>;
}

/// Stable 64-bit advisory lock key for a chat id.
pub fn chat_lock_key(chat_id: &ChatId) -> i64 {
    let digest = Sha256::digest(chat_id.as_str().as_bytes());
    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}
