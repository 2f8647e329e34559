//! In-process store used by tests in place of Postgres.

use super::{
    ChatLock, InboundRecord, MessageStore, NewInboundMessage, NewOutboundMessage, ThreadStore,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use wa_gateway::{ChatId, MessageId};
use wa_llm::ChatMessage;

#[derive(Debug, Clone)]
pub struct StoredInbound {
    pub id: i64,
    pub message: NewInboundMessage,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    inbound: Vec<StoredInbound>,
    outbound: Vec<NewOutboundMessage>,
    turns: HashMap<String, Vec<ChatMessage>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    locks: Mutex<HashMap<ChatId, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inbound(&self) -> Vec<StoredInbound> {
        self.state.lock().expect("memory store lock").inbound.clone()
    }

    pub fn outbound(&self) -> Vec<NewOutboundMessage> {
        self.state.lock().expect("memory store lock").outbound.clone()
    }

    pub fn turns(&self, thread_id: &str) -> Vec<ChatMessage> {
        self.state
            .lock()
            .expect("memory store lock")
            .turns
            .get(thread_id)
            .cloned()
            .unwrap_or_default()
    }

    fn chat_mutex(&self, chat_id: &ChatId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("memory lock table")
            .entry(chat_id.clone())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_inbound(&self, message: &NewInboundMessage) -> Result<bool> {
        let mut state = self.state.lock().expect("memory store lock");
        if state
            .inbound
            .iter()
            .any(|row| row.message.message_id == message.message_id)
        {
            return Ok(false);
        }
        state.next_id += 1;
        let id = state.next_id;
        state.inbound.push(StoredInbound {
            id,
            message: message.clone(),
            processed_at: None,
        });
        Ok(true)
    }

    async fn last_inbound_at(&self, chat_id: &ChatId) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.lock().expect("memory store lock");
        Ok(state
            .inbound
            .iter()
            .filter(|row| &row.message.chat_id == chat_id)
            .map(|row| row.message.received_at)
            .max())
    }

    async fn fetch_unprocessed(&self, chat_id: &ChatId) -> Result<Vec<InboundRecord>> {
        let state = self.state.lock().expect("memory store lock");
        let sent_ids: Vec<&MessageId> = state
            .outbound
            .iter()
            .filter_map(|row| row.gateway_message_id.as_ref())
            .collect();
        let mut rows: Vec<InboundRecord> = state
            .inbound
            .iter()
            .filter(|row| &row.message.chat_id == chat_id && row.processed_at.is_none())
            .map(|row| InboundRecord {
                id: row.id,
                message_id: row.message.message_id.clone(),
                text: row.message.text.clone(),
                origin: row.message.origin,
                received_at: row.message.received_at,
                is_echo: row.message.origin.is_from_me()
                    && sent_ids.contains(&&row.message.message_id),
            })
            .collect();
        rows.sort_by_key(|row| (row.received_at, row.id));
        Ok(rows)
    }

    async fn mark_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock");
        for row in state.inbound.iter_mut().filter(|row| ids.contains(&row.id)) {
            row.processed_at = Some(processed_at);
        }
        Ok(())
    }

    async fn insert_outbound(&self, message: &NewOutboundMessage) -> Result<i64> {
        let mut state = self.state.lock().expect("memory store lock");
        state.outbound.push(message.clone());
        Ok(state.outbound.len() as i64)
    }

    async fn lock_chat(&self, chat_id: &ChatId) -> Result<Box<dyn ChatLock>> {
        let guard = self.chat_mutex(chat_id).lock_owned().await;
        Ok(Box::new(MemoryChatLock { _guard: guard }))
    }
}

struct MemoryChatLock {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

#[async_trait]
impl ChatLock for MemoryChatLock {
    async fn release(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ThreadStore for MemoryStore {
    async fn load_turns(&self, thread_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let state = self.state.lock().expect("memory store lock");
        let turns = state.turns.get(thread_id).cloned().unwrap_or_default();
        let skip = turns.len().saturating_sub(limit);
        Ok(turns.into_iter().skip(skip).collect())
    }

    async fn append_turns(&self, thread_id: &str, turns: &[ChatMessage]) -> Result<()> {
        let mut state = self.state.lock().expect("memory store lock");
        state
            .turns
            .entry(thread_id.to_string())
            .or_default()
            .extend_from_slice(turns);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wa_gateway::Origin;

    fn inbound(chat: &str, id: &str, at: DateTime<Utc>) -> NewInboundMessage {
        NewInboundMessage {
            chat_id: ChatId::new(chat),
            message_id: MessageId::new(id),
            text: format!("text {id}"),
            origin: Origin::Counterparty,
            gateway_timestamp: None,
            received_at: at,
        }
    }

    #[tokio::test]
    async fn duplicate_message_ids_store_one_row() {
        let store = MemoryStore::new();
        let now = Utc::now();
        assert!(store.insert_inbound(&inbound("a", "m1", now)).await.expect("insert"));
        assert!(!store.insert_inbound(&inbound("a", "m1", now)).await.expect("insert"));
        assert_eq!(store.inbound().len(), 1);
    }

    #[tokio::test]
    async fn thread_turns_are_windowed_to_the_most_recent() {
        let store = MemoryStore::new();
        store
            .append_turns(
                "wa:a",
                &[
                    ChatMessage::user("1"),
                    ChatMessage::assistant("2"),
                    ChatMessage::user("3"),
                ],
            )
            .await
            .expect("append");
        let turns = store.load_turns("wa:a", 2).await.expect("load");
        assert_eq!(turns, vec![ChatMessage::assistant("2"), ChatMessage::user("3")]);
    }
}
