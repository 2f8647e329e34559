//! Recording fakes for the gateway and the agent.

use crate::agent::ConversationAgent;
use crate::clock::{Clock, SystemClock};
use crate::db::memory::MemoryStore;
use crate::delivery::DeliverySettings;
use crate::server::RelayState;
use crate::worker::{ChatProcessor, ProcessorSettings};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use wa_gateway::{ChatId, GatewayError, MessageId, MessagingGateway, SentMessage};
use wa_llm::ChatMessage;

#[derive(Debug, Clone)]
pub struct SendCall {
    pub chat_id: ChatId,
    pub text: String,
    pub at: Instant,
}

#[derive(Debug, Clone)]
pub struct TypingCall {
    pub chat_id: ChatId,
    pub duration: Duration,
    pub at: Instant,
}

#[derive(Default)]
pub struct FakeGateway {
    sends: Mutex<Vec<SendCall>>,
    typing: Mutex<Vec<TypingCall>>,
    reads: Mutex<Vec<(ChatId, MessageId)>>,
    fail_sends: AtomicBool,
    fail_typing: AtomicBool,
    sent_count: AtomicU64,
}

impl FakeGateway {
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_typing(&self, fail: bool) {
        self.fail_typing.store(fail, Ordering::SeqCst);
    }

    pub fn sends(&self) -> Vec<SendCall> {
        self.sends.lock().expect("sends lock").clone()
    }

    pub fn typing(&self) -> Vec<TypingCall> {
        self.typing.lock().expect("typing lock").clone()
    }

    pub fn reads(&self) -> Vec<(ChatId, MessageId)> {
        self.reads.lock().expect("reads lock").clone()
    }
}

#[async_trait]
impl MessagingGateway for FakeGateway {
    async fn send_text(&self, to: &ChatId, text: &str) -> wa_gateway::Result<SentMessage> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 503,
                body: "gateway unavailable".to_string(),
            });
        }
        self.sends.lock().expect("sends lock").push(SendCall {
            chat_id: to.clone(),
            text: text.to_string(),
            at: Instant::now(),
        });
        let n = self.sent_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SentMessage {
            message_id: Some(MessageId::new(format!("OUT-{n}"))),
        })
    }

    async fn set_typing(&self, to: &ChatId, duration: Duration) -> wa_gateway::Result<()> {
        self.typing.lock().expect("typing lock").push(TypingCall {
            chat_id: to.clone(),
            duration,
            at: Instant::now(),
        });
        if self.fail_typing.load(Ordering::SeqCst) {
            return Err(GatewayError::Http("presence timed out".to_string()));
        }
        Ok(())
    }

    async fn mark_read(&self, chat: &ChatId, message_id: &MessageId) -> wa_gateway::Result<()> {
        self.reads
            .lock()
            .expect("reads lock")
            .push((chat.clone(), message_id.clone()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvokeCall {
    pub thread_id: String,
    pub input: String,
    pub at: Instant,
}

pub struct FakeAgent {
    reply: String,
    latency: Duration,
    invokes: Mutex<Vec<InvokeCall>>,
    appends: Mutex<Vec<(String, ChatMessage)>>,
}

impl FakeAgent {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            latency: Duration::ZERO,
            invokes: Mutex::default(),
            appends: Mutex::default(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn invokes(&self) -> Vec<InvokeCall> {
        self.invokes.lock().expect("invokes lock").clone()
    }

    pub fn appends(&self) -> Vec<(String, ChatMessage)> {
        self.appends.lock().expect("appends lock").clone()
    }
}

#[async_trait]
impl ConversationAgent for FakeAgent {
    async fn invoke(&self, thread_id: &str, input: &str) -> Result<String> {
        self.invokes.lock().expect("invokes lock").push(InvokeCall {
            thread_id: thread_id.to_string(),
            input: input.to_string(),
            at: Instant::now(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(self.reply.clone())
    }

    async fn append(&self, thread_id: &str, message: ChatMessage) -> Result<()> {
        self.appends
            .lock()
            .expect("appends lock")
            .push((thread_id.to_string(), message));
        Ok(())
    }
}

/// Webhook-facing state over an in-memory store and recording fakes.
pub fn relay_state(webhook_api_key: Option<&str>) -> (Arc<RelayState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let processor = Arc::new(ChatProcessor::new(
        store.clone(),
        Arc::new(FakeGateway::default()),
        Arc::new(FakeAgent::replying("ok")),
        clock.clone(),
        ProcessorSettings {
            debounce: Duration::from_secs(10),
            mark_read: false,
            max_concurrent_passes: 4,
        },
        DeliverySettings::default(),
    ));
    let state = Arc::new(RelayState {
        store: store.clone(),
        processor,
        clock,
        webhook_api_key: webhook_api_key.map(str::to_string),
        tasks: TaskTracker::new(),
    });
    (state, store)
}
