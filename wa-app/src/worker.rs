//! Per-chat processing pass.
//!
//! A pass holds the chat's exclusive lock for its whole duration, waits until
//! the chat has been quiet for the debounce window, then reconciles the
//! pending batch: operator messages become assistant turns, and counterparty
//! messages produce at most one agent reply, delivered bubble by bubble.
//!
//! Passes are scheduled in-process so that each chat has at most one pass
//! waiting for its batch, and the number of running passes stays below the
//! connection pool size (every running pass pins a pooled connection).

use crate::agent::{ConversationAgent, thread_id};
use crate::clock::Clock;
use crate::db::{InboundRecord, MessageStore};
use crate::delivery::{DeliverySettings, ReplyDispatcher};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use wa_gateway::{ChatId, MessageId, MessagingGateway, Origin};
use wa_llm::ChatMessage;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub debounce: Duration,
    pub mark_read: bool,
    /// Passes allowed to hold a chat lock (or wait on one) at the same time.
    pub max_concurrent_passes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// The chat has no stored messages at all.
    NoMessages,
    /// An earlier pass already consumed everything.
    NothingPending,
    /// The operator spoke last; the agent stays silent.
    OperatorTakeover { processed: usize },
    /// Only our own sends came back.
    EchoesOnly { processed: usize },
    Replied { processed: usize, chunks: usize },
}

/// A quiet batch split by author.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciled {
    pub ids: Vec<i64>,
    pub operator_turns: Vec<String>,
    /// Counterparty texts joined with newlines.
    pub user_input: Option<String>,
    pub last_counterparty: Option<MessageId>,
    /// The last non-echo message was written by the operator.
    pub takeover: bool,
}

pub fn reconcile(batch: &[InboundRecord]) -> Reconciled {
    let mut out = Reconciled {
        ids: batch.iter().map(|m| m.id).collect(),
        ..Reconciled::default()
    };
    let mut counterparty = Vec::new();
    let mut last_author = None;
    for message in batch.iter().filter(|m| !m.is_echo) {
        last_author = Some(message.origin);
        match message.origin {
            Origin::Operator => out.operator_turns.push(message.text.clone()),
            Origin::Counterparty => {
                counterparty.push(message.text.as_str());
                out.last_counterparty = Some(message.message_id.clone());
            }
        }
    }
    out.takeover = last_author == Some(Origin::Operator);
    if !counterparty.is_empty() {
        out.user_input = Some(counterparty.join("\n"));
    }
    out
}

/// Time left until `window` has passed since `last`, or `None` once it has.
/// A `last` in the future counts as "just now".
pub fn quiet_remaining(
    last: DateTime<Utc>,
    now: DateTime<Utc>,
    window: Duration,
) -> Option<Duration> {
    let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
    window.checked_sub(elapsed).filter(|d| !d.is_zero())
}

pub struct ChatProcessor {
    store: Arc<dyn MessageStore>,
    gateway: Arc<dyn MessagingGateway>,
    agent: Arc<dyn ConversationAgent>,
    clock: Arc<dyn Clock>,
    dispatcher: ReplyDispatcher,
    settings: ProcessorSettings,
    pass_slots: Semaphore,
    /// Chats with a scheduled pass that has not captured its batch yet.
    waiting: Mutex<HashMap<ChatId, u64>>,
    ticket_sequence: AtomicU64,
}

impl ChatProcessor {
    pub fn new(
        store: Arc<dyn MessageStore>,
        gateway: Arc<dyn MessagingGateway>,
        agent: Arc<dyn ConversationAgent>,
        clock: Arc<dyn Clock>,
        settings: ProcessorSettings,
        delivery: DeliverySettings,
    ) -> Self {
        let dispatcher =
            ReplyDispatcher::new(gateway.clone(), store.clone(), clock.clone(), delivery);
        let pass_slots = Semaphore::new(settings.max_concurrent_passes.max(1));
        Self {
            store,
            gateway,
            agent,
            clock,
            dispatcher,
            settings,
            pass_slots,
            waiting: Mutex::new(HashMap::new()),
            ticket_sequence: AtomicU64::new(1),
        }
    }

    /// Run a pass in the background. Failures are logged, not retried; the
    /// batch stays pending until the next message for the chat arrives.
    ///
    /// Returns `false` when the chat already has a pass waiting for its
    /// batch; that pass will pick the new message up.
    pub fn spawn_pass(self: &Arc<Self>, tasks: &TaskTracker, chat_id: ChatId) -> bool {
        let Some(ticket) = self.enqueue(&chat_id) else {
            tracing::debug!(chat_id = %chat_id, "chat pass already waiting; coalesced");
            return false;
        };
        let processor = Arc::clone(self);
        tasks.spawn(async move {
            let result = processor.process_chat(&chat_id).await;
            processor.dequeue(&chat_id, Some(ticket));
            match result {
                Ok(outcome) => {
                    tracing::info!(chat_id = %chat_id, outcome = ?outcome, "chat pass finished");
                }
                Err(e) => {
                    tracing::error!(chat_id = %chat_id, error = %format!("{e:#}"), "chat pass failed");
                }
            }
        });
        true
    }

    /// Passes scheduled through `spawn_pass` that have not yet captured a batch.
    pub fn waiting_passes(&self) -> usize {
        self.waiting_table().len()
    }

    fn waiting_table(&self) -> MutexGuard<'_, HashMap<ChatId, u64>> {
        self.waiting.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, chat_id: &ChatId) -> Option<u64> {
        let mut waiting = self.waiting_table();
        if waiting.contains_key(chat_id) {
            return None;
        }
        let ticket = self.ticket_sequence.fetch_add(1, Ordering::Relaxed);
        waiting.insert(chat_id.clone(), ticket);
        Some(ticket)
    }

    /// Forget the chat's waiting pass. With a ticket, only that pass's entry
    /// is removed, so a newer pass scheduled after the batch capture survives.
    fn dequeue(&self, chat_id: &ChatId, ticket: Option<u64>) {
        let mut waiting = self.waiting_table();
        if ticket.is_none() || waiting.get(chat_id).copied() == ticket {
            waiting.remove(chat_id);
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %chat_id))]
    pub async fn process_chat(&self, chat_id: &ChatId) -> Result<PassOutcome> {
        let _slot = self
            .pass_slots
            .acquire()
            .await
            .context("chat pass slots closed")?;
        let lock = self.store.lock_chat(chat_id).await?;
        let result = self.run_locked(chat_id).await;
        if let Err(e) = lock.release().await {
            tracing::warn!(error = %format!("{e:#}"), "failed to release chat lock");
        }
        result
    }

    async fn run_locked(&self, chat_id: &ChatId) -> Result<PassOutcome> {
        let Some(batch) = self.wait_for_quiet_batch(chat_id).await? else {
            return Ok(PassOutcome::NoMessages);
        };
        if batch.is_empty() {
            tracing::debug!("no pending messages");
            return Ok(PassOutcome::NothingPending);
        }
        tracing::debug!(
            batch_size = batch.len(),
            oldest_received_at = %batch[0].received_at,
            "quiet batch captured"
        );

        let batch = reconcile(&batch);
        let processed = batch.ids.len();
        let thread = thread_id(chat_id);
        for text in &batch.operator_turns {
            self.agent
                .append(&thread, ChatMessage::assistant(text.clone()))
                .await?;
        }

        if batch.takeover {
            self.store.mark_processed(&batch.ids, self.clock.now()).await?;
            tracing::info!(processed, "operator replied last; skipping agent");
            return Ok(PassOutcome::OperatorTakeover { processed });
        }

        let Some(input) = batch.user_input.as_deref() else {
            self.store.mark_processed(&batch.ids, self.clock.now()).await?;
            tracing::debug!(processed, "batch held only echoes of our own sends");
            return Ok(PassOutcome::EchoesOnly { processed });
        };

        if self.settings.mark_read {
            if let Some(message_id) = &batch.last_counterparty {
                if let Err(e) = self.gateway.mark_read(chat_id, message_id).await {
                    tracing::warn!(error = %e, "mark read failed");
                }
            }
        }

        let reply = self.agent.invoke(&thread, input).await?;
        let chunks = self.dispatcher.deliver(chat_id, &reply).await?;
        self.store.mark_processed(&batch.ids, self.clock.now()).await?;
        tracing::info!(processed, chunks, "batch answered");
        Ok(PassOutcome::Replied { processed, chunks })
    }

    /// Sleep until no message has arrived for the debounce window, then
    /// return everything still pending. `None` when the chat has no messages.
    async fn wait_for_quiet_batch(&self, chat_id: &ChatId) -> Result<Option<Vec<InboundRecord>>> {
        loop {
            let Some(last) = self.store.last_inbound_at(chat_id).await? else {
                tracing::warn!("no messages stored for chat");
                return Ok(None);
            };
            let Some(remaining) = quiet_remaining(last, self.clock.now(), self.settings.debounce)
            else {
                break;
            };
            tracing::debug!(
                remaining_ms = remaining.as_millis() as u64,
                "waiting for chat to go quiet"
            );
            tokio::time::sleep(remaining).await;
        }
        // Messages stored from here on need a pass of their own.
        self.dequeue(chat_id, None);
        Ok(Some(self.store.fetch_unprocessed(chat_id).await?))
    }
}
