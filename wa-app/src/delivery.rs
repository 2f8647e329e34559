//! Human-paced reply delivery: split into bubbles, fake typing, send, pause.

use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::db::{MessageStore, NewOutboundMessage};
use anyhow::Result;
use rand::Rng as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use wa_gateway::{ChatId, MessagingGateway};

#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub delimiter: String,
    pub typing_per_char: Duration,
    pub typing_min: Duration,
    pub typing_max: Duration,
    pub typing_pulse: Duration,
    pub pause_min: Duration,
    pub pause_max: Duration,
}

impl From<&DeliveryConfig> for DeliverySettings {
    fn from(cfg: &DeliveryConfig) -> Self {
        Self {
            delimiter: cfg.delimiter.clone(),
            typing_per_char: Duration::from_millis(cfg.typing_ms_per_char),
            typing_min: Duration::from_millis(cfg.typing_min_ms),
            typing_max: Duration::from_millis(cfg.typing_max_ms),
            typing_pulse: Duration::from_millis(cfg.typing_pulse_ms),
            pause_min: Duration::from_millis(cfg.pause_min_ms),
            pause_max: Duration::from_millis(cfg.pause_max_ms),
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self::from(&DeliveryConfig::default())
    }
}

/// Split a reply on `delimiter` into trimmed, non-empty bubbles.
pub fn split_reply(reply: &str, delimiter: &str) -> Vec<String> {
    if delimiter.is_empty() {
        let reply = reply.trim();
        return if reply.is_empty() {
            Vec::new()
        } else {
            vec![reply.to_string()]
        };
    }
    reply
        .split(delimiter)
        .map(str::trim)
        .filter(|chunk| !chunk.is_empty())
        .map(str::to_string)
        .collect()
}

/// How long to show "typing..." before sending `chunk`.
pub fn typing_duration(chunk: &str, settings: &DeliverySettings) -> Duration {
    let chars = u32::try_from(chunk.chars().count()).unwrap_or(u32::MAX);
    settings
        .typing_per_char
        .saturating_mul(chars)
        .max(settings.typing_min)
        .min(settings.typing_max)
}

pub fn inter_chunk_pause(settings: &DeliverySettings) -> Duration {
    let lo = settings.pause_min.as_millis() as u64;
    let hi = (settings.pause_max.as_millis() as u64).max(lo);
    Duration::from_millis(rand::rng().random_range(lo..=hi))
}

pub struct ReplyDispatcher {
    gateway: Arc<dyn MessagingGateway>,
    store: Arc<dyn MessageStore>,
    clock: Arc<dyn Clock>,
    settings: DeliverySettings,
}

impl ReplyDispatcher {
    pub fn new(
        gateway: Arc<dyn MessagingGateway>,
        store: Arc<dyn MessageStore>,
        clock: Arc<dyn Clock>,
        settings: DeliverySettings,
    ) -> Self {
        Self {
            gateway,
            store,
            clock,
            settings,
        }
    }

    /// Deliver every bubble of `reply` in order. Returns the number sent.
    ///
    /// Stops at the first failed send; bubbles already sent stay sent.
    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %chat_id))]
    pub async fn deliver(&self, chat_id: &ChatId, reply: &str) -> Result<usize> {
        let chunks = split_reply(reply, &self.settings.delimiter);
        if chunks.is_empty() {
            tracing::info!("reply has no content; nothing to send");
            return Ok(0);
        }
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            self.simulate_typing(chat_id, typing_duration(chunk, &self.settings))
                .await;

            let sent = match self.gateway.send_text(chat_id, chunk).await {
                Ok(sent) => sent,
                Err(e) => {
                    tracing::error!(
                        chunk_index = index,
                        chunk_count = total,
                        error = %e,
                        "reply send failed"
                    );
                    return Err(anyhow::Error::new(e)
                        .context(format!("send reply chunk {}/{total}", index + 1)));
                }
            };
            tracing::info!(
                chunk_index = index,
                chunk_count = total,
                gateway_message_id = ?sent.message_id,
                "reply chunk sent"
            );

            let record = NewOutboundMessage {
                chat_id: chat_id.clone(),
                text: chunk.clone(),
                gateway_message_id: sent.message_id,
                sent_at: self.clock.now(),
            };
            if let Err(e) = self.store.insert_outbound(&record).await {
                tracing::warn!(error = %format!("{e:#}"), "failed to record outbound message");
            }

            if index + 1 < total {
                tokio::time::sleep(inter_chunk_pause(&self.settings)).await;
            }
        }
        Ok(total)
    }

    /// Keep the typing indicator up for `duration`, refreshing it every pulse.
    async fn simulate_typing(&self, chat_id: &ChatId, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let pulse = (deadline - now).min(self.settings.typing_pulse);
            if let Err(e) = self.gateway.set_typing(chat_id, pulse).await {
                tracing::warn!(error = %e, "typing indicator failed");
            }
            tokio::time::sleep_until(now + pulse).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::db::memory::MemoryStore;
    use crate::testing::FakeGateway;

    fn dispatcher(gateway: Arc<FakeGateway>, store: Arc<MemoryStore>) -> ReplyDispatcher {
        ReplyDispatcher::new(
            gateway,
            store,
            Arc::new(TokioClock::new()),
            DeliverySettings::default(),
        )
    }

    #[test]
    fn split_trims_and_drops_empty_chunks() {
        assert_eq!(
            split_reply(" hey ||| |||how are you?|||", "|||"),
            vec!["hey".to_string(), "how are you?".to_string()]
        );
        assert_eq!(split_reply("single", "|||"), vec!["single".to_string()]);
        assert!(split_reply(" ||| ", "|||").is_empty());
        assert!(split_reply("", "|||").is_empty());
    }

    #[test]
    fn typing_duration_is_proportional_and_clamped() {
        let settings = DeliverySettings::default();
        assert_eq!(typing_duration("ok", &settings), Duration::from_millis(2_000));
        assert_eq!(
            typing_duration(&"x".repeat(100), &settings),
            Duration::from_millis(5_000)
        );
        assert_eq!(
            typing_duration(&"x".repeat(5_000), &settings),
            Duration::from_millis(60_000)
        );
        // Characters, not bytes.
        assert_eq!(
            typing_duration(&"é".repeat(100), &settings),
            Duration::from_millis(5_000)
        );
    }

    #[test]
    fn pause_stays_within_bounds() {
        let settings = DeliverySettings::default();
        for _ in 0..200 {
            let pause = inter_chunk_pause(&settings);
            assert!(pause >= Duration::from_millis(500));
            assert!(pause <= Duration::from_millis(1_500));
        }
        let fixed = DeliverySettings {
            pause_min: Duration::from_millis(700),
            pause_max: Duration::from_millis(700),
            ..DeliverySettings::default()
        };
        assert_eq!(inter_chunk_pause(&fixed), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn typing_is_refreshed_in_pulses_until_the_send() {
        let gateway = Arc::new(FakeGateway::default());
        let store = Arc::new(MemoryStore::new());
        let chat = ChatId::new("1555@s.whatsapp.net");
        let started = Instant::now();

        let sent = dispatcher(gateway.clone(), store.clone())
            .deliver(&chat, &"x".repeat(200))
            .await
            .expect("deliver");
        assert_eq!(sent, 1);

        let pulses: Vec<Duration> = gateway.typing().into_iter().map(|t| t.duration).collect();
        assert_eq!(
            pulses,
            vec![
                Duration::from_millis(3_000),
                Duration::from_millis(3_000),
                Duration::from_millis(3_000),
                Duration::from_millis(1_000),
            ]
        );
        let pulse_offsets: Vec<Duration> = gateway
            .typing()
            .iter()
            .map(|t| {
                assert_eq!(t.chat_id, chat);
                t.at - started
            })
            .collect();
        assert_eq!(
            pulse_offsets,
            vec![
                Duration::ZERO,
                Duration::from_millis(3_000),
                Duration::from_millis(6_000),
                Duration::from_millis(9_000),
            ]
        );
        let sends = gateway.sends();
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].chat_id, chat);
        assert_eq!(sends[0].at - started, Duration::from_millis(10_000));
        assert_eq!(store.outbound().len(), 1);
        assert_eq!(
            store.outbound()[0].gateway_message_id.as_ref().map(|id| id.as_str()),
            Some("OUT-1")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn typing_failures_do_not_block_the_send() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.fail_typing(true);
        let store = Arc::new(MemoryStore::new());

        let sent = dispatcher(gateway.clone(), store)
            .deliver(&ChatId::new("1555@s.whatsapp.net"), "hi|||there")
            .await
            .expect("deliver");
        assert_eq!(sent, 2);
        assert_eq!(gateway.sends().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn send_failure_stops_delivery_and_is_returned() {
        let gateway = Arc::new(FakeGateway::default());
        gateway.fail_sends(true);
        let store = Arc::new(MemoryStore::new());

        let err = dispatcher(gateway.clone(), store.clone())
            .deliver(&ChatId::new("1555@s.whatsapp.net"), "one|||two")
            .await
            .expect_err("send failure");
        assert!(format!("{err:#}").contains("send reply chunk 1/2"));
        assert_eq!(gateway.typing().len(), 1);
        assert!(store.outbound().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn blank_reply_sends_nothing() {
        let gateway = Arc::new(FakeGateway::default());
        let sent = dispatcher(gateway.clone(), Arc::new(MemoryStore::new()))
            .deliver(&ChatId::new("1555@s.whatsapp.net"), " ||| ")
            .await
            .expect("deliver");
        assert_eq!(sent, 0);
        assert!(gateway.sends().is_empty());
        assert!(gateway.typing().is_empty());
    }
}
