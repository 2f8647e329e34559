use super::{
    ChatLock, InboundRecord, MessageStore, NewInboundMessage, NewOutboundMessage, ThreadStore,
    chat_lock_key,
};
use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row as _};
use wa_gateway::{ChatId, MessageId, Origin};
use wa_llm::{ChatMessage, Role};

const SCHEMA: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS inbound_messages (
    id BIGSERIAL PRIMARY KEY,
    chat_id TEXT NOT NULL,
    message_id TEXT NOT NULL UNIQUE,
    text TEXT NOT NULL,
    is_from_me BOOLEAN NOT NULL DEFAULT FALSE,
    gateway_ts BIGINT,
    received_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    processed_at TIMESTAMPTZ
)
"#,
    r#"
CREATE INDEX IF NOT EXISTS inbound_messages_chat_received_idx
    ON inbound_messages (chat_id, received_at DESC)
"#,
    r#"
CREATE INDEX IF NOT EXISTS inbound_messages_unprocessed_idx
    ON inbound_messages (chat_id, received_at)
    WHERE processed_at IS NULL
"#,
    r#"
CREATE TABLE IF NOT EXISTS outbound_messages (
    id BIGSERIAL PRIMARY KEY,
    chat_id TEXT NOT NULL,
    text TEXT NOT NULL,
    gateway_message_id TEXT,
    sent_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#,
    r#"
CREATE INDEX IF NOT EXISTS outbound_messages_gateway_id_idx
    ON outbound_messages (gateway_message_id)
"#,
    r#"
CREATE TABLE IF NOT EXISTS conversation_turns (
    id BIGSERIAL PRIMARY KEY,
    thread_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#,
    r#"
CREATE INDEX IF NOT EXISTS conversation_turns_thread_idx
    ON conversation_turns (thread_id, id DESC)
"#,
];

/// Serializes schema setup between relay instances starting together.
const SCHEMA_LOCK_KEY: i64 = 0x7761_7265_6c61_7900;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2.min(max_connections))
            .connect(url)
            .await
            .context("failed to connect to Postgres")?;
        Ok(Self { pool })
    }

    /// Create tables and indexes that do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin schema setup")?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(SCHEMA_LOCK_KEY)
            .execute(&mut *tx)
            .await
            .context("lock schema setup")?;
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&mut *tx)
                .await
                .context("failed to apply schema statement")?;
        }
        tx.commit().await.context("commit schema setup")?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("database ping failed")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn insert_inbound(&self, message: &NewInboundMessage) -> Result<bool> {
        let row = sqlx::query(
            r#"
INSERT INTO inbound_messages (chat_id, message_id, text, is_from_me, gateway_ts, received_at)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (message_id) DO NOTHING
RETURNING id
"#,
        )
        .bind(message.chat_id.as_str())
        .bind(message.message_id.as_str())
        .bind(&message.text)
        .bind(message.origin.is_from_me())
        .bind(message.gateway_timestamp)
        .bind(message.received_at)
        .fetch_optional(&self.pool)
        .await
        .context("insert inbound message")?;
        Ok(row.is_some())
    }

    async fn last_inbound_at(&self, chat_id: &ChatId) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
SELECT received_at
  FROM inbound_messages
 WHERE chat_id = $1
 ORDER BY received_at DESC
 LIMIT 1
"#,
        )
        .bind(chat_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("read latest inbound timestamp")?;
        Ok(row.map(|(received_at,)| received_at))
    }

    async fn fetch_unprocessed(&self, chat_id: &ChatId) -> Result<Vec<InboundRecord>> {
        let rows = sqlx::query(
            r#"
SELECT i.id, i.message_id, i.text, i.is_from_me, i.received_at,
       (i.is_from_me AND EXISTS (
            SELECT 1 FROM outbound_messages o WHERE o.gateway_message_id = i.message_id
       )) AS is_echo
  FROM inbound_messages i
 WHERE i.chat_id = $1 AND i.processed_at IS NULL
 ORDER BY i.received_at ASC, i.id ASC
"#,
        )
        .bind(chat_id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("fetch unprocessed messages")?;

        rows.into_iter()
            .map(|row| -> Result<InboundRecord> {
                Ok(InboundRecord {
                    id: row.try_get("id")?,
                    message_id: MessageId::new(row.try_get::<String, _>("message_id")?),
                    text: row.try_get("text")?,
                    origin: Origin::from_me(row.try_get("is_from_me")?),
                    received_at: row.try_get("received_at")?,
                    is_echo: row.try_get("is_echo")?,
                })
            })
            .collect()
    }

    async fn mark_processed(&self, ids: &[i64], processed_at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        sqlx::query("UPDATE inbound_messages SET processed_at = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(processed_at)
            .execute(&self.pool)
            .await
            .context("mark messages processed")?;
        Ok(())
    }

    async fn insert_outbound(&self, message: &NewOutboundMessage) -> Result<i64> {
        let (id,): (i64,) = sqlx::query_as(
            r#"
INSERT INTO outbound_messages (chat_id, text, gateway_message_id, sent_at)
VALUES ($1, $2, $3, $4)
RETURNING id
"#,
        )
        .bind(message.chat_id.as_str())
        .bind(&message.text)
        .bind(message.gateway_message_id.as_ref().map(|id| id.as_str()))
        .bind(message.sent_at)
        .fetch_one(&self.pool)
        .await
        .context("insert outbound message")?;
        Ok(id)
    }

    async fn lock_chat(&self, chat_id: &ChatId) -> Result<Box<dyn ChatLock>> {
        let key = chat_lock_key(chat_id);
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquire connection for chat lock")?;
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(key)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("pg_advisory_lock({key})"))?;
        tracing::debug!(chat_id = %chat_id, lock_key = key, "chat lock acquired");
        Ok(Box::new(PgChatLock {
            conn: Some(conn),
            key,
        }))
    }
}

/// Session-level advisory lock pinned to one pooled connection.
struct PgChatLock {
    conn: Option<PoolConnection<Postgres>>,
    key: i64,
}

#[async_trait]
impl ChatLock for PgChatLock {
    async fn release(mut self: Box<Self>) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await;
        match unlocked {
            Ok(true) => {
                tracing::debug!(lock_key = self.key, "chat lock released");
                Ok(())
            }
            Ok(false) => {
                tracing::warn!(lock_key = self.key, "chat lock was not held at release");
                drop(conn.detach());
                Ok(())
            }
            Err(e) => {
                // Closing the session drops every advisory lock it holds.
                drop(conn.detach());
                Err(anyhow::anyhow!("pg_advisory_unlock({}): {e}", self.key))
            }
        }
    }
}

impl Drop for PgChatLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(
                lock_key = self.key,
                "chat lock dropped without release; closing its connection"
            );
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl ThreadStore for PgStore {
    async fn load_turns(&self, thread_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            r#"
SELECT role, content FROM (
    SELECT id, role, content
      FROM conversation_turns
     WHERE thread_id = $1
     ORDER BY id DESC
     LIMIT $2
) recent
ORDER BY id ASC
"#,
        )
        .bind(thread_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .context("load conversation turns")?;

        let mut turns = Vec::with_capacity(rows.len());
        for (role, content) in rows {
            let Some(role) = Role::parse(&role) else {
                tracing::warn!(thread_id, role = %role, "skipping turn with unknown role");
                continue;
            };
            turns.push(ChatMessage { role, content });
        }
        Ok(turns)
    }

    async fn append_turns(&self, thread_id: &str, turns: &[ChatMessage]) -> Result<()> {
        if turns.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.context("begin turn append")?;
        for turn in turns {
            sqlx::query(
                "INSERT INTO conversation_turns (thread_id, role, content) VALUES ($1, $2, $3)",
            )
            .bind(thread_id)
            .bind(turn.role.as_str())
            .bind(&turn.content)
            .execute(&mut *tx)
            .await
            .context("append conversation turn")?;
        }
        tx.commit().await.context("commit turn append")?;
        Ok(())
    }
}
