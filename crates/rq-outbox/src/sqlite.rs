//! SQLite outbox
//!
//! Timestamps are stored as epoch milliseconds and the message as JSON
//! text. SQLite serializes writers, so a single `UPDATE ... RETURNING`
//! is enough to claim rows.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rq_common::Message;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::message::OutboxMessage;
use crate::repository::{lease_until, oldest_first, OutboxRepository};
use crate::{OutboxError, Result};

const RETURNING: &str =
    "id, queue_name, message, created_at, available_at, retry_count, last_error";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_outbox (
        id TEXT PRIMARY KEY,
        queue_name TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        available_at INTEGER NOT NULL,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT NULL,
        claimed_until INTEGER NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_outbox_available_at ON queue_outbox(available_at)",
    "CREATE INDEX IF NOT EXISTS idx_queue_outbox_queue_name ON queue_outbox(queue_name)",
];

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(*statement).execute(pool).await?;
    }
    Ok(())
}

/// Insert one outbox row per message inside the caller's transaction.
pub async fn create_outbox_message(
    tx: &mut Transaction<'_, Sqlite>,
    queue_name: &str,
    messages: &[Message],
) -> Result<Vec<Uuid>> {
    let mut ids = Vec::with_capacity(messages.len());
    for message in messages {
        let outbox = OutboxMessage::new(queue_name, message.clone());
        sqlx::query(
            "INSERT INTO queue_outbox (id, queue_name, message, created_at, available_at, retry_count) \
             VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(outbox.id.to_string())
        .bind(&outbox.queue_name)
        .bind(serde_json::to_string(&outbox.message)?)
        .bind(outbox.created_at.timestamp_millis())
        .bind(outbox.available_at.timestamp_millis())
        .execute(&mut **tx)
        .await?;

        debug!(outbox_id = %outbox.id, queue = %queue_name, message_id = %message.id, "Outbox message created");
        ids.push(outbox.id);
    }
    Ok(ids)
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or(OutboxError::InvalidTimestamp(millis))
}

fn from_row(row: &SqliteRow) -> Result<OutboxMessage> {
    let id: String = row.try_get("id")?;
    let message: String = row.try_get("message")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(OutboxMessage {
        id: Uuid::parse_str(&id).map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        queue_name: row.try_get("queue_name")?,
        message: serde_json::from_str(&message)?,
        created_at: timestamp(row.try_get("created_at")?)?,
        available_at: timestamp(row.try_get("available_at")?)?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        last_error: row.try_get("last_error")?,
    })
}

pub struct SqliteOutboxRepository {
    pool: SqlitePool,
}

impl SqliteOutboxRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        init_schema(&self.pool).await
    }
}

#[async_trait]
impl OutboxRepository for SqliteOutboxRepository {
    async fn claim_ready(&self, limit: usize, max_retries: u32, lease: Duration) -> Result<Vec<OutboxMessage>> {
        let now = Utc::now();
        let query = format!(
            r#"
            UPDATE queue_outbox
            SET claimed_until = ?1
            WHERE id IN (
                SELECT id FROM queue_outbox
                WHERE available_at <= ?2
                AND retry_count < ?3
                AND (claimed_until IS NULL OR claimed_until <= ?2)
                ORDER BY available_at ASC
                LIMIT ?4
            )
            RETURNING {RETURNING}
            "#
        );

        let rows = sqlx::query(&query)
            .bind(lease_until(now, lease).timestamp_millis())
            .bind(now.timestamp_millis())
            .bind(i64::from(max_retries))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let claimed = rows.iter().map(from_row).collect::<Result<Vec<_>>>()?;
        Ok(oldest_first(claimed))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM queue_outbox WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE queue_outbox SET retry_count = ?, available_at = ?, last_error = ?, claimed_until = NULL \
             WHERE id = ?",
        )
        .bind(i64::from(retry_count))
        .bind(available_at.timestamp_millis())
        .bind(last_error)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        let query = format!("SELECT {RETURNING} FROM queue_outbox WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(from_row).transpose()
    }
}
