use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rq_common::Message;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::message::OutboxMessage;
use crate::repository::{lease_until, oldest_first, OutboxRepository};
use crate::Result;

const RETURNING: &str =
    "id, queue_name, message, created_at, available_at, retry_count, last_error";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS queue_outbox (
        id UUID PRIMARY KEY,
        queue_name TEXT NOT NULL,
        message JSON NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        available_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        retry_count INT NOT NULL DEFAULT 0,
        last_error TEXT NULL,
        claimed_until TIMESTAMPTZ NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_queue_outbox_available_at ON queue_outbox(available_at)",
    "CREATE INDEX IF NOT EXISTS idx_queue_outbox_queue_name ON queue_outbox(queue_name)",
];

/// Create the outbox table and its indexes.
pub async fn init_schema(pool: &PgPool) -> Result<()> {
    // Prepared statements take a single command each
    for statement in SCHEMA {
        sqlx::query(*statement).execute(pool).await?;
    }
    Ok(())
}

/// Insert one outbox row per message inside the caller's transaction.
///
/// Nothing becomes visible to the relay unless the transaction commits.
pub async fn create_outbox_message(
    tx: &mut Transaction<'_, Postgres>,
    queue_name: &str,
    messages: &[Message],
) -> Result<Vec<Uuid>> {
    let mut ids = Vec::with_capacity(messages.len());
    for message in messages {
        let outbox = OutboxMessage::new(queue_name, message.clone());
        sqlx::query(
            "INSERT INTO queue_outbox (id, queue_name, message, created_at, available_at, retry_count) \
             VALUES ($1, $2, $3::json, $4, $5, $6)",
        )
        .bind(outbox.id)
        .bind(&outbox.queue_name)
        .bind(serde_json::to_string(&outbox.message)?)
        .bind(outbox.created_at)
        .bind(outbox.available_at)
        .bind(0_i32)
        .execute(&mut **tx)
        .await?;

        debug!(outbox_id = %outbox.id, queue = %queue_name, message_id = %message.id, "Outbox message created");
        ids.push(outbox.id);
    }
    Ok(ids)
}

fn from_row(row: &PgRow) -> Result<OutboxMessage> {
    let Json(message): Json<Message> = row.try_get("message")?;
    let retry_count: i32 = row.try_get("retry_count")?;
    Ok(OutboxMessage {
        id: row.try_get("id")?,
        queue_name: row.try_get("queue_name")?,
        message,
        created_at: row.try_get("created_at")?,
        available_at: row.try_get("available_at")?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        last_error: row.try_get("last_error")?,
    })
}

fn to_db_count(count: u32) -> i32 {
    i32::try_from(count).unwrap_or(i32::MAX)
}

pub struct PostgresOutboxRepository {
    pool: PgPool,
}

impl PostgresOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        init_schema(&self.pool).await
    }
}

#[async_trait]
impl OutboxRepository for PostgresOutboxRepository {
    async fn claim_ready(&self, limit: usize, max_retries: u32, lease: Duration) -> Result<Vec<OutboxMessage>> {
        let now = Utc::now();
        let query = format!(
            r#"
            UPDATE queue_outbox
            SET claimed_until = $1
            WHERE id IN (
                SELECT id FROM queue_outbox
                WHERE available_at <= $2
                AND retry_count < $3
                AND (claimed_until IS NULL OR claimed_until <= $2)
                ORDER BY available_at ASC
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {RETURNING}
            "#
        );

        let rows = sqlx::query(&query)
            .bind(lease_until(now, lease))
            .bind(now)
            .bind(to_db_count(max_retries))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        let claimed = rows.iter().map(from_row).collect::<Result<Vec<_>>>()?;
        Ok(oldest_first(claimed))
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM queue_outbox WHERE id = $1")
            .bind(id)
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
            "UPDATE queue_outbox SET retry_count = $1, available_at = $2, last_error = $3, claimed_until = NULL \
             WHERE id = $4",
        )
        .bind(to_db_count(retry_count))
        .bind(available_at)
        .bind(last_error)
        .bind(id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        let query = format!("SELECT {RETURNING} FROM queue_outbox WHERE id = $1");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(from_row).transpose()
    }
}
