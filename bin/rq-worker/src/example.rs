//! Example queue: an `example_log` row written together with the outbox
//! message announcing it, and the handler that consumes that message.

use std::sync::Arc;

use rq_common::{Message, MessageError};
use rq_outbox::OutboxError;
use rq_queue::{handler_for, MessageHandler};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::database::Database;

pub const QUEUE_EXAMPLE: &str = "queue_example";
pub const MESSAGE_LOG_CREATED: &str = "example_log_created";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExampleLog {
    pub id: String,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum ExampleError {
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("error creating message: {0}")]
    Message(#[from] MessageError),
    #[error("error creating outbox message: {0}")]
    Outbox(#[from] OutboxError),
}

pub async fn init_schema(db: &Database) -> Result<(), ExampleError> {
    let ddl = "CREATE TABLE IF NOT EXISTS example_log (id TEXT PRIMARY KEY, message TEXT NOT NULL)";
    match db {
        Database::Postgres(pool) => {
            sqlx::query(ddl).execute(pool).await?;
        }
        Database::Sqlite(pool) => {
            sqlx::query(ddl).execute(pool).await?;
        }
    }
    Ok(())
}

/// Store a log entry and its `example_log_created` outbox message in one
/// transaction. Either both are committed or neither is.
pub async fn create_log(db: &Database, message: &str) -> Result<ExampleLog, ExampleError> {
    if message.is_empty() {
        return Err(ExampleError::EmptyMessage);
    }

    let log = ExampleLog {
        id: uuid::Uuid::new_v4().to_string(),
        message: message.to_string(),
    };
    let created = Message::new(MESSAGE_LOG_CREATED, &log)?;

    // An early return drops the transaction, which rolls it back
    match db {
        Database::Postgres(pool) => {
            let mut tx = pool.begin().await?;
            sqlx::query("INSERT INTO example_log (id, message) VALUES ($1, $2)")
                .bind(&log.id)
                .bind(&log.message)
                .execute(&mut *tx)
                .await?;
            rq_outbox::postgres::create_outbox_message(&mut tx, QUEUE_EXAMPLE, &[created]).await?;
            tx.commit().await?;
        }
        Database::Sqlite(pool) => {
            let mut tx = pool.begin().await?;
            sqlx::query("INSERT INTO example_log (id, message) VALUES (?, ?)")
                .bind(&log.id)
                .bind(&log.message)
                .execute(&mut *tx)
                .await?;
            rq_outbox::sqlite::create_outbox_message(&mut tx, QUEUE_EXAMPLE, &[created]).await?;
            tx.commit().await?;
        }
    }

    info!(log_id = %log.id, "Example log created");
    Ok(log)
}

pub fn handlers() -> Vec<Arc<dyn MessageHandler>> {
    vec![handler_for(MESSAGE_LOG_CREATED, |msg: Message| async move {
        let log: ExampleLog = msg.decode_body()?;
        info!(log_id = %log.id, log_message = %log.message, "Processing example log created message");
        Ok::<(), anyhow::Error>(())
    })]
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn sqlite() -> Database {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let db = Database::Sqlite(pool);
        db.migrate().await.unwrap();
        db
    }

    async fn log_count(db: &Database) -> i64 {
        let Database::Sqlite(pool) = db else {
            unreachable!("tests run on sqlite")
        };
        sqlx::query_scalar("SELECT COUNT(*) FROM example_log")
            .fetch_one(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_log_writes_row_and_outbox_message() {
        let db = sqlite().await;

        let log = create_log(&db, "hello").await.unwrap();
        assert_eq!(log.message, "hello");
        assert_eq!(log_count(&db).await, 1);

        let claimed = db
            .outbox_repository()
            .claim_ready(10, 3, Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].queue_name, QUEUE_EXAMPLE);
        assert_eq!(claimed[0].message.name, MESSAGE_LOG_CREATED);
        assert_eq!(claimed[0].message.decode_body::<ExampleLog>().unwrap(), log);
    }

    #[tokio::test]
    async fn test_create_log_rejects_empty_message() {
        let db = sqlite().await;

        let err = create_log(&db, "").await.unwrap_err();
        assert!(matches!(err, ExampleError::EmptyMessage));
        assert_eq!(log_count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_handler_decodes_log() {
        let handlers = handlers();
        let log = ExampleLog {
            id: "log-1".to_string(),
            message: "hello".to_string(),
        };

        let created = Message::new(MESSAGE_LOG_CREATED, &log).unwrap();
        assert!(handlers[0].can_handle(&created));
        assert!(handlers[0].handle(&created).await.is_ok());

        let garbage = Message::from_bytes(MESSAGE_LOG_CREATED, b"not json".to_vec());
        assert!(handlers[0].handle(&garbage).await.is_err());

        let other = Message::from_bytes("other", Vec::new());
        assert!(!handlers[0].can_handle(&other));
    }
}
