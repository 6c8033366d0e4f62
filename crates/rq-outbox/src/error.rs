use rq_common::MessageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[cfg(any(feature = "postgres", feature = "sqlite"))]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("invalid outbox message payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
}
