//! RelayQueue transactional outbox
//!
//! Application code writes `OutboxMessage` rows in the same transaction as
//! its business data (`postgres::create_outbox_message`,
//! `sqlite::create_outbox_message`). The `OutboxRelay` claims committed
//! rows, publishes them through a `QueuePublisher` and deletes them, or
//! reschedules them with exponential backoff.

pub mod error;
pub mod message;
pub mod relay;
pub mod repository;

#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::OutboxError;
pub use message::OutboxMessage;
pub use relay::{OutboxRelay, RelayConfig, RelayOutcome};
pub use repository::OutboxRepository;

#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxRepository;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxRepository;

pub type Result<T> = std::result::Result<T, OutboxError>;
