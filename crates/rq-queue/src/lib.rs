//! RelayQueue broker-backed queues
//!
//! - `Broker`/`BrokerChannel`: the connected broker client the queues talk to
//! - `AmqpBroker`: RabbitMQ implementation with a delayed-delivery exchange
//! - `InMemoryBroker`: process-local broker for tests and local development
//! - `Queue`: dispatch, blocking fetch, handle-with-retry, run loop, shutdown
//! - `MessageHandler`: predicate + action pair owned by a queue

pub mod broker;
pub mod error;
pub mod handler;
pub mod memory;
pub mod queue;

#[cfg(feature = "amqp")]
pub mod amqp;

use async_trait::async_trait;
use rq_common::Message;

pub use broker::{Acknowledger, Broker, BrokerChannel, RawDelivery};
pub use error::QueueError;
pub use handler::{handler_for, FnHandler, MessageHandler, NamedHandler};
pub use memory::{InMemoryBroker, QueueStats};
pub use queue::{Delivery, HandleOutcome, Queue, DEFAULT_POLL_INTERVAL};

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Publishes a message to a queue by name.
///
/// The outbox relay publishes through this seam; the router's pool
/// implements it.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn dispatch(&self, queue_name: &str, message: &Message) -> Result<()>;
}
