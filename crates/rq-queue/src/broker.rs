use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// A connected broker client.
///
/// Channels are cheap and not shared between concurrent publishers: every
/// dispatch and every fetch opens its own.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare the direct and delayed exchanges, the durable queue and
    /// both bindings for `queue`.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Publish `payload` to `queue`. A non-zero `delay` routes through the
    /// delayed-delivery path.
    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()>;

    /// Fetch one message without auto-acknowledging it.
    async fn get(&self, queue: &str) -> Result<Option<RawDelivery>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Acknowledges one specific delivery. Consumed on use.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;
}

/// An undecoded delivery and the handle that acknowledges it.
pub struct RawDelivery {
    pub body: Vec<u8>,
    pub acker: Box<dyn Acknowledger>,
}

impl fmt::Debug for RawDelivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDelivery")
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}
