//! Queue - one broker topic, its handlers and its run loop

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rq_common::{Message, Shutdown};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::{Acknowledger, Broker};
use crate::handler::MessageHandler;
use crate::Result;

/// Interval between broker polls while waiting for a message
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A decoded message bound to the acknowledgement handle of the delivery
/// it came from. `ack` consumes the delivery, so it can only happen once.
pub struct Delivery {
    message: Message,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// What `handle_message` did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Handler succeeded, delivery acknowledged
    Handled,
    /// Handler failed, retry message dispatched, delivery acknowledged
    Retried,
    /// Handler failed and the retry dispatch failed too, delivery acknowledged
    RetryFailed,
    /// Handler failed with no retries left, delivery acknowledged
    Exhausted,
    /// No handler matched, delivery left unacknowledged
    Unhandled,
}

pub struct Queue {
    name: String,
    handlers: Vec<Arc<dyn MessageHandler>>,
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
    workers: usize,
    shutdown: Shutdown,
}

impl Queue {
    /// Bind a queue to the broker topic `name`, declaring its topology.
    pub async fn new(
        name: impl Into<String>,
        handlers: Vec<Arc<dyn MessageHandler>>,
        broker: Arc<dyn Broker>,
    ) -> Result<Self> {
        let name = name.into();

        let channel = broker.open_channel().await?;
        let declared = channel.declare_queue(&name).await;
        channel.close().await?;
        declared?;

        info!(queue = %name, handlers = handlers.len(), "Queue declared");

        Ok(Self {
            name,
            handlers,
            broker,
            poll_interval: DEFAULT_POLL_INTERVAL,
            workers: 1,
            shutdown: Shutdown::new(),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Number of run loops a pool starts for this queue (at least one).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Publish `message` to this queue's topic; a non-zero delay goes
    /// through the delayed-delivery path. Safe to call concurrently: every
    /// call publishes on its own channel.
    pub async fn dispatch(&self, message: &Message) -> Result<()> {
        let payload = message.encode()?;

        let channel = self.broker.open_channel().await?;
        let published = channel
            .publish(&self.name, &payload, Duration::from_millis(message.delay))
            .await;
        if let Err(e) = channel.close().await {
            warn!(queue = %self.name, error = %e, "Failed to close publish channel");
        }
        published?;

        counter!("rq_messages_dispatched_total", "queue" => self.name.clone()).increment(1);
        info!(
            queue = %self.name,
            message_id = %message.id,
            message_name = %message.name,
            delay = message.delay,
            retry_count = message.retry_count,
            "Message dispatched"
        );
        Ok(())
    }

    /// Wait for the next message.
    ///
    /// Polls the broker every poll interval. Returns `Ok(None)` when `cancel`
    /// resolves or the queue is shut down. A payload that fails to decode is
    /// an error, never silently dropped.
    pub async fn fetch_message<C>(&self, cancel: C) -> Result<Option<Delivery>>
    where
        C: Future<Output = ()> + Send,
    {
        let channel = self.broker.open_channel().await?;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = self.shutdown.wait();
        tokio::pin!(shutdown);
        tokio::pin!(cancel);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    channel.close().await?;
                    info!(queue = %self.name, "Worker stopped fetching messages due to shutdown");
                    return Ok(None);
                }
                _ = &mut cancel => {
                    if let Err(e) = channel.close().await {
                        debug!(queue = %self.name, error = %e, "Failed to close fetch channel");
                    }
                    return Ok(None);
                }
                _ = ticker.tick() => {
                    let raw = match channel.get(&self.name).await {
                        Ok(Some(raw)) => raw,
                        Ok(None) => continue,
                        Err(e) => {
                            if let Err(close_err) = channel.close().await {
                                debug!(queue = %self.name, error = %close_err, "Failed to close fetch channel");
                            }
                            return Err(e);
                        }
                    };
                    let message = Message::decode(&raw.body)?;
                    return Ok(Some(Delivery::new(message, raw.acker)));
                }
            }
        }
    }

    /// Run the first matching handler and acknowledge the delivery.
    ///
    /// A failed handler never causes redelivery of this delivery: a new
    /// message carrying the bumped retry count and backoff delay is
    /// dispatched instead, and the current delivery is acknowledged.
    pub async fn handle_message(&self, delivery: Delivery) -> HandleOutcome {
        let message = delivery.message();

        let Some(handler) = self.handlers.iter().find(|h| h.can_handle(message)) else {
            counter!("rq_messages_unhandled_total", "queue" => self.name.clone()).increment(1);
            warn!(
                queue = %self.name,
                message_id = %message.id,
                message_name = %message.name,
                "No handler found for message"
            );
            return HandleOutcome::Unhandled;
        };

        info!(
            queue = %self.name,
            message_id = %message.id,
            message_name = %message.name,
            "Handling message"
        );

        let outcome = match handler.handle(message).await {
            Ok(()) => {
                counter!("rq_messages_handled_total", "queue" => self.name.clone()).increment(1);
                info!(
                    queue = %self.name,
                    message_id = %message.id,
                    message_name = %message.name,
                    "Message handled successfully"
                );
                HandleOutcome::Handled
            }
            Err(e) => {
                counter!("rq_messages_failed_total", "queue" => self.name.clone()).increment(1);
                error!(
                    queue = %self.name,
                    message_id = %message.id,
                    message_name = %message.name,
                    error = %e,
                    "Failed to handle message"
                );

                if message.should_retry() {
                    match self.retry_message(message).await {
                        Ok(()) => HandleOutcome::Retried,
                        Err(e) => {
                            error!(
                                queue = %self.name,
                                message_id = %message.id,
                                message_name = %message.name,
                                error = %e,
                                "Failed to retry message"
                            );
                            HandleOutcome::RetryFailed
                        }
                    }
                } else {
                    counter!("rq_messages_exhausted_total", "queue" => self.name.clone()).increment(1);
                    error!(
                        queue = %self.name,
                        message_id = %message.id,
                        message_name = %message.name,
                        retry_count = message.retry_count,
                        "Message reached max retries"
                    );
                    HandleOutcome::Exhausted
                }
            }
        };

        let message_id = message.id.clone();
        if let Err(e) = delivery.ack().await {
            error!(
                queue = %self.name,
                message_id = %message_id,
                error = %e,
                "Failed to acknowledge message"
            );
        }

        outcome
    }

    /// Dispatch the follow-up of a failed message with exponential backoff.
    pub async fn retry_message(&self, message: &Message) -> Result<()> {
        let retry = message.next_retry();
        self.dispatch(&retry).await?;

        counter!("rq_messages_retried_total", "queue" => self.name.clone()).increment(1);
        info!(
            queue = %self.name,
            message_id = %retry.id,
            message_name = %retry.name,
            retry_count = retry.retry_count,
            delay = retry.delay,
            "Retry message dispatched"
        );
        Ok(())
    }

    /// Fetch and handle messages until the queue is shut down.
    ///
    /// Fetch errors are transient: they are logged and the loop waits one
    /// poll interval before fetching again. A handler already running when
    /// shutdown is signaled is allowed to finish.
    pub async fn work(&self) {
        debug!(queue = %self.name, "Worker started");

        while !self.shutdown.is_triggered() {
            match self.fetch_message(std::future::pending::<()>()).await {
                Ok(Some(delivery)) => {
                    self.handle_message(delivery).await;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(queue = %self.name, error = %e, "Error fetching messages");
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = self.shutdown.wait() => {}
                    }
                }
            }
        }

        debug!(queue = %self.name, "Worker exited");
    }

    /// Stop fetching. Idempotent; in-flight handlers are not interrupted.
    pub fn shutdown(&self) {
        if !self.shutdown.trigger() {
            return;
        }
        info!(queue = %self.name, "Queue shutdown initiated, workers will finish current messages");
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("handlers", &self.handlers.len())
            .field("poll_interval", &self.poll_interval)
            .field("workers", &self.workers)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_for;
    use crate::memory::InMemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn queue_with(broker: &InMemoryBroker, handlers: Vec<Arc<dyn MessageHandler>>) -> Queue {
        Queue::new("orders", handlers, Arc::new(broker.clone()))
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(5))
    }

    async fn next(queue: &Queue) -> Delivery {
        queue
            .fetch_message(std::future::pending::<()>())
            .await
            .unwrap()
            .expect("a delivery")
    }

    #[tokio::test]
    async fn test_handled_message_is_acked() {
        let broker = InMemoryBroker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let queue = queue_with(
            &broker,
            vec![handler_for("created", move |_msg| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })],
        )
        .await;

        queue.dispatch(&Message::from_bytes("created", b"{}".to_vec())).await.unwrap();
        let outcome = queue.handle_message(next(&queue).await).await;

        assert_eq!(outcome, HandleOutcome::Handled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = broker.stats("orders");
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn test_first_matching_handler_wins() {
        let broker = InMemoryBroker::new();
        let hits = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let first = hits.clone();
        let second = hits.clone();
        let queue = queue_with(
            &broker,
            vec![
                handler_for("created", move |_msg| {
                    let hits = first.clone();
                    async move {
                        hits.lock().push("first");
                        Ok(())
                    }
                }),
                handler_for("created", move |_msg| {
                    let hits = second.clone();
                    async move {
                        hits.lock().push("second");
                        Ok(())
                    }
                }),
            ],
        )
        .await;

        queue.dispatch(&Message::from_bytes("created", Vec::new())).await.unwrap();
        queue.handle_message(next(&queue).await).await;

        assert_eq!(*hits.lock(), vec!["first"]);
    }

    #[tokio::test]
    async fn test_failed_message_is_retried_with_backoff() {
        let broker = InMemoryBroker::new();
        let queue = queue_with(
            &broker,
            vec![handler_for("created", |_msg| async { Err(anyhow::anyhow!("boom")) })],
        )
        .await;

        let original = Message::from_bytes("created", b"{}".to_vec()).with_id("msg-1");
        queue.dispatch(&original).await.unwrap();
        let outcome = queue.handle_message(next(&queue).await).await;

        assert_eq!(outcome, HandleOutcome::Retried);
        let pending = broker.pending("orders");
        assert_eq!(pending.len(), 1);
        let retry = Message::decode(&pending[0]).unwrap();
        assert_eq!(retry.id, "msg-1");
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.delay, 100);
        assert_eq!(broker.stats("orders").acked, 1);
    }

    #[tokio::test]
    async fn test_exhausted_message_is_not_retried() {
        let broker = InMemoryBroker::new();
        let queue = queue_with(
            &broker,
            vec![handler_for("created", |_msg| async { Err(anyhow::anyhow!("boom")) })],
        )
        .await;

        let msg = Message::from_bytes("created", Vec::new()).with_retry_count(3);
        queue.dispatch(&msg).await.unwrap();
        let outcome = queue.handle_message(next(&queue).await).await;

        assert_eq!(outcome, HandleOutcome::Exhausted);
        assert!(broker.pending("orders").is_empty());
        assert_eq!(broker.stats("orders").acked, 1);
    }

    #[tokio::test]
    async fn test_retry_dispatch_failure_still_acks() {
        let broker = InMemoryBroker::new();
        let queue = queue_with(
            &broker,
            vec![handler_for("created", |_msg| async { Err(anyhow::anyhow!("boom")) })],
        )
        .await;

        queue.dispatch(&Message::from_bytes("created", Vec::new())).await.unwrap();
        let delivery = next(&queue).await;
        broker.set_fail_publish(true);

        assert_eq!(queue.handle_message(delivery).await, HandleOutcome::RetryFailed);
        let stats = broker.stats("orders");
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.ready, 0);
    }

    #[tokio::test]
    async fn test_unhandled_message_is_left_for_redelivery() {
        let broker = InMemoryBroker::new();
        let queue = queue_with(&broker, vec![handler_for("created", |_msg| async { Ok(()) })]).await;

        queue.dispatch(&Message::from_bytes("deleted", Vec::new())).await.unwrap();
        let outcome = queue.handle_message(next(&queue).await).await;

        assert_eq!(outcome, HandleOutcome::Unhandled);
        let stats = broker.stats("orders");
        assert_eq!(stats.acked, 0);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.redelivered, 1);
    }

    #[tokio::test]
    async fn test_fetch_rejects_undecodable_payload() {
        let broker = InMemoryBroker::new();
        let queue = queue_with(&broker, Vec::new()).await;

        let channel = broker.open_channel().await.unwrap();
        channel.publish("orders", b"not json", Duration::ZERO).await.unwrap();

        let err = queue.fetch_message(std::future::pending::<()>()).await.unwrap_err();
        assert!(matches!(err, crate::QueueError::Message(_)));
    }

    #[tokio::test]
    async fn test_fetch_returns_none_on_cancel() {
        let broker = InMemoryBroker::new();
        let queue = queue_with(&broker, Vec::new()).await;

        let fetched = queue
            .fetch_message(tokio::time::sleep(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let broker = InMemoryBroker::new();
        let queue = queue_with(&broker, Vec::new()).await;

        assert!(!queue.is_shutdown());
        queue.shutdown();
        queue.shutdown();
        assert!(queue.is_shutdown());
        assert!(queue.fetch_message(std::future::pending::<()>()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_with_workers_has_a_floor_of_one() {
        let broker = InMemoryBroker::new();
        let queue = queue_with(&broker, Vec::new()).await.with_workers(0);
        assert_eq!(queue.workers(), 1);
    }
}
