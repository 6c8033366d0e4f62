//! In-memory broker
//!
//! Mirrors the broker semantics the queues rely on: durable named queues,
//! delayed visibility, get-one without auto-ack, and redelivery of a
//! delivery that is dropped without being acknowledged. Time is read from
//! the tokio clock so paused-time tests can step through delays.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::broker::{Acknowledger, Broker, BrokerChannel, RawDelivery};
use crate::{QueueError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Published and not yet fetched (including not-yet-visible)
    pub ready: usize,
    /// Fetched and not yet acknowledged
    pub unacked: usize,
    pub acked: usize,
    pub published: usize,
    pub redelivered: usize,
}

#[derive(Debug)]
struct Pending {
    visible_at: Instant,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Pending>,
    stats: QueueStats,
}

type SharedQueues = Arc<Mutex<HashMap<String, QueueState>>>;

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    queues: SharedQueues,
    fail_publish: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent publish fail with a transport error.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn stats(&self, queue: &str) -> QueueStats {
        let queues = self.queues.lock();
        queues.get(queue).map(|q| q.stats).unwrap_or_default()
    }

    /// Bodies waiting in `queue`, visible or not, in publish order.
    pub fn pending(&self, queue: &str) -> Vec<Vec<u8>> {
        let queues = self.queues.lock();
        queues
            .get(queue)
            .map(|q| q.ready.iter().map(|p| p.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>> {
        Ok(Box::new(InMemoryChannel {
            queues: self.queues.clone(),
            fail_publish: self.fail_publish.clone(),
        }))
    }
}

struct InMemoryChannel {
    queues: SharedQueues,
    fail_publish: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.queues.lock().entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], delay: Duration) -> Result<()> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(QueueError::Transport("publish rejected by broker".to_string()));
        }

        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Transport(format!("no queue bound to routing key {}", queue)))?;

        state.ready.push_back(Pending {
            visible_at: Instant::now() + delay,
            body: payload.to_vec(),
        });
        state.stats.ready += 1;
        state.stats.published += 1;
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<RawDelivery>> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| QueueError::Transport(format!("queue {} not declared", queue)))?;

        let now = Instant::now();
        let Some(position) = state.ready.iter().position(|p| p.visible_at <= now) else {
            return Ok(None);
        };
        let Some(pending) = state.ready.remove(position) else {
            return Ok(None);
        };

        state.stats.ready -= 1;
        state.stats.unacked += 1;

        Ok(Some(RawDelivery {
            body: pending.body.clone(),
            acker: Box::new(InMemoryAcker {
                queues: self.queues.clone(),
                queue: queue.to_string(),
                body: Some(pending.body),
            }),
        }))
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

struct InMemoryAcker {
    queues: SharedQueues,
    queue: String,
    // Some until acknowledged
    body: Option<Vec<u8>>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.body = None;
        let mut queues = this.queues.lock();
        if let Some(state) = queues.get_mut(&this.queue) {
            state.stats.unacked -= 1;
            state.stats.acked += 1;
        }
        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        let Some(body) = self.body.take() else {
            return;
        };
        let mut queues = self.queues.lock();
        if let Some(state) = queues.get_mut(&self.queue) {
            state.ready.push_front(Pending {
                visible_at: Instant::now(),
                body,
            });
            state.stats.unacked -= 1;
            state.stats.ready += 1;
            state.stats.redelivered += 1;
        }
    }
}
