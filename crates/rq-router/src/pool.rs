//! Pool - queues addressed by name
//!
//! Queues keep their insertion order, which is the order their run loops
//! are started and shut down in.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use rq_common::Message;
use rq_queue::{Queue, QueueError, QueuePublisher, Result};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

#[derive(Debug, Default)]
pub struct Pool {
    queues: IndexMap<String, Arc<Queue>>,
}

impl Pool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from `queues`, rejecting duplicate names.
    pub fn with_queues(queues: impl IntoIterator<Item = Queue>) -> Result<Self> {
        let mut pool = Self::new();
        for queue in queues {
            pool.add_queue(queue)?;
        }
        Ok(pool)
    }

    pub fn add_queue(&mut self, queue: Queue) -> Result<()> {
        if self.queues.contains_key(queue.name()) {
            return Err(QueueError::DuplicateQueue(queue.name().to_string()));
        }

        debug!(queue = %queue.name(), workers = queue.workers(), "Queue added to pool");
        self.queues.insert(queue.name().to_string(), Arc::new(queue));
        Ok(())
    }

    pub fn queue(&self, name: &str) -> Option<&Arc<Queue>> {
        self.queues.get(name)
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.queues.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Dispatch `message` to the queue named `queue_name`.
    pub async fn dispatch(&self, queue_name: &str, message: &Message) -> Result<()> {
        let queue = self
            .queues
            .get(queue_name)
            .ok_or_else(|| QueueError::QueueNotFound(queue_name.to_string()))?;
        queue.dispatch(message).await
    }

    /// Run every queue's workers concurrently.
    ///
    /// Returns once all run loops have exited, which happens after
    /// `shutdown` and once in-flight handlers are done. Dropping the future
    /// aborts the workers.
    pub async fn work(&self) {
        let mut workers = JoinSet::new();
        for queue in self.queues.values() {
            for worker_id in 0..queue.workers() {
                let queue = queue.clone();
                workers.spawn(async move {
                    debug!(queue = %queue.name(), worker_id, "Spawning queue worker");
                    queue.work().await;
                });
            }
        }

        info!(queues = self.queues.len(), workers = workers.len(), "Pool started");

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Queue worker task failed");
            }
        }

        info!("Pool stopped");
    }

    /// Signal shutdown to every queue in insertion order.
    pub fn shutdown(&self) {
        info!(queues = self.queues.len(), "Shutting down pool");
        for queue in self.queues.values() {
            queue.shutdown();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.queues.values().all(|queue| queue.is_shutdown())
    }
}

#[async_trait]
impl QueuePublisher for Pool {
    async fn dispatch(&self, queue_name: &str, message: &Message) -> Result<()> {
        Pool::dispatch(self, queue_name, message).await
    }
}
