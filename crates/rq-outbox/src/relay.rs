//! Outbox relay - publishes committed outbox rows into their queues

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use metrics::counter;
use rq_common::{Shutdown, DEFAULT_MAX_RETRIES};
use rq_queue::QueuePublisher;
use tracing::{debug, error, info, warn};

use crate::message::OutboxMessage;
use crate::repository::OutboxRepository;
use crate::Result;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Rows claimed per iteration, which also bounds concurrent dispatches
    pub batch_size: usize,
    /// Sleep between polls when nothing is ready
    pub poll_interval: Duration,
    /// Rows with this many failed attempts are never selected again
    pub max_retries: u32,
    /// How long a claimed row stays invisible to other relays
    pub claim_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            max_retries: DEFAULT_MAX_RETRIES,
            claim_timeout: Duration::from_secs(30),
        }
    }
}

/// What happened to one claimed row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Published and deleted
    Dispatched,
    /// Publish failed, retry scheduled with backoff
    Rescheduled,
    /// Publish failed and the row ran out of retries
    Exhausted,
    /// Bookkeeping failed; the row is picked up again once its claim lapses
    Deferred,
}

pub struct OutboxRelay {
    repository: Arc<dyn OutboxRepository>,
    publisher: Arc<dyn QueuePublisher>,
    config: RelayConfig,
    shutdown: Shutdown,
}

impl OutboxRelay {
    pub fn new(
        repository: Arc<dyn OutboxRepository>,
        publisher: Arc<dyn QueuePublisher>,
        config: RelayConfig,
    ) -> Self {
        Self {
            repository,
            publisher,
            config: RelayConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            shutdown: Shutdown::new(),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Poll and relay until shutdown. A batch already in flight when
    /// shutdown is signaled is finished first.
    pub async fn run(&self) {
        info!(
            batch_size = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_retries = self.config.max_retries,
            "Starting outbox relay"
        );

        while !self.shutdown.is_triggered() {
            match self.process_batch().await {
                Ok(0) => self.idle().await,
                Ok(count) => debug!(count, "Processed outbox batch"),
                Err(e) => {
                    error!(error = %e, "Failed to fetch outbox messages");
                    self.idle().await;
                }
            }
        }

        info!("Outbox relay stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = self.shutdown.wait() => {}
        }
    }

    /// Claim one batch of ready rows and relay all of them concurrently.
    ///
    /// Returns the number of rows claimed. The whole batch is settled
    /// before this returns.
    pub async fn process_batch(&self) -> Result<usize> {
        let rows = self
            .repository
            .claim_ready(self.config.batch_size, self.config.max_retries, self.config.claim_timeout)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let count = rows.len();
        join_all(rows.into_iter().map(|row| self.relay(row))).await;
        Ok(count)
    }

    /// Publish one row, then delete it or schedule its retry.
    pub async fn relay(&self, row: OutboxMessage) -> RelayOutcome {
        if let Err(e) = self.publisher.dispatch(&row.queue_name, &row.message).await {
            error!(
                outbox_id = %row.id,
                queue = %row.queue_name,
                message_id = %row.message.id,
                error = %e,
                "Failed to dispatch outbox message"
            );
            return self.schedule_retry(&row, &e.to_string()).await;
        }

        match self.repository.delete(row.id).await {
            Ok(deleted) => {
                if !deleted {
                    debug!(outbox_id = %row.id, "Outbox message already deleted");
                }
                counter!("rq_outbox_dispatched_total", "queue" => row.queue_name.clone()).increment(1);
                info!(
                    outbox_id = %row.id,
                    queue = %row.queue_name,
                    message_id = %row.message.id,
                    "Outbox message dispatched"
                );
                RelayOutcome::Dispatched
            }
            Err(e) => {
                error!(
                    outbox_id = %row.id,
                    queue = %row.queue_name,
                    message_id = %row.message.id,
                    error = %e,
                    "Failed to delete dispatched outbox message"
                );
                RelayOutcome::Deferred
            }
        }
    }

    async fn schedule_retry(&self, row: &OutboxMessage, last_error: &str) -> RelayOutcome {
        let (retry_count, available_at) = row.next_attempt(Utc::now());

        if let Err(e) = self
            .repository
            .schedule_retry(row.id, retry_count, available_at, last_error)
            .await
        {
            error!(
                outbox_id = %row.id,
                queue = %row.queue_name,
                error = %e,
                "Failed to update outbox message for retry"
            );
            return RelayOutcome::Deferred;
        }

        counter!("rq_outbox_rescheduled_total", "queue" => row.queue_name.clone()).increment(1);
        warn!(
            outbox_id = %row.id,
            queue = %row.queue_name,
            message_id = %row.message.id,
            retry = retry_count,
            available_at = %available_at,
            "Scheduled outbox message retry"
        );

        if retry_count >= self.config.max_retries {
            counter!("rq_outbox_exhausted_total", "queue" => row.queue_name.clone()).increment(1);
            error!(
                outbox_id = %row.id,
                queue = %row.queue_name,
                message_id = %row.message.id,
                retry = retry_count,
                "Outbox message reached max retries"
            );
            return RelayOutcome::Exhausted;
        }

        RelayOutcome::Rescheduled
    }

    /// Stop polling. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.trigger() {
            info!("Outbox relay shutdown initiated");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_triggered()
    }
}
