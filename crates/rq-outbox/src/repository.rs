use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::message::OutboxMessage;
use crate::Result;

/// Relay-side access to the outbox table.
///
/// Every mutation runs in its own transaction.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Claim up to `limit` ready rows, oldest `available_at` first.
    ///
    /// A row is ready when `available_at <= now`, `retry_count < max_retries`
    /// and no live claim holds it. Claimed rows are leased for `lease`;
    /// a row whose lease lapsed becomes claimable again.
    async fn claim_ready(&self, limit: usize, max_retries: u32, lease: Duration) -> Result<Vec<OutboxMessage>>;

    /// Delete a relayed row. `Ok(false)` if it was already gone.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Record a failed attempt and release the claim.
    async fn schedule_retry(
        &self,
        id: Uuid,
        retry_count: u32,
        available_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<()>;

    async fn find(&self, id: Uuid) -> Result<Option<OutboxMessage>>;
}

/// Lease expiry for a claim taken at `now`.
pub(crate) fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|lease| now.checked_add_signed(lease))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Rows come back from `UPDATE ... RETURNING` in no particular order.
pub(crate) fn oldest_first(mut rows: Vec<OutboxMessage>) -> Vec<OutboxMessage> {
    rows.sort_by(|a, b| a.available_at.cmp(&b.available_at).then(a.created_at.cmp(&b.created_at)));
    rows
}
