use chrono::{DateTime, Duration, Utc};
use rq_common::{backoff_ms, Message};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message waiting in the outbox for the relay to publish it.
///
/// Written in the same transaction as the business change that produced
/// it; afterwards only the relay touches it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    /// Name of the pool queue the message is relayed into
    pub queue_name: String,
    pub message: Message,
    pub created_at: DateTime<Utc>,
    /// Not selectable before this instant
    pub available_at: DateTime<Utc>,
    /// Failed relay attempts so far
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl OutboxMessage {
    pub fn new(queue_name: impl Into<String>, message: Message) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            queue_name: queue_name.into(),
            message,
            created_at: now,
            available_at: now,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Retry count and availability after a failed relay attempt at `now`.
    ///
    /// Never moves `available_at` backwards.
    pub fn next_attempt(&self, now: DateTime<Utc>) -> (u32, DateTime<Utc>) {
        let retry_count = self.retry_count.saturating_add(1);
        let delay_ms = i64::try_from(backoff_ms(retry_count)).unwrap_or(i64::MAX);
        let available_at = now
            .checked_add_signed(Duration::milliseconds(delay_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .max(self.available_at);
        (retry_count, available_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_outbox_message_is_immediately_available() {
        let msg = Message::from_bytes("created", b"{}".to_vec());
        let outbox = OutboxMessage::new("orders", msg.clone());

        assert_eq!(outbox.queue_name, "orders");
        assert_eq!(outbox.message, msg);
        assert_eq!(outbox.created_at, outbox.available_at);
        assert_eq!(outbox.retry_count, 0);
        assert!(outbox.last_error.is_none());
    }

    #[test]
    fn test_next_attempt_uses_backoff() {
        let mut outbox = OutboxMessage::new("orders", Message::from_bytes("created", Vec::new()));
        let now = outbox.available_at;

        assert_eq!(outbox.next_attempt(now), (1, now + Duration::milliseconds(100)));

        outbox.retry_count = 2;
        assert_eq!(outbox.next_attempt(now), (3, now + Duration::milliseconds(400)));
    }

    #[test]
    fn test_next_attempt_never_moves_backwards() {
        let mut outbox = OutboxMessage::new("orders", Message::from_bytes("created", Vec::new()));
        let now = outbox.available_at;
        outbox.available_at = now + Duration::seconds(10);

        let (_, available_at) = outbox.next_attempt(now);
        assert_eq!(available_at, outbox.available_at);
    }
}
