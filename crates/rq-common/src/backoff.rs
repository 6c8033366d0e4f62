//! Exponential backoff shared by broker-level retries and outbox rescheduling.

use std::time::Duration;

/// Base delay for the first retry
const BASE_DELAY_MS: u64 = 100;

/// Delay in milliseconds before retry number `retry_count`.
///
/// `0` for the original attempt, then `100 * 2^(retry_count - 1)`,
/// saturating instead of overflowing for absurd counts.
pub fn backoff_ms(retry_count: u32) -> u64 {
    if retry_count == 0 {
        return 0;
    }
    1u64.checked_shl(retry_count - 1)
        .and_then(|factor| BASE_DELAY_MS.checked_mul(factor))
        .unwrap_or(u64::MAX)
}

pub fn backoff(retry_count: u32) -> Duration {
    Duration::from_millis(backoff_ms(retry_count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_attempt_has_no_delay() {
        assert_eq!(backoff_ms(0), 0);
        assert_eq!(backoff(0), Duration::ZERO);
    }

    #[test]
    fn test_doubles_per_retry() {
        assert_eq!(backoff_ms(1), 100);
        assert_eq!(backoff_ms(2), 200);
        assert_eq!(backoff_ms(3), 400);
        assert_eq!(backoff_ms(4), 800);
        for retry in 1..20u32 {
            assert_eq!(backoff_ms(retry), 100 * 2u64.pow(retry - 1));
        }
    }

    #[test]
    fn test_saturates() {
        assert_eq!(backoff_ms(64), u64::MAX);
        assert_eq!(backoff_ms(u32::MAX), u64::MAX);
    }
}
