//! Retry helpers: status classification and full-jitter backoff.

use std::time::Duration;

use rand::Rng;

/// Whether an HTTP status is worth retrying at all.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

/// Exponential backoff with full jitter: a uniform draw from
/// `[0, min(cap, base * 2^attempt)]`.
///
/// Full jitter spreads concurrent retries across the whole interval so a
/// provider recovering from an outage is not hit by a synchronized wave.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt));
    let ceiling = exp.min(cap);
    if ceiling.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..=ceiling.as_nanos() as u64);
    Duration::from_nanos(nanos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(599));
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn test_backoff_within_bounds() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(5);
        for attempt in 0..10 {
            for _ in 0..50 {
                let delay = backoff_delay(attempt, base, cap);
                assert!(delay <= cap);
                let ceiling = base.saturating_mul(2u32.saturating_pow(attempt)).min(cap);
                assert!(delay <= ceiling);
            }
        }
    }

    #[test]
    fn test_backoff_zero_base() {
        assert_eq!(
            backoff_delay(3, Duration::ZERO, Duration::from_secs(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_backoff_large_attempt_saturates_at_cap() {
        let cap = Duration::from_secs(2);
        let delay = backoff_delay(64, Duration::from_millis(100), cap);
        assert!(delay <= cap);
    }
}
