//! Retry policy with capped exponential backoff.
//!
//! Decides, for a failed step attempt, whether another attempt is allowed
//! and how long to wait before it. Pure: no clock, no I/O.

use std::time::Duration;

use stepwise_types::config::RetryConfig;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt after `delay`.
    Retry(Duration),
    /// The retry budget is spent; the step has failed terminally.
    Exhausted,
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Decide after the `attempt_count`-th failed attempt (1-based).
    ///
    /// Returns `Retry` for `1..=max_retries` and `Exhausted` beyond.
    pub fn decide(&self, attempt_count: u32, max_retries: u32) -> RetryDecision {
        if attempt_count > max_retries {
            return RetryDecision::Exhausted;
        }
        RetryDecision::Retry(self.delay_for(attempt_count))
    }

    /// Backoff delay before the attempt following `attempt_count`.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt_count);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(5))
    }

    #[test]
    fn test_retry_exhaustion_is_monotonic() {
        let policy = policy();
        for max_retries in 0..8 {
            for attempt in 1..=max_retries {
                assert!(
                    matches!(policy.decide(attempt, max_retries), RetryDecision::Retry(_)),
                    "attempt {attempt} of max {max_retries} should retry"
                );
            }
            assert_eq!(
                policy.decide(max_retries + 1, max_retries),
                RetryDecision::Exhausted
            );
            assert_eq!(
                policy.decide(max_retries + 5, max_retries),
                RetryDecision::Exhausted
            );
        }
    }

    #[test]
    fn test_zero_retries_fails_on_first_error() {
        assert_eq!(policy().decide(1, 0), RetryDecision::Exhausted);
    }

    #[test]
    fn test_delay_doubles_per_attempt() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        // Large exponents saturate instead of overflowing.
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_default_uses_config_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(30), Duration::from_secs(300));
    }
}
