//! Retry policy for transient fetch failures
//!
//! Delays grow as `base * 2^attempt` plus a uniform jitter in `[0, base)`, so
//! concurrent workers retrying the same host do not fall into lockstep.

use crate::config::ScraperConfig;
use crate::state::FailureKind;
use rand::Rng;
use std::time::Duration;

/// Decides whether and when a failed request is retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Base backoff delay
    pub base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self { max_retries, base }
    }

    pub fn from_config(config: &ScraperConfig) -> Self {
        Self::new(config.max_retries, config.retry_delay_base())
    }

    /// Decides whether to retry after a failed attempt
    ///
    /// # Arguments
    ///
    /// * `attempt` - Failed attempts so far, minus one (0 after the first failure)
    /// * `kind` - Classification of the failure
    /// * `retry_after` - Server-provided minimum wait (HTTP 429 `Retry-After`),
    ///   capped at [`RetryPolicy::max_backoff`]
    ///
    /// # Returns
    ///
    /// * `Some(delay)` - Retry after sleeping for `delay`
    /// * `None` - The failure is permanent or retries are exhausted
    pub fn should_retry(
        &self,
        attempt: u32,
        kind: FailureKind,
        retry_after: Option<Duration>,
    ) -> Option<Duration> {
        if !is_retryable(kind) || attempt >= self.max_retries {
            return None;
        }

        let delay = self.backoff_delay(attempt);
        Some(match retry_after {
            Some(minimum) => delay.max(minimum.min(self.max_backoff())),
            None => delay,
        })
    }

    /// Longest delay this policy ever waits: the last backoff step plus full jitter
    pub fn max_backoff(&self) -> Duration {
        exponential_delay(self.max_retries, self.base).saturating_add(self.base)
    }

    /// Calculates the backoff delay for a retry, jitter included
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter = self.base.mul_f64(rand::rng().random::<f64>());
        exponential_delay(attempt, self.base).saturating_add(jitter)
    }
}

/// Returns true for failure kinds that may succeed on a later attempt
pub fn is_retryable(kind: FailureKind) -> bool {
    matches!(kind, FailureKind::TransientNetwork)
}

/// Calculates `base * 2^attempt` without jitter
pub fn exponential_delay(attempt: u32, base: Duration) -> Duration {
    let multiplier = 2_u32.saturating_pow(attempt);
    base.saturating_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100))
    }

    #[test]
    fn test_exponential_delay() {
        let base = Duration::from_millis(100);
        assert_eq!(exponential_delay(0, base), Duration::from_millis(100));
        assert_eq!(exponential_delay(1, base), Duration::from_millis(200));
        assert_eq!(exponential_delay(2, base), Duration::from_millis(400));
        assert_eq!(exponential_delay(3, base), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_delay_overflow_protection() {
        let base = Duration::from_secs(u64::MAX / 2);
        assert!(exponential_delay(40, base) > Duration::ZERO);
    }

    #[test]
    fn test_backoff_includes_bounded_jitter() {
        let policy = create_test_policy();
        for attempt in 0..3 {
            let floor = exponential_delay(attempt, policy.base);
            for _ in 0..50 {
                let delay = policy.backoff_delay(attempt);
                assert!(delay >= floor);
                assert!(delay < floor + policy.base);
            }
        }
    }

    #[test]
    fn test_transient_failures_retry_until_exhausted() {
        let policy = create_test_policy();
        assert!(policy.should_retry(0, FailureKind::TransientNetwork, None).is_some());
        assert!(policy.should_retry(2, FailureKind::TransientNetwork, None).is_some());
        assert!(policy.should_retry(3, FailureKind::TransientNetwork, None).is_none());
    }

    #[test]
    fn test_permanent_failures_never_retry() {
        let policy = create_test_policy();
        for kind in [
            FailureKind::Permanent,
            FailureKind::Blocked,
            FailureKind::Structural,
            FailureKind::CircuitOpen,
            FailureKind::Cancelled,
        ] {
            assert!(policy.should_retry(0, kind, None).is_none(), "{} retried", kind);
        }
    }

    #[test]
    fn test_retry_after_is_lower_bound() {
        let policy = create_test_policy();
        let delay = policy
            .should_retry(0, FailureKind::TransientNetwork, Some(Duration::from_millis(600)))
            .unwrap();
        assert_eq!(delay, Duration::from_millis(600));
    }

    #[test]
    fn test_zero_retries() {
        let policy = RetryPolicy::new(0, Duration::from_millis(100));
        assert!(policy.should_retry(0, FailureKind::TransientNetwork, None).is_none());
    }

    #[test]
    fn test_retry_after_is_capped_at_max_backoff() {
        let policy = create_test_policy();
        assert_eq!(policy.max_backoff(), Duration::from_millis(900));

        let delay = policy
            .should_retry(0, FailureKind::TransientNetwork, Some(Duration::from_secs(999_999)))
            .unwrap();
        assert_eq!(delay, policy.max_backoff());
    }
}
