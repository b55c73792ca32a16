//! Retry with exponential backoff for retryable delivery failures

use crate::config::DeliveryConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            config.max_retries,
            Duration::from_secs(config.retry_base_secs),
            Duration::from_secs(config.retry_max_delay_secs),
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a message that has already been retried `retry_count` times may
    /// be retried again
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    /// Delay before the next attempt: `base * 2^retry_count`, capped
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        debug!(retry_count, delay_secs = delay.as_secs(), "Calculated retry delay");
        delay
    }

    /// Instant of the next attempt after a failure at `now`
    pub fn next_attempt(&self, retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        now + delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for(1), Duration::from_secs(120));
        assert_eq!(policy.delay_for(2), Duration::from_secs(240));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::new(10, Duration::from_secs(60), Duration::from_secs(300));
        assert_eq!(policy.delay_for(5), Duration::from_secs(300));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_next_attempt() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        assert_eq!(policy.next_attempt(1, now), now + chrono::Duration::seconds(120));
    }
}
