//! Delivery retry with backoff and jitter.

use rand::Rng;
use std::time::Duration;

use crate::config::NotificationConfig;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Constant delay between retries.
    Constant(Duration),
    /// Exponential: delay * 2^(attempt - 1).
    Exponential(Duration),
}

impl BackoffStrategy {
    /// Calculates the delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Constant(d) => *d,
            Self::Exponential(d) => {
                d.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            }
        }
    }
}

/// Jitter strategy for adding randomness to delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    /// No jitter.
    None,
    /// Equal jitter: [delay/2, delay].
    Equal,
}

impl JitterStrategy {
    /// Applies jitter to a delay.
    #[must_use]
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            Self::None => delay,
            Self::Equal => {
                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let half = millis / 2;
                Duration::from_millis(half + rand::thread_rng().gen_range(0..=millis - half))
            }
        }
    }
}

/// How often and how patiently a delivery is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
}

impl RetryPolicy {
    /// Creates a new retry policy.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: BackoffStrategy, jitter: JitterStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            jitter,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.backoff.delay(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&NotificationConfig::default())
    }
}

impl From<&NotificationConfig> for RetryPolicy {
    fn from(config: &NotificationConfig) -> Self {
        Self::new(
            config.max_attempts,
            BackoffStrategy::Exponential(Duration::from_millis(config.base_delay_ms)),
            if config.jitter {
                JitterStrategy::Equal
            } else {
                JitterStrategy::None
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_backoff() {
        let strategy = BackoffStrategy::Constant(Duration::from_secs(1));
        assert_eq!(strategy.delay(1), Duration::from_secs(1));
        assert_eq!(strategy.delay(5), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_backoff() {
        let strategy = BackoffStrategy::Exponential(Duration::from_millis(200));
        assert_eq!(strategy.delay(1), Duration::from_millis(200));
        assert_eq!(strategy.delay(2), Duration::from_millis(400));
        assert_eq!(strategy.delay(4), Duration::from_millis(1600));
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(100);
        assert_eq!(JitterStrategy::None.apply(delay), delay);

        for _ in 0..100 {
            let equal = JitterStrategy::Equal.apply(delay);
            assert!(equal >= Duration::from_millis(50) && equal <= delay);
        }
    }

    #[test]
    fn test_policy_from_config() {
        let config = NotificationConfig {
            max_attempts: 5,
            base_delay_ms: 10,
            jitter: false,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_policy_always_attempts_once() {
        let policy = RetryPolicy::new(0, BackoffStrategy::Constant(Duration::ZERO), JitterStrategy::None);
        assert_eq!(policy.max_attempts, 1);
    }
}
