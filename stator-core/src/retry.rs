//! Retry and backoff policy for failed transition attempts

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry on the next scheduling cycle
    None,

    /// Fixed delay between retries
    Fixed,

    /// Exponential backoff, capped at `max_delay`
    Exponential,
}

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempt ceiling; an entity with this many consecutive failures is frozen
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub initial_delay: Duration,

    /// Maximum delay between attempts
    pub max_delay: Duration,

    /// Retry strategy to use
    pub strategy: RetryStrategy,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(3600),
            strategy: RetryStrategy::Exponential,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed delay between attempts
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            strategy: RetryStrategy::Fixed,
            backoff_multiplier: 1.0,
        }
    }

    /// Exponential policy doubling from `initial_delay` up to `max_delay`
    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            strategy: RetryStrategy::Exponential,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay to wait after `attempt_count` consecutive failures.
    ///
    /// Zero failures means the entity is due immediately.
    pub fn backoff(&self, attempt_count: u32) -> Duration {
        if attempt_count == 0 {
            return Duration::ZERO;
        }
        match self.strategy {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed => self.initial_delay,
            RetryStrategy::Exponential => {
                let exponent = (attempt_count - 1).min(i32::MAX as u32) as i32;
                let delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
                let capped = delay.min(self.max_delay.as_secs_f64());
                if capped.is_finite() && capped >= 0.0 {
                    Duration::from_secs_f64(capped)
                } else {
                    self.max_delay
                }
            }
        }
    }

    /// [`backoff`](Self::backoff) as a chrono duration for timestamp arithmetic
    pub fn backoff_chrono(&self, attempt_count: u32) -> chrono::Duration {
        chrono::Duration::from_std(self.backoff(attempt_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)))
    }

    /// Check if another attempt is allowed after `attempt_count` failures
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Whether the attempt ceiling has been reached
    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        !self.should_retry(attempt_count)
    }

    /// Validate the policy parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err("max_delay must be >= initial_delay".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(policy.is_exhausted(3));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_secs(5));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60), 20);

        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(7), Duration::from_secs(60));
        assert_eq!(policy.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_validation_rejects_zero_attempts() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_shrinking_multiplier() {
        let policy = RetryPolicy {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_up_to_cap(
            initial_ms in 1u64..10_000,
            cap_factor in 1u64..100,
            multiplier in 1.0f64..4.0,
            attempt in 0u32..64,
        ) {
            let initial = Duration::from_millis(initial_ms);
            let policy = RetryPolicy {
                max_attempts: 100,
                initial_delay: initial,
                max_delay: initial * cap_factor as u32,
                strategy: RetryStrategy::Exponential,
                backoff_multiplier: multiplier,
            };

            prop_assert!(policy.backoff(attempt) <= policy.backoff(attempt + 1));
            prop_assert!(policy.backoff(attempt + 1) <= policy.max_delay);
        }

        #[test]
        fn backoff_resets_to_base_after_success(attempt in 1u32..64) {
            let policy = RetryPolicy::exponential(
                Duration::from_secs(1),
                Duration::from_secs(600),
                100,
            );
            // A success resets attempt_count to zero; the next failure waits the base delay
            prop_assert!(policy.backoff(attempt) >= policy.backoff(1));
            prop_assert_eq!(policy.backoff(1), policy.initial_delay);
            prop_assert_eq!(policy.backoff(0), Duration::ZERO);
        }
    }
}
