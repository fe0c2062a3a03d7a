//! Retry timing for handler chains.
//!
//! Computes backoff delays with jitter and decides whether a failed handler
//! chain gets another attempt. The sleeping itself happens in
//! [`crate::resilience::RetryResilience`] so it can honor cancellation.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Retry policy for a handler chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,

    /// Base delay for backoff calculation.
    pub base_delay: Duration,

    /// Maximum delay between attempts.
    pub max_delay: Duration,

    /// Jitter percentage (0.0 to 1.0) to add randomness.
    pub jitter_factor: f64,

    /// Strategy for calculating backoff delays.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackoffStrategy {
    /// Fixed delay between retries.
    Fixed,
    /// Exponential backoff: delay doubles each attempt.
    Exponential,
    /// Linear backoff: delay increases by base amount each attempt.
    Linear,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry {
        /// Wait before the next attempt
        delay: Duration,
    },
    /// Stop retrying.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Decides whether attempt `attempt_number` (1-based) that failed with
    /// `error` gets another try.
    pub fn decide(&self, attempt_number: u32, error: &ChannelError) -> RetryDecision {
        if attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts),
            };
        }

        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        RetryDecision::Retry { delay: self.delay_for(attempt_number) }
    }

    /// Delay after failed attempt `attempt_number`, jittered and capped.
    pub fn delay_for(&self, attempt_number: u32) -> Duration {
        let base_delay = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay * attempt_number.max(1),
            BackoffStrategy::Exponential => {
                let exponent = attempt_number.saturating_sub(1).min(20);
                self.base_delay * 2_u32.saturating_pow(exponent)
            },
        };

        let capped_delay = std::cmp::min(base_delay, self.max_delay);

        std::cmp::min(apply_jitter(capped_delay, self.jitter_factor), self.max_delay)
    }
}

/// Randomizes a delay by ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped_jitter = jitter_factor.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped_jitter;
    let jitter_offset = rng.random_range(-jitter_range..=jitter_range);
    let jittered_secs = duration.as_secs_f64() + jitter_offset;

    Duration::from_secs_f64(jittered_secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            backoff_strategy: strategy,
        }
    }

    #[test]
    fn exponential_backoff_increases_correctly() {
        let policy = no_jitter(BackoffStrategy::Exponential);

        let delays: Vec<_> = (1..=4).map(|attempt| policy.delay_for(attempt)).collect();

        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(800),
            ]
        );
    }

    #[test]
    fn linear_and_fixed_strategies() {
        let linear = no_jitter(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(1), Duration::from_millis(100));
        assert_eq!(linear.delay_for(3), Duration::from_millis(300));

        let fixed = no_jitter(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(1), fixed.delay_for(7));
    }

    #[test]
    fn retry_respects_maximum_attempts() {
        let policy = RetryPolicy { max_attempts: 3, ..Default::default() };
        let error = ChannelError::handler(&anyhow::anyhow!("downstream unavailable"));

        assert!(matches!(policy.decide(2, &error), RetryDecision::Retry { .. }));
        match policy.decide(3, &error) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("should not retry at max attempts"),
        }
    }

    #[test]
    fn non_retryable_errors_rejected() {
        let policy = RetryPolicy::default();
        let error = ChannelError::CircuitOpen { name: "orders".to_string() };

        match policy.decide(1, &error) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("non-retryable")),
            RetryDecision::Retry { .. } => unreachable!("open circuits are not retried"),
        }
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base_delay = Duration::from_secs(10);
        let mut seen_delays = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base_delay, 0.5);
            seen_delays.insert(jittered.as_millis());
        }

        assert!(seen_delays.len() > 1, "jitter should create variation");
        for &delay_ms in &seen_delays {
            assert!((5_000..=15_000).contains(&delay_ms), "delay out of range: {delay_ms}ms");
        }
    }

    #[test]
    fn max_delay_enforced() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(1),
            ..no_jitter(BackoffStrategy::Exponential)
        };

        assert_eq!(policy.delay_for(15), Duration::from_secs(1));
    }
}
