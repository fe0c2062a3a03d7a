//! Policies wrapping one pass through the handler chain.
//!
//! The dispatch pipeline hands its interceptor, handler and fallback stages
//! to a [`ResiliencePolicy`] as an [`Attempt`]. A policy may run it once,
//! retry it with backoff, or refuse it while a circuit is open.

use std::sync::Arc;

use backbone_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    circuit::{CircuitBreaker, CircuitConfig},
    error::{ChannelError, Result},
    retry::{RetryDecision, RetryPolicy},
};

/// One run of the handler chain; yields whether the announcement was handled.
#[async_trait::async_trait]
pub trait Attempt: Send + Sync {
    /// Runs the chain once.
    async fn attempt(&self) -> Result<bool>;
}

/// Strategy applied around each handler chain run.
#[async_trait::async_trait]
pub trait ResiliencePolicy: Send + Sync + std::fmt::Debug {
    /// Executes `attempt` under this policy.
    ///
    /// Implementations must stop waiting once `cancellation` fires.
    async fn execute(&self, attempt: &dyn Attempt, cancellation: &CancellationToken) -> Result<bool>;
}

/// Runs the chain exactly once.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResilience;

#[async_trait::async_trait]
impl ResiliencePolicy for NoResilience {
    async fn execute(&self, attempt: &dyn Attempt, _cancellation: &CancellationToken) -> Result<bool> {
        attempt.attempt().await
    }
}

/// Retries failed chains according to a [`RetryPolicy`].
#[derive(Debug)]
pub struct RetryResilience {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl RetryResilience {
    /// Creates a retrying policy sleeping on `clock`.
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { policy, clock }
    }
}

#[async_trait::async_trait]
impl ResiliencePolicy for RetryResilience {
    async fn execute(&self, attempt: &dyn Attempt, cancellation: &CancellationToken) -> Result<bool> {
        let mut attempt_number = 1;
        loop {
            let error = match attempt.attempt().await {
                Ok(handled) => return Ok(handled),
                Err(error) => error,
            };

            match self.policy.decide(attempt_number, &error) {
                RetryDecision::Retry { delay } => {
                    debug!(
                        attempt = attempt_number,
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying handler chain"
                    );
                    tokio::select! {
                        () = self.clock.sleep(delay) => {},
                        () = cancellation.cancelled() => return Err(ChannelError::Cancelled),
                    }
                    attempt_number += 1;
                },
                RetryDecision::GiveUp { reason } if error.is_retryable() => {
                    warn!(attempts = attempt_number, reason = %reason, "handler chain retries exhausted");
                    return Err(ChannelError::RetriesExhausted {
                        attempts: attempt_number,
                        last_error: error.to_string(),
                    });
                },
                RetryDecision::GiveUp { .. } => return Err(error),
            }
        }
    }
}

/// Fails fast while the handler chain keeps failing.
#[derive(Debug)]
pub struct CircuitBreakerResilience {
    breaker: CircuitBreaker,
}

impl CircuitBreakerResilience {
    /// Creates a breaker-guarded policy.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { breaker: CircuitBreaker::new(name, config, clock) }
    }

    /// Underlying breaker, for inspection.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait::async_trait]
impl ResiliencePolicy for CircuitBreakerResilience {
    async fn execute(&self, attempt: &dyn Attempt, _cancellation: &CancellationToken) -> Result<bool> {
        if !self.breaker.should_allow().await {
            return Err(ChannelError::CircuitOpen { name: self.breaker.name().to_string() });
        }

        let result = attempt.attempt().await;
        match &result {
            Ok(_) => self.breaker.record_success().await,
            Err(error) if error.is_retryable() => self.breaker.record_failure().await,
            // Contract violations and cancellations say nothing about health
            Err(_) => {},
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use backbone_core::TestClock;

    use super::*;
    use crate::{circuit::CircuitState, retry::BackoffStrategy};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self { failures_left: AtomicU32::new(failures), calls: AtomicU32::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl Attempt for Flaky {
        async fn attempt(&self) -> Result<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ChannelError::handler(&anyhow::anyhow!("downstream unavailable")));
            }
            Ok(true)
        }
    }

    fn retry_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    #[tokio::test]
    async fn retry_recovers_after_transient_failures() {
        let clock = TestClock::new();
        let policy = RetryResilience::new(retry_policy(3), Arc::new(clock.clone()));
        let attempt = Flaky::new(2);

        let handled = policy.execute(&attempt, &CancellationToken::new()).await.unwrap();

        assert!(handled);
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            clock.recorded_sleeps(),
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let clock = TestClock::new();
        let policy = RetryResilience::new(retry_policy(2), Arc::new(clock));
        let attempt = Flaky::new(5);

        let error = policy.execute(&attempt, &CancellationToken::new()).await.unwrap_err();

        assert!(matches!(error, ChannelError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_stops_on_cancellation() {
        let policy = RetryResilience::new(retry_policy(5), Arc::new(backbone_core::RealClock::new()));
        let attempt = Flaky::new(5);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let error = policy.execute(&attempt, &cancellation).await.unwrap_err();

        assert!(matches!(error, ChannelError::Cancelled));
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn circuit_opens_and_rejects() {
        let config = CircuitConfig { failure_threshold: 2, ..CircuitConfig::default() };
        let policy = CircuitBreakerResilience::new("orders", config, Arc::new(TestClock::new()));
        let attempt = Flaky::new(10);
        let cancellation = CancellationToken::new();

        for _ in 0..2 {
            assert!(policy.execute(&attempt, &cancellation).await.is_err());
        }
        let error = policy.execute(&attempt, &cancellation).await.unwrap_err();

        assert!(matches!(error, ChannelError::CircuitOpen { ref name } if name == "orders"));
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 2);
        assert_eq!(policy.breaker().state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn no_resilience_runs_once() {
        let attempt = Flaky::new(1);

        let result = NoResilience.execute(&attempt, &CancellationToken::new()).await;

        assert!(result.is_err());
        assert_eq!(attempt.calls.load(Ordering::SeqCst), 1);
    }
}
