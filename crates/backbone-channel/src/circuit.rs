//! Circuit breaker guarding handler chains.
//!
//! A breaker fails fast while a downstream dependency of the handlers is
//! down and probes recovery after a timeout. Time is read from the injected
//! [`Clock`] so transitions can be driven in tests.
//!
//! ```text
//!   CLOSED ── failure threshold or rate ──▶ OPEN
//!     ▲                                      │
//!     │ success threshold      open_timeout  │
//!     │                                      ▼
//!     └──────────────────────────────── HALF-OPEN ── any failure ──▶ OPEN
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use backbone_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Number of consecutive failures to trigger circuit open.
    pub failure_threshold: u32,
    /// Minimum attempts before considering failure rate.
    pub min_requests_for_rate: u32,
    /// Failure rate threshold (0.0 to 1.0) to trigger circuit open.
    pub failure_rate_threshold: f64,
    /// Time to wait before transitioning from Open to Half-Open.
    pub open_timeout: Duration,
    /// Number of consecutive successes to close circuit from Half-Open.
    pub success_threshold: u32,
    /// Maximum number of attempts allowed in Half-Open state.
    pub half_open_max_requests: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_requests_for_rate: 10,
            failure_rate_threshold: 0.5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
            half_open_max_requests: 2,
        }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all attempts allowed.
    Closed,
    /// Dependency unhealthy - attempts fail immediately.
    Open,
    /// Testing recovery - limited attempts allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Counters and state of a breaker.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current circuit state.
    pub state: CircuitState,
    /// Number of consecutive failures in current state.
    pub consecutive_failures: u32,
    /// Number of consecutive successes in Half-Open state.
    pub consecutive_successes: u32,
    /// Total attempts in current window.
    pub total_requests: u32,
    /// Failed attempts in current window.
    pub failed_requests: u32,
    /// When circuit was last opened.
    pub last_opened_at: Option<Instant>,
    /// Number of attempts made in Half-Open state.
    pub half_open_requests: u32,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            total_requests: 0,
            failed_requests: 0,
            last_opened_at: None,
            half_open_requests: 0,
        }
    }

    /// Current failure rate (0.0 to 1.0).
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            f64::from(self.failed_requests) / f64::from(self.total_requests)
        }
    }

    fn reset_counters(&mut self) {
        self.total_requests = 0;
        self.failed_requests = 0;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_requests = 0;
    }
}

/// Thread-safe named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    stats: Mutex<CircuitStats>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { name: name.into(), config, stats: Mutex::new(CircuitStats::new()), clock }
    }

    /// Breaker name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Determines if an attempt may proceed.
    ///
    /// Moves an open breaker to Half-Open once `open_timeout` has elapsed.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition with check required
    pub async fn should_allow(&self) -> bool {
        let mut stats = self.stats.lock().await;

        if stats.state == CircuitState::Open {
            let elapsed = stats
                .last_opened_at
                .map(|opened_at| self.clock.now().saturating_duration_since(opened_at));
            if elapsed.is_some_and(|elapsed| elapsed >= self.config.open_timeout) {
                info!(breaker = %self.name, "circuit breaker transitioning to half-open");
                stats.state = CircuitState::HalfOpen;
                stats.half_open_requests = 0;
                stats.consecutive_successes = 0;
            }
        }

        match stats.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => stats.half_open_requests < self.config.half_open_max_requests,
        }
    }

    /// Records a successful attempt.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_success(&self) {
        let mut stats = self.stats.lock().await;

        stats.total_requests += 1;
        stats.consecutive_failures = 0;

        match stats.state {
            CircuitState::Closed => {},
            CircuitState::Open => {
                warn!(breaker = %self.name, "recorded success for open circuit");
            },
            CircuitState::HalfOpen => {
                stats.consecutive_successes += 1;
                stats.half_open_requests += 1;

                if stats.consecutive_successes >= self.config.success_threshold {
                    info!(breaker = %self.name, "circuit breaker closing");
                    stats.state = CircuitState::Closed;
                    stats.reset_counters();
                }
            },
        }
    }

    /// Records a failed attempt.
    #[allow(clippy::significant_drop_tightening)] // Atomic state transition required
    pub async fn record_failure(&self) {
        let mut stats = self.stats.lock().await;

        stats.total_requests += 1;
        stats.failed_requests += 1;
        stats.consecutive_failures += 1;
        stats.consecutive_successes = 0;

        match stats.state {
            CircuitState::Closed => {
                if self.should_open(&stats) {
                    self.open(&mut stats);
                }
            },
            CircuitState::Open => {},
            CircuitState::HalfOpen => {
                stats.half_open_requests += 1;
                self.open(&mut stats);
            },
        }
    }

    /// Snapshot of the breaker counters.
    pub async fn stats(&self) -> CircuitStats {
        self.stats.lock().await.clone()
    }

    /// Current state without applying the open timeout.
    pub async fn state(&self) -> CircuitState {
        self.stats.lock().await.state
    }

    fn should_open(&self, stats: &CircuitStats) -> bool {
        if stats.consecutive_failures >= self.config.failure_threshold {
            return true;
        }

        stats.total_requests >= self.config.min_requests_for_rate
            && stats.failure_rate() >= self.config.failure_rate_threshold
    }

    fn open(&self, stats: &mut CircuitStats) {
        warn!(
            breaker = %self.name,
            consecutive_failures = stats.consecutive_failures,
            failure_rate = stats.failure_rate(),
            "circuit breaker opening"
        );
        stats.state = CircuitState::Open;
        stats.last_opened_at = Some(self.clock.now());
    }
}

#[cfg(test)]
mod tests {
    use backbone_core::TestClock;

    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            min_requests_for_rate: 5,
            failure_rate_threshold: 0.6,
            open_timeout: Duration::from_millis(100),
            success_threshold: 2,
            half_open_max_requests: 2,
        }
    }

    fn breaker(clock: &TestClock) -> CircuitBreaker {
        CircuitBreaker::new("orders", test_config(), Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn circuit_starts_closed() {
        let breaker = breaker(&TestClock::new());
        assert!(breaker.should_allow().await);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn consecutive_failures_open_circuit() {
        let breaker = breaker(&TestClock::new());

        for _ in 0..2 {
            breaker.record_failure().await;
            assert!(breaker.should_allow().await);
        }

        breaker.record_failure().await;
        assert!(!breaker.should_allow().await);
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn failure_rate_opens_circuit() {
        let breaker = breaker(&TestClock::new());

        breaker.record_success().await;
        breaker.record_success().await;
        breaker.record_failure().await;
        breaker.record_failure().await;

        // 4 attempts, below min_requests_for_rate
        assert!(breaker.should_allow().await);

        // 5 attempts, 3 failures = 60%
        breaker.record_failure().await;
        assert!(!breaker.should_allow().await);
    }

    #[tokio::test]
    async fn open_timeout_moves_to_half_open() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        assert!(!breaker.should_allow().await);

        clock.advance(Duration::from_millis(100));

        assert!(breaker.should_allow().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_successes_close_circuit() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        clock.advance(Duration::from_millis(150));
        assert!(breaker.should_allow().await);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.total_requests, 0);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            breaker.record_failure().await;
        }
        clock.advance(Duration::from_millis(150));
        assert!(breaker.should_allow().await);

        breaker.record_failure().await;

        assert!(!breaker.should_allow().await);
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_resets_failure_counters() {
        let breaker = breaker(&TestClock::new());

        breaker.record_failure().await;
        breaker.record_failure().await;
        assert_eq!(breaker.stats().await.consecutive_failures, 2);

        breaker.record_success().await;
        let stats = breaker.stats().await;
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.total_requests, 3);
        assert!((stats.failure_rate() - 0.6667).abs() < 0.01);
    }
}
