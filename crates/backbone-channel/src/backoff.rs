//! Exponential delay for idle polling.
//!
//! Shard readers and shard discovery wait between empty polls. The delay
//! starts at `min_delay`, doubles after every further empty poll up to
//! `max_delay`, and falls back to `min_delay` once work shows up.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounds of the idle backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSettings {
    /// First delay after an empty poll.
    pub min_delay: Duration,
    /// Ceiling of the delay.
    pub max_delay: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self { min_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5_000) }
    }
}

/// Doubling delay with reset.
#[derive(Debug, Clone)]
pub struct EmptyBatchBackoff {
    settings: BackoffSettings,
    next: Duration,
}

impl EmptyBatchBackoff {
    /// Creates a backoff positioned at `min_delay`.
    pub fn new(settings: BackoffSettings) -> Self {
        Self { settings, next: settings.min_delay }
    }

    /// Returns the delay to wait now and doubles the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = delay.saturating_mul(2).min(self.settings.max_delay);
        delay
    }

    /// Puts the backoff back at `min_delay`.
    pub fn reset(&mut self) {
        self.next = self.settings.min_delay;
    }

    /// Delay the next call to [`Self::next_delay`] returns.
    pub fn peek(&self) -> Duration {
        self.next
    }
}

impl Default for EmptyBatchBackoff {
    fn default() -> Self {
        Self::new(BackoffSettings::default())
    }
}
