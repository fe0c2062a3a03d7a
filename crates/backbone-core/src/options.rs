//! Consumer options steering acknowledgment, dispatch and termination.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of entries claimed or read per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// When the pipeline commits an entry on the handler's behalf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckBehavior {
    /// Commit only when some handler reported the announcement as handled.
    #[default]
    OnSucceed,
    /// Commit once the handler chain has run, whatever its outcome.
    OnFinally,
    /// Never commit automatically; handlers resolve the ack themselves.
    Manual,
}

/// What to do with an announcement no handler claimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialConsumerBehavior {
    /// Leave it unhandled and move on.
    #[default]
    Loose,
    /// Raise a per-message error; a missing handler is a contract violation.
    ThrowIfNotHandled,
    /// A later consumer stage owns the ack, so `OnFinally` does not commit.
    Sequential,
}

/// How an announcement is fanned out over registered handlers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiConsumerBehavior {
    /// Invoke handlers in registration order and stop at the first match.
    #[default]
    FirstMatch,
    /// Invoke every handler concurrently.
    All,
}

/// Options for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Entries claimed or read per batch.
    pub batch_size: usize,

    /// Announcements to dispatch before the subscription ends (0 = no limit).
    ///
    /// Failed dispatches do not count. An entry redelivered after a failure
    /// counts once it dispatches cleanly.
    pub max_messages: u64,

    /// Commit policy.
    pub ack_behavior: AckBehavior,

    /// Unhandled announcement policy.
    pub partial_behavior: PartialConsumerBehavior,

    /// Handler fan-out policy.
    pub multi_consumer_behavior: MultiConsumerBehavior,

    /// Stop once the stream is drained or an entry newer than this shows up.
    pub fetch_until: Option<DateTime<Utc>>,

    /// Minimum idle time before a pending entry may be claimed.
    pub claim_min_idle: Duration,

    /// Register the subscription in the process-wide keep-alive registry.
    pub keep_alive: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_messages: 0,
            ack_behavior: AckBehavior::default(),
            partial_behavior: PartialConsumerBehavior::default(),
            multi_consumer_behavior: MultiConsumerBehavior::default(),
            fetch_until: None,
            claim_min_idle: Duration::ZERO,
            keep_alive: false,
        }
    }
}

impl ConsumerOptions {
    /// Sets the fetch cutoff from unix seconds; out-of-range values clear it.
    #[must_use]
    pub fn fetch_until_unix(mut self, seconds: i64) -> Self {
        self.fetch_until = DateTime::from_timestamp(seconds, 0);
        self
    }

    /// Returns true when a message ceiling is configured.
    pub fn has_message_limit(&self) -> bool {
        self.max_messages != 0
    }

    /// Returns true when the pipeline should commit in its finally step.
    pub fn commits_on_finally(&self) -> bool {
        self.ack_behavior == AckBehavior::OnFinally
            && self.partial_behavior != PartialConsumerBehavior::Sequential
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_loose_first_match_on_succeed() {
        let options = ConsumerOptions::default();

        assert_eq!(options.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(options.ack_behavior, AckBehavior::OnSucceed);
        assert_eq!(options.partial_behavior, PartialConsumerBehavior::Loose);
        assert_eq!(options.multi_consumer_behavior, MultiConsumerBehavior::FirstMatch);
        assert!(!options.has_message_limit());
        assert!(options.fetch_until.is_none());
    }

    #[test]
    fn sequential_suppresses_finally_commit() {
        let mut options =
            ConsumerOptions { ack_behavior: AckBehavior::OnFinally, ..Default::default() };
        assert!(options.commits_on_finally());

        options.partial_behavior = PartialConsumerBehavior::Sequential;
        assert!(!options.commits_on_finally());
    }

    #[test]
    fn fetch_until_unix_sets_cutoff() {
        let options = ConsumerOptions::default().fetch_until_unix(1_700_000_000);
        assert_eq!(options.fetch_until.map(|cutoff| cutoff.timestamp()), Some(1_700_000_000));
    }
}
