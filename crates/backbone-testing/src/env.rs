//! In-memory test environment for channel integration tests.

use std::{sync::Arc, time::Duration};

use backbone_channel::{
    store::memory::MemoryStreamStore, BackoffSettings, ConsumerChannel, ConsumerPlan,
    HandlerChain, SubscriptionHandle,
};
use backbone_core::{Bucket, Clock, EntryId, StreamKey, TestClock};

use crate::init_tracing;

/// Memory store, virtual clock and a channel wired to both.
#[derive(Debug, Clone)]
pub struct TestEnv {
    /// Store shared by producers and the channel.
    pub store: MemoryStreamStore,
    /// Virtual clock driving backoff and claim idle times.
    pub clock: TestClock,
    /// Channel consuming from `store`.
    pub channel: ConsumerChannel,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    /// Creates an environment with default backoff bounds.
    pub fn new() -> Self {
        Self::with_backoff(BackoffSettings::default())
    }

    /// Creates an environment with custom backoff bounds.
    pub fn with_backoff(backoff: BackoffSettings) -> Self {
        init_tracing();

        let clock = TestClock::new();
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = MemoryStreamStore::with_clock(Arc::clone(&shared_clock));
        let channel = ConsumerChannel::new(Arc::new(store.clone()))
            .with_clock(shared_clock)
            .with_backoff(backoff);

        Self { store, clock, channel }
    }

    /// Clock as the trait object the channel expects.
    pub fn shared_clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    /// Publishes an announcement produced now with one `body` segment.
    pub async fn publish(&self, key: &StreamKey, message_id: &str, operation: &str) -> EntryId {
        let produced_at = self.clock.now_utc().timestamp();
        self.publish_at(key, message_id, operation, produced_at).await
    }

    /// Publishes an announcement produced at `produced_at` unix seconds.
    pub async fn publish_at(
        &self,
        key: &StreamKey,
        message_id: &str,
        operation: &str,
        produced_at: i64,
    ) -> EntryId {
        let segments = Bucket::empty().add_range([("body", format!("payload of {message_id}"))]);
        self.store
            .publish(key, message_id, operation, produced_at, &segments, &Bucket::empty())
            .await
    }

    /// Publishes `count` announcements named `{prefix}-{n}`, starting at 1.
    pub async fn publish_many(&self, key: &StreamKey, prefix: &str, operation: &str, count: usize) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(count);
        for n in 1..=count {
            ids.push(self.publish(key, &format!("{prefix}-{n}"), operation).await);
        }
        ids
    }

    /// Subscribes `chain` to `plan` on this environment's channel.
    pub fn subscribe(&self, plan: ConsumerPlan, chain: HandlerChain) -> SubscriptionHandle {
        self.channel.subscribe(plan, chain)
    }

    /// Yields to the runtime until `condition` holds.
    ///
    /// Panics when the condition still fails after `timeout` of wall time.
    pub async fn wait_until<F>(&self, timeout: Duration, mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let waited = tokio::time::timeout(timeout, async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await;
        assert!(waited.is_ok(), "condition not met within {timeout:?}");
    }
}
