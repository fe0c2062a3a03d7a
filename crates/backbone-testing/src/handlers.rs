//! Handler doubles for deterministic dispatch tests.
//!
//! Every double records what it saw so tests can assert on dispatch order
//! and on the context handed to handlers. Waiting helpers use bounded
//! timeouts to prevent CI hangs.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use backbone_channel::{AnnouncementHandler, ConsumerContext, ConsumerInterceptor, FallbackHandler};
use backbone_core::{Announcement, Metadata};
use bytes::Bytes;
use tokio::sync::Notify;

/// Default timeout for waiting on handler invocations in tests.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(2);

/// Counts invocations and wakes waiters on every one.
#[derive(Debug, Default)]
pub struct CompletionTracker {
    completed_count: AtomicUsize,
    notify: Notify,
}

impl CompletionTracker {
    /// Creates a tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records one completed invocation.
    pub fn record_completion(&self) {
        self.completed_count.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Number of completed invocations.
    pub fn completed_count(&self) -> usize {
        self.completed_count.load(Ordering::SeqCst)
    }

    /// Waits for at least `count` invocations.
    ///
    /// Panics after [`DEFAULT_HANDLER_TIMEOUT`].
    pub async fn wait_for_completions(&self, count: usize) {
        let result = tokio::time::timeout(DEFAULT_HANDLER_TIMEOUT, async {
            loop {
                let notified = self.notify.notified();
                if self.completed_count() >= count {
                    break;
                }
                notified.await;
            }
        })
        .await;

        assert!(
            result.is_ok(),
            "handlers did not complete in time. Expected: {count}, Actual: {}",
            self.completed_count()
        );
    }
}

/// What a [`RecordingHandler`] does with the ack of an announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// Leaves the ack to the pipeline.
    None,
    /// Commits the ack explicitly.
    Commit,
    /// Cancels the ack and with it the rest of the batch.
    Cancel,
}

/// One announcement as seen by a recording double.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    /// Message id of the announcement.
    pub message_id: String,
    /// Operation of the announcement.
    pub operation: String,
    /// Shard the announcement was read from.
    pub shard: String,
    /// Consumer that received it.
    pub consumer: String,
}

impl Seen {
    fn new(announcement: &Announcement, context: &ConsumerContext) -> Self {
        Self {
            message_id: announcement.metadata.message_id.clone(),
            operation: announcement.metadata.operation.clone(),
            shard: announcement.metadata.shard.clone(),
            consumer: context.consumer_name().to_string(),
        }
    }
}

/// Handler that records announcements and answers with a fixed result.
#[derive(Debug)]
pub struct RecordingHandler {
    handled: bool,
    action: AckAction,
    fail_on: HashSet<String>,
    cancel_on: HashSet<String>,
    seen: Mutex<Vec<Seen>>,
    tracker: Arc<CompletionTracker>,
}

impl RecordingHandler {
    /// Handler reporting every announcement as handled.
    pub fn handling() -> Arc<Self> {
        Arc::new(Self::new(true, AckAction::None))
    }

    /// Handler reporting every announcement as not handled.
    pub fn ignoring() -> Arc<Self> {
        Arc::new(Self::new(false, AckAction::None))
    }

    /// Handler that handles and commits every announcement explicitly.
    pub fn committing() -> Arc<Self> {
        Arc::new(Self::new(true, AckAction::Commit))
    }

    /// Handler answering `handled` and applying `action` to each ack.
    pub fn new(handled: bool, action: AckAction) -> Self {
        Self {
            handled,
            action,
            fail_on: HashSet::new(),
            cancel_on: HashSet::new(),
            seen: Mutex::new(Vec::new()),
            tracker: CompletionTracker::new(),
        }
    }

    /// Fails for announcements with `message_id`.
    #[must_use]
    pub fn failing_on(mut self, message_id: impl Into<String>) -> Self {
        self.fail_on.insert(message_id.into());
        self
    }

    /// Cancels the ack of announcements with `message_id`.
    #[must_use]
    pub fn cancelling_on(mut self, message_id: impl Into<String>) -> Self {
        self.cancel_on.insert(message_id.into());
        self
    }

    /// Announcements seen so far, in invocation order.
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    /// Message ids seen so far, in invocation order.
    pub fn message_ids(&self) -> Vec<String> {
        self.seen().into_iter().map(|seen| seen.message_id).collect()
    }

    /// Number of invocations.
    pub fn calls(&self) -> usize {
        self.tracker.completed_count()
    }

    /// Waits until at least `count` announcements were handled.
    pub async fn wait_for(&self, count: usize) {
        self.tracker.wait_for_completions(count).await;
    }
}

#[async_trait::async_trait]
impl AnnouncementHandler for RecordingHandler {
    async fn handle(&self, announcement: &Announcement, context: &ConsumerContext) -> anyhow::Result<bool> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Seen::new(announcement, context));

        let message_id = &announcement.metadata.message_id;
        let result = if self.fail_on.contains(message_id) {
            Err(anyhow::anyhow!("handler failed for {message_id}"))
        } else if self.cancel_on.contains(message_id) {
            context.ack().cancel()?;
            Ok(self.handled)
        } else {
            match self.action {
                AckAction::None => {},
                AckAction::Commit => {
                    context.ack().ack().await?;
                },
                AckAction::Cancel => {
                    context.ack().cancel()?;
                },
            }
            Ok(self.handled)
        };

        self.tracker.record_completion();
        result
    }
}

/// Fallback that records announcements and optionally commits them.
#[derive(Debug)]
pub struct RecordingFallback {
    commit: bool,
    seen: Mutex<Vec<String>>,
}

impl RecordingFallback {
    /// Fallback that commits every announcement it receives.
    pub fn committing() -> Arc<Self> {
        Arc::new(Self { commit: true, seen: Mutex::new(Vec::new()) })
    }

    /// Fallback that only records.
    pub fn observing() -> Arc<Self> {
        Arc::new(Self { commit: false, seen: Mutex::new(Vec::new()) })
    }

    /// Message ids seen so far.
    pub fn message_ids(&self) -> Vec<String> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl FallbackHandler for RecordingFallback {
    async fn handle(&self, announcement: &Announcement, context: &ConsumerContext) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(announcement.metadata.message_id.clone());
        if self.commit {
            context.ack().ack().await?;
        }
        Ok(())
    }
}

/// Interceptor that records the slot it receives.
#[derive(Debug)]
pub struct RecordingInterceptor {
    name: String,
    seen: Mutex<Vec<(String, Bytes)>>,
}

impl RecordingInterceptor {
    /// Interceptor reading slot `name`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into(), seen: Mutex::new(Vec::new()) })
    }

    /// `(message_id, slot)` pairs seen so far.
    pub fn seen(&self) -> Vec<(String, Bytes)> {
        self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
}

#[async_trait::async_trait]
impl ConsumerInterceptor for RecordingInterceptor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn intercept(&self, metadata: &Metadata, data: &Bytes) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((metadata.message_id.clone(), data.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tracker_returns_once_count_is_reached() {
        let tracker = CompletionTracker::new();
        let background = Arc::clone(&tracker);

        tokio::spawn(async move {
            for _ in 0..3 {
                background.record_completion();
            }
        });

        tracker.wait_for_completions(3).await;
        assert_eq!(tracker.completed_count(), 3);
    }

    #[tokio::test]
    async fn tracker_returns_immediately_when_already_complete() {
        let tracker = CompletionTracker::new();
        tracker.record_completion();

        tracker.wait_for_completions(1).await;
    }
}
