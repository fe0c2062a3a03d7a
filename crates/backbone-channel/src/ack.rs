//! Ack-once handle for a delivered entry.
//!
//! Every entry handed to the dispatch pipeline gets an [`Ack`]. Committing
//! acknowledges the entry in its consumer group; cancelling fires the batch
//! token so the remaining entries of the batch are not dispatched and leaves
//! the entry pending for a later claim. Only the first transition counts.
//!
//! The pipeline cancels on its own when dispatch fails. That cancel resolves
//! the single entry and leaves the batch running.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use backbone_core::{AckBehavior, EntryId, StreamKey};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    error::{ChannelError, Result},
    store::StreamStore,
};

const PENDING: u8 = 0;
const ACKED: u8 = 1;
const CANCELLED: u8 = 2;

/// Resolution state of an ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Not yet resolved.
    Pending,
    /// Acknowledged in the consumer group.
    Acked,
    /// Cancelled; the entry stays pending in the group.
    Cancelled,
}

impl AckState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            ACKED => Self::Acked,
            CANCELLED => Self::Cancelled,
            _ => Self::Pending,
        }
    }
}

/// Result of a transition request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// This call committed the entry.
    Committed,
    /// This call cancelled the entry.
    Cancelled,
    /// An earlier call already resolved the ack.
    AlreadyResolved,
}

struct AckInner {
    store: Arc<dyn StreamStore>,
    key: StreamKey,
    group: String,
    entry_id: EntryId,
    behavior: AckBehavior,
    state: AtomicU8,
    batch: CancellationToken,
}

/// Ack handle bound to one entry id.
///
/// Clones share state, so a handler and the pipeline see the same
/// resolution.
#[derive(Clone)]
pub struct Ack {
    inner: Arc<AckInner>,
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack")
            .field("stream", &self.inner.key)
            .field("entry_id", &self.inner.entry_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Ack {
    /// Creates a pending ack for `entry_id` on `key`.
    ///
    /// `batch` is fired when the ack is cancelled.
    pub fn new(
        store: Arc<dyn StreamStore>,
        key: StreamKey,
        group: impl Into<String>,
        entry_id: EntryId,
        behavior: AckBehavior,
        batch: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(AckInner {
                store,
                key,
                group: group.into(),
                entry_id,
                behavior,
                state: AtomicU8::new(PENDING),
                batch,
            }),
        }
    }

    /// Entry this ack resolves.
    pub fn entry_id(&self) -> &EntryId {
        &self.inner.entry_id
    }

    /// Current state.
    pub fn state(&self) -> AckState {
        AckState::from_raw(self.inner.state.load(Ordering::Acquire))
    }

    /// Returns true once committed or cancelled.
    pub fn is_resolved(&self) -> bool {
        self.state() != AckState::Pending
    }

    /// Commits the entry in its consumer group.
    ///
    /// # Errors
    ///
    /// Returns `AckAlreadyResolved` when called on a resolved ack under
    /// [`AckBehavior::Manual`], or the store error when the acknowledgment
    /// fails. A failed acknowledgment leaves the ack pending.
    pub async fn ack(&self) -> Result<AckOutcome> {
        if !self.transition(ACKED) {
            return self.already_resolved();
        }
        self.commit().await
    }

    /// Cancels the entry and stops the rest of its batch.
    ///
    /// Nothing is sent to the store; the entry stays pending until claimed
    /// again.
    ///
    /// # Errors
    ///
    /// Returns `AckAlreadyResolved` when called on a resolved ack under
    /// [`AckBehavior::Manual`].
    pub fn cancel(&self) -> Result<AckOutcome> {
        if !self.transition(CANCELLED) {
            return self.already_resolved();
        }
        self.inner.batch.cancel();
        debug!(stream = %self.inner.key, entry_id = %self.inner.entry_id, "ack cancelled");
        Ok(AckOutcome::Cancelled)
    }

    /// Pipeline commit; resolved acks are left alone under every behavior.
    pub(crate) async fn auto_commit(&self) -> Result<AckOutcome> {
        if !self.transition(ACKED) {
            return Ok(AckOutcome::AlreadyResolved);
        }
        self.commit().await
    }

    /// Pipeline cancel after a failed dispatch.
    ///
    /// Only this entry is resolved; the rest of the batch keeps running.
    /// Resolved acks are left alone under every behavior.
    pub(crate) fn auto_cancel(&self) -> AckOutcome {
        if !self.transition(CANCELLED) {
            return AckOutcome::AlreadyResolved;
        }
        debug!(stream = %self.inner.key, entry_id = %self.inner.entry_id, "ack cancelled after failure");
        AckOutcome::Cancelled
    }

    fn transition(&self, target: u8) -> bool {
        self.inner
            .state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn already_resolved(&self) -> Result<AckOutcome> {
        if self.inner.behavior == AckBehavior::Manual {
            return Err(ChannelError::AckAlreadyResolved {
                entry_id: self.inner.entry_id.to_string(),
            });
        }
        Ok(AckOutcome::AlreadyResolved)
    }

    async fn commit(&self) -> Result<AckOutcome> {
        let inner = &self.inner;
        match inner.store.acknowledge(&inner.key, &inner.group, &inner.entry_id).await {
            Ok(_) => {
                debug!(stream = %inner.key, entry_id = %inner.entry_id, "entry acknowledged");
                Ok(AckOutcome::Committed)
            },
            Err(error) => {
                inner.state.store(PENDING, Ordering::Release);
                warn!(
                    stream = %inner.key,
                    entry_id = %inner.entry_id,
                    error = %error,
                    "acknowledgment failed, entry stays pending"
                );
                Err(error)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStreamStore;

    async fn delivered(store: &MemoryStreamStore) -> EntryId {
        let key = StreamKey::new("orders", "1");
        store.append(&key, Default::default()).await;
        store.create_group_if_absent(&key, "billing").await.unwrap();
        store.read_new(&key, "billing", "c-1", 1).await.unwrap()[0].id.clone()
    }

    fn ack_for(store: &MemoryStreamStore, id: EntryId, behavior: AckBehavior) -> (Ack, CancellationToken) {
        let batch = CancellationToken::new();
        let ack = Ack::new(
            Arc::new(store.clone()),
            StreamKey::new("orders", "1"),
            "billing",
            id,
            behavior,
            batch.clone(),
        );
        (ack, batch)
    }

    #[tokio::test]
    async fn commit_then_cancel_acknowledges_once() {
        let store = MemoryStreamStore::new();
        let id = delivered(&store).await;
        let (ack, batch) = ack_for(&store, id, AckBehavior::OnSucceed);

        assert_eq!(ack.ack().await.unwrap(), AckOutcome::Committed);
        assert_eq!(ack.cancel().unwrap(), AckOutcome::AlreadyResolved);
        assert_eq!(ack.ack().await.unwrap(), AckOutcome::AlreadyResolved);

        assert_eq!(store.acknowledged().await.len(), 1);
        assert_eq!(ack.state(), AckState::Acked);
        assert!(!batch.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_then_commit_never_acknowledges() {
        let store = MemoryStreamStore::new();
        let id = delivered(&store).await;
        let (ack, batch) = ack_for(&store, id.clone(), AckBehavior::OnSucceed);

        assert_eq!(ack.cancel().unwrap(), AckOutcome::Cancelled);
        assert_eq!(ack.ack().await.unwrap(), AckOutcome::AlreadyResolved);

        assert!(store.acknowledged().await.is_empty());
        assert!(batch.is_cancelled());
        let key = StreamKey::new("orders", "1");
        assert_eq!(store.pending_ids(&key, "billing", "c-1").await, vec![id]);
    }

    #[tokio::test]
    async fn pipeline_cancel_keeps_the_batch_running() {
        let store = MemoryStreamStore::new();
        let id = delivered(&store).await;
        let (ack, batch) = ack_for(&store, id, AckBehavior::OnSucceed);

        assert_eq!(ack.auto_cancel(), AckOutcome::Cancelled);
        assert_eq!(ack.cancel().unwrap(), AckOutcome::AlreadyResolved);

        assert_eq!(ack.state(), AckState::Cancelled);
        assert!(!batch.is_cancelled());
    }

    #[tokio::test]
    async fn manual_behavior_rejects_second_transition() {
        let store = MemoryStreamStore::new();
        let id = delivered(&store).await;
        let (ack, _) = ack_for(&store, id, AckBehavior::Manual);

        ack.ack().await.unwrap();
        let error = ack.cancel().unwrap_err();

        assert!(matches!(error, ChannelError::AckAlreadyResolved { .. }));
        assert_eq!(ack.auto_cancel(), AckOutcome::AlreadyResolved);
    }

    #[tokio::test]
    async fn failed_commit_leaves_ack_pending() {
        let store = MemoryStreamStore::new();
        let id = delivered(&store).await;
        store.inject_ack_error(ChannelError::connection("reset by peer")).await;
        let (ack, _) = ack_for(&store, id, AckBehavior::OnSucceed);

        assert!(ack.ack().await.is_err());
        assert_eq!(ack.state(), AckState::Pending);

        assert_eq!(ack.ack().await.unwrap(), AckOutcome::Committed);
    }

    #[tokio::test]
    async fn concurrent_commits_acknowledge_once() {
        let store = MemoryStreamStore::new();
        let id = delivered(&store).await;
        let (ack, _) = ack_for(&store, id, AckBehavior::OnFinally);

        let ack2 = ack.clone();
        let (left, right) = tokio::join!(ack.ack(), ack2.auto_commit());
        let outcomes = [left.unwrap(), right.unwrap()];

        assert_eq!(outcomes.iter().filter(|o| **o == AckOutcome::Committed).count(), 1);
        assert_eq!(store.acknowledged().await.len(), 1);
    }
}
