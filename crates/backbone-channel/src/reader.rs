//! Claim, read and backoff loop for a single stream.
//!
//! A reader owns one `(partition, shard)` stream for one consumer. After
//! making sure the consumer group exists it repeats:
//!
//! 1. claim entries left pending for this consumer, oldest first, while
//!    there may be any;
//! 2. otherwise read entries never delivered to the group;
//! 3. dispatch the batch in stream order, or back off when it is empty.
//!
//! Store failures are logged and count as an empty batch. Only cancellation,
//! the message ceiling, a fetch cutoff, or failing to create the group end
//! the loop.
//!
//! Entries whose dispatch failed or was cancelled stay pending. They are
//! claimed again only once a read of new entries comes back empty, so a
//! message that keeps failing never holds up newer ones.

use std::{sync::Arc, time::Duration};

use backbone_core::{Clock, EntryId, RawEntry, StreamKey};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Span};

use crate::{
    ack::{Ack, AckState},
    assembler::MessageAssembler,
    backoff::{BackoffSettings, EmptyBatchBackoff},
    dispatch::{ConsumerContext, DispatchPipeline, DispatchStatus},
    error::{ErrorCategory, Result},
    plan::ConsumerPlan,
    store::StreamStore,
    subscription::SubscriptionStats,
};

/// Shared collaborators handed to every reader of a subscription.
#[derive(Clone)]
pub struct ShardResources {
    /// Stream store.
    pub store: Arc<dyn StreamStore>,
    /// Handler pipeline shared across shards.
    pub pipeline: Arc<DispatchPipeline>,
    /// Clock for backoff sleeps.
    pub clock: Arc<dyn Clock>,
    /// Empty-batch backoff bounds.
    pub backoff: BackoffSettings,
    /// Subscription counters.
    pub stats: Arc<RwLock<SubscriptionStats>>,
}

/// Why a reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardExit {
    /// The subscription was cancelled.
    Cancelled,
    /// The message ceiling was reached.
    LimitReached,
    /// A fetch cutoff was reached.
    Drained,
}

/// Result of one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderStep {
    /// Keep polling.
    Continue,
    /// Stop the loop.
    Stop(ShardExit),
}

enum BatchEnd {
    Completed { progressed: bool },
    Stopped(ShardExit),
}

/// Consumer loop for one stream.
pub struct ShardReader {
    key: StreamKey,
    group: Arc<str>,
    consumer: Arc<str>,
    batch_size: usize,
    claim_min_idle: Duration,
    fetch_until: Option<DateTime<Utc>>,
    resources: ShardResources,
    assembler: MessageAssembler,
    backoff: EmptyBatchBackoff,
    cancellation: CancellationToken,
    has_unclaimed: bool,
    claim_cursor: Option<EntryId>,
    left_pending: bool,
}

impl std::fmt::Debug for ShardReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardReader")
            .field("key", &self.key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("has_unclaimed", &self.has_unclaimed)
            .field("left_pending", &self.left_pending)
            .finish_non_exhaustive()
    }
}

impl ShardReader {
    /// Creates a reader for `key`, stopping when `cancellation` fires.
    pub fn new(
        key: StreamKey,
        plan: &ConsumerPlan,
        cancellation: CancellationToken,
        resources: ShardResources,
    ) -> Self {
        let options = plan.options();
        Self {
            key,
            group: Arc::from(plan.consumer_group()),
            consumer: Arc::from(plan.consumer_name()),
            batch_size: options.batch_size,
            claim_min_idle: options.claim_min_idle,
            fetch_until: options.fetch_until,
            assembler: MessageAssembler::new(Arc::clone(&resources.store)),
            backoff: EmptyBatchBackoff::new(resources.backoff),
            resources,
            cancellation,
            has_unclaimed: true,
            claim_cursor: None,
            left_pending: false,
        }
    }

    /// Stream this reader consumes.
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Span attached to everything the reader logs.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "shard",
            stream = %self.key,
            group = %self.group,
            consumer = %self.consumer,
        )
    }

    /// Creates the consumer group when absent.
    ///
    /// # Errors
    ///
    /// Returns the store error when the group cannot be created; the reader
    /// cannot run without it.
    pub async fn activate(&self) -> Result<()> {
        let created = self.resources.store.create_group_if_absent(&self.key, &self.group).await?;
        if created {
            info!(stream = %self.key, group = %self.group, "consumer group created");
        }
        Ok(())
    }

    /// Runs the loop until cancellation, the ceiling or the fetch cutoff.
    ///
    /// # Errors
    ///
    /// Returns an error only when the consumer group cannot be created.
    pub async fn run(mut self) -> Result<ShardExit> {
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => return Ok(ShardExit::Cancelled),
            activated = self.activate() => activated?,
        }
        debug!(stream = %self.key, "shard reader started");

        loop {
            if let ReaderStep::Stop(exit) = self.step().await {
                debug!(stream = %self.key, ?exit, "shard reader stopped");
                return Ok(exit);
            }
        }
    }

    /// Fetches the next batch: claimed pending entries first, new entries
    /// otherwise.
    ///
    /// When no new entries arrive and earlier batches left entries pending,
    /// the next call claims them again.
    ///
    /// # Errors
    ///
    /// Returns the store error of the failing call.
    pub async fn next_batch(&mut self) -> Result<Vec<RawEntry>> {
        let store = &self.resources.store;

        if self.has_unclaimed {
            let pending = store
                .list_pending(
                    &self.key,
                    &self.group,
                    &self.consumer,
                    self.claim_cursor.as_ref(),
                    self.batch_size,
                )
                .await?;

            if let Some(last) = pending.last() {
                let claimed = store
                    .claim(&self.key, &self.group, &self.consumer, self.claim_min_idle, &pending)
                    .await?;
                if !claimed.is_empty() {
                    debug!(stream = %self.key, count = claimed.len(), "claimed pending entries");
                    self.claim_cursor = Some(last.clone());
                    return Ok(claimed);
                }
            }

            self.has_unclaimed = false;
            self.claim_cursor = None;
        }

        let entries = store.read_new(&self.key, &self.group, &self.consumer, self.batch_size).await?;
        if entries.is_empty() && self.left_pending {
            debug!(stream = %self.key, "stream idle, reclaiming entries left pending");
            self.left_pending = false;
            self.has_unclaimed = true;
        }
        Ok(entries)
    }

    /// Runs one iteration: fetch, then dispatch or back off.
    pub async fn step(&mut self) -> ReaderStep {
        if self.cancellation.is_cancelled() {
            return ReaderStep::Stop(ShardExit::Cancelled);
        }

        let cancellation = self.cancellation.clone();
        let fetched = tokio::select! {
            biased;
            () = cancellation.cancelled() => return ReaderStep::Stop(ShardExit::Cancelled),
            fetched = self.next_batch() => fetched,
        };

        let entries = match fetched {
            Ok(entries) => entries,
            Err(error) => {
                if error.is_transient() {
                    warn!(stream = %self.key, error = %error, "fetch failed, treating as empty batch");
                } else {
                    error!(
                        stream = %self.key,
                        error = %error,
                        category = %ErrorCategory::from(&error),
                        "fetch failed, treating as empty batch"
                    );
                }
                self.resources.stats.write().await.read_failures += 1;
                return self.back_off().await;
            },
        };

        if entries.is_empty() {
            if self.fetch_until.is_some() {
                info!(stream = %self.key, "stream drained up to fetch cutoff");
                return ReaderStep::Stop(ShardExit::Drained);
            }
            self.resources.stats.write().await.empty_polls += 1;
            return self.back_off().await;
        }

        match self.process_batch(entries).await {
            BatchEnd::Completed { progressed: true } => {
                self.backoff.reset();
                ReaderStep::Continue
            },
            BatchEnd::Completed { progressed: false } => self.back_off().await,
            BatchEnd::Stopped(exit) => ReaderStep::Stop(exit),
        }
    }

    async fn back_off(&mut self) -> ReaderStep {
        let delay = self.backoff.next_delay();
        trace!(stream = %self.key, delay_ms = delay.as_millis(), "backing off");
        tokio::select! {
            biased;
            () = self.cancellation.cancelled() => ReaderStep::Stop(ShardExit::Cancelled),
            () = self.resources.clock.sleep(delay) => ReaderStep::Continue,
        }
    }

    async fn process_batch(&mut self, entries: Vec<RawEntry>) -> BatchEnd {
        let batch = self.cancellation.child_token();
        let pipeline = Arc::clone(&self.resources.pipeline);
        let ack_behavior = pipeline.options().ack_behavior;
        let mut progressed = false;

        for entry in entries {
            if batch.is_cancelled() {
                self.left_pending = true;
                break;
            }

            let announcement = match self.assembler.assemble(&self.key, &entry).await {
                Ok(announcement) => announcement,
                Err(error) => {
                    warn!(stream = %self.key, entry_id = %entry.id, error = %error, "skipping entry");
                    self.resources.stats.write().await.assembly_failures += 1;
                    continue;
                },
            };

            if let Some(cutoff) = self.fetch_until {
                if announcement.metadata.produced_at > cutoff {
                    info!(
                        stream = %self.key,
                        entry_id = %entry.id,
                        %cutoff,
                        "entry produced after fetch cutoff"
                    );
                    return BatchEnd::Stopped(ShardExit::Drained);
                }
            }

            let ack = Ack::new(
                Arc::clone(&self.resources.store),
                self.key.clone(),
                self.group.as_ref(),
                entry.id.clone(),
                ack_behavior,
                batch.clone(),
            );
            let context = ConsumerContext::new(
                announcement.metadata.clone(),
                ack,
                batch.clone(),
                Arc::clone(&self.group),
                Arc::clone(&self.consumer),
            );

            let outcome = pipeline.dispatch(&announcement, &context).await;
            if matches!(outcome.status, DispatchStatus::LimitReached) {
                return self.stop_at_limit();
            }

            {
                let mut stats = self.resources.stats.write().await;
                stats.received += 1;
                match outcome.status {
                    DispatchStatus::Handled => stats.handled += 1,
                    DispatchStatus::Unhandled => stats.unhandled += 1,
                    DispatchStatus::Failed(_) => stats.failed += 1,
                    DispatchStatus::LimitReached => {},
                }
                match outcome.ack {
                    AckState::Acked => stats.acked += 1,
                    AckState::Cancelled => stats.cancelled += 1,
                    AckState::Pending => {},
                }
            }

            if matches!(outcome.status, DispatchStatus::Failed(_)) || outcome.ack == AckState::Cancelled {
                self.left_pending = true;
            } else {
                progressed = true;
            }

            if pipeline.limit_reached() {
                return self.stop_at_limit();
            }
        }

        if self.cancellation.is_cancelled() {
            return BatchEnd::Stopped(ShardExit::Cancelled);
        }
        BatchEnd::Completed { progressed }
    }

    fn stop_at_limit(&self) -> BatchEnd {
        info!(stream = %self.key, "message limit reached, stopping subscription");
        self.cancellation.cancel();
        BatchEnd::Stopped(ShardExit::LimitReached)
    }
}
