//! Subscribing a handler chain to a plan.
//!
//! [`ConsumerChannel::subscribe`] spawns the subscription and returns a
//! [`SubscriptionHandle`]. The handle owns the subscription: dropping it
//! cancels the subscription unless it was detached with
//! [`SubscriptionHandle::keep_alive`].
//!
//! The subscription repeats shard discovery until readers are running, then
//! ends once they stop. Cancelling the caller's token or the plan's token
//! stops it; reaching the message ceiling or a fetch cutoff ends it too.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use backbone_core::{Clock, RealClock};
use serde::Serialize;
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::{
    backoff::{BackoffSettings, EmptyBatchBackoff},
    config::ChannelConfig,
    dispatch::{DispatchPipeline, HandlerChain},
    error::{ChannelError, Result},
    keep_alive,
    plan::ConsumerPlan,
    reader::ShardResources,
    redis_store::RedisStreamStore,
    store::StreamStore,
    supervisor::{ActiveShards, PartitionSupervisor},
};

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);

/// Counters of one subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Announcements dispatched.
    pub received: u64,
    /// Announcements a handler or fallback handled.
    pub handled: u64,
    /// Announcements nothing handled.
    pub unhandled: u64,
    /// Announcements whose chain failed.
    pub failed: u64,
    /// Entries acknowledged.
    pub acked: u64,
    /// Acks cancelled.
    pub cancelled: u64,
    /// Entries skipped because they could not be assembled.
    pub assembly_failures: u64,
    /// Polls that returned nothing.
    pub empty_polls: u64,
    /// Polls that failed at the store.
    pub read_failures: u64,
    /// Readers started over the subscription's lifetime.
    pub shards_started: u64,
    /// Readers currently running.
    pub active_shards: usize,
}

/// How a subscription ended.
#[derive(Debug, Clone)]
pub enum SubscriptionEnd {
    /// Cancelled by the caller, the plan, or handle disposal.
    Cancelled,
    /// The message ceiling was reached.
    LimitReached,
    /// Every shard was consumed up to the fetch cutoff.
    Drained,
    /// Every reader failed to start.
    Failed(ChannelError),
}

impl SubscriptionEnd {
    /// Returns true for the endings reported to callers as cancellation.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::LimitReached)
    }
}

/// Entry point for consuming announcements.
#[derive(Clone)]
pub struct ConsumerChannel {
    store: Arc<dyn StreamStore>,
    clock: Arc<dyn Clock>,
    backoff: BackoffSettings,
}

impl std::fmt::Debug for ConsumerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerChannel").field("backoff", &self.backoff).finish_non_exhaustive()
    }
}

impl ConsumerChannel {
    /// Creates a channel over `store` using the real clock.
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store, clock: Arc::new(RealClock::new()), backoff: BackoffSettings::default() }
    }

    /// Connects to Redis with the credentials and timings of `config`.
    ///
    /// The connection itself is opened by the first store call.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the endpoint is invalid.
    pub fn from_config(config: &ChannelConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let store = RedisStreamStore::new(
            &config.credentials(),
            config.to_connection_settings(),
            config.response_timeout(),
            Arc::clone(&clock),
        )?;
        Ok(Self { store: Arc::new(store), clock, backoff: config.to_backoff_settings() })
    }

    /// Uses `clock` for backoff and cool-down timing.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Uses other empty-batch backoff bounds.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    /// Starts consuming `plan` with `chain`.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe(&self, plan: ConsumerPlan, chain: HandlerChain) -> SubscriptionHandle {
        self.subscribe_with_cancellation(plan, chain, CancellationToken::new())
    }

    /// Starts consuming `plan`, also stopping when `cancellation` fires.
    ///
    /// Must be called within a tokio runtime.
    pub fn subscribe_with_cancellation(
        &self,
        plan: ConsumerPlan,
        chain: HandlerChain,
        cancellation: CancellationToken,
    ) -> SubscriptionHandle {
        let id = NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed);
        let linked = link(plan.cancellation(), cancellation);
        let stats = Arc::new(RwLock::new(SubscriptionStats::default()));

        let pipeline =
            Arc::new(DispatchPipeline::new(chain, plan.options().clone(), plan.resilience()));
        let resources = ShardResources {
            store: Arc::clone(&self.store),
            pipeline,
            clock: Arc::clone(&self.clock),
            backoff: self.backoff,
            stats: Arc::clone(&stats),
        };

        let keep_alive = plan.options().keep_alive;
        let span = plan.span();
        let task = tokio::spawn(
            run_subscription(id, plan, linked.clone(), resources).instrument(span),
        );

        let mut handle =
            SubscriptionHandle { id, cancellation: linked, task: Some(task), stats, detached: false };
        if keep_alive {
            handle.detach();
        }
        handle
    }
}

/// Child of the plan token that also fires with the caller's token.
fn link(plan: &CancellationToken, caller: CancellationToken) -> CancellationToken {
    let linked = plan.child_token();
    let watched = linked.clone();
    tokio::spawn(async move {
        tokio::select! {
            () = caller.cancelled() => watched.cancel(),
            () = watched.cancelled() => {},
        }
    });
    linked
}

async fn run_subscription(
    id: u64,
    plan: ConsumerPlan,
    cancellation: CancellationToken,
    resources: ShardResources,
) -> SubscriptionEnd {
    info!(subscription_id = id, "subscription started");
    let active: ActiveShards = Arc::new(Mutex::new(HashSet::new()));
    let mut backoff = EmptyBatchBackoff::new(resources.backoff);
    let pipeline = Arc::clone(&resources.pipeline);

    let end = loop {
        let report = PartitionSupervisor::new(
            plan.clone(),
            cancellation.clone(),
            resources.clone(),
            Arc::clone(&active),
        )
        .run()
        .await;

        if pipeline.limit_reached() {
            break SubscriptionEnd::LimitReached;
        }
        if cancellation.is_cancelled() {
            break SubscriptionEnd::Cancelled;
        }
        if report.drained() || plan.options().fetch_until.is_some() {
            break SubscriptionEnd::Drained;
        }
        if report.all_failed() {
            if let Some((_, failure)) = report.failures.into_iter().next() {
                break SubscriptionEnd::Failed(failure);
            }
        }

        let delay = backoff.next_delay();
        debug!(subscription_id = id, delay_ms = delay.as_millis(), "no live shards, rediscovering");
        tokio::select! {
            biased;
            () = cancellation.cancelled() => break SubscriptionEnd::Cancelled,
            () = resources.clock.sleep(delay) => {},
        }
    };

    // Cancel before forgetting so a concurrent detach sees the end
    cancellation.cancel();
    keep_alive::forget(id);
    info!(subscription_id = id, end = ?end, "subscription completed");
    end
}

/// Owner of a running subscription.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    cancellation: CancellationToken,
    task: Option<JoinHandle<SubscriptionEnd>>,
    stats: Arc<RwLock<SubscriptionStats>>,
    detached: bool,
}

impl SubscriptionHandle {
    /// Process-unique subscription id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Token cancelling this subscription.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Requests the subscription to stop.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Returns true once the subscription task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Snapshot of the subscription counters.
    pub async fn stats(&self) -> SubscriptionStats {
        self.stats.read().await.clone()
    }

    /// Waits for the subscription to end on its own.
    pub async fn completion(mut self) -> SubscriptionEnd {
        match self.task.take() {
            Some(task) => join(task).await,
            None => SubscriptionEnd::Cancelled,
        }
    }

    /// Cancels the subscription and waits up to `timeout` for it to stop.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` when the subscription is still running after
    /// `timeout`.
    pub async fn dispose(mut self, timeout: Duration) -> Result<SubscriptionEnd> {
        self.cancellation.cancel();
        keep_alive::forget(self.id);
        let Some(task) = self.task.take() else {
            return Ok(SubscriptionEnd::Cancelled);
        };
        tokio::time::timeout(timeout, join(task)).await.map_err(|_| {
            warn!(subscription_id = self.id, "subscription did not stop in time");
            ChannelError::timeout("subscription dispose", timeout)
        })
    }

    /// Detaches the subscription so dropping the handle no longer stops it.
    ///
    /// It runs until it ends on its own or is released through
    /// [`keep_alive::release`] with the returned id. A subscription that has
    /// already ended is not registered.
    pub fn keep_alive(mut self) -> u64 {
        self.detach();
        self.id
    }

    fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        if self.is_finished() || self.cancellation.is_cancelled() {
            return;
        }
        keep_alive::register(self.id, self.cancellation.clone());
        if self.cancellation.is_cancelled() {
            keep_alive::forget(self.id);
        }
    }
}

async fn join(task: JoinHandle<SubscriptionEnd>) -> SubscriptionEnd {
    task.await.unwrap_or_else(|join_error| {
        SubscriptionEnd::Failed(ChannelError::internal(format!("subscription task failed: {join_error}")))
    })
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.detached && !self.is_finished() {
            self.cancellation.cancel();
        }
    }
}
