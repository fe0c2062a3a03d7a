//! Shard discovery and fan-out.
//!
//! A plan without a shard covers every stream under its partition. The
//! supervisor scans for `{partition}:*`, starts one [`ShardReader`] task per
//! stream it is not already running, and waits for all of them.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use backbone_core::StreamKey;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::{
    backoff::EmptyBatchBackoff,
    error::ChannelError,
    plan::ConsumerPlan,
    reader::{ShardExit, ShardReader, ShardResources},
};

/// Streams with a running reader, shared across discovery passes.
pub type ActiveShards = Arc<Mutex<HashSet<StreamKey>>>;

/// How the shard tasks of one supervision pass ended.
#[derive(Debug, Default)]
pub struct SupervisorReport {
    /// Readers started by this pass.
    pub started: usize,
    /// Readers that stopped normally.
    pub exits: Vec<(StreamKey, ShardExit)>,
    /// Readers that stopped with an error.
    pub failures: Vec<(StreamKey, ChannelError)>,
}

impl SupervisorReport {
    /// Returns true when some reader stopped at the fetch cutoff.
    pub fn drained(&self) -> bool {
        self.exits.iter().any(|(_, exit)| *exit == ShardExit::Drained)
    }

    /// Returns true when readers were started and every one of them failed.
    pub fn all_failed(&self) -> bool {
        self.started > 0 && self.failures.len() == self.started
    }
}

/// Removes a stream from the active set when its task ends, panics included.
struct ActiveGuard {
    active: ActiveShards,
    key: StreamKey,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(&self.key);
    }
}

/// Discovers the shards of a plan and runs a reader per shard.
pub struct PartitionSupervisor {
    plan: ConsumerPlan,
    cancellation: CancellationToken,
    resources: ShardResources,
    active: ActiveShards,
}

impl PartitionSupervisor {
    /// Creates a supervisor; readers stop when `cancellation` fires.
    pub fn new(
        plan: ConsumerPlan,
        cancellation: CancellationToken,
        resources: ShardResources,
        active: ActiveShards,
    ) -> Self {
        Self { plan, cancellation, resources, active }
    }

    /// Streams currently being read.
    pub fn active_shards(&self) -> Vec<StreamKey> {
        let mut keys: Vec<StreamKey> =
            self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Discovers shards, runs their readers, and waits for all of them.
    ///
    /// Returns early with an empty report when cancelled during discovery.
    pub async fn run(self) -> SupervisorReport {
        let keys = match self.plan.single_stream() {
            Some(key) => vec![key],
            None => match self.discover().await {
                Some(keys) => keys,
                None => return SupervisorReport::default(),
            },
        };

        let mut report = SupervisorReport::default();
        let mut tasks = JoinSet::new();
        let mut task_keys = HashMap::new();

        for key in keys {
            if !self.mark_active(&key) {
                debug!(stream = %key, "shard already active, skipping");
                continue;
            }

            let reader =
                ShardReader::new(key.clone(), &self.plan, self.cancellation.clone(), self.resources.clone());
            let span = reader.span();
            let guard = ActiveGuard { active: Arc::clone(&self.active), key: key.clone() };
            let task = tasks.spawn(
                async move {
                    let _guard = guard;
                    reader.run().await
                }
                .instrument(span),
            );
            task_keys.insert(task.id(), key);
            report.started += 1;
        }

        {
            let mut stats = self.resources.stats.write().await;
            stats.shards_started += report.started as u64;
            stats.active_shards += report.started;
        }
        info!(
            partition = %self.plan.effective_partition(),
            started = report.started,
            "shard readers started"
        );

        while let Some(joined) = tasks.join_next_with_id().await {
            {
                let mut stats = self.resources.stats.write().await;
                stats.active_shards = stats.active_shards.saturating_sub(1);
            }
            let task_id = match &joined {
                Ok((id, _)) => *id,
                Err(join_error) => join_error.id(),
            };
            let Some(key) = task_keys.remove(&task_id) else {
                continue;
            };
            match joined {
                Ok((_, Ok(exit))) => report.exits.push((key, exit)),
                Ok((_, Err(failure))) => {
                    error!(stream = %key, error = %failure, "shard reader failed");
                    report.failures.push((key, failure));
                },
                Err(join_error) => {
                    error!(stream = %key, error = %join_error, "shard reader task panicked");
                    report.failures.push((
                        key,
                        ChannelError::internal(format!("shard reader panicked: {join_error}")),
                    ));
                },
            }
        }

        report
    }

    /// Scans for shard streams, backing off on errors; `None` when cancelled.
    async fn discover(&self) -> Option<Vec<StreamKey>> {
        let partition = self.plan.effective_partition();
        let pattern = StreamKey::scan_pattern(&partition);
        let mut backoff = EmptyBatchBackoff::new(self.resources.backoff);

        loop {
            let scanned = tokio::select! {
                biased;
                () = self.cancellation.cancelled() => return None,
                scanned = self.resources.store.scan_keys(&pattern) => scanned,
            };

            match scanned {
                Ok(raw_keys) => {
                    let mut seen = HashSet::new();
                    let keys = raw_keys
                        .iter()
                        .filter_map(|raw| match StreamKey::from_scanned(&partition, raw) {
                            Ok(key) => Some(key),
                            Err(error) => {
                                debug!(key = %raw, error = %error, "ignoring scanned key");
                                None
                            },
                        })
                        .filter(|key| seen.insert(key.clone()))
                        .collect();
                    return Some(keys);
                },
                Err(error) => {
                    let delay = backoff.next_delay();
                    warn!(
                        partition = %partition,
                        error = %error,
                        delay_ms = delay.as_millis(),
                        "shard discovery failed"
                    );
                    tokio::select! {
                        biased;
                        () = self.cancellation.cancelled() => return None,
                        () = self.resources.clock.sleep(delay) => {},
                    }
                },
            }
        }
    }

    fn mark_active(&self, key: &StreamKey) -> bool {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).insert(key.clone())
    }
}
