//! Storage abstraction over stream consumer groups.
//!
//! The channel engine only needs a handful of consumer-group primitives:
//! idempotent group creation, pending listing, claiming, reading new
//! entries, acknowledging, fetching side-channel hashes and scanning keys.
//! Production uses [`crate::redis_store::RedisStreamStore`]; tests use the
//! in-memory [`memory::MemoryStreamStore`] with identical group semantics.
//!
//! Implementations must serve every call from the authoritative node.
//! Replicas may lag behind acknowledgments and would hand out entries that
//! were already committed.

use std::{future::Future, pin::Pin, time::Duration};

use backbone_core::{EntryId, RawEntry, StreamKey};
use bytes::Bytes;

use crate::error::Result;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Consumer-group operations required by the channel engine.
pub trait StreamStore: Send + Sync + 'static {
    /// Verifies the store answers.
    fn ping(&self) -> StoreFuture<'_, ()>;

    /// Creates the consumer group, and the stream when absent.
    ///
    /// Returns `true` when the group was created and `false` when it already
    /// existed. An existing group is never an error.
    fn create_group_if_absent<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
    ) -> StoreFuture<'a, bool>;

    /// Lists entries delivered to `consumer` but not yet acknowledged.
    ///
    /// Returns at most `count` ids in store order, starting strictly after
    /// `after` when given.
    fn list_pending<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
        consumer: &'a str,
        after: Option<&'a EntryId>,
        count: usize,
    ) -> StoreFuture<'a, Vec<EntryId>>;

    /// Transfers ownership of pending entries to `consumer`.
    ///
    /// Only entries idle for at least `min_idle` are claimed. Entries that
    /// were acknowledged or deleted in the meantime are skipped.
    fn claim<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
        consumer: &'a str,
        min_idle: Duration,
        ids: &'a [EntryId],
    ) -> StoreFuture<'a, Vec<RawEntry>>;

    /// Reads up to `count` entries never delivered to any group member.
    fn read_new<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
        consumer: &'a str,
        count: usize,
    ) -> StoreFuture<'a, Vec<RawEntry>>;

    /// Acknowledges one entry, returning how many entries were released.
    fn acknowledge<'a>(
        &'a self,
        key: &'a StreamKey,
        group: &'a str,
        id: &'a EntryId,
    ) -> StoreFuture<'a, u64>;

    /// Returns every field of a hash; a missing hash yields no pairs.
    fn hash_entries<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<(String, Bytes)>>;

    /// Returns every key matching a glob pattern.
    ///
    /// The scan is not transactional and may report a key more than once.
    fn scan_keys<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, Vec<String>>;
}

pub mod memory {
    //! In-memory stream store for testing.
    //!
    //! Models streams, consumer groups and per-consumer pending lists the way
    //! a Redis stream does, plus the producer write path. Supports injecting
    //! failures and records every acknowledgment for verification.

    use std::{
        collections::{BTreeMap, HashMap, VecDeque},
        sync::Arc,
        time::{Duration, Instant},
    };

    use backbone_core::{
        models::{
            interceptors_key, segments_key, FIELD_MESSAGE_ID, FIELD_OPERATION, FIELD_PRODUCED_AT,
        },
        Bucket, Clock, EntryId, RawEntry, RealClock, StreamKey,
    };
    use bytes::Bytes;
    use tokio::sync::Mutex;

    use super::{StoreFuture, StreamStore};
    use crate::error::{ChannelError, Result};

    #[derive(Debug)]
    struct PendingEntry {
        consumer: String,
        delivered_at: Instant,
        deliveries: u32,
    }

    #[derive(Debug, Default)]
    struct GroupState {
        /// Number of entries handed out by `read_new`
        next_unread: usize,
        /// Pending entries keyed by their position in the stream
        pending: BTreeMap<usize, PendingEntry>,
    }

    #[derive(Debug, Default)]
    struct StreamState {
        entries: Vec<RawEntry>,
        positions: HashMap<EntryId, usize>,
        groups: HashMap<String, GroupState>,
    }

    /// Recorded acknowledgment.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct AckRecord {
        /// Stream the entry belongs to
        pub key: StreamKey,
        /// Group that acknowledged it
        pub group: String,
        /// Acknowledged entry
        pub id: EntryId,
    }

    #[derive(Debug, Default)]
    struct State {
        sequence: u64,
        streams: HashMap<String, StreamState>,
        hashes: HashMap<String, Vec<(String, Bytes)>>,
        acks: Vec<AckRecord>,
        read_errors: VecDeque<ChannelError>,
        pending_errors: VecDeque<ChannelError>,
        scan_errors: VecDeque<ChannelError>,
        group_errors: VecDeque<ChannelError>,
        ack_errors: VecDeque<ChannelError>,
        failing_hashes: HashMap<String, ChannelError>,
        read_calls: usize,
        claim_calls: usize,
        groups_created: usize,
    }

    /// In-memory store with consumer-group semantics.
    #[derive(Debug, Clone)]
    pub struct MemoryStreamStore {
        state: Arc<Mutex<State>>,
        clock: Arc<dyn Clock>,
    }

    impl Default for MemoryStreamStore {
        fn default() -> Self {
            Self::new()
        }
    }

    impl MemoryStreamStore {
        /// Creates an empty store using the real clock for idle times.
        pub fn new() -> Self {
            Self::with_clock(Arc::new(RealClock::new()))
        }

        /// Creates an empty store measuring idle times with `clock`.
        pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
            Self { state: Arc::new(Mutex::new(State::default())), clock }
        }

        /// Appends raw fields to a stream, creating it when absent.
        pub async fn append(&self, key: &StreamKey, fields: HashMap<String, String>) -> EntryId {
            let mut state = self.state.lock().await;
            state.sequence += 1;
            let id = EntryId(format!("{}-0", state.sequence));
            let stream = state.streams.entry(key.to_string()).or_default();
            stream.positions.insert(id.clone(), stream.entries.len());
            stream.entries.push(RawEntry::new(id.clone(), fields));
            id
        }

        /// Publishes an announcement the way a producer does.
        ///
        /// Writes the segment and interceptor hashes, then appends the entry
        /// referencing them.
        pub async fn publish(
            &self,
            key: &StreamKey,
            message_id: &str,
            operation: &str,
            produced_at: i64,
            segments: &Bucket,
            interceptors: &Bucket,
        ) -> EntryId {
            self.put_hash(&segments_key(message_id), bucket_pairs(segments)).await;
            self.put_hash(&interceptors_key(message_id), bucket_pairs(interceptors)).await;

            let fields = HashMap::from([
                (FIELD_MESSAGE_ID.to_string(), message_id.to_string()),
                (FIELD_OPERATION.to_string(), operation.to_string()),
                (FIELD_PRODUCED_AT.to_string(), produced_at.to_string()),
            ]);
            self.append(key, fields).await
        }

        /// Stores hash fields under `key`, replacing previous content.
        pub async fn put_hash(&self, key: &str, pairs: Vec<(String, Bytes)>) {
            let mut state = self.state.lock().await;
            if pairs.is_empty() {
                state.hashes.remove(key);
            } else {
                state.hashes.insert(key.to_string(), pairs);
            }
        }

        /// Makes the next read fail with `error`.
        pub async fn inject_read_error(&self, error: ChannelError) {
            self.state.lock().await.read_errors.push_back(error);
        }

        /// Makes the next pending listing fail with `error`.
        pub async fn inject_pending_error(&self, error: ChannelError) {
            self.state.lock().await.pending_errors.push_back(error);
        }

        /// Makes the next key scan fail with `error`.
        pub async fn inject_scan_error(&self, error: ChannelError) {
            self.state.lock().await.scan_errors.push_back(error);
        }

        /// Makes the next group creation fail with `error`.
        pub async fn inject_group_error(&self, error: ChannelError) {
            self.state.lock().await.group_errors.push_back(error);
        }

        /// Makes the next acknowledgment fail with `error`.
        pub async fn inject_ack_error(&self, error: ChannelError) {
            self.state.lock().await.ack_errors.push_back(error);
        }

        /// Makes every fetch of hash `key` fail with `error`.
        pub async fn fail_hash(&self, key: &str, error: ChannelError) {
            self.state.lock().await.failing_hashes.insert(key.to_string(), error);
        }

        /// Returns every successful acknowledgment in call order.
        pub async fn acknowledged(&self) -> Vec<AckRecord> {
            self.state.lock().await.acks.clone()
        }

        /// Returns the ids pending for `consumer` in `group`.
        pub async fn pending_ids(&self, key: &StreamKey, group: &str, consumer: &str) -> Vec<EntryId> {
            let state = self.state.lock().await;
            let Some(stream) = state.streams.get(&key.to_string()) else {
                return Vec::new();
            };
            let Some(group_state) = stream.groups.get(group) else {
                return Vec::new();
            };
            group_state
                .pending
                .iter()
                .filter(|(_, pending)| pending.consumer == consumer)
                .map(|(position, _)| stream.entries[*position].id.clone())
                .collect()
        }

        /// How often an entry has been delivered within `group`.
        pub async fn delivery_count(&self, key: &StreamKey, group: &str, id: &EntryId) -> u32 {
            let state = self.state.lock().await;
            state
                .streams
                .get(&key.to_string())
                .and_then(|stream| {
                    let position = stream.positions.get(id)?;
                    stream.groups.get(group)?.pending.get(position).map(|p| p.deliveries)
                })
                .unwrap_or(0)
        }

        /// Returns true when `group` exists on `key`.
        pub async fn has_group(&self, key: &StreamKey, group: &str) -> bool {
            let state = self.state.lock().await;
            state.streams.get(&key.to_string()).is_some_and(|stream| stream.groups.contains_key(group))
        }

        /// Number of `read_new` calls served.
        pub async fn read_calls(&self) -> usize {
            self.state.lock().await.read_calls
        }

        /// Number of `claim` calls served.
        pub async fn claim_calls(&self) -> usize {
            self.state.lock().await.claim_calls
        }

        /// Number of groups actually created.
        pub async fn groups_created(&self) -> usize {
            self.state.lock().await.groups_created
        }
    }

    fn bucket_pairs(bucket: &Bucket) -> Vec<(String, Bytes)> {
        bucket.iter().map(|(key, value)| (key.to_string(), value.clone())).collect()
    }

    fn no_group(key: &StreamKey, group: &str) -> ChannelError {
        ChannelError::store(format!("NOGROUP no consumer group {group} for key {key}"))
    }

    /// Minimal glob support: `*` matches any run of characters.
    fn glob_matches(pattern: &str, candidate: &str) -> bool {
        let mut parts = pattern.split('*');
        let Some(first) = parts.next() else {
            return candidate.is_empty();
        };
        let Some(mut rest) = candidate.strip_prefix(first) else {
            return false;
        };
        let tail: Vec<&str> = parts.collect();
        let Some((last, middle)) = tail.split_last() else {
            return rest.is_empty();
        };
        for part in middle {
            match rest.find(part) {
                Some(index) => rest = &rest[index + part.len()..],
                None => return false,
            }
        }
        rest.ends_with(last)
    }

    impl StreamStore for MemoryStreamStore {
        fn ping(&self) -> StoreFuture<'_, ()> {
            Box::pin(async { Ok(()) })
        }

        fn create_group_if_absent<'a>(
            &'a self,
            key: &'a StreamKey,
            group: &'a str,
        ) -> StoreFuture<'a, bool> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                if let Some(error) = state.group_errors.pop_front() {
                    return Err(error);
                }
                let stream = state.streams.entry(key.to_string()).or_default();
                if stream.groups.contains_key(group) {
                    return Ok(false);
                }
                // New groups replay from the start of the stream
                stream.groups.insert(group.to_string(), GroupState::default());
                state.groups_created += 1;
                Ok(true)
            })
        }

        fn list_pending<'a>(
            &'a self,
            key: &'a StreamKey,
            group: &'a str,
            consumer: &'a str,
            after: Option<&'a EntryId>,
            count: usize,
        ) -> StoreFuture<'a, Vec<EntryId>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                if let Some(error) = state.pending_errors.pop_front() {
                    return Err(error);
                }
                let stream = state.streams.get(&key.to_string()).ok_or_else(|| no_group(key, group))?;
                let group_state = stream.groups.get(group).ok_or_else(|| no_group(key, group))?;
                let start = after.and_then(|id| stream.positions.get(id)).map_or(0, |p| p + 1);

                Ok(group_state
                    .pending
                    .range(start..)
                    .filter(|(_, pending)| pending.consumer == consumer)
                    .take(count)
                    .map(|(position, _)| stream.entries[*position].id.clone())
                    .collect())
            })
        }

        fn claim<'a>(
            &'a self,
            key: &'a StreamKey,
            group: &'a str,
            consumer: &'a str,
            min_idle: Duration,
            ids: &'a [EntryId],
        ) -> StoreFuture<'a, Vec<RawEntry>> {
            Box::pin(async move {
                let now = self.clock.now();
                let mut state = self.state.lock().await;
                state.claim_calls += 1;
                let stream =
                    state.streams.get_mut(&key.to_string()).ok_or_else(|| no_group(key, group))?;
                let group_state =
                    stream.groups.get_mut(group).ok_or_else(|| no_group(key, group))?;

                let mut claimed = Vec::with_capacity(ids.len());
                for id in ids {
                    let Some(position) = stream.positions.get(id) else {
                        continue;
                    };
                    let Some(pending) = group_state.pending.get_mut(position) else {
                        continue;
                    };
                    if now.saturating_duration_since(pending.delivered_at) < min_idle {
                        continue;
                    }
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    claimed.push(stream.entries[*position].clone());
                }
                Ok(claimed)
            })
        }

        fn read_new<'a>(
            &'a self,
            key: &'a StreamKey,
            group: &'a str,
            consumer: &'a str,
            count: usize,
        ) -> StoreFuture<'a, Vec<RawEntry>> {
            Box::pin(async move {
                let now = self.clock.now();
                let mut state = self.state.lock().await;
                state.read_calls += 1;
                if let Some(error) = state.read_errors.pop_front() {
                    return Err(error);
                }
                let stream =
                    state.streams.get_mut(&key.to_string()).ok_or_else(|| no_group(key, group))?;
                let group_state =
                    stream.groups.get_mut(group).ok_or_else(|| no_group(key, group))?;

                let end = stream.entries.len().min(group_state.next_unread + count);
                let batch: Vec<RawEntry> = stream.entries[group_state.next_unread..end].to_vec();
                for position in group_state.next_unread..end {
                    group_state.pending.insert(
                        position,
                        PendingEntry { consumer: consumer.to_string(), delivered_at: now, deliveries: 1 },
                    );
                }
                group_state.next_unread = end;
                Ok(batch)
            })
        }

        fn acknowledge<'a>(
            &'a self,
            key: &'a StreamKey,
            group: &'a str,
            id: &'a EntryId,
        ) -> StoreFuture<'a, u64> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                if let Some(error) = state.ack_errors.pop_front() {
                    return Err(error);
                }
                let released = state
                    .streams
                    .get_mut(&key.to_string())
                    .and_then(|stream| {
                        let position = *stream.positions.get(id)?;
                        stream.groups.get_mut(group)?.pending.remove(&position)
                    })
                    .is_some();
                if released {
                    state.acks.push(AckRecord {
                        key: key.clone(),
                        group: group.to_string(),
                        id: id.clone(),
                    });
                }
                Ok(u64::from(released))
            })
        }

        fn hash_entries<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Vec<(String, Bytes)>> {
            Box::pin(async move {
                let state = self.state.lock().await;
                if let Some(error) = state.failing_hashes.get(key) {
                    return Err(error.clone());
                }
                Ok(state.hashes.get(key).cloned().unwrap_or_default())
            })
        }

        fn scan_keys<'a>(&'a self, pattern: &'a str) -> StoreFuture<'a, Vec<String>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                if let Some(error) = state.scan_errors.pop_front() {
                    return Err(error);
                }
                let mut keys: Vec<String> = state
                    .streams
                    .keys()
                    .chain(state.hashes.keys())
                    .filter(|key| glob_matches(pattern, key))
                    .cloned()
                    .collect();
                keys.sort();
                Ok(keys)
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn glob_matching() {
            assert!(glob_matches("orders:*", "orders:1"));
            assert!(glob_matches("orders:*", "orders:"));
            assert!(!glob_matches("orders:*", "payments:1"));
            assert!(glob_matches("*~m-1", "Segments~m-1"));
            assert!(glob_matches("a*b*c", "a-x-b-y-c"));
            assert!(!glob_matches("a*b*c", "a-x-c"));
            assert!(glob_matches("exact", "exact"));
        }

        #[tokio::test]
        async fn read_new_moves_entries_to_pending() {
            let store = MemoryStreamStore::new();
            let key = StreamKey::new("orders", "1");
            store.create_group_if_absent(&key, "g").await.unwrap();
            let first = store.append(&key, HashMap::new()).await;
            let second = store.append(&key, HashMap::new()).await;

            let batch = store.read_new(&key, "g", "c1", 10).await.unwrap();
            assert_eq!(batch.len(), 2);
            assert_eq!(store.pending_ids(&key, "g", "c1").await, vec![first.clone(), second]);

            assert_eq!(store.acknowledge(&key, "g", &first).await.unwrap(), 1);
            assert_eq!(store.acknowledge(&key, "g", &first).await.unwrap(), 0);
            assert_eq!(store.acknowledged().await.len(), 1);
            assert!(store.read_new(&key, "g", "c1", 10).await.unwrap().is_empty());
        }

        #[tokio::test]
        async fn group_creation_is_idempotent() {
            let store = MemoryStreamStore::new();
            let key = StreamKey::new("orders", "1");

            assert!(store.create_group_if_absent(&key, "g").await.unwrap());
            assert!(!store.create_group_if_absent(&key, "g").await.unwrap());
            assert_eq!(store.groups_created().await, 1);
        }

        #[tokio::test]
        async fn list_pending_honours_cursor() {
            let store = MemoryStreamStore::new();
            let key = StreamKey::new("orders", "1");
            store.create_group_if_absent(&key, "g").await.unwrap();
            for _ in 0..3 {
                store.append(&key, HashMap::new()).await;
            }
            let batch = store.read_new(&key, "g", "c1", 10).await.unwrap();

            let after_first =
                store.list_pending(&key, "g", "c1", Some(&batch[0].id), 10).await.unwrap();
            assert_eq!(after_first, vec![batch[1].id.clone(), batch[2].id.clone()]);

            let other_consumer = store.list_pending(&key, "g", "c2", None, 10).await.unwrap();
            assert!(other_consumer.is_empty());
        }
    }
}
