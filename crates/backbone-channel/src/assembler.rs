//! Turns raw stream entries into announcements.

use std::sync::Arc;

use backbone_core::{
    models::{interceptors_key, segments_key},
    Announcement, Bucket, Metadata, RawEntry, StreamKey,
};

use crate::{
    error::{ChannelError, Result},
    store::StreamStore,
};

/// Decodes entry metadata and loads the two side-channel hashes.
#[derive(Clone)]
pub struct MessageAssembler {
    store: Arc<dyn StreamStore>,
}

impl MessageAssembler {
    /// Creates an assembler reading side-channels from `store`.
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store }
    }

    /// Builds the announcement for one entry read from `key`.
    ///
    /// Missing side-channel hashes yield empty buckets.
    ///
    /// # Errors
    ///
    /// Returns `Assembly` when a metadata field is missing or malformed, or
    /// when a side-channel fetch fails. The entry is not acknowledged.
    pub async fn assemble(&self, key: &StreamKey, entry: &RawEntry) -> Result<Announcement> {
        let metadata = Metadata::from_entry(key, entry)?;
        let segments_key = segments_key(&metadata.message_id);
        let interceptors_key = interceptors_key(&metadata.message_id);

        let (segments, interceptors) = tokio::try_join!(
            self.store.hash_entries(&segments_key),
            self.store.hash_entries(&interceptors_key),
        )
        .map_err(|error| ChannelError::assembly(entry.id.as_str(), error.to_string()))?;

        Ok(Announcement::new(
            metadata,
            Bucket::empty().add_range(segments),
            Bucket::empty().add_range(interceptors),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use backbone_core::models::{FIELD_MESSAGE_ID, FIELD_OPERATION, FIELD_PRODUCED_AT};
    use bytes::Bytes;

    use super::*;
    use crate::store::memory::MemoryStreamStore;

    fn key() -> StreamKey {
        StreamKey::new("orders", "1")
    }

    #[tokio::test]
    async fn assembles_published_announcement() {
        let store = MemoryStreamStore::new();
        let segments = Bucket::from_iter([("a", vec![1_u8, 2]), ("b", vec![3])]);
        let interceptors = Bucket::from_iter([("trace", b"abc".to_vec())]);
        store.publish(&key(), "m-1", "OrderPlaced", 1_700_000_000, &segments, &interceptors).await;
        store.create_group_if_absent(&key(), "billing").await.unwrap();
        let entries = store.read_new(&key(), "billing", "c-1", 10).await.unwrap();

        let assembler = MessageAssembler::new(Arc::new(store));
        let announcement = assembler.assemble(&key(), &entries[0]).await.unwrap();

        assert_eq!(announcement.operation(), "OrderPlaced");
        assert_eq!(announcement.metadata.message_id, "m-1");
        assert_eq!(announcement.metadata.shard, "1");
        assert_eq!(announcement.metadata.produced_at.timestamp(), 1_700_000_000);
        assert_eq!(announcement.segments, segments);
        assert_eq!(announcement.interceptors.get("trace"), Some(&Bytes::from_static(b"abc")));
    }

    #[tokio::test]
    async fn missing_hashes_yield_empty_buckets() {
        let store = Arc::new(MemoryStreamStore::new());
        let entry = RawEntry::new(
            "1-0",
            HashMap::from([
                (FIELD_MESSAGE_ID.to_string(), "m-2".to_string()),
                (FIELD_OPERATION.to_string(), "Noop".to_string()),
                (FIELD_PRODUCED_AT.to_string(), "0".to_string()),
            ]),
        );

        let announcement = MessageAssembler::new(store).assemble(&key(), &entry).await.unwrap();

        assert!(announcement.segments.is_empty());
        assert!(announcement.interceptors.is_empty());
    }

    #[tokio::test]
    async fn missing_operation_fails_assembly() {
        let store = Arc::new(MemoryStreamStore::new());
        let entry = RawEntry::new(
            "7-0",
            HashMap::from([
                (FIELD_MESSAGE_ID.to_string(), "m-3".to_string()),
                (FIELD_PRODUCED_AT.to_string(), "0".to_string()),
            ]),
        );

        let error = MessageAssembler::new(store).assemble(&key(), &entry).await.unwrap_err();

        assert!(matches!(error, ChannelError::Assembly { ref entry_id, .. } if entry_id == "7-0"));
    }

    #[tokio::test]
    async fn side_channel_failure_fails_assembly() {
        let store = MemoryStreamStore::new();
        store.fail_hash(&segments_key("m-4"), ChannelError::store("LOADING")).await;
        let entry = RawEntry::new(
            "8-0",
            HashMap::from([
                (FIELD_MESSAGE_ID.to_string(), "m-4".to_string()),
                (FIELD_OPERATION.to_string(), "Noop".to_string()),
                (FIELD_PRODUCED_AT.to_string(), "0".to_string()),
            ]),
        );

        let error = MessageAssembler::new(Arc::new(store)).assemble(&key(), &entry).await.unwrap_err();

        assert!(matches!(error, ChannelError::Assembly { .. }));
    }
}
