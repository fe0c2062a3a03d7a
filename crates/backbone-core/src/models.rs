//! Stream keys, raw entries and assembled announcements.
//!
//! A producer appends one entry per announcement to the `partition:shard`
//! stream and writes the payload segments and interceptor side-data into two
//! hashes keyed by the message id. Consumers read the entry, fetch both
//! hashes, and hand the resulting [`Announcement`] to their handlers.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Entry field carrying the producer-assigned message id.
pub const FIELD_MESSAGE_ID: &str = "MessageId";

/// Entry field carrying the operation signature.
pub const FIELD_OPERATION: &str = "Operation";

/// Entry field carrying the production time in unix seconds.
pub const FIELD_PRODUCED_AT: &str = "ProducedAt";

/// Hash key holding the payload segments of a message.
pub fn segments_key(message_id: &str) -> String {
    format!("Segments~{message_id}")
}

/// Hash key holding the interceptor side-data of a message.
pub fn interceptors_key(message_id: &str) -> String {
    format!("Interceptors~{message_id}")
}

/// Identifies one ordered append-only stream as `partition:shard`.
///
/// # Example
///
/// ```
/// use backbone_core::StreamKey;
/// let key = StreamKey::new("orders", "eu-1");
/// assert_eq!(key.to_string(), "orders:eu-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    partition: String,
    shard: String,
}

impl StreamKey {
    /// Creates a key from its partition and shard.
    pub fn new(partition: impl Into<String>, shard: impl Into<String>) -> Self {
        Self { partition: partition.into(), shard: shard.into() }
    }

    /// Rebuilds a key returned by a `partition:*` scan.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStreamKey` if `raw` does not start with `partition:`
    /// or has an empty shard.
    pub fn from_scanned(partition: &str, raw: &str) -> Result<Self> {
        raw.strip_prefix(partition)
            .and_then(|rest| rest.strip_prefix(':'))
            .filter(|shard| !shard.is_empty())
            .map(|shard| Self::new(partition, shard))
            .ok_or_else(|| CoreError::InvalidStreamKey { key: raw.to_string() })
    }

    /// Partition half of the key.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Shard half of the key.
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Glob pattern matching every shard of `partition`.
    pub fn scan_pattern(partition: &str) -> String {
        format!("{partition}:*")
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.partition, self.shard)
    }
}

/// Store-assigned entry id, monotonic within one stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub String);

impl EntryId {
    /// Borrows the id as the store's wire representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntryId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntryId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// One stored record as returned by a claim or read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    /// Store-assigned id.
    pub id: EntryId,
    /// Field name to value mapping.
    pub fields: HashMap<String, String>,
}

impl RawEntry {
    /// Creates an entry from its id and fields.
    pub fn new(id: impl Into<EntryId>, fields: HashMap<String, String>) -> Self {
        Self { id: id.into(), fields }
    }

    /// Looks up a field value.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    fn required(&self, name: &'static str) -> Result<&str> {
        self.field(name).ok_or_else(|| CoreError::missing_field(self.id.as_str(), name))
    }
}

/// Immutable string-keyed byte mapping.
///
/// Holds either the payload segments or the interceptor side-data of a
/// message. Producers guarantee key uniqueness, so a union never has to
/// resolve collisions; when it happens anyway the right-hand value wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    entries: BTreeMap<String, Bytes>,
}

impl Bucket {
    /// Creates an empty bucket.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns a new bucket holding these entries plus `pairs`.
    #[must_use]
    pub fn add_range<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Bytes>,
    {
        let mut entries = self.entries.clone();
        entries.extend(pairs.into_iter().map(|(key, value)| (key.into(), value.into())));
        Self { entries }
    }

    /// Returns the union of two buckets.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        self.add_range(other.entries.iter().map(|(key, value)| (key.clone(), value.clone())))
    }

    /// Looks up the bytes stored under `key`.
    pub fn get(&self, key: &str) -> Option<&Bytes> {
        self.entries.get(key)
    }

    /// Returns the set of keys.
    pub fn keys(&self) -> BTreeSet<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Iterates over key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the bucket holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Bucket
where
    K: Into<String>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::empty().add_range(iter)
    }
}

/// Identity and routing information of one announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Producer-assigned message id.
    pub message_id: String,
    /// Partition the entry was read from.
    pub partition: String,
    /// Shard the entry was read from.
    pub shard: String,
    /// Operation signature used to route the announcement.
    pub operation: String,
    /// When the producer appended the entry.
    pub produced_at: DateTime<Utc>,
}

impl Metadata {
    /// Decodes the metadata fields of an entry read from `key`.
    ///
    /// # Errors
    ///
    /// Returns `MissingField` when `MessageId`, `Operation` or `ProducedAt`
    /// is absent and `InvalidField` when `ProducedAt` is not a unix second
    /// count within the representable range.
    pub fn from_entry(key: &StreamKey, entry: &RawEntry) -> Result<Self> {
        let message_id = entry.required(FIELD_MESSAGE_ID)?.to_string();
        let operation = entry.required(FIELD_OPERATION)?.to_string();
        let raw_produced_at = entry.required(FIELD_PRODUCED_AT)?;

        let seconds: i64 = raw_produced_at.trim().parse().map_err(|error| {
            CoreError::invalid_field(
                entry.id.as_str(),
                FIELD_PRODUCED_AT,
                raw_produced_at,
                format!("{error}"),
            )
        })?;
        let produced_at = DateTime::from_timestamp(seconds, 0).ok_or_else(|| {
            CoreError::invalid_field(
                entry.id.as_str(),
                FIELD_PRODUCED_AT,
                raw_produced_at,
                "timestamp out of range",
            )
        })?;

        Ok(Self {
            message_id,
            partition: key.partition().to_string(),
            shard: key.shard().to_string(),
            operation,
            produced_at,
        })
    }

    /// Stream the announcement was read from.
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(self.partition.clone(), self.shard.clone())
    }
}

/// Fully assembled logical event delivered to handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    /// Identity and routing info.
    pub metadata: Metadata,
    /// Payload segments.
    pub segments: Bucket,
    /// Interceptor side-data, one slot per interceptor name.
    pub interceptors: Bucket,
}

impl Announcement {
    /// Creates an announcement from its parts.
    pub fn new(metadata: Metadata, segments: Bucket, interceptors: Bucket) -> Self {
        Self { metadata, segments, interceptors }
    }

    /// Operation signature shortcut.
    pub fn operation(&self) -> &str {
        &self.metadata.operation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(fields: &[(&str, &str)]) -> RawEntry {
        RawEntry::new(
            "1-0",
            fields.iter().map(|(key, value)| ((*key).to_string(), (*value).to_string())).collect(),
        )
    }

    #[test]
    fn stream_key_formats_partition_and_shard() {
        let key = StreamKey::new("orders", "eu-1");
        assert_eq!(key.to_string(), "orders:eu-1");
        assert_eq!(StreamKey::scan_pattern("orders"), "orders:*");
    }

    #[test]
    fn scanned_keys_are_split_on_partition_prefix() {
        let key = StreamKey::from_scanned("orders", "orders:eu:1").unwrap();
        assert_eq!(key.shard(), "eu:1");

        assert!(StreamKey::from_scanned("orders", "payments:1").is_err());
        assert!(StreamKey::from_scanned("orders", "orders:").is_err());
        assert!(StreamKey::from_scanned("orders", "ordersx:1").is_err());
    }

    #[test]
    fn bucket_lookup_and_keys() {
        let bucket: Bucket = [("a", vec![1_u8, 2]), ("b", vec![3_u8])].into_iter().collect();

        assert_eq!(bucket.get("a").map(|bytes| bytes.as_ref()), Some(&[1_u8, 2][..]));
        assert_eq!(bucket.keys(), BTreeSet::from(["a", "b"]));
        assert!(bucket.get("c").is_none());
    }

    #[test]
    fn bucket_merge_is_union_and_leaves_inputs_untouched() {
        let left = Bucket::empty().add_range([("a", Bytes::from_static(b"1"))]);
        let right = Bucket::empty().add_range([("b", Bytes::from_static(b"2"))]);

        let merged = left.merge(&right);

        assert_eq!(merged.keys(), BTreeSet::from(["a", "b"]));
        assert_eq!(left.len(), 1);
        assert_eq!(right.len(), 1);
    }

    #[test]
    fn metadata_decodes_entry_fields() {
        let key = StreamKey::new("orders", "1");
        let raw = entry(&[
            (FIELD_MESSAGE_ID, "m-1"),
            (FIELD_OPERATION, "OrderPlaced"),
            (FIELD_PRODUCED_AT, "1700000000"),
        ]);

        let metadata = Metadata::from_entry(&key, &raw).unwrap();

        assert_eq!(metadata.message_id, "m-1");
        assert_eq!(metadata.operation, "OrderPlaced");
        assert_eq!(metadata.partition, "orders");
        assert_eq!(metadata.shard, "1");
        assert_eq!(metadata.produced_at.timestamp(), 1_700_000_000);
        assert_eq!(metadata.stream_key(), key);
    }

    #[test]
    fn metadata_rejects_missing_and_malformed_fields() {
        let key = StreamKey::new("orders", "1");

        let missing = entry(&[(FIELD_MESSAGE_ID, "m-1"), (FIELD_PRODUCED_AT, "1")]);
        assert_eq!(
            Metadata::from_entry(&key, &missing),
            Err(CoreError::missing_field("1-0", FIELD_OPERATION))
        );

        let malformed = entry(&[
            (FIELD_MESSAGE_ID, "m-1"),
            (FIELD_OPERATION, "OrderPlaced"),
            (FIELD_PRODUCED_AT, "yesterday"),
        ]);
        assert!(matches!(
            Metadata::from_entry(&key, &malformed),
            Err(CoreError::InvalidField { field: FIELD_PRODUCED_AT, .. })
        ));
    }

    #[test]
    fn side_channel_keys() {
        assert_eq!(segments_key("m-1"), "Segments~m-1");
        assert_eq!(interceptors_key("m-1"), "Interceptors~m-1");
    }
}
