//! Raw stream entry builder.
//!
//! [`TestEnv::publish`](crate::TestEnv::publish) covers well-formed
//! announcements. This builder writes the entry fields directly so tests can
//! append entries a producer would never write.

use std::collections::HashMap;

use backbone_channel::store::memory::MemoryStreamStore;
use backbone_core::{
    models::{FIELD_MESSAGE_ID, FIELD_OPERATION, FIELD_PRODUCED_AT},
    EntryId, StreamKey,
};

/// Builder for the field map of one stream entry.
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    fields: HashMap<String, String>,
}

impl EntryBuilder {
    /// Entry for `message_id` with a default operation and a zero timestamp.
    pub fn new(message_id: impl Into<String>) -> Self {
        let fields = HashMap::from([
            (FIELD_MESSAGE_ID.to_string(), message_id.into()),
            (FIELD_OPERATION.to_string(), "Test".to_string()),
            (FIELD_PRODUCED_AT.to_string(), "0".to_string()),
        ]);
        Self { fields }
    }

    /// Sets the operation signature.
    #[must_use]
    pub fn operation(self, operation: impl Into<String>) -> Self {
        self.field(FIELD_OPERATION, operation)
    }

    /// Sets the production time in unix seconds.
    #[must_use]
    pub fn produced_at(self, seconds: i64) -> Self {
        self.field(FIELD_PRODUCED_AT, seconds.to_string())
    }

    /// Sets an arbitrary field, replacing any previous value.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Removes a field.
    #[must_use]
    pub fn without(mut self, name: &str) -> Self {
        self.fields.remove(name);
        self
    }

    /// Finished field map.
    pub fn build(self) -> HashMap<String, String> {
        self.fields
    }

    /// Appends the entry to `key` on `store`.
    pub async fn append_to(self, store: &MemoryStreamStore, key: &StreamKey) -> EntryId {
        store.append(key, self.fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_all_required_fields() {
        let fields = EntryBuilder::new("m-1").build();

        assert_eq!(fields.get(FIELD_MESSAGE_ID).map(String::as_str), Some("m-1"));
        assert_eq!(fields.get(FIELD_OPERATION).map(String::as_str), Some("Test"));
        assert_eq!(fields.get(FIELD_PRODUCED_AT).map(String::as_str), Some("0"));
    }

    #[test]
    fn without_drops_a_field() {
        let fields = EntryBuilder::new("m-1").without(FIELD_OPERATION).build();

        assert!(!fields.contains_key(FIELD_OPERATION));
        assert_eq!(fields.len(), 2);
    }
}
