//! Error types for decoding stream entries into domain values.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Failures raised while turning raw store data into domain types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A required entry field was absent.
    #[error("entry {entry_id} is missing field {field}")]
    MissingField {
        /// Store-assigned id of the offending entry
        entry_id: String,
        /// Name of the missing field
        field: &'static str,
    },

    /// A field was present but could not be parsed.
    #[error("entry {entry_id} has invalid {field} value {value:?}: {reason}")]
    InvalidField {
        /// Store-assigned id of the offending entry
        entry_id: String,
        /// Name of the invalid field
        field: &'static str,
        /// Raw value as read from the store
        value: String,
        /// Why the value was rejected
        reason: String,
    },

    /// A stream key did not have the `partition:shard` shape.
    #[error("invalid stream key {key:?}")]
    InvalidStreamKey {
        /// The rejected key
        key: String,
    },
}

impl CoreError {
    /// Creates a missing field error.
    pub fn missing_field(entry_id: impl Into<String>, field: &'static str) -> Self {
        Self::MissingField { entry_id: entry_id.into(), field }
    }

    /// Creates an invalid field error.
    pub fn invalid_field(
        entry_id: impl Into<String>,
        field: &'static str,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidField {
            entry_id: entry_id.into(),
            field,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_entry_and_field() {
        let error = CoreError::missing_field("17-0", "MessageId");
        assert_eq!(error.to_string(), "entry 17-0 is missing field MessageId");

        let error = CoreError::invalid_field("17-0", "ProducedAt", "soon", "not an integer");
        assert_eq!(
            error.to_string(),
            "entry 17-0 has invalid ProducedAt value \"soon\": not an integer"
        );
    }
}
