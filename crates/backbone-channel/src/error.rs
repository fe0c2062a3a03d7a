//! Error types for the consumer channel engine.
//!
//! Separates transient store failures (retried through backoff) from
//! per-message failures (isolated to one entry) and lifecycle signals such
//! as cancellation and the message ceiling. Errors carry enough context for
//! structured logging and are categorized for the subscription statistics.

use std::{fmt, time::Duration};

use backbone_core::CoreError;
use thiserror::Error;

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

/// Error conditions raised by the channel engine.
#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    /// Store round-trip exceeded its deadline.
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline in milliseconds
        timeout_ms: u64,
    },

    /// Connection to the store failed or dropped.
    #[error("store connection failed: {message}")]
    Connection {
        /// Description of the connection failure
        message: String,
    },

    /// Store rejected or failed a command.
    #[error("store command failed: {message}")]
    Store {
        /// Description of the command failure
        message: String,
    },

    /// Consumer group could not be created for a stream.
    #[error("cannot create consumer group {group} on {stream}: {message}")]
    GroupCreation {
        /// Stream key the group was created on
        stream: String,
        /// Consumer group name
        group: String,
        /// Underlying store message
        message: String,
    },

    /// Entry could not be turned into an announcement.
    #[error("cannot assemble entry {entry_id}: {message}")]
    Assembly {
        /// Store-assigned entry id
        entry_id: String,
        /// Why assembly failed
        message: String,
    },

    /// Interceptor rejected an announcement.
    #[error("interceptor {name} failed: {message}")]
    Interceptor {
        /// Interceptor name
        name: String,
        /// Interceptor error message
        message: String,
    },

    /// Handler or fallback returned an error.
    #[error("handler failed: {message}")]
    Handler {
        /// Handler error message
        message: String,
    },

    /// No handler claimed an announcement that had to be handled.
    #[error("no handler matched {stream} operation {operation} message {message_id}")]
    NoHandlerMatched {
        /// Stream key of the announcement
        stream: String,
        /// Operation signature
        operation: String,
        /// Message id
        message_id: String,
    },

    /// Circuit breaker rejected the attempt.
    #[error("circuit breaker {name} is open")]
    CircuitOpen {
        /// Breaker name
        name: String,
    },

    /// Retry policy gave up.
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error of the final attempt
        last_error: String,
    },

    /// Ack was already committed or cancelled.
    #[error("ack for entry {entry_id} already resolved")]
    AckAlreadyResolved {
        /// Store-assigned entry id
        entry_id: String,
    },

    /// Work was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid plan or configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Unexpected internal error.
    #[error("internal channel error: {message}")]
    Internal {
        /// Internal error message
        message: String,
    },
}

impl ChannelError {
    /// Creates a timeout error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Creates a store command error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store { message: message.into() }
    }

    /// Creates an assembly error for an entry.
    pub fn assembly(entry_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Assembly { entry_id: entry_id.into(), message: message.into() }
    }

    /// Creates an interceptor error.
    pub fn interceptor(name: impl Into<String>, error: &anyhow::Error) -> Self {
        Self::Interceptor { name: name.into(), message: format!("{error:#}") }
    }

    /// Creates a handler error.
    pub fn handler(error: &anyhow::Error) -> Self {
        Self::Handler { message: format!("{error:#}") }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Returns true for store failures the shard loop absorbs with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Connection { .. } | Self::Store { .. })
    }

    /// Determines if a resilience policy may retry after this error.
    ///
    /// Store and handler failures are retryable. Contract violations,
    /// lifecycle signals and open circuits are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout { .. }
            | Self::Connection { .. }
            | Self::Store { .. }
            | Self::Interceptor { .. }
            | Self::Handler { .. } => true,

            Self::GroupCreation { .. }
            | Self::Assembly { .. }
            | Self::NoHandlerMatched { .. }
            | Self::CircuitOpen { .. }
            | Self::RetriesExhausted { .. }
            | Self::AckAlreadyResolved { .. }
            | Self::Cancelled
            | Self::Configuration { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Returns true for errors that signal an orderly stop, not a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<CoreError> for ChannelError {
    fn from(error: CoreError) -> Self {
        match &error {
            CoreError::MissingField { entry_id, .. } | CoreError::InvalidField { entry_id, .. } => {
                Self::assembly(entry_id.clone(), error.to_string())
            },
            CoreError::InvalidStreamKey { .. } => Self::store(error.to_string()),
        }
    }
}

/// Category of channel error for statistics and log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Store connectivity and command failures.
    Store,
    /// Entry decoding and side-channel fetches.
    Assembly,
    /// Handler, fallback and interceptor failures.
    Handler,
    /// Handler contract violations.
    Contract,
    /// Retry and circuit breaker outcomes.
    Resilience,
    /// Cancellation and ack state.
    Lifecycle,
    /// Configuration problems.
    Configuration,
    /// Internal system errors.
    Internal,
}

impl From<&ChannelError> for ErrorCategory {
    fn from(error: &ChannelError) -> Self {
        match error {
            ChannelError::Timeout { .. }
            | ChannelError::Connection { .. }
            | ChannelError::Store { .. }
            | ChannelError::GroupCreation { .. } => Self::Store,
            ChannelError::Assembly { .. } => Self::Assembly,
            ChannelError::Interceptor { .. } | ChannelError::Handler { .. } => Self::Handler,
            ChannelError::NoHandlerMatched { .. } => Self::Contract,
            ChannelError::CircuitOpen { .. } | ChannelError::RetriesExhausted { .. } => {
                Self::Resilience
            },
            ChannelError::AckAlreadyResolved { .. } | ChannelError::Cancelled => Self::Lifecycle,
            ChannelError::Configuration { .. } => Self::Configuration,
            ChannelError::Internal { .. } => Self::Internal,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store => write!(f, "store"),
            Self::Assembly => write!(f, "assembly"),
            Self::Handler => write!(f, "handler"),
            Self::Contract => write!(f, "contract"),
            Self::Resilience => write!(f, "resilience"),
            Self::Lifecycle => write!(f, "lifecycle"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_identified_correctly() {
        assert!(ChannelError::timeout("XREADGROUP", Duration::from_secs(5)).is_transient());
        assert!(ChannelError::connection("reset by peer").is_transient());
        assert!(ChannelError::store("NOGROUP").is_transient());

        assert!(!ChannelError::assembly("1-0", "missing MessageId").is_transient());
        assert!(!ChannelError::Cancelled.is_transient());
    }

    #[test]
    fn contract_violations_are_not_retried() {
        let error = ChannelError::NoHandlerMatched {
            stream: "orders:1".to_string(),
            operation: "OrderPlaced".to_string(),
            message_id: "m-1".to_string(),
        };
        assert!(!error.is_retryable());
        assert_eq!(ErrorCategory::from(&error), ErrorCategory::Contract);

        let handler = ChannelError::handler(&anyhow::anyhow!("boom"));
        assert!(handler.is_retryable());
    }

    #[test]
    fn cancel_is_an_orderly_stop() {
        assert!(ChannelError::Cancelled.is_cancellation());
        assert!(!ChannelError::internal("bug").is_cancellation());
    }

    #[test]
    fn core_errors_map_to_assembly() {
        let error: ChannelError = CoreError::missing_field("9-0", "Operation").into();
        assert!(matches!(error, ChannelError::Assembly { ref entry_id, .. } if entry_id == "9-0"));
    }

    #[test]
    fn error_display_format() {
        let error = ChannelError::timeout("XACK", Duration::from_millis(250));
        assert_eq!(error.to_string(), "XACK timed out after 250ms");
        assert_eq!(ErrorCategory::from(&error).to_string(), "store");
    }
}
