//! Test infrastructure for the backbone consumer crates.
//!
//! Provides an in-memory environment with a virtual clock, recording
//! handler doubles, a raw entry builder and one-time tracing setup so integration tests run
//! deterministically without a Redis server.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::sync::Once;

pub mod entries;
pub mod env;
pub mod handlers;

pub use backbone_channel::store::memory::{AckRecord, MemoryStreamStore};
pub use backbone_core::TestClock;
pub use entries::EntryBuilder;
pub use env::TestEnv;
pub use handlers::{
    AckAction, CompletionTracker, RecordingFallback, RecordingHandler, RecordingInterceptor, Seen,
    DEFAULT_HANDLER_TIMEOUT,
};

static TRACING: Once = Once::new();

/// Installs a test-writer subscriber filtered by `RUST_LOG`, defaulting to
/// `error`. Safe to call from every test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
            )
            .with_test_writer()
            .try_init();
    });
}
