//! Core domain model for the backbone stream consumer.
//!
//! Provides the stream key, raw entry and announcement types, the consumer
//! option enums that steer acknowledgment and dispatch, and the clock
//! abstraction shared by every time-dependent loop. The channel engine and
//! its test fixtures depend on these types for consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod options;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{Announcement, Bucket, EntryId, Metadata, RawEntry, StreamKey};
pub use options::{AckBehavior, ConsumerOptions, MultiConsumerBehavior, PartialConsumerBehavior};
pub use time::{Clock, RealClock, TestClock};
