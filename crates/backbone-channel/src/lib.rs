//! Consumer channel engine over stream consumer groups.
//!
//! Announcements are appended to streams named `{partition}:{shard}`. This
//! crate consumes them through a consumer group, assembles each entry with
//! its side-channel segments and interceptor data, and dispatches it to a
//! chain of handlers under an explicit acknowledgment policy.
//!
//! # Architecture
//!
//! A subscription runs the following pieces:
//!
//! 1. **Partition supervisor** - discovers the shards of a partition and
//!    runs one reader per shard
//! 2. **Shard reader** - claims pending entries, then reads new ones, and
//!    backs off exponentially on empty batches
//! 3. **Message assembler** - turns a raw entry into an announcement
//! 4. **Dispatch pipeline** - runs interceptors and handlers, applies the
//!    partial-consumer and ack policies and enforces the message ceiling
//! 5. **Ack controller** - commits or cancels each entry exactly once
//!
//! All store access goes through [`StreamStore`]. The Redis implementation
//! shares one multiplexed connection across shards and replaces it under a
//! debounced reconnect when it breaks.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use backbone_channel::{
//!     ChannelConfig, ConsumerChannel, ConsumerPlan, HandlerChain, OperationRouter,
//! };
//!
//! # async fn example(handler: Arc<dyn backbone_channel::AnnouncementHandler>) -> anyhow::Result<()> {
//! let config = ChannelConfig::load()?;
//! let channel = ConsumerChannel::from_config(&config)?;
//!
//! let plan = ConsumerPlan::builder("orders", "billing")
//!     .options(config.to_consumer_options())
//!     .build()?;
//! let router = OperationRouter::new().route("OrderPlaced", handler);
//! let chain = HandlerChain::new().with_handler(Arc::new(router));
//!
//! let subscription = channel.subscribe(plan, chain);
//! let end = subscription.completion().await;
//! println!("subscription ended: {end:?}");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod ack;
pub mod assembler;
pub mod backoff;
pub mod circuit;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod keep_alive;
pub mod plan;
pub mod reader;
pub mod redis_store;
pub mod resilience;
pub mod retry;
pub mod router;
pub mod store;
pub mod subscription;
pub mod supervisor;

pub use ack::{Ack, AckOutcome, AckState};
pub use assembler::MessageAssembler;
pub use backoff::{BackoffSettings, EmptyBatchBackoff};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use config::{ChannelConfig, RedisCredentials};
pub use connection::{ConnectionManager, ConnectionSettings, Connector};
pub use dispatch::{
    AnnouncementHandler, ConsumerContext, ConsumerInterceptor, DispatchOutcome, DispatchPipeline,
    DispatchStatus, FallbackHandler, HandlerChain,
};
pub use error::{ChannelError, ErrorCategory, Result};
pub use plan::{ConsumerPlan, ConsumerPlanBuilder};
pub use reader::{ReaderStep, ShardExit, ShardReader, ShardResources};
pub use redis_store::RedisStreamStore;
pub use resilience::{CircuitBreakerResilience, NoResilience, ResiliencePolicy, RetryResilience};
pub use retry::{BackoffStrategy, RetryDecision, RetryPolicy};
pub use router::OperationRouter;
pub use store::StreamStore;
pub use subscription::{ConsumerChannel, SubscriptionEnd, SubscriptionHandle, SubscriptionStats};
pub use supervisor::{PartitionSupervisor, SupervisorReport};
