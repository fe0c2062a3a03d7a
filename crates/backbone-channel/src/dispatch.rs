//! Handler chain execution for one announcement.
//!
//! For every assembled announcement the pipeline enforces the message
//! ceiling, runs the interceptors, invokes handlers (all of them or up to the
//! first match), falls back when nothing handled it, applies the partial
//! behavior, and finally resolves the ack according to the ack behavior.
//! Interceptors, handlers and fallbacks run together as one attempt under the
//! plan's resilience policy.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use backbone_core::{
    AckBehavior, Announcement, ConsumerOptions, Metadata, MultiConsumerBehavior,
    PartialConsumerBehavior,
};
use bytes::Bytes;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    ack::{Ack, AckState},
    error::{ChannelError, ErrorCategory, Result},
    resilience::{Attempt, ResiliencePolicy},
};

/// Handles announcements; returns `true` when it handled the announcement.
#[async_trait::async_trait]
pub trait AnnouncementHandler: Send + Sync {
    /// Processes one announcement.
    async fn handle(&self, announcement: &Announcement, context: &ConsumerContext) -> anyhow::Result<bool>;
}

/// Runs when no handler handled an announcement.
///
/// A fallback signals that it took care of the announcement by committing
/// the ack exposed through the context.
#[async_trait::async_trait]
pub trait FallbackHandler: Send + Sync {
    /// Processes one unhandled announcement.
    async fn handle(&self, announcement: &Announcement, context: &ConsumerContext) -> anyhow::Result<()>;
}

/// Inspects announcement side-data before any handler runs.
#[async_trait::async_trait]
pub trait ConsumerInterceptor: Send + Sync {
    /// Slot of the interceptors bucket this interceptor reads.
    fn name(&self) -> &str;

    /// Receives the metadata and the interceptor's slot, empty when absent.
    ///
    /// An error aborts the announcement.
    async fn intercept(&self, metadata: &Metadata, data: &Bytes) -> anyhow::Result<()>;
}

/// Per-announcement context passed to handlers, fallbacks and interceptors.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    metadata: Metadata,
    ack: Ack,
    cancellation: CancellationToken,
    consumer_group: Arc<str>,
    consumer_name: Arc<str>,
}

impl ConsumerContext {
    /// Creates a context for one delivery.
    pub fn new(
        metadata: Metadata,
        ack: Ack,
        cancellation: CancellationToken,
        consumer_group: Arc<str>,
        consumer_name: Arc<str>,
    ) -> Self {
        Self { metadata, ack, cancellation, consumer_group, consumer_name }
    }

    /// Metadata of the announcement.
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Ack of the delivered entry.
    pub fn ack(&self) -> &Ack {
        &self.ack
    }

    /// Batch cancellation; fires when any ack of the batch is cancelled or
    /// the subscription stops.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Consumer group the entry was delivered to.
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Consumer identity within the group.
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }
}

/// Ordered handlers, fallbacks and interceptors of a subscription.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn AnnouncementHandler>>,
    fallbacks: Vec<Arc<dyn FallbackHandler>>,
    interceptors: Vec<Arc<dyn ConsumerInterceptor>>,
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("handlers", &self.handlers.len())
            .field("fallbacks", &self.fallbacks.len())
            .field("interceptors", &self.interceptors.iter().map(|i| i.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a handler; registration order is dispatch order.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn AnnouncementHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Appends a fallback handler.
    #[must_use]
    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackHandler>) -> Self {
        self.fallbacks.push(fallback);
        self
    }

    /// Appends an interceptor.
    #[must_use]
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ConsumerInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

/// How the pipeline finished with one announcement.
#[derive(Debug, Clone)]
pub enum DispatchStatus {
    /// A handler returned `true` or a fallback committed the ack.
    Handled,
    /// Nothing handled the announcement and that is allowed.
    Unhandled,
    /// Interceptor, handler or contract failure.
    Failed(ChannelError),
    /// The message ceiling was already reached; nothing ran.
    LimitReached,
}

/// Result of dispatching one announcement.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// What happened to the announcement.
    pub status: DispatchStatus,
    /// Ack state after resolution.
    pub ack: AckState,
}

/// Drives the handler chain for every announcement of a subscription.
///
/// Shared by all shard readers of a subscription, so the message ceiling
/// counts across shards. Only dispatches that do not fail count toward it.
pub struct DispatchPipeline {
    chain: HandlerChain,
    options: ConsumerOptions,
    resilience: Arc<dyn ResiliencePolicy>,
    dispatched: AtomicU64,
    limit_reached: AtomicBool,
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("chain", &self.chain)
            .field("options", &self.options)
            .field("resilience", &self.resilience)
            .field("dispatched", &self.dispatched())
            .finish()
    }
}

impl DispatchPipeline {
    /// Creates a pipeline for one subscription.
    pub fn new(
        chain: HandlerChain,
        options: ConsumerOptions,
        resilience: Arc<dyn ResiliencePolicy>,
    ) -> Self {
        Self {
            chain,
            options,
            resilience,
            dispatched: AtomicU64::new(0),
            limit_reached: AtomicBool::new(false),
        }
    }

    /// Options the pipeline applies.
    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Announcements dispatched without failure so far, plus any in flight.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Acquire).min(self.ceiling())
    }

    /// Returns true once the message ceiling has been reached.
    pub fn limit_reached(&self) -> bool {
        self.limit_reached.load(Ordering::Acquire)
    }

    fn ceiling(&self) -> u64 {
        if self.options.has_message_limit() {
            self.options.max_messages
        } else {
            u64::MAX
        }
    }

    /// Dispatches one announcement and resolves its ack.
    pub async fn dispatch(&self, announcement: &Announcement, context: &ConsumerContext) -> DispatchOutcome {
        let ack = context.ack();

        let count = self.dispatched.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.ceiling() {
            self.limit_reached.store(true, Ordering::Release);
            ack.auto_cancel();
            debug!(
                message_id = %announcement.metadata.message_id,
                limit = self.options.max_messages,
                "message limit reached, announcement left pending"
            );
            return DispatchOutcome { status: DispatchStatus::LimitReached, ack: ack.state() };
        }

        let attempt = ChainAttempt { pipeline: self, announcement, context };
        let result = self.resilience.execute(&attempt, context.cancellation()).await;
        let status = self.resolve(announcement, context, result).await;

        if matches!(status, DispatchStatus::Failed(_)) {
            // Failed dispatches give their slot back
            self.dispatched.fetch_sub(1, Ordering::AcqRel);
        } else if count >= self.ceiling() {
            self.limit_reached.store(true, Ordering::Release);
        }

        DispatchOutcome { status, ack: ack.state() }
    }

    async fn resolve(
        &self,
        announcement: &Announcement,
        context: &ConsumerContext,
        result: Result<bool>,
    ) -> DispatchStatus {
        let ack = context.ack();
        let commits_on_finally = self.options.commits_on_finally();
        let metadata = &announcement.metadata;

        let status = match result {
            Ok(true) => {
                if self.options.ack_behavior == AckBehavior::OnSucceed {
                    self.commit(ack, metadata).await;
                }
                DispatchStatus::Handled
            },
            Ok(false) => {
                if self.options.partial_behavior == PartialConsumerBehavior::ThrowIfNotHandled {
                    let failure = ChannelError::NoHandlerMatched {
                        stream: metadata.stream_key().to_string(),
                        operation: metadata.operation.clone(),
                        message_id: metadata.message_id.clone(),
                    };
                    error!(
                        message_id = %metadata.message_id,
                        operation = %metadata.operation,
                        error = %failure,
                        "announcement not handled"
                    );
                    if !commits_on_finally {
                        ack.auto_cancel();
                    }
                    DispatchStatus::Failed(failure)
                } else {
                    debug!(
                        message_id = %metadata.message_id,
                        operation = %metadata.operation,
                        "announcement not handled"
                    );
                    DispatchStatus::Unhandled
                }
            },
            Err(failure) => {
                if failure.is_cancellation() {
                    debug!(message_id = %metadata.message_id, "dispatch cancelled");
                } else {
                    error!(
                        message_id = %metadata.message_id,
                        operation = %metadata.operation,
                        error = %failure,
                        category = %ErrorCategory::from(&failure),
                        "announcement dispatch failed"
                    );
                }
                if !commits_on_finally {
                    ack.auto_cancel();
                }
                DispatchStatus::Failed(failure)
            },
        };

        if commits_on_finally {
            self.commit(ack, metadata).await;
        }

        status
    }

    async fn commit(&self, ack: &Ack, metadata: &Metadata) {
        if let Err(failure) = ack.auto_commit().await {
            warn!(message_id = %metadata.message_id, error = %failure, "auto commit failed");
        }
    }

    async fn run_chain(&self, announcement: &Announcement, context: &ConsumerContext) -> Result<bool> {
        self.run_interceptors(announcement).await?;

        let handled = match self.options.multi_consumer_behavior {
            MultiConsumerBehavior::All => self.run_all(announcement, context).await?,
            MultiConsumerBehavior::FirstMatch => self.run_first_match(announcement, context).await?,
        };
        if handled {
            return Ok(true);
        }

        self.run_fallbacks(announcement, context).await
    }

    async fn run_interceptors(&self, announcement: &Announcement) -> Result<()> {
        let empty = Bytes::new();
        for interceptor in &self.chain.interceptors {
            let data = announcement.interceptors.get(interceptor.name()).unwrap_or(&empty);
            interceptor
                .intercept(&announcement.metadata, data)
                .await
                .map_err(|error| ChannelError::interceptor(interceptor.name(), &error))?;
        }
        Ok(())
    }

    async fn run_first_match(&self, announcement: &Announcement, context: &ConsumerContext) -> Result<bool> {
        for handler in &self.chain.handlers {
            if context.cancellation().is_cancelled() {
                return Err(ChannelError::Cancelled);
            }
            if handler.handle(announcement, context).await.map_err(|error| ChannelError::handler(&error))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn run_all(&self, announcement: &Announcement, context: &ConsumerContext) -> Result<bool> {
        let results =
            join_all(self.chain.handlers.iter().map(|handler| handler.handle(announcement, context))).await;

        let mut handled = false;
        for result in results {
            handled |= result.map_err(|error| ChannelError::handler(&error))?;
        }
        Ok(handled)
    }

    async fn run_fallbacks(&self, announcement: &Announcement, context: &ConsumerContext) -> Result<bool> {
        if self.chain.fallbacks.is_empty() {
            return Ok(false);
        }

        let results =
            join_all(self.chain.fallbacks.iter().map(|fallback| fallback.handle(announcement, context))).await;
        for result in results {
            result.map_err(|error| ChannelError::handler(&error))?;
        }

        Ok(context.ack().state() == AckState::Acked)
    }
}

struct ChainAttempt<'a> {
    pipeline: &'a DispatchPipeline,
    announcement: &'a Announcement,
    context: &'a ConsumerContext,
}

#[async_trait::async_trait]
impl Attempt for ChainAttempt<'_> {
    async fn attempt(&self) -> Result<bool> {
        self.pipeline.run_chain(self.announcement, self.context).await
    }
}
