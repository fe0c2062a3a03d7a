//! What to consume and how.

use std::sync::Arc;

use backbone_core::{ConsumerOptions, StreamKey};
use tokio_util::sync::CancellationToken;
use tracing::Span;
use uuid::Uuid;

use crate::{
    error::{ChannelError, Result},
    resilience::{NoResilience, ResiliencePolicy},
};

/// Immutable description of a subscription.
///
/// Partition, environment and shard overrides return a new plan and leave
/// the original untouched.
#[derive(Debug, Clone)]
pub struct ConsumerPlan {
    partition: String,
    environment: Option<String>,
    shard: String,
    consumer_group: String,
    consumer_name: String,
    options: ConsumerOptions,
    cancellation: CancellationToken,
    resilience: Arc<dyn ResiliencePolicy>,
}

impl ConsumerPlan {
    /// Starts a plan for `partition` consumed by `consumer_group`.
    pub fn builder(
        partition: impl Into<String>,
        consumer_group: impl Into<String>,
    ) -> ConsumerPlanBuilder {
        ConsumerPlanBuilder {
            partition: partition.into(),
            consumer_group: consumer_group.into(),
            environment: None,
            shard: String::new(),
            consumer_name: None,
            options: ConsumerOptions::default(),
            cancellation: None,
            resilience: None,
        }
    }

    /// Partition as configured, without the environment prefix.
    pub fn partition(&self) -> &str {
        &self.partition
    }

    /// Environment prefix, when set.
    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// Partition the streams live under: `{environment}.{partition}` or the
    /// bare partition.
    pub fn effective_partition(&self) -> String {
        match &self.environment {
            Some(environment) => format!("{environment}.{}", self.partition),
            None => self.partition.clone(),
        }
    }

    /// Shard to consume; empty means every shard of the partition.
    pub fn shard(&self) -> &str {
        &self.shard
    }

    /// Returns true when the plan targets all shards.
    pub fn is_all_shards(&self) -> bool {
        self.shard.is_empty()
    }

    /// Stream key of a single-shard plan.
    pub fn single_stream(&self) -> Option<StreamKey> {
        (!self.is_all_shards()).then(|| StreamKey::new(self.effective_partition(), self.shard.clone()))
    }

    /// Consumer group name.
    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Consumer identity within the group.
    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// Consumer options.
    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Plan-level cancellation.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Resilience policy wrapping each handler chain run.
    pub fn resilience(&self) -> Arc<dyn ResiliencePolicy> {
        Arc::clone(&self.resilience)
    }

    /// Copy of this plan targeting another partition.
    #[must_use]
    pub fn with_partition(&self, partition: impl Into<String>) -> Self {
        Self { partition: partition.into(), ..self.clone() }
    }

    /// Copy of this plan with an environment prefix.
    #[must_use]
    pub fn with_environment(&self, environment: impl Into<String>) -> Self {
        let environment = environment.into();
        Self { environment: (!environment.is_empty()).then_some(environment), ..self.clone() }
    }

    /// Copy of this plan targeting one shard; empty targets all shards.
    #[must_use]
    pub fn with_shard(&self, shard: impl Into<String>) -> Self {
        Self { shard: shard.into(), ..self.clone() }
    }

    /// Copy of this plan with other options.
    #[must_use]
    pub fn with_options(&self, options: ConsumerOptions) -> Self {
        Self { options, ..self.clone() }
    }

    /// Tracing span carrying the plan's identity.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "subscription",
            partition = %self.effective_partition(),
            shard = %self.shard,
            group = %self.consumer_group,
            consumer = %self.consumer_name,
        )
    }
}

/// Builder for [`ConsumerPlan`].
#[derive(Debug)]
pub struct ConsumerPlanBuilder {
    partition: String,
    consumer_group: String,
    environment: Option<String>,
    shard: String,
    consumer_name: Option<String>,
    options: ConsumerOptions,
    cancellation: Option<CancellationToken>,
    resilience: Option<Arc<dyn ResiliencePolicy>>,
}

impl ConsumerPlanBuilder {
    /// Prefixes the partition with an environment name.
    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Restricts the plan to one shard.
    #[must_use]
    pub fn shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = shard.into();
        self
    }

    /// Sets the consumer identity; defaults to `consumer-{uuid}`.
    #[must_use]
    pub fn consumer_name(mut self, consumer_name: impl Into<String>) -> Self {
        self.consumer_name = Some(consumer_name.into());
        self
    }

    /// Sets consumer options.
    #[must_use]
    pub fn options(mut self, options: ConsumerOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the plan-level cancellation token.
    #[must_use]
    pub fn cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }

    /// Sets the resilience policy; defaults to [`NoResilience`].
    #[must_use]
    pub fn resilience(mut self, resilience: Arc<dyn ResiliencePolicy>) -> Self {
        self.resilience = Some(resilience);
        self
    }

    /// Validates and builds the plan.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an empty partition or group, a partition
    /// or shard containing `:`, or a zero batch size.
    pub fn build(self) -> Result<ConsumerPlan> {
        if self.partition.trim().is_empty() {
            return Err(ChannelError::configuration("partition cannot be empty"));
        }
        if self.consumer_group.trim().is_empty() {
            return Err(ChannelError::configuration("consumer group cannot be empty"));
        }
        if self.partition.contains(':') || self.shard.contains(':') {
            return Err(ChannelError::configuration("partition and shard cannot contain ':'"));
        }
        if self.options.batch_size == 0 {
            return Err(ChannelError::configuration("batch size must be greater than 0"));
        }

        Ok(ConsumerPlan {
            partition: self.partition,
            environment: self.environment.filter(|environment| !environment.is_empty()),
            shard: self.shard,
            consumer_group: self.consumer_group,
            consumer_name: self
                .consumer_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4())),
            options: self.options,
            cancellation: self.cancellation.unwrap_or_default(),
            resilience: self.resilience.unwrap_or_else(|| Arc::new(NoResilience)),
        })
    }
}
