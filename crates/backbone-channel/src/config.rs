//! Configuration for consumer channels and the Redis connection.

use std::{env, fmt, time::Duration};

use anyhow::{Context, Result};
use backbone_core::{
    AckBehavior, ConsumerOptions, MultiConsumerBehavior, PartialConsumerBehavior,
};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::{
    backoff::BackoffSettings,
    circuit::CircuitConfig,
    connection::ConnectionSettings,
    error::ChannelError,
    retry::{BackoffStrategy, RetryPolicy},
};

const CONFIG_FILE: &str = "backbone.toml";

const ENV_PREFIX: &str = "BACKBONE_";

/// Default environment variable holding the Redis endpoint.
pub const DEFAULT_ENDPOINT_KEY: &str = "REDIS_EVENT_SOURCE_ENDPOINT";

/// Default environment variable holding the Redis password.
pub const DEFAULT_PASSWORD_KEY: &str = "REDIS_EVENT_SOURCE_PASS";

const DEFAULT_ENDPOINT: &str = "localhost:6379";

/// Channel configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables prefixed `BACKBONE_` (highest priority)
/// 2. Configuration file (`backbone.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use backbone_channel::config::ChannelConfig;
///
/// let config = ChannelConfig::load().expect("Failed to load configuration");
/// println!("batch size {}", config.batch_size);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    // Consumption
    /// Entries claimed or read per batch.
    ///
    /// Environment variable: `BACKBONE_BATCH_SIZE`
    pub batch_size: usize,
    /// Announcements per subscription before it ends (0 = unlimited).
    ///
    /// Environment variable: `BACKBONE_MAX_MESSAGES`
    pub max_messages: u64,
    /// Commit policy.
    ///
    /// Environment variable: `BACKBONE_ACK_BEHAVIOR`
    pub ack_behavior: AckBehavior,
    /// Unhandled announcement policy.
    ///
    /// Environment variable: `BACKBONE_PARTIAL_BEHAVIOR`
    pub partial_behavior: PartialConsumerBehavior,
    /// Handler fan-out policy.
    ///
    /// Environment variable: `BACKBONE_MULTI_CONSUMER_BEHAVIOR`
    pub multi_consumer_behavior: MultiConsumerBehavior,
    /// Optional cutoff in unix seconds; the subscription drains and stops.
    ///
    /// Environment variable: `BACKBONE_FETCH_UNTIL_UNIX`
    pub fetch_until_unix: Option<i64>,
    /// Minimum idle time in milliseconds before a pending entry is claimed.
    ///
    /// Environment variable: `BACKBONE_CLAIM_MIN_IDLE_MS`
    pub claim_min_idle_ms: u64,

    // Empty-batch backoff
    /// First delay after an empty batch in milliseconds.
    ///
    /// Environment variable: `BACKBONE_MIN_BACKOFF_MS`
    pub min_backoff_ms: u64,
    /// Ceiling of the empty-batch delay in milliseconds.
    ///
    /// Environment variable: `BACKBONE_MAX_BACKOFF_MS`
    pub max_backoff_ms: u64,

    // Connection
    /// Upper bound on waiting for a concurrent reconnect in milliseconds.
    ///
    /// Environment variable: `BACKBONE_RECONNECT_LOCK_TIMEOUT_MS`
    pub reconnect_lock_timeout_ms: u64,
    /// Minimum time between connection resets in milliseconds.
    ///
    /// Environment variable: `BACKBONE_RECONNECT_COOL_DOWN_MS`
    pub reconnect_cool_down_ms: u64,
    /// Grace period before a replaced connection is closed in milliseconds.
    ///
    /// Environment variable: `BACKBONE_CLOSE_GRACE_MS`
    pub close_grace_ms: u64,
    /// Per-command response timeout in milliseconds.
    ///
    /// Environment variable: `BACKBONE_RESPONSE_TIMEOUT_MS`
    pub response_timeout_ms: u64,
    /// Environment variable naming the Redis endpoint.
    ///
    /// Environment variable: `BACKBONE_ENDPOINT_ENV_KEY`
    pub endpoint_env_key: String,
    /// Environment variable naming the Redis password.
    ///
    /// Environment variable: `BACKBONE_PASSWORD_ENV_KEY`
    pub password_env_key: String,

    // Retry
    /// Maximum handler attempts per announcement.
    ///
    /// Environment variable: `BACKBONE_RETRY_MAX_ATTEMPTS`
    pub retry_max_attempts: u32,
    /// Base retry delay in milliseconds.
    ///
    /// Environment variable: `BACKBONE_RETRY_BASE_DELAY_MS`
    pub retry_base_delay_ms: u64,
    /// Maximum retry delay in milliseconds.
    ///
    /// Environment variable: `BACKBONE_RETRY_MAX_DELAY_MS`
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `BACKBONE_RETRY_JITTER_FACTOR`
    pub retry_jitter_factor: f64,

    // Circuit breaker
    /// Consecutive failures that open the circuit.
    ///
    /// Environment variable: `BACKBONE_CIRCUIT_FAILURE_THRESHOLD`
    pub circuit_failure_threshold: u32,
    /// Consecutive successes that close a half-open circuit.
    ///
    /// Environment variable: `BACKBONE_CIRCUIT_SUCCESS_THRESHOLD`
    pub circuit_success_threshold: u32,
    /// Time in milliseconds before an open circuit probes again.
    ///
    /// Environment variable: `BACKBONE_CIRCUIT_OPEN_TIMEOUT_MS`
    pub circuit_open_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        let options = ConsumerOptions::default();
        let connection = ConnectionSettings::default();
        let backoff = BackoffSettings::default();
        Self {
            batch_size: options.batch_size,
            max_messages: options.max_messages,
            ack_behavior: options.ack_behavior,
            partial_behavior: options.partial_behavior,
            multi_consumer_behavior: options.multi_consumer_behavior,
            fetch_until_unix: None,
            claim_min_idle_ms: 0,
            min_backoff_ms: millis(backoff.min_delay),
            max_backoff_ms: millis(backoff.max_delay),
            reconnect_lock_timeout_ms: millis(connection.lock_timeout),
            reconnect_cool_down_ms: millis(connection.cool_down),
            close_grace_ms: millis(connection.close_grace),
            response_timeout_ms: 5_000,
            endpoint_env_key: DEFAULT_ENDPOINT_KEY.to_string(),
            password_env_key: DEFAULT_PASSWORD_KEY.to_string(),
            retry_max_attempts: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            retry_jitter_factor: 0.1,
            circuit_failure_threshold: 5,
            circuit_success_threshold: 2,
            circuit_open_timeout_ms: 30_000,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl ChannelConfig {
    /// Loads configuration from defaults, `backbone.toml`, and `BACKBONE_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(CONFIG_FILE))
                .merge(Env::prefixed(ENV_PREFIX)),
        )
    }

    /// Extracts and validates configuration from a prepared figment.
    ///
    /// # Errors
    ///
    /// Returns an error when extraction or validation fails.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().context("Failed to load channel configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Converts to consumer options.
    pub fn to_consumer_options(&self) -> ConsumerOptions {
        let options = ConsumerOptions {
            batch_size: self.batch_size,
            max_messages: self.max_messages,
            ack_behavior: self.ack_behavior,
            partial_behavior: self.partial_behavior,
            multi_consumer_behavior: self.multi_consumer_behavior,
            fetch_until: None,
            claim_min_idle: Duration::from_millis(self.claim_min_idle_ms),
            keep_alive: false,
        };
        match self.fetch_until_unix {
            Some(seconds) => options.fetch_until_unix(seconds),
            None => options,
        }
    }

    /// Converts to empty-batch backoff settings.
    pub fn to_backoff_settings(&self) -> BackoffSettings {
        BackoffSettings {
            min_delay: Duration::from_millis(self.min_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
        }
    }

    /// Converts to connection settings.
    pub fn to_connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            lock_timeout: Duration::from_millis(self.reconnect_lock_timeout_ms),
            cool_down: Duration::from_millis(self.reconnect_cool_down_ms),
            close_grace: Duration::from_millis(self.close_grace_ms),
        }
    }

    /// Converts to a handler retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter_factor,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Converts to circuit breaker configuration.
    ///
    /// Rate-based tripping and the half-open probe budget are fixed.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            min_requests_for_rate: 10,
            failure_rate_threshold: 0.5,
            open_timeout: Duration::from_millis(self.circuit_open_timeout_ms),
            success_threshold: self.circuit_success_threshold,
            half_open_max_requests: 2,
        }
    }

    /// Per-command response timeout.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Resolves Redis credentials from the configured environment keys.
    pub fn credentials(&self) -> RedisCredentials {
        RedisCredentials::from_env_keys(&self.endpoint_env_key, &self.password_env_key)
    }

    /// Validates configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be greater than 0");
        }

        if self.min_backoff_ms == 0 {
            anyhow::bail!("min_backoff_ms must be greater than 0");
        }

        if self.min_backoff_ms > self.max_backoff_ms {
            anyhow::bail!("min_backoff_ms cannot exceed max_backoff_ms");
        }

        if self.retry_max_attempts == 0 {
            anyhow::bail!("retry_max_attempts must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.circuit_failure_threshold == 0 {
            anyhow::bail!("circuit_failure_threshold must be greater than 0");
        }

        if self.endpoint_env_key.is_empty() || self.password_env_key.is_empty() {
            anyhow::bail!("credential environment keys cannot be empty");
        }

        Ok(())
    }
}

/// Redis endpoint and password resolved from the environment.
#[derive(Clone, PartialEq, Eq)]
pub struct RedisCredentials {
    endpoint: String,
    password: Option<String>,
}

impl RedisCredentials {
    /// Creates credentials from explicit values.
    pub fn new(endpoint: impl Into<String>, password: Option<String>) -> Self {
        Self { endpoint: endpoint.into(), password }
    }

    /// Reads `REDIS_EVENT_SOURCE_ENDPOINT` and `REDIS_EVENT_SOURCE_PASS`.
    pub fn from_env() -> Self {
        Self::from_env_keys(DEFAULT_ENDPOINT_KEY, DEFAULT_PASSWORD_KEY)
    }

    /// Reads the endpoint and password from the named variables.
    ///
    /// A missing endpoint falls back to `localhost:6379`; a missing or empty
    /// password means no authentication.
    pub fn from_env_keys(endpoint_key: &str, password_key: &str) -> Self {
        let endpoint = env::var(endpoint_key)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let password = env::var(password_key).ok().filter(|value| !value.is_empty());
        Self { endpoint, password }
    }

    /// Endpoint as `host[:port]`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Password, when one is set.
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Splits the endpoint into host and port, defaulting the port to 6379.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the port is not a number.
    pub fn host_and_port(&self) -> std::result::Result<(String, u16), ChannelError> {
        let endpoint = self.endpoint.trim();
        match endpoint.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().map_err(|_| {
                    ChannelError::configuration(format!("invalid port in endpoint {endpoint:?}"))
                })?;
                Ok((host.to_string(), port))
            },
            None => Ok((endpoint.to_string(), 6379)),
        }
    }
}

impl fmt::Debug for RedisCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCredentials")
            .field("endpoint", &self.endpoint)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct TestEnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        originals: HashMap<String, Option<String>>,
    }

    impl TestEnvGuard {
        fn new() -> Self {
            let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            Self { _lock: lock, originals: HashMap::new() }
        }

        fn set_var(&mut self, key: &str, value: &str) {
            self.originals.entry(key.to_string()).or_insert_with(|| env::var(key).ok());
            env::set_var(key, value);
        }

        fn remove_var(&mut self, key: &str) {
            self.originals.entry(key.to_string()).or_insert_with(|| env::var(key).ok());
            env::remove_var(key);
        }
    }

    impl Drop for TestEnvGuard {
        fn drop(&mut self) {
            for (key, original) in &self.originals {
                match original {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn default_config_snapshot() {
        let config = ChannelConfig::default();

        assert!(config.validate().is_ok());

        insta::assert_yaml_snapshot!("default_channel_config", serde_yaml::to_value(&config).unwrap());
    }

    #[test]
    fn env_overrides_apply() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("BACKBONE_BATCH_SIZE", "25");
        guard.set_var("BACKBONE_MAX_MESSAGES", "100");
        guard.set_var("BACKBONE_ACK_BEHAVIOR", "on_finally");
        guard.set_var("BACKBONE_MULTI_CONSUMER_BEHAVIOR", "all");
        guard.set_var("BACKBONE_FETCH_UNTIL_UNIX", "1700000000");

        let config = ChannelConfig::load().expect("config should load with env overrides");
        let options = config.to_consumer_options();

        assert_eq!(options.batch_size, 25);
        assert_eq!(options.max_messages, 100);
        assert_eq!(options.ack_behavior, AckBehavior::OnFinally);
        assert_eq!(options.multi_consumer_behavior, MultiConsumerBehavior::All);
        assert_eq!(options.fetch_until.map(|cutoff| cutoff.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn conversions_snapshot() {
        let config = ChannelConfig::default();

        let connection = config.to_connection_settings();
        let backoff = config.to_backoff_settings();
        let retry = config.to_retry_policy();
        let circuit = config.to_circuit_config();

        let conversions = serde_json::json!({
            "backoff": {
                "max_ms": backoff.max_delay.as_millis(),
                "min_ms": backoff.min_delay.as_millis(),
            },
            "circuit": {
                "failure_threshold": circuit.failure_threshold,
                "open_timeout_ms": circuit.open_timeout.as_millis(),
                "success_threshold": circuit.success_threshold,
            },
            "connection": {
                "close_grace_ms": connection.close_grace.as_millis(),
                "cool_down_ms": connection.cool_down.as_millis(),
                "lock_timeout_ms": connection.lock_timeout.as_millis(),
            },
            "retry": {
                "base_delay_ms": retry.base_delay.as_millis(),
                "max_attempts": retry.max_attempts,
                "max_delay_ms": retry.max_delay.as_millis(),
            }
        });

        insta::assert_json_snapshot!("channel_config_conversions", conversions);
    }

    #[test]
    fn invalid_config_validation_fails() {
        let mut config = ChannelConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        config = ChannelConfig::default();
        config.min_backoff_ms = 10_000;
        assert!(config.validate().is_err());

        config = ChannelConfig::default();
        config.retry_jitter_factor = 1.5;
        assert!(config.validate().is_err());

        config = ChannelConfig::default();
        config.endpoint_env_key = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn credentials_resolve_from_named_keys() {
        let mut guard = TestEnvGuard::new();
        guard.set_var("TEST_BACKBONE_ENDPOINT", "redis.internal:6380");
        guard.set_var("TEST_BACKBONE_PASS", "hunter2");

        let credentials = RedisCredentials::from_env_keys("TEST_BACKBONE_ENDPOINT", "TEST_BACKBONE_PASS");

        assert_eq!(credentials.endpoint(), "redis.internal:6380");
        assert_eq!(credentials.password(), Some("hunter2"));
        assert_eq!(credentials.host_and_port().unwrap(), ("redis.internal".to_string(), 6380));
        assert!(!format!("{credentials:?}").contains("hunter2"));
    }

    #[test]
    fn credentials_default_to_localhost() {
        let mut guard = TestEnvGuard::new();
        guard.remove_var(DEFAULT_ENDPOINT_KEY);
        guard.remove_var(DEFAULT_PASSWORD_KEY);

        let credentials = RedisCredentials::from_env();

        assert_eq!(credentials.host_and_port().unwrap(), ("localhost".to_string(), 6379));
        assert!(credentials.password().is_none());
    }

    #[test]
    fn malformed_port_is_rejected() {
        let credentials = RedisCredentials::new("localhost:redis", None);
        assert!(credentials.host_and_port().is_err());
    }
}
