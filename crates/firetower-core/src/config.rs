//! Configuration types for the Firetower gateway.
//!
//! Configuration is loaded from YAML files and validated before use. Besides
//! the typed sections, [`GatewayConfig::get`] answers dotted string keys for
//! components that only need a single scalar.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::transport::BackoffPolicy;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Cluster identifier mixed into generated ids (0..=1023).
    #[serde(default)]
    pub cluster_id: u16,

    /// Client-facing TCP listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Upstream topic service connection configuration.
    pub topic_service: TopicServiceConfig,

    /// Fanout bucket configuration.
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Hot-topic sharding configuration.
    #[serde(default)]
    pub sharding: ShardingConfig,

    /// Prometheus metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client-facing TCP listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// Address to bind to, e.g., "0.0.0.0:9001".
    #[serde(default = "default_listen_address")]
    pub address: String,

    /// Maximum number of concurrent client connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Upstream topic service configuration.
///
/// Addresses support environment variable expansion: "${TOPIC_SERVICE_ADDR}".
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TopicServiceConfig {
    /// Address of the framed TCP topic service.
    pub address: String,

    /// Address of the management RPC endpoint.
    pub grpc_address: String,

    /// Dial timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// How long `send` waits for room in the outbound queue.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Capacity of both the outbound and the inbound queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Read buffer size for the receive loop.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Declared body lengths above this are treated as garbage.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Reconnect backoff.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Reconnect backoff bounds in milliseconds.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_initial_ms")]
    pub initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub max_ms: u64,
}

/// Fanout bucket configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BucketConfig {
    /// Outbound queue depth of each client session.
    #[serde(default = "default_session_queue_capacity")]
    pub session_queue_capacity: usize,

    /// Interval between stale-entry sweeps. 0 disables the sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Hot-topic sharding configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShardingConfig {
    /// Topics whose subscribers are spread over `shard_count` sub-topics.
    #[serde(default)]
    pub hot_topics: Vec<String>,

    /// Number of shards per hot topic.
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
}

/// Prometheus metrics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether to enable the metrics endpoint.
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    /// Address for the metrics HTTP server.
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output logs in JSON format (for production).
    #[serde(default)]
    pub json: bool,
}

/// Expand environment variables in a string.
///
/// Replaces `${VAR_NAME}` with the value of the environment variable `VAR_NAME`.
/// If the variable is not set, replaces with an empty string.
fn expand_env_vars(s: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex");
    re.replace_all(s, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .to_string()
}

fn validate_address(addr: &str) -> ConfigResult<()> {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(ConfigError::InvalidAddress(addr.to_string())),
    }
}

// Default value functions

fn default_listen_address() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_send_timeout_ms() -> u64 {
    3_000
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_session_queue_capacity() -> usize {
    256
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_shard_count() -> u32 {
    100
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

// Default implementations

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            address: default_listen_address(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_backoff_initial_ms(),
            max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            session_queue_capacity: default_session_queue_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            hot_topics: Vec::new(),
            shard_count: default_shard_count(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl TopicServiceConfig {
    /// Config pointing at the given addresses with every other field defaulted.
    #[must_use]
    pub fn new(address: impl Into<String>, grpc_address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            grpc_address: grpc_address.into(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            read_buffer_size: default_read_buffer_size(),
            max_frame_size: default_max_frame_size(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Topic service address with environment variables expanded.
    #[must_use]
    pub fn address(&self) -> String {
        expand_env_vars(&self.address)
    }

    /// Management RPC address with environment variables expanded.
    #[must_use]
    pub fn grpc_address(&self) -> String {
        expand_env_vars(&self.grpc_address)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Backoff policy used for both the management dial and the transport.
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.backoff.initial_ms),
            max: Duration::from_millis(self.backoff.max_ms),
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        validate_address(&self.address())?;
        validate_address(&self.grpc_address())?;

        if self.queue_capacity == 0 {
            return Err(ConfigError::InvalidCapacity {
                name: "topic_service.queue_capacity",
            });
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::InvalidCapacity {
                name: "topic_service.read_buffer_size",
            });
        }
        if self.backoff.initial_ms == 0 || self.backoff.initial_ms > self.backoff.max_ms {
            return Err(ConfigError::InvalidBackoff {
                initial_ms: self.backoff.initial_ms,
                max_ms: self.backoff.max_ms,
            });
        }
        Ok(())
    }
}

// Configuration loading and validation

impl GatewayConfig {
    /// Config with the given upstream addresses and defaults everywhere else.
    #[must_use]
    pub fn new(topic_service: TopicServiceConfig) -> Self {
        Self {
            cluster_id: 0,
            listen: ListenConfig::default(),
            topic_service,
            bucket: BucketConfig::default(),
            sharding: ShardingConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if
    /// validation fails.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            source: e,
        })?;

        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if parsing or validation fails.
    pub fn from_str(content: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation check fails.
    pub fn validate(&self) -> ConfigResult<()> {
        validate_address(&self.listen.address)?;
        self.topic_service.validate()?;

        if self.sharding.shard_count == 0 {
            return Err(ConfigError::InvalidShardCount(self.sharding.shard_count));
        }
        if self.bucket.session_queue_capacity == 0 {
            return Err(ConfigError::InvalidCapacity {
                name: "bucket.session_queue_capacity",
            });
        }
        Ok(())
    }

    /// String-keyed lookup of scalar settings.
    ///
    /// Accepts dotted section paths (`topic_service.address`) and the short
    /// aliases `grpc.address`, `topicServiceAddr` and `bucket.shards`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "grpc.address" | "topic_service.grpc_address" => self.topic_service.grpc_address(),
            "topicServiceAddr" | "topic_service.address" => self.topic_service.address(),
            "bucket.shards" | "sharding.shard_count" => self.sharding.shard_count.to_string(),
            "sharding.hot_topics" => self.sharding.hot_topics.join(","),
            "cluster_id" => self.cluster_id.to_string(),
            "listen.address" => self.listen.address.clone(),
            "listen.max_connections" => self.listen.max_connections.to_string(),
            "topic_service.send_timeout_ms" => self.topic_service.send_timeout_ms.to_string(),
            "topic_service.queue_capacity" => self.topic_service.queue_capacity.to_string(),
            "bucket.session_queue_capacity" => self.bucket.session_queue_capacity.to_string(),
            "metrics.address" => self.metrics.address.clone(),
            "logging.level" => self.logging.level.clone(),
            _ => return None,
        };
        Some(value)
    }
}
