//! Configuration management for Turnstile.
//!
//! Values are resolved once at startup, in increasing priority: built-in
//! defaults, an optional YAML file, `TURNSTILE_*` environment variables and
//! finally the flat legacy variables (`RATE_LIMIT_IP`, `REDIS_HOST`, ...).
//! Nothing here is re-read after the engine has been constructed.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::LimiterSettings;

/// Flat environment variables accepted for compatibility with existing
/// deployments, mapped onto their nested configuration keys.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("RATE_LIMIT_IP", "limits.ip_per_second"),
    ("RATE_LIMIT_TOKEN", "limits.token_per_second"),
    ("BLOCK_DURATION", "limits.block_duration_secs"),
    ("REDIS_HOST", "storage.redis.host"),
    ("REDIS_PORT", "storage.redis.port"),
    ("REDIS_PASSWORD", "storage.redis.password"),
    ("REDIS_DB", "storage.redis.db"),
];

/// Longest accepted block: 30 days.
pub const MAX_BLOCK_DURATION_SECS: u64 = 30 * 24 * 60 * 60;

/// Longest accepted per-call storage deadline.
pub const MAX_OPERATION_TIMEOUT_MS: u64 = 60_000;

/// Longest accepted pause between in-memory sweeps: one day.
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Request limits and block policy
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Storage backend configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Request limits and block policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Requests allowed per address per one-second window
    #[serde(default = "default_ip_per_second")]
    pub ip_per_second: u64,

    /// Requests allowed per token per one-second window
    #[serde(default = "default_token_per_second")]
    pub token_per_second: u64,

    /// How long a key stays blocked once it exceeds its limit
    #[serde(default = "default_block_duration_secs")]
    pub block_duration_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ip_per_second: default_ip_per_second(),
            token_per_second: default_token_per_second(),
            block_duration_secs: default_block_duration_secs(),
        }
    }
}

fn default_ip_per_second() -> u64 {
    5
}

fn default_token_per_second() -> u64 {
    10
}

fn default_block_duration_secs() -> u64 {
    300
}

/// Which storage gateway implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Shared Redis instance; required when running more than one replica
    Redis,
    /// Process-local map; counters are not shared between replicas
    Memory,
}

impl std::str::FromStr for StorageBackend {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "redis" => Ok(StorageBackend::Redis),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(TurnstileError::Config(format!(
                "unknown storage backend '{}'",
                other
            ))),
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,

    /// Deadline for every individual storage call, in milliseconds
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Interval between expired-entry sweeps of the memory backend
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Redis connection parameters
    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            operation_timeout_ms: default_operation_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
            redis: RedisConfig::default(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Redis
}

fn default_operation_timeout_ms() -> u64 {
    500
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Redis connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    /// Password for `AUTH`; unset means no authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Logical database index
    #[serde(default)]
    pub db: i64,

    /// Upper bound for establishing the initial connection
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = TurnstileError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(TurnstileError::Config(format!(
                "unknown log format '{}'",
                other
            ))),
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl TurnstileConfig {
    /// Resolve configuration from an optional YAML file and the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix("TURNSTILE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        for (key, value) in legacy_overrides(|name| std::env::var(name).ok()) {
            builder = builder.set_override(key, value)?;
        }

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine or the backends cannot operate with.
    pub fn validate(&self) -> Result<()> {
        check_range(
            "limits.block_duration_secs",
            self.limits.block_duration_secs,
            MAX_BLOCK_DURATION_SECS,
        )?;
        check_range(
            "storage.operation_timeout_ms",
            self.storage.operation_timeout_ms,
            MAX_OPERATION_TIMEOUT_MS,
        )?;
        check_range(
            "storage.sweep_interval_secs",
            self.storage.sweep_interval_secs,
            MAX_SWEEP_INTERVAL_SECS,
        )
    }

    /// Typed construction parameters for the decision engine.
    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            address_limit: self.limits.ip_per_second,
            token_limit: self.limits.token_per_second,
            block_duration: Duration::from_secs(self.limits.block_duration_secs),
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.storage.operation_timeout_ms)
    }
}

fn check_range(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 || value > max {
        return Err(TurnstileError::Config(format!(
            "{} must be between 1 and {}, got {}",
            name, max, value
        )));
    }
    Ok(())
}

/// Collect the legacy variables that are set to a non-empty value.
fn legacy_overrides<F>(lookup: F) -> Vec<(&'static str, String)>
where
    F: Fn(&str) -> Option<String>,
{
    LEGACY_ENV
        .iter()
        .filter_map(|(name, key)| {
            lookup(name)
                .filter(|value| !value.is_empty())
                .map(|value| (*key, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();

        assert_eq!(config.server.listen_addr, SocketAddr::from(([0, 0, 0, 0], 8080)));
        assert_eq!(config.limits.ip_per_second, 5);
        assert_eq!(config.limits.token_per_second, 10);
        assert_eq!(config.limits.block_duration_secs, 300);
        assert_eq!(config.storage.backend, StorageBackend::Redis);
        assert_eq!(config.storage.redis.port, 6379);
        assert!(config.storage.redis.password.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial_document() {
        let yaml = r#"
limits:
  ip_per_second: 20
  block_duration_secs: 60
storage:
  backend: memory
logging:
  format: json
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limits.ip_per_second, 20);
        assert_eq!(config.limits.token_per_second, 10);
        assert_eq!(config.limits.block_duration_secs, 60);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.storage.redis.host, "127.0.0.1");
    }

    #[test]
    fn test_from_yaml_rejects_zero_block_duration() {
        let yaml = "limits:\n  block_duration_secs: 0\n";
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_from_yaml_rejects_out_of_range_values() {
        for yaml in [
            "limits:\n  block_duration_secs: 18446744073709551615\n",
            "limits:\n  block_duration_secs: 2592001\n",
            "storage:\n  operation_timeout_ms: 60001\n",
            "storage:\n  sweep_interval_secs: 0\n",
            "storage:\n  sweep_interval_secs: 86401\n",
        ] {
            let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
            assert!(matches!(err, TurnstileError::Config(_)), "{}", yaml);
        }

        let yaml = "limits:\n  block_duration_secs: 2592000\nstorage:\n  operation_timeout_ms: 60000\n";
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limits.block_duration_secs, MAX_BLOCK_DURATION_SECS);
    }

    #[test]
    fn test_from_yaml_rejects_unknown_backend() {
        let yaml = "storage:\n  backend: memcached\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_limiter_settings() {
        let mut config = TurnstileConfig::default();
        config.limits.ip_per_second = 3;
        config.limits.token_per_second = 7;
        config.limits.block_duration_secs = 45;

        let settings = config.limiter_settings();
        assert_eq!(settings.address_limit, 3);
        assert_eq!(settings.token_limit, 7);
        assert_eq!(settings.block_duration, Duration::from_secs(45));
    }

    #[test]
    fn test_legacy_overrides_skip_unset_and_empty() {
        let env: HashMap<&str, &str> = [
            ("RATE_LIMIT_IP", "12"),
            ("REDIS_HOST", "cache.internal"),
            ("REDIS_PASSWORD", ""),
        ]
        .into_iter()
        .collect();

        let overrides = legacy_overrides(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(
            overrides,
            vec![
                ("limits.ip_per_second", "12".to_string()),
                ("storage.redis.host", "cache.internal".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_backend_and_format() {
        assert_eq!("Memory".parse::<StorageBackend>().unwrap(), StorageBackend::Memory);
        assert_eq!("redis".parse::<StorageBackend>().unwrap(), StorageBackend::Redis);
        assert!("disk".parse::<StorageBackend>().is_err());
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }
}
