//! Gateway configuration with layered sources.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewayConfig::default()`]
//! 2. If a config file exists, deep-merge user values over defaults
//! 3. Apply `PULSE_*` environment variable overrides (highest priority)
//!
//! Deep merge rules: objects merge recursively (source overrides target
//! per-key), arrays and primitives are replaced entirely, null values in the
//! source are skipped.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid JSON, or does not match the schema.
    #[error("invalid config: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Configuration for the Pulse gateway.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Heartbeat sweep interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Remove a connection after this long without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Stale-connection cleanup sweep interval in seconds.
    pub cleanup_interval_secs: u64,
    /// Connections older than this are removed by the cleanup sweep.
    pub stale_max_age_secs: u64,
    /// Load-monitoring interval in seconds.
    pub monitor_interval_secs: u64,
    /// Warn when active connections reach this count (advisory only).
    pub warn_connection_count: usize,
    /// Warn when rolling dispatch latency exceeds this (advisory only).
    pub warn_latency_ms: f64,
    /// Token-bucket capacity per connection.
    pub rate_limit_capacity: usize,
    /// Token-bucket refill rate per connection (tokens/second).
    pub rate_limit_refill_per_sec: f64,
    /// Dispatcher queue capacity (drop-on-full).
    pub dispatch_queue_capacity: usize,
    /// Outbound writer channel capacity per connection.
    pub outbound_channel_capacity: usize,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            cleanup_interval_secs: 60,
            stale_max_age_secs: 3600,
            monitor_interval_secs: 30,
            warn_connection_count: 8_000,
            warn_latency_ms: 100.0,
            rate_limit_capacity: 200,
            rate_limit_refill_per_sec: 50.0,
            dispatch_queue_capacity: 1024,
            outbound_channel_capacity: 1024,
            max_message_size: 1024 * 1024, // 1 MB
        }
    }
}

impl GatewayConfig {
    /// Load config from a JSON file with env var overrides.
    ///
    /// A missing file yields defaults (plus env overrides); an unreadable or
    /// invalid file is an error.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default())?;

        let merged = if path.exists() {
            debug!(?path, "loading gateway config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        } else {
            debug!(?path, "config file not found, using defaults");
            defaults
        };

        let mut config: Self = serde_json::from_value(merged)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `PULSE_HOST`, `PULSE_PORT`, and `PULSE_MAX_CONNECTIONS`
    /// overrides from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PULSE_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("PULSE_PORT") {
            match port.parse() {
                Ok(port) => self.port = port,
                Err(_) => warn!(value = port, "ignoring invalid PULSE_PORT"),
            }
        }
        if let Ok(max) = std::env::var("PULSE_MAX_CONNECTIONS") {
            match max.parse() {
                Ok(max) => self.max_connections = max,
                Err(_) => warn!(value = max, "ignoring invalid PULSE_MAX_CONNECTIONS"),
            }
        }
    }

    /// Heartbeat sweep interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Cleanup sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Maximum connection age before the cleanup sweep removes it.
    pub fn stale_max_age(&self) -> Duration {
        Duration::from_secs(self.stale_max_age_secs)
    }

    /// Load-monitoring interval.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }
}

/// Recursive deep merge of two JSON values.
///
/// Objects merge recursively (source overrides target per-key); arrays and
/// primitives are replaced entirely; null values in the source are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
