//! Configuration for the relay.
//!
//! Configuration is passed to [`Relay::new()`](crate::Relay::new) and can be
//! constructed programmatically or deserialized from JSON. The `wal-relay`
//! binary loads an optional JSON file and then applies command-line overrides.
//!
//! # Configuration Structure
//!
//! ```text
//! RelayConfig
//! ├── namespace: String            # WAL namespace to replicate
//! ├── upstream: UpstreamConfig     # Redis Streams upstream
//! ├── replica: ReplicaConfig       # Local SQLite replica
//! └── settings: RelaySettings      # Lag threshold, retries, timers
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "namespace": "demo",
//!   "upstream": { "redis_url": "redis://upstream:6379", "block_timeout": "5s" },
//!   "replica": { "data_dir": "/var/lib/wal-relay" },
//!   "settings": { "segment_lag_threshold": 10, "apply_max_attempts": 3 }
//! }
//! ```
//!
//! Durations are strings in `humantime` format (`"250ms"`, `"5s"`, `"2m"`).

use crate::error::{RelayError, Result};
use crate::offset::Offset;
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `Relay::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// WAL namespace to subscribe to. Also names the local replica file.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub replica: ReplicaConfig,

    #[serde(default)]
    pub settings: RelaySettings,
}

fn default_namespace() -> String {
    "demo".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            upstream: UpstreamConfig::default(),
            replica: ReplicaConfig::default(),
            settings: RelaySettings::default(),
        }
    }
}

impl RelayConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            upstream: UpstreamConfig::for_testing("redis://127.0.0.1:6379"),
            replica: ReplicaConfig::default(),
            settings: RelaySettings::for_testing(),
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| RelayError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(RelayError::Config("namespace must not be empty".to_string()));
        }
        if self.upstream.batch_size == 0 {
            return Err(RelayError::Config("upstream.batch_size must be at least 1".to_string()));
        }
        if self.settings.apply_max_attempts == 0 {
            return Err(RelayError::Config("settings.apply_max_attempts must be at least 1".to_string()));
        }
        if self.settings.startup_max_attempts == 0 {
            return Err(RelayError::Config("settings.startup_max_attempts must be at least 1".to_string()));
        }

        let durations = [
            ("upstream.block_timeout", &self.upstream.block_timeout),
            ("upstream.connection_timeout", &self.upstream.connection_timeout),
            ("settings.subscribe_timeout", &self.settings.subscribe_timeout),
            ("settings.reconnect_initial_delay", &self.settings.reconnect_initial_delay),
            ("settings.reconnect_max_delay", &self.settings.reconnect_max_delay),
            ("settings.apply_retry_delay", &self.settings.apply_retry_delay),
            ("settings.liveness_interval", &self.settings.liveness_interval),
            ("settings.drain_timeout", &self.settings.drain_timeout),
        ];
        for (name, value) in durations {
            humantime::parse_duration(value)
                .map_err(|e| RelayError::Config(format!("{} = {:?}: {}", name, value, e)))?;
        }
        if self.settings.liveness_interval_duration().is_zero() {
            return Err(RelayError::Config("settings.liveness_interval must be non-zero".to_string()));
        }
        if self.settings.subscribe_timeout_duration().is_zero() {
            return Err(RelayError::Config("settings.subscribe_timeout must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Parse a humantime duration, falling back to `default` when malformed.
fn parse_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

// ═══════════════════════════════════════════════════════════════════════════════
// UpstreamConfig: where the WAL comes from
// ═══════════════════════════════════════════════════════════════════════════════

/// Redis Streams upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prepended to `{namespace}:wal` to form the stream key.
    #[serde(default)]
    pub key_prefix: String,

    /// XREAD block timeout. Bounds how long one read waits for new entries.
    #[serde(default = "default_block_timeout")]
    pub block_timeout: String,

    /// Maximum entries per XREAD, i.e. maximum records per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timeout for establishing the Redis connection.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: String,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_block_timeout() -> String {
    "5s".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_connection_timeout() -> String {
    "5s".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            key_prefix: String::new(),
            block_timeout: default_block_timeout(),
            batch_size: default_batch_size(),
            connection_timeout: default_connection_timeout(),
        }
    }
}

impl UpstreamConfig {
    /// Short timeouts for tests.
    pub fn for_testing(redis_url: &str) -> Self {
        Self {
            redis_url: redis_url.to_string(),
            key_prefix: String::new(),
            block_timeout: "100ms".to_string(),
            batch_size: 10,
            connection_timeout: "500ms".to_string(),
        }
    }

    pub fn block_timeout_duration(&self) -> Duration {
        parse_or(&self.block_timeout, Duration::from_secs(5))
    }

    pub fn connection_timeout_duration(&self) -> Duration {
        parse_or(&self.connection_timeout, Duration::from_secs(5))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicaConfig: local storage
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Directory holding `{namespace}.db`. Created on startup if missing.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/tmp/wal-relay")
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RelaySettings: lag, retries, timers
// ═══════════════════════════════════════════════════════════════════════════════

/// Tunables for the relay loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Degraded when the replica is more than this many segments behind.
    #[serde(default = "default_segment_lag_threshold")]
    pub segment_lag_threshold: u64,

    /// Start position for a replica that has never applied anything.
    /// Ignored once the sink reports an offset.
    #[serde(default)]
    pub initial_offset: Option<Offset>,

    /// Timeout for one subscribe attempt.
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout: String,

    /// Subscribe attempts before the first successful session. Exhausting
    /// this is fatal; reconnects after that retry forever.
    #[serde(default = "default_startup_max_attempts")]
    pub startup_max_attempts: usize,

    #[serde(default = "default_reconnect_initial_delay")]
    pub reconnect_initial_delay: String,

    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay: String,

    /// Apply attempts per batch before the relay gives up.
    #[serde(default = "default_apply_max_attempts")]
    pub apply_max_attempts: usize,

    #[serde(default = "default_apply_retry_delay")]
    pub apply_retry_delay: String,

    /// Period of the liveness offset report.
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval: String,

    /// How long the binary waits for the relay to drain after a signal.
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout: String,
}

fn default_segment_lag_threshold() -> u64 {
    10
}

fn default_subscribe_timeout() -> String {
    "10s".to_string()
}

fn default_startup_max_attempts() -> usize {
    20
}

fn default_reconnect_initial_delay() -> String {
    "1s".to_string()
}

fn default_reconnect_max_delay() -> String {
    "300s".to_string()
}

fn default_apply_max_attempts() -> usize {
    3
}

fn default_apply_retry_delay() -> String {
    "100ms".to_string()
}

fn default_liveness_interval() -> String {
    "30s".to_string()
}

fn default_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            segment_lag_threshold: default_segment_lag_threshold(),
            initial_offset: None,
            subscribe_timeout: default_subscribe_timeout(),
            startup_max_attempts: default_startup_max_attempts(),
            reconnect_initial_delay: default_reconnect_initial_delay(),
            reconnect_max_delay: default_reconnect_max_delay(),
            apply_max_attempts: default_apply_max_attempts(),
            apply_retry_delay: default_apply_retry_delay(),
            liveness_interval: default_liveness_interval(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl RelaySettings {
    /// Millisecond-scale timers so tests run fast.
    pub fn for_testing() -> Self {
        Self {
            segment_lag_threshold: default_segment_lag_threshold(),
            initial_offset: None,
            subscribe_timeout: "500ms".to_string(),
            startup_max_attempts: 3,
            reconnect_initial_delay: "10ms".to_string(),
            reconnect_max_delay: "100ms".to_string(),
            apply_max_attempts: 3,
            apply_retry_delay: "10ms".to_string(),
            liveness_interval: "50ms".to_string(),
            drain_timeout: "1s".to_string(),
        }
    }

    pub fn subscribe_timeout_duration(&self) -> Duration {
        parse_or(&self.subscribe_timeout, Duration::from_secs(10))
    }

    pub fn liveness_interval_duration(&self) -> Duration {
        parse_or(&self.liveness_interval, Duration::from_secs(30))
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        parse_or(&self.drain_timeout, Duration::from_secs(10))
    }

    /// Schedule for subscribe attempts before the first session.
    pub fn startup_retry(&self) -> RetryConfig {
        let reconnect = self.reconnect_retry();
        RetryConfig {
            max_attempts: self.startup_max_attempts,
            initial_delay: reconnect.initial_delay,
            max_delay: reconnect.max_delay.min(RetryConfig::startup().max_delay),
            attempt_timeout: reconnect.attempt_timeout,
            ..RetryConfig::startup()
        }
    }

    /// Schedule for reconnects once a session has been established.
    pub fn reconnect_retry(&self) -> RetryConfig {
        let daemon = RetryConfig::daemon();
        RetryConfig {
            initial_delay: parse_or(&self.reconnect_initial_delay, daemon.initial_delay),
            max_delay: parse_or(&self.reconnect_max_delay, daemon.max_delay),
            attempt_timeout: self.subscribe_timeout_duration(),
            ..daemon
        }
    }

    /// Schedule for re-applying a rejected batch.
    pub fn apply_retry(&self) -> RetryConfig {
        RetryConfig::apply(
            self.apply_max_attempts,
            parse_or(&self.apply_retry_delay, Duration::from_millis(100)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.namespace, "demo");
        assert_eq!(config.upstream.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.upstream.batch_size, 100);
        assert_eq!(config.replica.data_dir, PathBuf::from("/tmp/wal-relay"));
        assert_eq!(config.settings.segment_lag_threshold, 10);
        assert_eq!(config.settings.apply_max_attempts, 3);
        assert_eq!(config.settings.liveness_interval_duration(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: RelayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.namespace, "demo");
        assert_eq!(config.upstream.block_timeout, "5s");
        assert_eq!(config.settings.initial_offset, None);
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "namespace": "orders",
            "upstream": { "redis_url": "redis://up:6379", "key_prefix": "prod:" },
            "settings": { "segment_lag_threshold": 4, "initial_offset": { "segment_id": 2, "offset": 9 } }
        }"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.namespace, "orders");
        assert_eq!(config.upstream.key_prefix, "prod:");
        assert_eq!(config.upstream.batch_size, 100);
        assert_eq!(config.settings.segment_lag_threshold, 4);
        assert_eq!(config.settings.initial_offset, Some(Offset::new(2, 9)));
        assert_eq!(config.settings.apply_max_attempts, 3);
    }

    #[test]
    fn test_duration_parsing() {
        let test_cases = [
            ("5s", Duration::from_secs(5)),
            ("100ms", Duration::from_millis(100)),
            ("1m", Duration::from_secs(60)),
            ("1s 500ms", Duration::from_millis(1500)),
        ];
        for (input, expected) in test_cases {
            let config = UpstreamConfig {
                block_timeout: input.to_string(),
                ..Default::default()
            };
            assert_eq!(config.block_timeout_duration(), expected, "Failed for input: {}", input);
        }
    }

    #[test]
    fn test_invalid_duration_falls_back_but_fails_validation() {
        let mut config = RelayConfig::default();
        config.upstream.block_timeout = "invalid".to_string();
        assert_eq!(config.upstream.block_timeout_duration(), Duration::from_secs(5));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("upstream.block_timeout"));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.namespace = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.upstream.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.settings.apply_max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.settings.liveness_interval = "0s".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_subscribe_timeout() {
        let mut config = RelayConfig::for_testing("zero-timeout");
        config.settings.subscribe_timeout = "0s".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("subscribe_timeout"));

        config.settings.subscribe_timeout = "1ms".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_schedules() {
        let settings = RelaySettings::default();

        let startup = settings.startup_retry();
        assert_eq!(startup.max_attempts, 20);
        assert_eq!(startup.initial_delay, Duration::from_secs(1));
        assert_eq!(startup.max_delay, Duration::from_secs(30));
        assert_eq!(startup.attempt_timeout, Duration::from_secs(10));

        let reconnect = settings.reconnect_retry();
        assert_eq!(reconnect.max_attempts, usize::MAX);
        assert_eq!(reconnect.max_delay, Duration::from_secs(300));
        assert_eq!(reconnect.attempt_timeout, Duration::from_secs(10));

        let apply = settings.apply_retry();
        assert_eq!(apply.max_attempts, 3);
        assert_eq!(apply.initial_delay, Duration::from_millis(100));
    }

    #[test]
    fn test_for_testing_is_fast() {
        let config = RelayConfig::for_testing("t");
        assert!(config.validate().is_ok());
        assert!(config.settings.reconnect_retry().initial_delay <= Duration::from_millis(10));
        assert_eq!(config.settings.startup_retry().max_attempts, 3);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{"namespace":"from-file"}"#).unwrap();
        let config = RelayConfig::from_file(&path).unwrap();
        assert_eq!(config.namespace, "from-file");

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(RelayConfig::from_file(&path), Err(RelayError::Config(_))));

        assert!(matches!(
            RelayConfig::from_file(dir.path().join("missing.json")),
            Err(RelayError::Io(_))
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let config = RelayConfig::for_testing("roundtrip");
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RelayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.namespace, "roundtrip");
        assert_eq!(parsed.settings.apply_retry_delay, "10ms");
    }
}
