//! Server configuration.
//!
//! Every component reads its knobs from one section of [`ServerConfig`].
//! All sections implement `Default` with production values, and the whole
//! tree (de)serializes from JSON with durations expressed in milliseconds.
//!
//! # Example
//!
//! ```ignore
//! use browser_mcp_server::config::ServerConfig;
//!
//! let mut config = ServerConfig::from_json_str(r#"{ "cache": { "maxEntries": 500 } }"#)?;
//! config.protocol.request_timeout = Duration::from_secs(60);
//! config.validate()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Duration (de)serialization
// ============================================================================

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

/// Root configuration for the server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server identity reported in `initialize`.
    pub server: ServerInfoConfig,
    /// Protocol engine settings.
    pub protocol: ProtocolConfig,
    /// Transport settings.
    pub transport: TransportConfig,
    /// Resource pool settings.
    pub pool: PoolConfig,
    /// Response cache settings.
    pub cache: CacheConfig,
    /// Session-state cache settings.
    pub session_cache: SessionCacheConfig,
    /// Event system settings.
    pub events: EventConfig,
    /// Per-connection rate limiting.
    pub rate_limit: RateLimitConfig,
}

impl ServerConfig {
    /// Parses a configuration from a JSON string.
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] on malformed input and [`Error::Config`] if the
    /// parsed values fail validation.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read, otherwise as
    /// [`ServerConfig::from_json_str`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Checks that every budget and interval is usable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        fn non_zero_duration(value: Duration, field: &str) -> Result<()> {
            if value.is_zero() {
                return Err(Error::config(format!("{field} must be greater than zero")));
            }
            Ok(())
        }

        fn non_zero(value: usize, field: &str) -> Result<()> {
            if value == 0 {
                return Err(Error::config(format!("{field} must be greater than zero")));
            }
            Ok(())
        }

        non_zero_duration(self.protocol.request_timeout, "protocol.requestTimeout")?;
        non_zero(self.protocol.max_in_flight, "protocol.maxInFlight")?;
        non_zero_duration(self.pool.health_check_interval, "pool.healthCheckInterval")?;
        non_zero_duration(self.pool.sweep_interval, "pool.sweepInterval")?;
        non_zero(self.cache.max_bytes, "cache.maxBytes")?;
        non_zero(self.cache.max_entries, "cache.maxEntries")?;
        non_zero_duration(self.cache.default_ttl, "cache.defaultTtl")?;
        non_zero_duration(self.cache.cleanup_interval, "cache.cleanupInterval")?;
        non_zero(self.session_cache.max_memory_entries, "sessionCache.maxMemoryEntries")?;
        non_zero_duration(self.session_cache.cleanup_interval, "sessionCache.cleanupInterval")?;
        non_zero(self.events.max_history, "events.maxHistory")?;
        non_zero(self.transport.max_message_bytes, "transport.maxMessageBytes")?;
        non_zero(self.transport.replay_buffer, "transport.replayBuffer")?;
        non_zero_duration(self.transport.ping_interval, "transport.pingInterval")?;
        non_zero_duration(self.transport.pong_timeout, "transport.pongTimeout")?;

        if self.rate_limit.enabled && self.rate_limit.per_minute > self.rate_limit.per_hour {
            return Err(Error::config(
                "rateLimit.perMinute must not exceed rateLimit.perHour",
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Section: Server identity
// ============================================================================

/// Identity reported to clients in the `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerInfoConfig {
    /// Server name.
    pub name: String,
    /// Server version.
    pub version: String,
}

impl Default for ServerInfoConfig {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

// ============================================================================
// Section: Protocol
// ============================================================================

/// Protocol engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// Window after which a pending request times out.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// Maximum number of concurrently tracked requests.
    pub max_in_flight: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(300),
            max_in_flight: 1_000,
        }
    }
}

// ============================================================================
// Section: Transport
// ============================================================================

/// Transport settings shared by all transport implementations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransportConfig {
    /// Bind address for the WebSocket transport.
    pub websocket_addr: SocketAddr,
    /// Bind address for the SSE/HTTP transport.
    pub http_addr: SocketAddr,
    /// Largest accepted inbound message.
    pub max_message_bytes: usize,
    /// Interval between server pings on bidirectional sockets.
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,
    /// Time a client has to answer a ping before being dropped.
    #[serde(with = "duration_ms")]
    pub pong_timeout: Duration,
    /// Interval between keep-alive comments on push streams.
    #[serde(with = "duration_ms")]
    pub keep_alive_interval: Duration,
    /// Time a single-shot POST waits for its response.
    #[serde(with = "duration_ms")]
    pub post_response_timeout: Duration,
    /// Number of recent outbound messages kept for replay.
    pub replay_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        Self {
            websocket_addr: SocketAddr::new(localhost, 8765),
            http_addr: SocketAddr::new(localhost, 8766),
            max_message_bytes: 10 * 1024 * 1024,
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            keep_alive_interval: Duration::from_secs(15),
            post_response_timeout: Duration::from_secs(300),
            replay_buffer: 100,
        }
    }
}

// ============================================================================
// Section: Resource pool
// ============================================================================

/// Resource pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum number of top-level resources.
    pub max_top: usize,
    /// Maximum number of sub-contexts per top-level resource.
    pub max_mid_per_top: usize,
    /// Maximum number of leaves per sub-context.
    pub max_leaf_per_mid: usize,
    /// Interval of the per-resource liveness check.
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
    /// Interval of the pool-wide disconnection sweep.
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Reuse an existing sub-context when the request carries no options.
    pub reuse_empty_contexts: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_top: 5,
            max_mid_per_top: 10,
            max_leaf_per_mid: 20,
            health_check_interval: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            reuse_empty_contexts: false,
        }
    }
}

// ============================================================================
// Section: Response cache
// ============================================================================

/// Response cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Whether tool results are cached at all.
    pub enabled: bool,
    /// Byte budget across all entries.
    pub max_bytes: usize,
    /// Entry count budget.
    pub max_entries: usize,
    /// TTL used when a caller passes none.
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,
    /// Interval of the expired-entry sweep.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_bytes: 50 * 1024 * 1024,
            max_entries: 1_000,
            default_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Section: Session-state cache
// ============================================================================

/// Session-state cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionCacheConfig {
    /// Directory for durable copies and backups; `None` keeps state in memory only.
    pub storage_dir: Option<PathBuf>,
    /// Maximum non-persistent entries kept in memory.
    pub max_memory_entries: usize,
    /// Age after which non-persistent entries are swept.
    #[serde(with = "duration_ms")]
    pub max_age: Duration,
    /// Interval of the age sweep.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for SessionCacheConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            max_memory_entries: 100,
            max_age: Duration::from_secs(24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }
}

// ============================================================================
// Section: Events
// ============================================================================

/// Event system settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EventConfig {
    /// History retention cap.
    pub max_history: usize,
    /// Optional age limit for history records.
    #[serde(default, with = "optional_duration_ms")]
    pub max_age: Option<Duration>,
    /// Interval of the age-based pruning task.
    #[serde(with = "duration_ms")]
    pub prune_interval: Duration,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_history: 10_000,
            max_age: None,
            prune_interval: Duration::from_secs(300),
        }
    }
}

mod optional_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}

// ============================================================================
// Section: Rate limiting
// ============================================================================

/// Sliding-window rate limits applied per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Whether limits are enforced.
    pub enabled: bool,
    /// Requests allowed in any 60-second window.
    pub per_minute: usize,
    /// Requests allowed in any 3600-second window.
    pub per_hour: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_minute: 120,
            per_hour: 3_000,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol.request_timeout, Duration::from_secs(300));
        assert_eq!(config.pool.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.pool.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.events.max_history, 10_000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = ServerConfig::from_json_str(
            r#"{ "cache": { "maxEntries": 5, "defaultTtl": 1500 }, "pool": { "reuseEmptyContexts": true } }"#,
        )
        .expect("parse");

        assert_eq!(config.cache.max_entries, 5);
        assert_eq!(config.cache.default_ttl, Duration::from_millis(1500));
        assert_eq!(config.cache.max_bytes, CacheConfig::default().max_bytes);
        assert!(config.pool.reuse_empty_contexts);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let err = ServerConfig::from_json_str(r#"{ "cache": { "maxBytes": 0 } }"#)
            .expect_err("zero budget must fail");
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("cache.maxBytes"));
    }

    #[test]
    fn test_rate_limit_ordering_rejected() {
        let mut config = ServerConfig::default();
        config.rate_limit.per_minute = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let mut config = ServerConfig::default();
        config.protocol.request_timeout = Duration::MAX;
        config.events.max_age = Some(Duration::MAX);

        let value = serde_json::to_value(&config).expect("serialize");
        assert_eq!(value["protocol"]["requestTimeout"], serde_json::json!(u64::MAX));
        assert_eq!(value["events"]["maxAge"], serde_json::json!(u64::MAX));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{ "events": { "maxHistory": 42, "maxAge": 1000 } }"#)
            .expect("write");

        let config = ServerConfig::from_json_file(&path).expect("load");
        assert_eq!(config.events.max_history, 42);
        assert_eq!(config.events.max_age, Some(Duration::from_secs(1)));
    }
}
