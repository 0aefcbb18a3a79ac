//! Configuration surface for connections, services and local caches.
//!
//! Plain serde structs with per-field defaults so partial TOML documents work;
//! `from_toml_str` is the single parsing entry point.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};

/// Parse any of the config structs from a TOML snippet.
pub fn from_toml_str<T: DeserializeOwned>(toml: &str) -> Result<T> {
    serdeconv::from_toml_str(toml).map_err(|err| Error::Config(err.to_string()))
}

/// Options governing one physical connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Interval between ping requests on channel 0. Zero disables pings.
    pub ping_interval_millis: u64,
    /// How long an unanswered ping may stay outstanding before the connection
    /// is failed. Zero means "same as the ping interval".
    pub ping_timeout_millis: u64,
    /// Pending-channel count above which each additional entry is logged as a
    /// warning. The map itself is never capped.
    pub max_pending_channels: usize,
    /// Budget for flushing the close notification. Negative means unbounded.
    pub close_notify_timeout_millis: i64,
    /// Deadline for the open handshake to complete.
    pub handshake_timeout_millis: u64,
    /// Edition tag announced in the open handshake.
    pub edition: String,
    /// Identity token presented to the peer during the open handshake.
    pub identity_token: Option<String>,
}

impl ConnectionConfig {
    /// Effective ping timeout after applying the "same as interval" default.
    #[inline]
    pub fn effective_ping_timeout(&self) -> u64 {
        if self.ping_timeout_millis == 0 {
            self.ping_interval_millis
        } else {
            self.ping_timeout_millis
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            ping_interval_millis: 0,
            ping_timeout_millis: 0,
            max_pending_channels: 100,
            close_notify_timeout_millis: -1,
            handshake_timeout_millis: 30_000,
            edition: "CE".to_string(),
            identity_token: None,
        }
    }
}

/// Options governing a service runtime and its event dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Default deadline applied to requests awaited with `timeout = 0`.
    /// Zero means no deadline.
    pub request_timeout_millis: u64,
    /// A command running longer than this on the service thread is logged as
    /// hung. Zero disables the check.
    pub task_hung_threshold_millis: u64,
    /// Name of the serializer negotiated for new channels.
    pub serializer_name: String,
    /// Dispatcher queue length beyond which posting threads are throttled.
    pub clogged_count: usize,
    /// Pause applied to a throttled posting thread.
    pub clogged_delay_millis: u64,
    /// Upper bound on how long the service thread sleeps between transport
    /// polls when no commands or timers are due.
    pub poll_interval_millis: u64,
}

impl Default for ServiceConfig {
    fn default() -> ServiceConfig {
        ServiceConfig {
            request_timeout_millis: 0,
            task_hung_threshold_millis: 0,
            serializer_name: "bincode".to_string(),
            clogged_count: 1024,
            clogged_delay_millis: 32,
            poll_interval_millis: 10,
        }
    }
}

/// Options governing a local cache instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum total unit cost. Zero means unlimited.
    pub high_units: u64,
    /// Fraction of `high_units` that a prune pass reduces the cache to.
    pub prune_level: f64,
    /// Default entry expiry. Zero means entries never expire by default.
    pub expiry_millis: u64,
    /// One of "hybrid", "lru", "lfu", "external".
    pub eviction_policy: String,
    /// One of "fixed", "binary", "external".
    pub unit_calculator: String,
}

impl CacheConfig {
    /// `low_units = floor(high_units * prune_level)`.
    #[inline]
    pub fn low_units(&self) -> u64 {
        (self.high_units as f64 * self.prune_level).floor() as u64
    }
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig {
            high_units: 0,
            prune_level: 0.75,
            expiry_millis: 0,
            eviction_policy: "hybrid".to_string(),
            unit_calculator: "fixed".to_string(),
        }
    }
}
