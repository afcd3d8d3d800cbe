//! Sync configuration.
//!
//! The dashboard shell owns the config file; this module parses the
//! `sync` section out of the already-loaded JSON value and validates the
//! connection parameters the core cares about.
//!
//! ```json5
//! {
//!   sync: {
//!     url: "wss://api.example.com/sync",
//!     role: "admin",
//!     autoReconnect: true,
//!     reconnectIntervalMs: 1000,
//!     maxRetries: 5,
//!   }
//! }
//! ```

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Base interval between reconnect attempts in milliseconds.
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 1_000;

/// Maximum consecutive connection attempts before settling in `Failed`.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// How long to wait for the auth handshake response.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// How long to wait for a server acknowledgment to an emitted event.
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;

/// Ceiling for the exponential backoff.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Role announced after every successful connect.
pub const DEFAULT_ROLE: &str = "admin";

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid sync URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("unsupported URL scheme {scheme} (expected ws or wss)")]
    UnsupportedScheme { scheme: String },

    #[error("sync URL is empty")]
    EmptyUrl,
}

/// Connection parameters for the sync core.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint, e.g. `wss://api.example.com/sync`.
    pub url: String,
    /// Role announced after each successful connect.
    pub role: String,
    /// Whether to reconnect automatically after an unexpected drop.
    pub auto_reconnect: bool,
    /// Base interval between reconnect attempts in milliseconds.
    pub reconnect_interval_ms: u64,
    /// Maximum consecutive attempts before giving up.
    pub max_retries: u32,
    /// Auth handshake response timeout in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Emit acknowledgment timeout in milliseconds.
    pub ack_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            role: DEFAULT_ROLE.to_string(),
            auto_reconnect: true,
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    /// Config with defaults for the given endpoint.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Validate the endpoint URL and scheme.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::EmptyUrl);
        }

        let url = url::Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            message: e.to_string(),
        })?;

        match url.scheme() {
            "ws" | "wss" => Ok(()),
            other => Err(ConfigError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    /// Backoff delay before attempt `attempt` (zero-based), doubling from
    /// the base interval and capped at [`MAX_BACKOFF_MS`].
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let ms = self
            .reconnect_interval_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(6)))
            .min(MAX_BACKOFF_MS);
        Duration::from_millis(ms)
    }
}

/// Parse sync configuration from the dashboard's JSON config value.
///
/// Config path: `sync`. Missing keys fall back to defaults; a missing
/// `sync` section yields the default config (empty URL, which fails
/// validation at connect time).
pub fn build_sync_config(cfg: &Value) -> SyncConfig {
    let sync = match cfg.get("sync").and_then(|v| v.as_object()) {
        Some(obj) => obj,
        None => return SyncConfig::default(),
    };

    let url = sync
        .get("url")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let role = sync
        .get("role")
        .and_then(|v| v.as_str())
        .unwrap_or(DEFAULT_ROLE)
        .to_string();

    let auto_reconnect = sync
        .get("autoReconnect")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let reconnect_interval_ms = sync
        .get("reconnectIntervalMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_RECONNECT_INTERVAL_MS);

    let max_retries = sync
        .get("maxRetries")
        .and_then(|v| v.as_u64())
        .map(|v| v as u32)
        .unwrap_or(DEFAULT_MAX_RETRIES);

    let handshake_timeout_ms = sync
        .get("handshakeTimeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_MS);

    let ack_timeout_ms = sync
        .get("ackTimeoutMs")
        .and_then(|v| v.as_u64())
        .unwrap_or(DEFAULT_ACK_TIMEOUT_MS);

    SyncConfig {
        url,
        role,
        auto_reconnect,
        reconnect_interval_ms,
        max_retries,
        handshake_timeout_ms,
        ack_timeout_ms,
    }
}
