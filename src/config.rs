//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SESSION_CHANNEL_URL`
//! 2. **Config file**: path via `--config <path>`, or `session-channel.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [connection]
//! url = "http://localhost:8000"
//! path = "/socket.io"
//! reconnection = true
//! reconnection_attempts = 5
//! reconnection_delay_ms = 1000
//! reconnection_delay_max_ms = 5000
//! connect_timeout_ms = 20000
//!
//! [store]
//! output_buffer_size = 1000
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "session-channel.toml";

/// Environment variable overriding `connection.url`.
pub const URL_ENV: &str = "SESSION_CHANNEL_URL";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport endpoint and reconnection policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// HTTP(S) base URL of the API server (default `http://localhost:8000`).
    #[serde(default = "default_url")]
    pub url: String,
    /// Socket.IO mount path (default `/socket.io`).
    #[serde(default = "default_path")]
    pub path: String,
    /// Reconnect automatically after a drop (default true).
    #[serde(default = "default_reconnection")]
    pub reconnection: bool,
    /// Reconnect attempts before giving up (default 5).
    #[serde(default = "default_reconnection_attempts")]
    pub reconnection_attempts: u32,
    /// Delay before the first reconnect attempt in milliseconds (default 1000).
    #[serde(default = "default_reconnection_delay_ms")]
    pub reconnection_delay_ms: u64,
    /// Upper bound for the doubling reconnect delay (default 5000).
    #[serde(default = "default_reconnection_delay_max_ms")]
    pub reconnection_delay_max_ms: u64,
    /// Budget for one open sequence (WebSocket + Engine.IO + namespace connect), default 20 000.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// Output store limits.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Maximum output records kept per session (default 1000).
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_url() -> String {
    "http://localhost:8000".to_string()
}
fn default_path() -> String {
    "/socket.io".to_string()
}
fn default_reconnection() -> bool {
    true
}
fn default_reconnection_attempts() -> u32 {
    5
}
fn default_reconnection_delay_ms() -> u64 {
    1000
}
fn default_reconnection_delay_max_ms() -> u64 {
    5000
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_output_buffer_size() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            path: default_path(),
            reconnection: default_reconnection(),
            reconnection_attempts: default_reconnection_attempts(),
            reconnection_delay_ms: default_reconnection_delay_ms(),
            reconnection_delay_max_ms: default_reconnection_delay_max_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            output_buffer_size: default_output_buffer_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ConnectionConfig {
    /// Config pointing at `url` with every other field defaulted.
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Delay before reconnect attempt number `attempt` (1-based): the base delay
    /// doubled per attempt, capped at `reconnection_delay_max_ms`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .reconnection_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.reconnection_delay_max_ms.max(self.reconnection_delay_ms));
        Duration::from_millis(ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `session-channel.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = if let Some(p) = path {
            Self::from_file(p)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(DEFAULT_CONFIG_FILE)?
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(url) = std::env::var(URL_ENV) {
            if !url.is_empty() {
                config.connection.url = url;
            }
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse a TOML document, defaulting everything it leaves out.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
