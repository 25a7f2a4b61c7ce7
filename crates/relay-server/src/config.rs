//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket endpoint configuration.
    #[serde(default)]
    pub websocket: WebSocketConfig,

    /// Engine tuning passed through to the node.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Default per-channel behavior.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// WebSocket endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub path: String,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum outbound queue size per connection in bytes.
    #[serde(default = "default_queue_max_size")]
    pub client_queue_max_size: usize,

    /// Maximum channels per connection, 0 for unlimited.
    #[serde(default = "default_channel_limit")]
    pub client_channel_limit: usize,

    /// Maximum connections per user ID, 0 for unlimited.
    #[serde(default)]
    pub user_connection_limit: usize,

    /// Ping interval suggested to clients, in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Stream metadata retention in seconds.
    #[serde(default = "default_history_meta_ttl")]
    pub history_meta_ttl_s: u64,
}

/// Default per-channel behavior applied by the built-in hooks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelsConfig {
    /// Retained publications per channel, 0 disables history.
    #[serde(default = "default_history_size")]
    pub history_size: usize,

    /// Publication payload retention in seconds.
    #[serde(default = "default_history_ttl")]
    pub history_ttl_s: u64,

    /// Enable recovery on subscribe.
    #[serde(default = "default_true")]
    pub recovery: bool,

    /// Maintain presence for subscribed clients.
    #[serde(default = "default_true")]
    pub presence: bool,

    /// Emit and deliver join/leave events.
    #[serde(default)]
    pub join_leave: bool,

    /// Allow clients to publish into channels.
    #[serde(default = "default_true")]
    pub allow_publish: bool,

    /// Accept connections without a token, mapped to an anonymous user.
    #[serde(default)]
    pub allow_anonymous: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RELAY_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/connection/websocket".to_string()
}

fn default_queue_max_size() -> usize {
    1024 * 1024
}

fn default_channel_limit() -> usize {
    128
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_history_meta_ttl() -> u64 {
    30 * 24 * 3600
}

fn default_history_size() -> usize {
    0
}

fn default_history_ttl() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket: WebSocketConfig::default(),
            engine: EngineConfig::default(),
            channels: ChannelsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: default_ws_path(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            client_queue_max_size: default_queue_max_size(),
            client_channel_limit: default_channel_limit(),
            user_connection_limit: 0,
            ping_interval_ms: default_ping_interval(),
            history_meta_ttl_s: default_history_meta_ttl(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            history_ttl_s: default_history_ttl(),
            recovery: true,
            presence: true,
            join_leave: false,
            allow_publish: true,
            allow_anonymous: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Build the engine configuration for the node.
    #[must_use]
    pub fn engine_config(&self) -> relay_core::Config {
        relay_core::Config {
            version: env!("CARGO_PKG_VERSION").to_string(),
            client_queue_max_size: self.engine.client_queue_max_size,
            client_channel_limit: self.engine.client_channel_limit,
            user_connection_limit: self.engine.user_connection_limit,
            ping_interval: Duration::from_millis(self.engine.ping_interval_ms),
            history_meta_ttl: Duration::from_secs(self.engine.history_meta_ttl_s),
            ..relay_core::Config::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.websocket.path, "/connection/websocket");
        assert!(config.channels.recovery);
        assert!(!config.channels.join_leave);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [engine]
            client_channel_limit = 16

            [channels]
            history_size = 100
            history_ttl_s = 300
            join_leave = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.engine.client_channel_limit, 16);
        assert_eq!(config.channels.history_size, 100);
        assert!(config.channels.join_leave);
    }

    #[test]
    fn test_engine_config_mapping() {
        let mut config = Config::default();
        config.engine.ping_interval_ms = 10_000;
        config.engine.user_connection_limit = 2;

        let engine = config.engine_config();
        assert_eq!(engine.ping_interval, Duration::from_secs(10));
        assert_eq!(engine.user_connection_limit, 2);
        assert_eq!(engine.client_channel_limit, 128);
    }
}
