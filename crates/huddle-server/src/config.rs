//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - The first TOML file found in [`CONFIG_PATHS`]
//! - Environment variables (`HUDDLE_*`, nested keys joined with `__`)

use anyhow::{bail, Context, Result};
use huddle_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

/// Files probed by [`Config::load`], in order.
pub const CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

/// Paths the HTTP router reserves for itself.
const RESERVED_PATHS: [&str; 3] = ["/", "/health", "/stats"];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent WebSocket connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Chat messages retained per room.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// Rooms whose chat history is retained; the quietest is dropped first.
    #[serde(default = "default_history_rooms")]
    pub history_rooms: usize,

    /// Events buffered per topic before slow subscribers start missing them.
    #[serde(default = "default_topic_capacity")]
    pub topic_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Advertised ping interval in milliseconds; also the sweep period.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Sessions silent for longer than this are disconnected.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
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
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws-presence".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_history_capacity() -> usize {
    huddle_core::DEFAULT_HISTORY_CAPACITY
}

fn default_history_rooms() -> usize {
    huddle_core::DEFAULT_HISTORY_ROOMS
}

fn default_topic_capacity() -> usize {
    1024
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    90_000 // 90 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            history_capacity: default_history_capacity(),
            history_rooms: default_history_rooms(),
            topic_capacity: default_topic_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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
    /// Load configuration from the first config file found, then the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the result is invalid.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        for path in &CONFIG_PATHS {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                info!("Loading configuration from {}", expanded);
                builder = builder.add_source(config::File::new(
                    expanded.as_ref(),
                    config::FileFormat::Toml,
                ));
                break;
            }
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix("HUDDLE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.limits.history_capacity == 0 {
            bail!("limits.history_capacity must be at least 1");
        }
        if self.limits.history_rooms == 0 {
            bail!("limits.history_rooms must be at least 1");
        }
        if self.limits.topic_capacity == 0 {
            bail!("limits.topic_capacity must be at least 1");
        }
        if self.limits.max_message_size == 0 {
            bail!("limits.max_message_size must be at least 1");
        }
        if self.heartbeat.interval_ms == 0 {
            bail!("heartbeat.interval_ms must be at least 1");
        }
        if self.heartbeat.timeout_ms <= self.heartbeat.interval_ms {
            bail!(
                "heartbeat.timeout_ms ({}) must exceed heartbeat.interval_ms ({})",
                self.heartbeat.timeout_ms,
                self.heartbeat.interval_ms
            );
        }
        let path = &self.transport.websocket_path;
        if !path.starts_with('/') || RESERVED_PATHS.contains(&path.as_str()) {
            bail!("transport.websocket_path {path:?} is not a usable endpoint path");
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Engine tunables derived from this configuration.
    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            history_capacity: self.limits.history_capacity,
            history_rooms: self.limits.history_rooms,
            ..EngineConfig::default()
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
        assert_eq!(config.transport.websocket_path, "/ws-presence");
        assert_eq!(config.limits.history_capacity, 200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [limits]
            max_connections = 50000
            history_capacity = 20
            history_rooms = 300

            [heartbeat]
            interval_ms = 5000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.topic_capacity, 1024);
        assert_eq!(config.heartbeat.timeout_ms, 90_000);
        assert_eq!(config.engine_config().history_capacity, 20);
        assert_eq!(config.engine_config().history_rooms, 300);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("huddle-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7000\n[transport]\nwebsocket_path = \"/live\"\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.transport.websocket_path, "/live");
    }

    #[test]
    fn test_from_missing_file() {
        assert!(Config::from_file("/definitely/not/here.toml").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let mut config = Config::default();
        config.limits.history_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.history_rooms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.heartbeat.timeout_ms = config.heartbeat.interval_ms;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.websocket_path = "/health".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transport.websocket_path = "ws".into();
        assert!(config.validate().is_err());
    }
}
