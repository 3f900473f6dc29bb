//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - TOML configuration file (`relay.toml`, `/etc/relay/relay.toml`,
//!   `~/.config/relay/relay.toml`)
//! - Environment variables (`RELAY__PORT`, `RELAY__BROKER__URL`, ...)

use anyhow::{bail, Context, Result};
use relay_core::GatewayConfig;
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

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Broker configuration.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum chats a single connection may belong to.
    #[serde(default = "default_max_chats")]
    pub max_chats_per_connection: usize,
}

/// Which broker backs the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Redis pub/sub, for multi-instance deployments.
    Redis,
    /// In-process bus. Single instance only.
    Memory,
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Broker backend.
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,

    /// Redis URL.
    #[serde(default = "default_broker_url")]
    pub url: String,

    /// Publish timeout in milliseconds.
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_ms: u64,

    /// Connect and subscribe timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
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
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_chats() -> usize {
    relay_core::membership::DEFAULT_MAX_CHATS_PER_CONNECTION
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Redis
}

fn default_broker_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_publish_timeout() -> u64 {
    5_000
}

fn default_connect_timeout() -> u64 {
    10_000
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
            broker: BrokerConfig::default(),
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
            max_chats_per_connection: default_max_chats(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            url: default_broker_url(),
            publish_timeout_ms: default_publish_timeout(),
            connect_timeout_ms: default_connect_timeout(),
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

impl BrokerConfig {
    /// Get the connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default file locations and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        // Files are added lowest priority first.
        let mut builder = ::config::Config::builder();
        for path in config_paths.iter().rev() {
            let expanded = shellexpand::tilde(path);
            builder = builder.add_source(
                ::config::File::with_name(expanded.as_ref())
                    .format(::config::FileFormat::Toml)
                    .required(false),
            );
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix("RELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;

        config.validate()?;
        Ok(config)
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

        config.validate()?;
        Ok(config)
    }

    /// Check values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        if self.limits.max_chats_per_connection == 0 {
            bail!("limits.max_chats_per_connection must be positive");
        }
        if self.broker.publish_timeout_ms == 0 || self.broker.connect_timeout_ms == 0 {
            bail!("broker timeouts must be positive");
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
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Get the gateway settings derived from this configuration.
    #[must_use]
    pub fn gateway(&self) -> GatewayConfig {
        GatewayConfig {
            publish_timeout: Duration::from_millis(self.broker.publish_timeout_ms),
            subscribe_timeout: self.broker.connect_timeout(),
            max_chats_per_connection: self.limits.max_chats_per_connection,
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
        assert_eq!(config.transport.websocket_path, "/ws");
        assert_eq!(config.broker.kind, BrokerKind::Redis);
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

            [broker]
            kind = "memory"
            publish_timeout_ms = 250
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.limits.max_message_size, 64 * 1024);
        assert_eq!(config.broker.kind, BrokerKind::Memory);

        let gateway = config.gateway();
        assert_eq!(gateway.publish_timeout, Duration::from_millis(250));
        assert_eq!(gateway.subscribe_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.transport.websocket_path = "ws".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.limits.max_chats_per_connection = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(Config::from_file("/nonexistent/relay.toml").is_err());
    }
}
