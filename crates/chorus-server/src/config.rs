//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file (`chorus.toml` in the working directory, `/etc/chorus/` or
//!   `~/.config/chorus/`, or an explicit `--config` path)
//! - Environment variables (`CHORUS__PORT`, `CHORUS__HEARTBEAT__TIMEOUT_MS`, ...)

use anyhow::{Context, Result};
use chorus_core::{DeliveryConfig, HubConfig, NotificationConfig, RetryPolicy, TransportConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Files searched, in order, when no explicit path is given.
const CONFIG_PATHS: [&str; 3] = [
    "chorus.toml",
    "/etc/chorus/chorus.toml",
    "~/.config/chorus/chorus.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Realtime transport configuration.
    #[serde(default)]
    pub transport: TransportSettings,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Message rules.
    #[serde(default)]
    pub messaging: DeliveryConfig,

    /// Notification grouping and fan-out.
    #[serde(default)]
    pub notifications: NotificationConfig,

    /// Write-conflict retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Realtime transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Events buffered per connection before new ones are dropped.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    /// Maximum rooms per connection.
    #[serde(default = "default_max_rooms")]
    pub max_rooms_per_connection: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds. Also the sweep period.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connections silent for longer than this are dropped.
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

fn default_outbound_buffer() -> usize {
    256
}

fn default_max_rooms() -> usize {
    100
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportSettings::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            messaging: DeliveryConfig::default(),
            notifications: NotificationConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            outbound_buffer: default_outbound_buffer(),
            max_rooms_per_connection: default_max_rooms(),
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

impl HeartbeatConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load the first config file found on the search path, layered under
    /// `CHORUS__*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            tracing::debug!(path = %path, "Loading config file");
            builder = builder.add_source(::config::File::with_name(path).required(true));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix("CHORUS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .context("Invalid configuration")
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
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    /// Configuration of the messaging core.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            transport: TransportConfig {
                max_rooms_per_connection: self.transport.max_rooms_per_connection,
                outbound_buffer: self.transport.outbound_buffer,
                auto_delete_empty_rooms: true,
            },
            delivery: self.messaging.clone(),
            notifications: self.notifications.clone(),
            retry: self.retry.clone(),
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
        assert_eq!(config.messaging.delete_window_secs, 900);
        assert_eq!(config.notifications.fanout_batch_size, 500);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

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

            [messaging]
            max_content_len = 2000

            [notifications]
            fanout_batch_size = 250

            [retry]
            max_attempts = 8
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.messaging.max_content_len, 2000);
        assert_eq!(config.messaging.delete_window_secs, 900);

        let hub = config.hub_config();
        assert_eq!(hub.notifications.fanout_batch_size, 250);
        assert_eq!(hub.retry.max_attempts, 8);
        assert_eq!(hub.transport.max_rooms_per_connection, 100);
    }
}
