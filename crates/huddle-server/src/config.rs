//! Server configuration.
//!
//! Configuration is layered, later sources overriding earlier ones:
//! - Built-in defaults
//! - TOML configuration file
//! - Environment variables (`HUDDLE_*`, `__` between nested keys)
//! - Command line arguments

use anyhow::{Context, Result};
use huddle_core::{RegistryConfig, RouterConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files tried in order when no explicit path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "huddle.toml",
    "/etc/huddle/huddle.toml",
    "~/.config/huddle/huddle.toml",
];

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "HUDDLE";

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

    /// Fan-out behaviour.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Group creation policy.
    #[serde(default)]
    pub groups: GroupsConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix of the WebSocket endpoint; the group id follows it.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of groups.
    #[serde(default = "default_max_groups")]
    pub max_groups: usize,

    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Messages buffered per connection before senders start waiting.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

/// Delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Per-recipient send timeout in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Prefix forwarded text with the group id.
    #[serde(default)]
    pub prefix_group_id: bool,

    /// Upper bound on one WebSocket write in milliseconds. A client that
    /// stays unwritable for longer is disconnected.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Group policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupsConfig {
    /// Create groups on first join.
    #[serde(default = "default_true")]
    pub auto_create: bool,

    /// Groups created at startup.
    #[serde(default)]
    pub preset: Vec<String>,
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

fn default_max_groups() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_send_timeout() -> u64 {
    1_000
}

fn default_write_timeout() -> u64 {
    5_000
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
            delivery: DeliveryConfig::default(),
            groups: GroupsConfig::default(),
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
            max_groups: default_max_groups(),
            max_message_size: default_max_message_size(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout(),
            prefix_group_id: false,
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            auto_create: true,
            preset: Vec::new(),
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
    /// Load configuration from a file (explicit or the first default found),
    /// then apply `HUDDLE_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, or if any source
    /// cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_default_file(),
        };

        let mut builder = config::Config::builder();
        if let Some(file) = &file {
            tracing::debug!("Loading config file {}", file.display());
            builder = builder.add_source(config::File::from(file.as_path()).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")
    }

    /// Load configuration from a specific TOML file.
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

    fn find_default_file() -> Option<PathBuf> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
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

    /// Route template for the WebSocket endpoint.
    #[must_use]
    pub fn websocket_route(&self) -> String {
        format!(
            "{}/:group_id",
            self.transport.websocket_path.trim_end_matches('/')
        )
    }

    /// Registry settings derived from this configuration.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            auto_create_groups: self.groups.auto_create,
            max_groups: self.limits.max_groups,
        }
    }

    /// Router settings derived from this configuration.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            send_timeout: Duration::from_millis(self.delivery.send_timeout_ms),
            prefix_group_id: self.delivery.prefix_group_id,
        }
    }

    /// Session settings derived from this configuration.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            outbox_capacity: self.limits.outbox_capacity,
            write_timeout: Duration::from_millis(self.delivery.write_timeout_ms),
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
        assert!(config.groups.auto_create);
        assert!(!config.delivery.prefix_group_id);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [delivery]
            send_timeout_ms = 250
            prefix_group_id = true

            [groups]
            auto_create = false
            preset = ["crops", "weather"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.limits.outbox_capacity, 256);
        assert_eq!(config.session_config().write_timeout, Duration::from_secs(5));
        assert_eq!(config.router_config().send_timeout, Duration::from_millis(250));
        assert!(config.router_config().prefix_group_id);
        assert!(!config.registry_config().auto_create_groups);
        assert_eq!(config.groups.preset, vec!["crops", "weather"]);
    }

    #[test]
    fn test_load_explicit_file() {
        let path = std::env::temp_dir().join(format!("huddle-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "port = 7001\n[limits]\noutbox_capacity = 8\n[delivery]\nwrite_timeout_ms = 750\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        let from_file = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7001);
        assert_eq!(config.session_config().outbox_capacity, 8);
        assert_eq!(
            config.session_config().write_timeout,
            Duration::from_millis(750)
        );
        assert_eq!(from_file.port, 7001);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = std::env::temp_dir().join("huddle-definitely-missing.toml");
        assert!(Config::load(Some(&path)).is_err());
        assert!(Config::from_file(&path).is_err());
    }

    #[test]
    fn test_websocket_route() {
        let mut config = Config::default();
        assert_eq!(config.websocket_route(), "/ws/:group_id");

        config.transport.websocket_path = "/relay/".to_string();
        assert_eq!(config.websocket_route(), "/relay/:group_id");
    }
}
