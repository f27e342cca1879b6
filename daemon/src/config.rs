//! Daemon configuration

use anyhow::Result;
use imserver_protocol::{MAX_USER_ID_LEN, WELCOME_TEXT};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Registry behaviour
    #[serde(default)]
    pub registry: RegistryConfig,

    /// HTTP push endpoint
    #[serde(default)]
    pub push: PushConfig,

    /// Management API
    #[serde(default)]
    pub management: ManagementConfig,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl DaemonConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load and merge configuration from file (incremental update)
    pub async fn load_merge(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let other = Self::load(path).await?;
        self.merge(other);
        Ok(())
    }

    /// Merge another config into this one (incremental)
    ///
    /// Rules:
    /// - Scalar values: overwrite if the new value differs from default
    /// - Booleans: overwrite if they differ from their default
    pub fn merge(&mut self, other: DaemonConfig) {
        // Server config
        if other.server.bind != default_bind() {
            self.server.bind = other.server.bind;
        }
        if other.server.endpoint_prefix != default_endpoint_prefix() {
            self.server.endpoint_prefix = other.server.endpoint_prefix;
        }
        if other.server.max_connections != default_max_connections() {
            self.server.max_connections = other.server.max_connections;
        }
        if other.server.max_user_id_len != default_max_user_id_len() {
            self.server.max_user_id_len = other.server.max_user_id_len;
        }
        if other.server.welcome_text != default_welcome_text() {
            self.server.welcome_text = other.server.welcome_text;
        }

        // Registry config
        if other.registry.count_replacements {
            self.registry.count_replacements = true;
        }

        // Push config
        if !other.push.enabled {
            self.push.enabled = false;
        }
        if other.push.path != default_push_path() {
            self.push.path = other.push.path;
        }
        if other.push.always_ack {
            self.push.always_ack = true;
        }
        if other.push.max_body_bytes != default_push_max_body_bytes() {
            self.push.max_body_bytes = other.push.max_body_bytes;
        }

        // Management
        if !other.management.enabled {
            self.management.enabled = false;
        }
        if other.management.bind != default_management_bind() {
            self.management.bind = other.management.bind;
        }

        // Monitoring
        if !other.monitoring.prometheus_enabled {
            self.monitoring.prometheus_enabled = false;
        }
        if other.monitoring.prometheus_bind != default_prometheus_bind() {
            self.monitoring.prometheus_bind = other.monitoring.prometheus_bind;
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// Path prefix of the WebSocket endpoint (`{prefix}/{userId}`)
    #[serde(default = "default_endpoint_prefix")]
    pub endpoint_prefix: String,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum user id length in bytes
    #[serde(default = "default_max_user_id_len")]
    pub max_user_id_len: usize,

    /// Text sent to a connection once it is registered
    #[serde(default = "default_welcome_text")]
    pub welcome_text: String,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_endpoint_prefix() -> String {
    "/imserver".to_string()
}

fn default_max_connections() -> usize {
    10000
}

fn default_max_user_id_len() -> usize {
    MAX_USER_ID_LEN
}

fn default_welcome_text() -> String {
    WELCOME_TEXT.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            endpoint_prefix: default_endpoint_prefix(),
            max_connections: default_max_connections(),
            max_user_id_len: default_max_user_id_len(),
            welcome_text: default_welcome_text(),
        }
    }
}

/// Registry configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    /// Count a reconnect under an already-online user id as a new user
    #[serde(default)]
    pub count_replacements: bool,
}

/// Push endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PushConfig {
    /// Serve the push endpoint
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Request path
    #[serde(default = "default_push_path")]
    pub path: String,

    /// Answer 200 regardless of the delivery outcome
    #[serde(default)]
    pub always_ack: bool,

    /// Largest accepted POST body
    #[serde(default = "default_push_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_push_path() -> String {
    "/pushToWeb".to_string()
}

fn default_push_max_body_bytes() -> usize {
    64 * 1024
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_push_path(),
            always_ack: false,
            max_body_bytes: default_push_max_body_bytes(),
        }
    }
}

/// Management API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ManagementConfig {
    /// Serve the management API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address
    #[serde(default = "default_management_bind")]
    pub bind: SocketAddr,
}

fn default_management_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind: default_management_bind(),
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: default_true(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.server.endpoint_prefix, "/imserver");
        assert_eq!(config.server.welcome_text, "连接成功");
        assert_eq!(config.push.path, "/pushToWeb");
        assert!(config.push.enabled);
        assert!(!config.push.always_ack);
        assert_eq!(config.push.max_body_bytes, 64 * 1024);
        assert!(!config.registry.count_replacements);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = DaemonConfig::parse(
            r#"
[server]
bind = "127.0.0.1:9000"
welcome_text = "connection successful"

[push]
always_ack = true
"#,
        )
        .unwrap();

        assert_eq!(config.server.bind.port(), 9000);
        assert_eq!(config.server.welcome_text, "connection successful");
        assert_eq!(config.server.endpoint_prefix, "/imserver");
        assert!(config.push.always_ack);
        assert!(config.management.enabled);
    }

    #[test]
    fn test_parse_rejects_bad_address() {
        assert!(DaemonConfig::parse("[server]\nbind = \"not-an-addr\"\n").is_err());
    }

    #[test]
    fn test_merge_scalars() {
        let mut config = DaemonConfig::default();
        let mut other = DaemonConfig::default();
        other.server.bind = "127.0.0.1:7000".parse().unwrap();
        other.push.path = "/push".to_string();
        other.push.max_body_bytes = 1024;

        config.merge(other);

        assert_eq!(config.server.bind.port(), 7000);
        assert_eq!(config.push.path, "/push");
        assert_eq!(config.push.max_body_bytes, 1024);
        assert_eq!(config.server.endpoint_prefix, "/imserver");
    }

    #[test]
    fn test_merge_flags() {
        let mut config = DaemonConfig::default();
        let mut other = DaemonConfig::default();
        other.registry.count_replacements = true;
        other.monitoring.prometheus_enabled = false;

        config.merge(other);

        assert!(config.registry.count_replacements);
        assert!(!config.monitoring.prometheus_enabled);
        assert!(config.management.enabled);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[management]\nenabled = false").unwrap();

        let config = DaemonConfig::load(file.path()).await.unwrap();
        assert!(!config.management.enabled);

        let mut base = DaemonConfig::default();
        base.load_merge(file.path()).await.unwrap();
        assert!(!base.management.enabled);
    }
}
