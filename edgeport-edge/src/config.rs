//! Configuration management
//!
//! Handles loading and validating edge agent configuration from TOML files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use edgeport_server::protocol::Credentials;

pub use edgeport_server::config::LoggingConfig;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub quic: QuicConfig,
    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Broker address (host:port)
    pub address: String,
    /// Server name for TLS SNI (defaults to host from address)
    pub server_name: Option<String>,
    /// Extra CA certificate (PEM) trusted for the broker
    pub ca_cert: Option<PathBuf>,
    /// Skip TLS certificate verification (insecure, dev only)
    #[serde(default)]
    pub insecure: bool,
}

impl ServerConfig {
    /// Get the server name for TLS SNI
    pub fn get_server_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or_else(|| {
            // Extract host from address (strip port)
            self.address
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(&self.address)
        })
    }
}

/// Access credential pair issued to this edge
#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    pub access_key: String,
    pub secret_key: String,
}

impl CredentialsConfig {
    pub fn to_credentials(&self) -> Credentials {
        Credentials::new(self.access_key.clone(), self.secret_key.clone())
    }
}

impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Agent behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    /// Pause between reconnect attempts, in seconds
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    /// Bound on dialing local services, in seconds (0 = OS default)
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// Bound on establishing the broker connection, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: default_reconnect_interval(),
            dial_timeout_secs: default_dial_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl EdgeConfig {
    pub fn dial_timeout(&self) -> Option<Duration> {
        (self.dial_timeout_secs > 0).then(|| Duration::from_secs(self.dial_timeout_secs))
    }
}

/// QUIC protocol configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QuicConfig {
    /// Connection idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Maximum concurrent tunnel streams the broker may open
    #[serde(default = "default_max_streams")]
    pub max_streams: u32,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            keep_alive_secs: default_keep_alive(),
            max_streams: default_max_streams(),
        }
    }
}

// Default value functions
fn default_reconnect_interval() -> u64 {
    5
}

fn default_dial_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_idle_timeout() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    10
}

fn default_max_streams() -> u32 {
    1024
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: "info".to_string(),
        format: "pretty".to_string(),
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.server.address.is_empty() {
            anyhow::bail!("server.address must not be empty");
        }
        if self.credentials.access_key.is_empty() {
            anyhow::bail!("credentials.access_key must not be empty");
        }
        if self.quic.idle_timeout_secs == 0 {
            anyhow::bail!("quic.idle_timeout_secs must be > 0");
        }
        if self.quic.keep_alive_secs >= self.quic.idle_timeout_secs {
            anyhow::bail!("quic.keep_alive_secs must be shorter than quic.idle_timeout_secs");
        }
        if self.quic.max_streams == 0 {
            anyhow::bail!("quic.max_streams must be > 0");
        }
        if self.edge.reconnect_interval_secs == 0 {
            anyhow::bail!("edge.reconnect_interval_secs must be > 0");
        }
        if self.edge.connect_timeout_secs == 0 {
            anyhow::bail!("edge.connect_timeout_secs must be > 0");
        }
        Ok(())
    }
}
