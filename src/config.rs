//! Configuration management
//!
//! Handles loading and validating broker configuration from TOML files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::gatekeeper::PortManagerConfig;
use crate::gateway::{GatewaySettings, ProxyRoute};
use crate::identity::StaticIdentityStore;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub quic: QuicConfig,
    pub tls: TlsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Statically declared edge credentials
    #[serde(default)]
    pub edges: Vec<EdgeCredentialConfig>,
    /// Proxies created at startup
    #[serde(default)]
    pub proxies: Vec<ProxyRoute>,
}

/// QUIC broker endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Address edges dial
    pub bind_addr: SocketAddr,
    /// Number of worker threads (0 = auto)
    #[serde(default)]
    pub workers: usize,
    /// Time an edge gets to present credentials
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

impl BrokerConfig {
    /// Get effective worker count (auto-detect if 0)
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }
}

/// QUIC protocol configuration.
///
/// The stream limit lives on the edge side, which receives every tunnel stream.
#[derive(Debug, Clone, Deserialize)]
pub struct QuicConfig {
    /// Connection idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for QuicConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

/// TLS configuration for the QUIC endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Path to certificate file
    pub cert_path: String,
    /// Path to private key file
    pub key_path: String,
    /// Auto-generate self-signed cert if missing
    #[serde(default)]
    pub auto_generate: bool,
}

/// Entry-side gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Address managed listeners bind on
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    /// Bound on reading one client request
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Grace period for draining a deleted listener
    #[serde(default = "default_drain_grace")]
    pub drain_grace_secs: u64,
    /// Largest accepted header block
    #[serde(default = "default_max_header_bytes")]
    pub max_header_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            read_timeout_secs: default_read_timeout(),
            drain_grace_secs: default_drain_grace(),
            max_header_bytes: default_max_header_bytes(),
        }
    }
}

impl GatewayConfig {
    pub fn port_manager(&self) -> PortManagerConfig {
        PortManagerConfig {
            bind_host: self.bind_host,
            drain_grace: Duration::from_secs(self.drain_grace_secs),
        }
    }

    pub fn settings(&self) -> GatewaySettings {
        GatewaySettings {
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            max_header_bytes: self.max_header_bytes,
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Metrics server bind address
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
    /// Interval between traffic flushes, in seconds
    #[serde(default = "default_traffic_flush")]
    pub traffic_flush_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
            traffic_flush_secs: default_traffic_flush(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// One statically known edge
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeCredentialConfig {
    pub edge_id: u64,
    pub access_key: String,
    pub secret_key: String,
}

// Default value functions
fn default_handshake_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 30 }
fn default_keep_alive() -> u64 { 10 }
fn default_bind_host() -> IpAddr { IpAddr::V4(Ipv4Addr::UNSPECIFIED) }
fn default_read_timeout() -> u64 { 30 }
fn default_drain_grace() -> u64 { 5 }
fn default_max_header_bytes() -> usize { 64 * 1024 }
fn default_metrics_addr() -> SocketAddr { SocketAddr::from(([127, 0, 0, 1], 9090)) }
fn default_traffic_flush() -> u64 { 60 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Identity store holding the `[[edges]]` entries
    pub fn identity_store(&self) -> StaticIdentityStore {
        let mut store = StaticIdentityStore::new();
        for edge in &self.edges {
            store.insert(edge.access_key.clone(), edge.edge_id, edge.secret_key.clone());
        }
        store
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.quic.idle_timeout_secs == 0 {
            anyhow::bail!("quic.idle_timeout_secs must be > 0");
        }
        if self.quic.keep_alive_secs >= self.quic.idle_timeout_secs {
            anyhow::bail!("quic.keep_alive_secs must be shorter than quic.idle_timeout_secs");
        }
        if self.broker.handshake_timeout_secs == 0 {
            anyhow::bail!("broker.handshake_timeout_secs must be > 0");
        }
        if self.gateway.read_timeout_secs == 0 {
            anyhow::bail!("gateway.read_timeout_secs must be > 0");
        }
        if self.gateway.max_header_bytes < 1024 {
            anyhow::bail!("gateway.max_header_bytes must be at least 1024");
        }
        if self.metrics.traffic_flush_secs == 0 {
            anyhow::bail!("metrics.traffic_flush_secs must be > 0");
        }

        let mut access_keys = HashSet::new();
        for edge in &self.edges {
            if edge.access_key.is_empty() {
                anyhow::bail!("edge {} has an empty access_key", edge.edge_id);
            }
            if !access_keys.insert(edge.access_key.as_str()) {
                anyhow::bail!("access_key {:?} is declared twice", edge.access_key);
            }
        }

        let mut proxy_ids = HashSet::new();
        let mut ports = HashSet::new();
        for proxy in &self.proxies {
            if !proxy_ids.insert(proxy.proxy_id) {
                anyhow::bail!("proxy {} is declared twice", proxy.proxy_id);
            }
            if proxy.port != 0 && !ports.insert(proxy.port) {
                anyhow::bail!("port {} is used by more than one proxy", proxy.port);
            }
            if proxy.target.is_empty() {
                anyhow::bail!("proxy {} has an empty target", proxy.proxy_id);
            }
        }

        Ok(())
    }
}
