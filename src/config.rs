//! Configuration management for Warren.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Client configuration.
    #[serde(default)]
    pub client: ClientConfig,

    /// TLS material.
    #[serde(default)]
    pub tls: TlsConfig,

    /// TUN device configuration (server side).
    #[serde(default)]
    pub tun: TunConfig,

    /// Metrics endpoint configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Queue depths and pool sizes.
    #[serde(default)]
    pub limits: Limits,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        // Need at least one assignable address after excluding the network,
        // server, and broadcast addresses.
        if self.server.cidr.prefix_len() > 30 {
            return Err(Error::InvalidConfig(format!(
                "server CIDR /{} leaves no assignable client addresses",
                self.server.cidr.prefix_len()
            )));
        }

        if self.tun.queues == 0 || self.tun.workers_per_queue == 0 {
            return Err(Error::InvalidConfig(
                "tun queues and workers_per_queue must be at least 1".into(),
            ));
        }

        if self.limits.client_queue == 0 {
            return Err(Error::InvalidConfig("client_queue must be at least 1".into()));
        }

        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the TLS tunnel.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Tunnel netblock. The address part is the server's own tunnel address;
    /// clients are assigned from the remaining hosts.
    #[serde(default = "default_cidr")]
    pub cidr: Ipv4Net,

    /// Deadline for a client to complete the application handshake.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cidr: default_cidr(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address to dial, `host:port`.
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Name the server's certificate must match (SNI).
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Client-side TUN device name.
    #[serde(default = "default_client_tun_name")]
    pub tun_name: String,

    /// Prefix length applied to the assigned tunnel address. The handshake
    /// only carries the address, so the netblock size is agreed out of band.
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,

    /// Deadline for the server to answer the application handshake.
    #[serde(default = "default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: default_server_addr(),
            server_name: default_server_name(),
            tun_name: default_client_tun_name(),
            prefix_len: default_prefix_len(),
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

/// TLS material paths. The same file layout serves both ends: a keypair for
/// this end plus the CA that signed the far end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain for this endpoint.
    #[serde(default = "default_cert")]
    pub cert: PathBuf,

    /// PEM private key for this endpoint.
    #[serde(default = "default_key")]
    pub key: PathBuf,

    /// PEM certificate authority used to verify the peer.
    #[serde(default = "default_ca")]
    pub ca: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: default_cert(),
            key: default_key(),
            ca: default_ca(),
        }
    }
}

/// Server-side TUN device configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    /// Device name.
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// Number of device queues to open (multi-queue).
    #[serde(default = "default_queues")]
    pub queues: usize,

    /// Concurrent reader tasks per queue.
    #[serde(default = "default_workers_per_queue")]
    pub workers_per_queue: usize,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: default_tun_name(),
            queues: default_queues(),
            workers_per_queue: default_workers_per_queue(),
        }
    }
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to serve the metrics endpoint at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Bind address for `/metrics` and `/clients`.
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_metrics_listen(),
        }
    }
}

/// Queue depths and buffer pool sizing.
///
/// The per-client queue is where the router's drop-don't-block policy bites;
/// the router and tun-write queues apply uniform backpressure and may block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    /// Per-client tx sink depth.
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,

    /// Router packet input depth.
    #[serde(default = "default_router_queue")]
    pub router_queue: usize,

    /// Shared tun-write queue depth.
    #[serde(default = "default_tun_queue")]
    pub tun_queue: usize,

    /// Buffer pool free-list bound.
    #[serde(default = "default_pool_buffers")]
    pub pool_buffers: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            client_queue: default_client_queue(),
            router_queue: default_router_queue(),
            tun_queue: default_tun_queue(),
            pool_buffers: default_pool_buffers(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (overridden by `RUST_LOG`).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors in text output.
    #[serde(default = "default_true")]
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            color: true,
        }
    }
}

fn default_listen() -> SocketAddr {
    "0.0.0.0:443".parse().unwrap()
}
fn default_cidr() -> Ipv4Net {
    "192.168.0.1/21".parse().unwrap()
}
fn default_handshake_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_server_addr() -> String {
    "localhost:443".into()
}
fn default_server_name() -> String {
    "localhost".into()
}
fn default_tun_name() -> String {
    "tun_warren".into()
}
fn default_client_tun_name() -> String {
    "tun_warrenc".into()
}
fn default_prefix_len() -> u8 {
    21
}
fn default_cert() -> PathBuf {
    "certs/cert.pem".into()
}
fn default_key() -> PathBuf {
    "certs/key.pem".into()
}
fn default_ca() -> PathBuf {
    "certs/ca.pem".into()
}
fn default_queues() -> usize {
    4
}
fn default_workers_per_queue() -> usize {
    2
}
fn default_metrics_listen() -> SocketAddr {
    "0.0.0.0:9000".parse().unwrap()
}
fn default_client_queue() -> usize {
    64
}
fn default_router_queue() -> usize {
    256
}
fn default_tun_queue() -> usize {
    256
}
fn default_pool_buffers() -> usize {
    1024
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_true() -> bool {
    true
}

/// Initialize the tracing subscriber from the logging config.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    } else {
        subscriber
            .with(fmt::layer().with_ansi(config.color))
            .try_init()
            .map_err(|e| Error::Config(format!("Failed to init logging: {e}")))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.cidr.prefix_len(), 21);
        assert_eq!(config.tun.name, "tun_warren");
        assert_eq!(config.client.tun_name, "tun_warrenc");
    }

    #[test]
    fn rejects_tiny_netblock() {
        let mut config = Config::default();
        config.server.cidr = "10.0.0.1/31".parse().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.server.listen, config.server.listen);
        assert_eq!(back.server.cidr, config.server.cidr);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:8443"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8443".parse().unwrap());
        assert_eq!(config.server.cidr, default_cidr());
        assert_eq!(config.limits.client_queue, 64);
    }
}
