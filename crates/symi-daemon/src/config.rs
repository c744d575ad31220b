//! Configuration loading

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use symi_core::protocol::{DEFAULT_TCP_PORT, DISCOVERY_PORT};
use symi_discovery::ScanConfig;
use symi_transport::{TransportConfig, DEFAULT_CONNECT_TIMEOUT_MS};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub transport: TransportSection,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for web server
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Consecutive failed connection attempts before giving up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Serial,
}

/// Gateway link settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_kind")]
    pub kind: TransportKind,
    /// Gateway host for TCP
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Device path for serial
    #[serde(default = "default_serial_path")]
    pub serial_path: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            host: default_host(),
            port: default_port(),
            serial_path: default_serial_path(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_kind() -> TransportKind {
    TransportKind::Tcp
}

fn default_host() -> String {
    "192.168.1.50".to_string()
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_serial_path() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

impl TransportSection {
    pub fn to_transport_config(&self) -> TransportConfig {
        match self.kind {
            TransportKind::Tcp => TransportConfig::Tcp {
                host: self.host.clone(),
                port: self.port,
                connect_timeout_ms: self.connect_timeout_ms,
            },
            TransportKind::Serial => TransportConfig::Serial {
                path: self.serial_path.clone(),
            },
        }
    }
}

/// LAN gateway discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_port")]
    pub port: u16,
    /// Per-host probe timeout
    #[serde(default = "default_discovery_timeout_ms")]
    pub timeout_ms: u64,
    /// Hosts probed at once
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: default_discovery_port(),
            timeout_ms: default_discovery_timeout_ms(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

fn default_discovery_timeout_ms() -> u64 {
    2000
}

fn default_concurrency() -> usize {
    64
}

impl DiscoveryConfig {
    pub fn to_scan_config(&self) -> ScanConfig {
        ScanConfig {
            port: self.port,
            timeout_ms: self.timeout_ms,
            concurrency: self.concurrency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Persisted device list
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./symi-devices.json")
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
