//! Application state management

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use symi_core::{Device, DeviceId, DeviceRegistry, PersistedDevices};
use symi_discovery::LanScanner;

use crate::config::Config;
use crate::gateway::Gateway;

/// Shared application state
pub struct AppState {
    /// Gateway engine
    pub gateway: Arc<Gateway>,
    /// LAN scanner for finding gateways
    pub scanner: LanScanner,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Create new application state.
    ///
    /// The registry is seeded from the persisted device list before any
    /// frame is read.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let persisted = PersistedDevices::load_or_create(&config.storage.path)?;
        let registry = Arc::new(DeviceRegistry::new());
        let seeded = registry.seed(&persisted).await;
        info!(
            devices = seeded,
            path = %config.storage.path.display(),
            "Loaded persisted devices"
        );

        spawn_persistence(registry.clone(), config.storage.path.clone(), persisted);

        let gateway = Gateway::new(registry);
        let scanner = LanScanner::new(config.discovery.to_scan_config());

        Ok(Arc::new(Self {
            gateway,
            scanner,
            config,
        }))
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        self.gateway.registry()
    }

    /// Get all known devices
    pub async fn devices(&self) -> Vec<Device> {
        self.registry().all().await
    }

    /// Get a specific device
    pub async fn get_device(&self, id: &str) -> Option<Device> {
        self.registry().get(&DeviceId::from(id)).await
    }
}

/// Rewrite the device file whenever the persisted view of the registry changes.
///
/// State-only updates (channel flips, RSSI) leave the persisted view as it
/// was and cause no write.
pub fn spawn_persistence(
    registry: Arc<DeviceRegistry>,
    path: PathBuf,
    mut saved: PersistedDevices,
) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => debug!(skipped = n, "Persistence lagged"),
                Err(RecvError::Closed) => break,
            }

            let current = registry.to_persisted().await;
            if current == saved {
                continue;
            }
            match current.save(&path) {
                Ok(()) => {
                    debug!(devices = current.len(), path = %path.display(), "Saved devices");
                    saved = current;
                }
                Err(e) => warn!(error = %e, path = %path.display(), "Failed to save devices"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use symi_core::{DeviceReport, DeviceType, FrameSource, MacAddress};
    use tempfile::TempDir;

    fn report(last: u8, address: u16) -> DeviceReport {
        DeviceReport {
            mac: MacAddress([0xA4, 0xC1, 0x38, 0x00, 0x00, last]),
            network_address: address,
            device_type: DeviceType::ZeroFireSwitch,
            sub_type: 2,
            online: true,
            rssi: None,
            source: FrameSource::DeviceList,
        }
    }

    async fn wait_for_file(path: &std::path::Path, devices: usize) -> PersistedDevices {
        for _ in 0..200 {
            if let Ok(file) = PersistedDevices::from_file(path) {
                if file.len() == devices {
                    return file;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("device file never reached {} devices", devices);
    }

    #[tokio::test]
    async fn test_registry_changes_are_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        let registry = Arc::new(DeviceRegistry::new());
        spawn_persistence(registry.clone(), path.clone(), PersistedDevices::new());

        registry.upsert(report(1, 0x0101)).await;
        registry.upsert(report(2, 0x0102)).await;
        let file = wait_for_file(&path, 2).await;
        assert!(file.devices.contains_key("a4c138000001"));
    }

    #[tokio::test]
    async fn test_state_seeded_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("devices.json");
        let registry = DeviceRegistry::new();
        registry.upsert(report(7, 0x0107)).await;
        registry.to_persisted().await.save(&path).unwrap();

        let mut config = Config::default();
        config.storage.path = path;
        let state = AppState::new(config).await.unwrap();

        let device = state.get_device("a4c138000007").await.unwrap();
        assert_eq!(device.network_address, 0x0107);
        assert!(!device.online);
        assert_eq!(state.devices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.path = dir.path().join("absent.json");
        let state = AppState::new(config).await.unwrap();
        assert!(state.devices().await.is_empty());
    }
}
