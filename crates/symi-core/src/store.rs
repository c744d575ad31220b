//! Persisted device list
//!
//! The registry is seeded from this file before the first frame is read and
//! the file is rewritten whenever the persisted view of the registry changes.
//! Only metadata is stored; live state comes back from the gateway.
//!
//! ```json
//! { "version": 1, "devices": { "1ad07d3d449c": { "device_type": 1, ... } } }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

use crate::device::{Device, DeviceId, DeviceReport, DeviceType, FrameSource, MacAddress};

pub const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("unsupported device list version {0}")]
    UnsupportedVersion(u32),
}

/// Stored metadata for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDevice {
    pub device_type: u8,
    pub channel_count: u8,
    pub mac: String,
    #[serde(default)]
    pub network_address: u16,
    #[serde(default)]
    pub sub_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedDevices {
    #[serde(default = "default_version")]
    pub version: u32,
    /// Keyed by device id
    #[serde(default)]
    pub devices: BTreeMap<String, PersistedDevice>,
}

fn default_version() -> u32 {
    STORE_VERSION
}

impl Default for PersistedDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistedDevices {
    pub fn new() -> Self {
        Self {
            version: STORE_VERSION,
            devices: BTreeMap::new(),
        }
    }

    pub fn from_devices<'a>(devices: impl IntoIterator<Item = &'a Device>) -> Self {
        let devices = devices
            .into_iter()
            .map(|device| {
                (
                    device.id.to_string(),
                    PersistedDevice {
                        device_type: device.device_type.code(),
                        channel_count: device.channel_count,
                        mac: device.mac.to_string(),
                        network_address: device.network_address,
                        sub_type: device.sub_type,
                    },
                )
            })
            .collect();
        Self {
            version: STORE_VERSION,
            devices,
        }
    }

    /// Reports to seed a registry with. Entries with an unreadable MAC are
    /// skipped.
    ///
    /// Switch entries written by older versions may lack `sub_type`; the
    /// stored channel count stands in for it.
    pub fn reports(&self) -> Vec<DeviceReport> {
        self.devices
            .iter()
            .filter_map(|(id, entry)| {
                let mac = match entry.mac.parse::<MacAddress>() {
                    Ok(mac) => mac,
                    Err(e) => {
                        warn!(device = %id, error = %e, "Skipping persisted device");
                        return None;
                    }
                };
                if DeviceId::from_mac(&mac).as_str() != id.to_ascii_lowercase() {
                    warn!(device = %id, mac = %mac, "Persisted id does not match MAC, using MAC");
                }
                let device_type = DeviceType::from_code(entry.device_type);
                let sub_type = if device_type.is_switch_family() {
                    entry.sub_type.max(entry.channel_count)
                } else {
                    entry.sub_type
                };
                Some(DeviceReport {
                    mac,
                    network_address: entry.network_address,
                    device_type,
                    sub_type,
                    online: false,
                    rssi: None,
                    source: FrameSource::Persisted,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Load the device list from a file
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)?;
        let stored: PersistedDevices = serde_json::from_str(&content)?;
        if stored.version != STORE_VERSION {
            return Err(StoreError::UnsupportedVersion(stored.version));
        }
        Ok(stored)
    }

    /// Load the device list or start empty if the file doesn't exist
    pub fn load_or_create(path: &Path) -> Result<Self, StoreError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Save the device list to a file
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
