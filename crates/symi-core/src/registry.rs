//! In-memory device registry
//!
//! The registry is the only owner of [`Device`] entries. Every mutation takes
//! the write lock and publishes a [`RegistryEvent`] before releasing it, so
//! subscribers see changes in the order they were applied.

use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::device::{CoverMotion, Device, DeviceId, DeviceReport, FrameSource};
use crate::protocol::{curtain, msg_type, switch};
use crate::store::PersistedDevices;

const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    #[error("device {device} has no channel {channel} (channels: 1..={channel_count})")]
    InvalidChannel {
        device: DeviceId,
        channel: u8,
        channel_count: u8,
    },
}

/// Registry change notification
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A device was seen for the first time
    Added(Device),
    /// Metadata, liveness or state of a known device changed
    Updated(Device),
    Removed(DeviceId),
    /// All devices were dropped
    Cleared,
}

/// What an upsert did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry created
    Added,
    /// Existing entry gained channels or a network address
    Changed,
    /// Existing entry only had its liveness refreshed
    Refreshed,
}

/// A device state change decoded from a status event or control ack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// One 1-based channel
    Channel { channel: u8, on: bool },
    AllChannels(bool),
    /// Bit `n` carries channel `n`
    ChannelMask(u8),
    Brightness(u8),
    ColorTemp(u8),
    Cover(CoverMotion),
    Position(u8),
}

impl StateChange {
    /// Decode the `msg_type | value` pair of a node status event (0x80/0x06)
    pub fn from_status_event(msg: u8, value: u8) -> Option<Self> {
        match msg {
            msg_type::SWITCH_CONTROL => Some(Self::ChannelMask(value)),
            msg_type::BRIGHTNESS_CONTROL => Some(Self::Brightness(value.min(100))),
            msg_type::COLOR_TEMP_CONTROL => Some(Self::ColorTemp(value.min(100))),
            msg_type::CURTAIN_CONTROL => cover_motion(value).map(Self::Cover),
            msg_type::CURTAIN_POSITION => Some(Self::Position(value.min(100))),
            _ => None,
        }
    }

    /// Decode the `msg_type | param` pair echoed in a control ack (0xB0).
    /// Switch acks carry the request parameter, not a bitmask.
    pub fn from_control_ack(msg: u8, param: u8) -> Option<Self> {
        match msg {
            msg_type::SWITCH_CONTROL => match param {
                switch::ALL_ON => Some(Self::AllChannels(true)),
                switch::ALL_OFF => Some(Self::AllChannels(false)),
                other => {
                    switch::decode_param(other).map(|(channel, on)| Self::Channel { channel, on })
                }
            },
            _ => Self::from_status_event(msg, param),
        }
    }
}

fn cover_motion(value: u8) -> Option<CoverMotion> {
    match value {
        curtain::OPEN => Some(CoverMotion::Opening),
        curtain::CLOSE => Some(CoverMotion::Closing),
        curtain::STOP => Some(CoverMotion::Stopped),
        _ => None,
    }
}

/// Authoritative set of known devices
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Device>>,
    event_tx: broadcast::Sender<RegistryEvent>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            devices: RwLock::new(HashMap::new()),
            event_tx,
        }
    }

    /// Subscribe to registry events
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    /// Insert or merge a device sighting
    pub async fn upsert(&self, report: DeviceReport) -> UpsertOutcome {
        let mut devices = self.devices.write().await;
        self.upsert_locked(&mut devices, &report)
    }

    /// Upsert several sightings under one write lock
    pub async fn upsert_many(&self, reports: &[DeviceReport]) -> Vec<UpsertOutcome> {
        let mut devices = self.devices.write().await;
        reports
            .iter()
            .map(|report| self.upsert_locked(&mut devices, report))
            .collect()
    }

    fn upsert_locked(
        &self,
        devices: &mut HashMap<DeviceId, Device>,
        report: &DeviceReport,
    ) -> UpsertOutcome {
        let id = report.id();
        let Some(existing) = devices.get_mut(&id) else {
            let device = Device::from_report(report);
            info!(
                device = %id,
                device_type = ?device.device_type,
                channels = device.channel_count,
                source = ?report.source,
                "Device added"
            );
            devices.insert(id, device.clone());
            self.emit(RegistryEvent::Added(device));
            return UpsertOutcome::Added;
        };

        let mut changed = false;

        if existing.device_type.is_switch_family() {
            let reported = existing.device_type.channel_count(report.sub_type);
            if reported > existing.channel_count {
                debug!(
                    device = %id,
                    from = existing.channel_count,
                    to = reported,
                    "Raising channel count"
                );
                existing.resize_channels(reported);
                changed = true;
            } else if reported < existing.channel_count {
                debug!(
                    device = %id,
                    kept = existing.channel_count,
                    reported,
                    "Ignoring smaller channel count"
                );
            }
        }

        if report.network_address != 0 && report.network_address != existing.network_address {
            debug!(
                device = %id,
                addr = format_args!("0x{:04X}", report.network_address),
                "Network address updated"
            );
            existing.network_address = report.network_address;
            changed = true;
        }

        if report.source != FrameSource::Persisted {
            existing.online = report.online;
            if report.rssi.is_some() {
                existing.rssi = report.rssi;
            }
            existing.touch();
        }

        self.emit(RegistryEvent::Updated(existing.clone()));
        if changed {
            UpsertOutcome::Changed
        } else {
            UpsertOutcome::Refreshed
        }
    }

    /// Get a device by id
    pub async fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.read().await.get(id).cloned()
    }

    /// Find the device holding a mesh address
    pub async fn get_by_address(&self, address: u16) -> Option<Device> {
        if address == 0 {
            return None;
        }
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.network_address == address)
            .cloned()
    }

    /// Point-in-time copy of every device, sorted by id
    pub async fn all(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Record the on/off state of one channel
    pub async fn set_channel_state(
        &self,
        id: &DeviceId,
        channel: u8,
        on: bool,
    ) -> Result<Device, RegistryError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownDevice(id.clone()))?;
        if channel == 0 || channel > device.channel_count {
            return Err(RegistryError::InvalidChannel {
                device: id.clone(),
                channel,
                channel_count: device.channel_count,
            });
        }
        device.state.channels[usize::from(channel - 1)] = on;
        device.touch();
        let device = device.clone();
        self.emit(RegistryEvent::Updated(device.clone()));
        Ok(device)
    }

    /// Apply a decoded state change to the device at a mesh address.
    ///
    /// Returns `None` when no device holds the address.
    pub async fn apply_state(&self, address: u16, change: StateChange) -> Option<Device> {
        let mut devices = self.devices.write().await;
        let device = devices
            .values_mut()
            .find(|d| address != 0 && d.network_address == address)?;

        let channels = &mut device.state.channels;
        match change {
            StateChange::Channel { channel, on } => {
                if let Some(slot) = usize::from(channel)
                    .checked_sub(1)
                    .and_then(|idx| channels.get_mut(idx))
                {
                    *slot = on;
                } else {
                    debug!(device = %device.id, channel, "Ack for channel outside device range");
                }
            }
            StateChange::AllChannels(on) => channels.iter_mut().for_each(|c| *c = on),
            StateChange::ChannelMask(mask) => {
                for (idx, slot) in channels.iter_mut().enumerate() {
                    *slot = u16::from(mask) & (1 << (idx + 1)) != 0;
                }
            }
            StateChange::Brightness(value) => device.state.brightness = Some(value),
            StateChange::ColorTemp(value) => device.state.color_temp = Some(value),
            StateChange::Cover(motion) => device.state.cover = Some(motion),
            StateChange::Position(value) => device.state.position = Some(value),
        }
        device.online = true;
        device.touch();

        let device = device.clone();
        self.emit(RegistryEvent::Updated(device.clone()));
        Some(device)
    }

    /// Apply a node status report (`msg_type`, `value`) to the device at `address`
    pub async fn apply_status(&self, address: u16, msg: u8, value: u8) -> Option<Device> {
        let change = StateChange::from_status_event(msg, value)?;
        self.apply_state(address, change).await
    }

    /// Adopt the mesh address assigned during pairing
    pub async fn assign_address(&self, id: &DeviceId, address: u16) -> Option<Device> {
        let mut devices = self.devices.write().await;
        if !devices.contains_key(id) {
            return None;
        }
        // An address belongs to one device at a time
        if address != 0 {
            for other in devices
                .values_mut()
                .filter(|d| d.id != *id && d.network_address == address)
            {
                other.network_address = 0;
                self.emit(RegistryEvent::Updated(other.clone()));
            }
        }
        let device = devices.get_mut(id)?;
        if device.network_address != address {
            info!(device = %id, addr = format_args!("0x{:04X}", address), "Device paired");
            device.network_address = address;
        }
        device.online = true;
        device.touch();
        let device = device.clone();
        self.emit(RegistryEvent::Updated(device.clone()));
        Some(device)
    }

    /// Remove a device
    pub async fn remove(&self, id: &DeviceId) -> Option<Device> {
        let mut devices = self.devices.write().await;
        let removed = devices.remove(id)?;
        info!(device = %id, "Device removed");
        self.emit(RegistryEvent::Removed(id.clone()));
        Some(removed)
    }

    /// Drop every device
    pub async fn clear(&self) {
        let mut devices = self.devices.write().await;
        devices.clear();
        info!("Device registry cleared");
        self.emit(RegistryEvent::Cleared);
    }

    /// Load persisted devices before any frame is processed
    pub async fn seed(&self, persisted: &PersistedDevices) -> usize {
        let outcomes = self.upsert_many(&persisted.reports()).await;
        outcomes
            .iter()
            .filter(|o| **o == UpsertOutcome::Added)
            .count()
    }

    /// Persistable view of the registry
    pub async fn to_persisted(&self) -> PersistedDevices {
        let devices = self.devices.read().await;
        PersistedDevices::from_devices(devices.values())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Capability, DeviceType, MacAddress};

    fn report(last: u8, device_type: u8, sub_type: u8, source: FrameSource) -> DeviceReport {
        DeviceReport {
            mac: MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]),
            network_address: 0,
            device_type: DeviceType::from_code(device_type),
            sub_type,
            online: true,
            rssi: None,
            source,
        }
    }

    #[tokio::test]
    async fn test_dedup_discovery_then_list() {
        let registry = DeviceRegistry::new();
        let mut scanned = report(1, 1, 2, FrameSource::Discovery);
        scanned.rssi = Some(-70);
        let mut listed = report(1, 1, 4, FrameSource::DeviceList);
        listed.network_address = 0x0102;

        assert_eq!(registry.upsert(scanned).await, UpsertOutcome::Added);
        assert_eq!(registry.upsert(listed).await, UpsertOutcome::Changed);

        let all = registry.all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].channel_count, 4);
        assert_eq!(all[0].state.channels.len(), 4);
        assert_eq!(all[0].network_address, 0x0102);
        assert_eq!(all[0].source, FrameSource::Discovery);
        assert_eq!(all[0].rssi, Some(-70));
    }

    #[tokio::test]
    async fn test_channel_count_never_decreases() {
        let registry = DeviceRegistry::new();
        registry.upsert(report(1, 2, 3, FrameSource::DeviceList)).await;
        assert_eq!(
            registry.upsert(report(1, 2, 1, FrameSource::Discovery)).await,
            UpsertOutcome::Refreshed
        );
        let id = report(1, 2, 3, FrameSource::DeviceList).id();
        assert_eq!(registry.get(&id).await.unwrap().channel_count, 3);
    }

    #[tokio::test]
    async fn test_first_writer_wins_for_type() {
        let registry = DeviceRegistry::new();
        registry.upsert(report(1, 8, 0, FrameSource::Discovery)).await;
        registry.upsert(report(1, 4, 0, FrameSource::DeviceList)).await;
        let device = registry.all().await.remove(0);
        assert_eq!(device.device_type, DeviceType::MotionSensor);
        assert_eq!(device.capabilities, vec![Capability::Motion]);
    }

    #[tokio::test]
    async fn test_capabilities_from_upsert() {
        let registry = DeviceRegistry::new();
        for (last, code) in [1u8, 3, 4, 5, 8, 10, 24].into_iter().enumerate() {
            let r = report(last as u8, code, 0, FrameSource::DeviceList);
            let id = r.id();
            registry.upsert(r).await;
            let device = registry.get(&id).await.unwrap();
            assert_eq!(device.capabilities, DeviceType::from_code(code).capabilities());
        }
        let five_color = report(6, 24, 0, FrameSource::DeviceList).id();
        assert_eq!(
            registry.get(&five_color).await.unwrap().capabilities,
            vec![
                Capability::Light,
                Capability::Brightness,
                Capability::ColorTemp,
                Capability::Rgb
            ]
        );
    }

    #[tokio::test]
    async fn test_set_channel_state_bounds() {
        let registry = DeviceRegistry::new();
        let r = report(1, 1, 2, FrameSource::DeviceList);
        let id = r.id();
        registry.upsert(r).await;

        let device = registry.set_channel_state(&id, 2, true).await.unwrap();
        assert_eq!(device.channel_state(2), Some(true));
        assert!(matches!(
            registry.set_channel_state(&id, 3, true).await,
            Err(RegistryError::InvalidChannel { channel: 3, .. })
        ));
        assert!(matches!(
            registry.set_channel_state(&id, 0, true).await,
            Err(RegistryError::InvalidChannel { channel: 0, .. })
        ));
        assert!(matches!(
            registry.set_channel_state(&DeviceId::from("ffffffffffff"), 1, true).await,
            Err(RegistryError::UnknownDevice(_))
        ));
    }

    #[tokio::test]
    async fn test_apply_status_mask() {
        let registry = DeviceRegistry::new();
        let mut r = report(1, 1, 3, FrameSource::DeviceList);
        r.network_address = 0x0010;
        registry.upsert(r).await;

        let device = registry
            .apply_status(0x0010, msg_type::SWITCH_CONTROL, 0b0000_1010)
            .await
            .unwrap();
        assert_eq!(device.state.channels, vec![true, false, true]);
        let change = StateChange::ChannelMask(0b0000_1010);

        let ack = StateChange::from_control_ack(msg_type::SWITCH_CONTROL, 0x04).unwrap();
        let device = registry.apply_state(0x0010, ack).await.unwrap();
        assert_eq!(device.state.channels, vec![true, true, true]);

        let all_off =
            StateChange::from_control_ack(msg_type::SWITCH_CONTROL, switch::ALL_OFF).unwrap();
        let device = registry.apply_state(0x0010, all_off).await.unwrap();
        assert_eq!(device.state.channels, vec![false, false, false]);

        assert!(registry.apply_state(0x0099, change).await.is_none());
    }

    #[test]
    fn test_state_change_clamps_and_decodes() {
        assert_eq!(
            StateChange::from_status_event(msg_type::BRIGHTNESS_CONTROL, 180),
            Some(StateChange::Brightness(100))
        );
        assert_eq!(
            StateChange::from_status_event(msg_type::CURTAIN_CONTROL, curtain::CLOSE),
            Some(StateChange::Cover(CoverMotion::Closing))
        );
        assert_eq!(StateChange::from_status_event(msg_type::CURTAIN_CONTROL, 9), None);
        assert_eq!(StateChange::from_status_event(0x7F, 1), None);
    }

    #[tokio::test]
    async fn test_events_in_mutation_order() {
        let registry = DeviceRegistry::new();
        let mut rx = registry.subscribe();
        let r = report(1, 8, 0, FrameSource::Discovery);
        let id = r.id();

        registry.upsert(r.clone()).await;
        registry.upsert(r).await;
        registry.remove(&id).await;
        registry.clear().await;

        assert!(matches!(rx.recv().await.unwrap(), RegistryEvent::Added(_)));
        assert!(matches!(rx.recv().await.unwrap(), RegistryEvent::Updated(_)));
        assert!(matches!(rx.recv().await.unwrap(), RegistryEvent::Removed(removed) if removed == id));
        assert!(matches!(rx.recv().await.unwrap(), RegistryEvent::Cleared));
    }

    #[tokio::test]
    async fn test_seed_and_persist() {
        let registry = DeviceRegistry::new();
        let mut r = report(1, 1, 4, FrameSource::DeviceList);
        r.network_address = 0x0020;
        registry.upsert(r).await;
        let persisted = registry.to_persisted().await;

        let restored = DeviceRegistry::new();
        assert_eq!(restored.seed(&persisted).await, 1);
        let device = restored.all().await.remove(0);
        assert_eq!(device.channel_count, 4);
        assert_eq!(device.network_address, 0x0020);
        assert_eq!(device.source, FrameSource::Persisted);
        assert!(!device.online);
        assert_eq!(restored.to_persisted().await, persisted);
    }

    #[tokio::test]
    async fn test_assign_address() {
        let registry = DeviceRegistry::new();
        let r = report(1, 4, 0, FrameSource::Discovery);
        let id = r.id();
        registry.upsert(r).await;
        registry.assign_address(&id, 0x0042).await.unwrap();
        assert_eq!(registry.get_by_address(0x0042).await.unwrap().id, id);
        assert!(registry.get_by_address(0).await.is_none());

        let other = report(2, 4, 0, FrameSource::Discovery);
        let other_id = other.id();
        registry.upsert(other).await;
        registry.assign_address(&other_id, 0x0042).await.unwrap();
        assert_eq!(registry.get_by_address(0x0042).await.unwrap().id, other_id);
        assert_eq!(registry.get(&id).await.unwrap().network_address, 0);
        assert!(registry
            .assign_address(&DeviceId::from("ffffffffffff"), 0x0042)
            .await
            .is_none());
        assert_eq!(registry.get_by_address(0x0042).await.unwrap().id, other_id);
    }

    #[tokio::test]
    async fn test_eight_channel_switch() {
        let registry = DeviceRegistry::new();
        let mut r = report(1, 1, 8, FrameSource::DeviceList);
        r.network_address = 0x0030;
        let id = r.id();
        registry.upsert(r).await;
        assert_eq!(registry.get(&id).await.unwrap().channels().len(), 8);

        let device = registry
            .apply_status(0x0030, msg_type::SWITCH_CONTROL, 0b1000_0010)
            .await
            .unwrap();
        assert_eq!(
            device.state.channels,
            vec![true, false, false, false, false, false, true, false]
        );
        let device = registry.set_channel_state(&id, 8, true).await.unwrap();
        assert_eq!(device.channel_state(8), Some(true));
    }
}
