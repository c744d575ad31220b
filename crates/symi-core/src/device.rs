//! Device types for tracking mesh nodes behind the gateway

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::trace;

use crate::protocol::{switch, DEVICE_LIST_ENTRY_LEN, DISCOVERY_ENTRY_LEN, SYMI_VENDOR_ID};

/// Unique identifier for a device, the lowercase hex of its MAC address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn from_mac(mac: &MacAddress) -> Self {
        Self(hex::encode(mac.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_ascii_lowercase())
    }
}

/// 6-byte BLE MAC, serialized as `AA:BB:CC:DD:EE:FF`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Read a MAC from the first six bytes of `bytes`
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let mac: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(mac))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MAC address: {0}")]
pub struct InvalidMac(String);

impl FromStr for MacAddress {
    type Err = InvalidMac;

    /// Accepts colon/dash separated or bare hex
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let bytes = hex::decode(&digits).map_err(|_| InvalidMac(s.to_string()))?;
        Self::from_slice(&bytes)
            .filter(|_| bytes.len() == 6)
            .ok_or_else(|| InvalidMac(s.to_string()))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = InvalidMac;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

/// Firmware device type codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    ZeroFireSwitch,
    SingleFireSwitch,
    SmartSocket,
    SmartLight,
    Curtain,
    ScenePanel,
    DoorSensor,
    MotionSensor,
    CardPower,
    Thermostat,
    TempHumidity,
    SceneSwitch,
    VoiceController,
    DoorLock,
    WaterAlarm,
    SmokeAlarm,
    TvBox,
    SingleFireSceneSwitch,
    TransparentModule,
    FiveColorLight,
    TransparentModule74,
    Unknown(u8),
}

impl DeviceType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::ZeroFireSwitch,
            2 => Self::SingleFireSwitch,
            3 => Self::SmartSocket,
            4 => Self::SmartLight,
            5 => Self::Curtain,
            6 => Self::ScenePanel,
            7 => Self::DoorSensor,
            8 => Self::MotionSensor,
            9 => Self::CardPower,
            10 => Self::Thermostat,
            11 => Self::TempHumidity,
            12 => Self::SceneSwitch,
            13 => Self::VoiceController,
            14 => Self::DoorLock,
            15 => Self::WaterAlarm,
            16 => Self::SmokeAlarm,
            17 => Self::TvBox,
            18 => Self::SingleFireSceneSwitch,
            20 => Self::TransparentModule,
            24 => Self::FiveColorLight,
            74 => Self::TransparentModule74,
            other => Self::Unknown(other),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            Self::ZeroFireSwitch => 1,
            Self::SingleFireSwitch => 2,
            Self::SmartSocket => 3,
            Self::SmartLight => 4,
            Self::Curtain => 5,
            Self::ScenePanel => 6,
            Self::DoorSensor => 7,
            Self::MotionSensor => 8,
            Self::CardPower => 9,
            Self::Thermostat => 10,
            Self::TempHumidity => 11,
            Self::SceneSwitch => 12,
            Self::VoiceController => 13,
            Self::DoorLock => 14,
            Self::WaterAlarm => 15,
            Self::SmokeAlarm => 16,
            Self::TvBox => 17,
            Self::SingleFireSceneSwitch => 18,
            Self::TransparentModule => 20,
            Self::FiveColorLight => 24,
            Self::TransparentModule74 => 74,
            Self::Unknown(code) => *code,
        }
    }

    /// Multi-gang switches whose sub type is the number of outputs
    pub fn is_switch_family(&self) -> bool {
        matches!(self, Self::ZeroFireSwitch | Self::SingleFireSwitch)
    }

    /// Fixed capability set for this type
    pub fn capabilities(&self) -> &'static [Capability] {
        use Capability::*;
        match self {
            Self::ZeroFireSwitch | Self::SingleFireSwitch => &[Switch],
            Self::SmartSocket => &[Switch, PowerMonitoring],
            Self::SmartLight => &[Light, Brightness, ColorTemp],
            Self::Curtain => &[Cover, Position],
            Self::ScenePanel => &[SceneControl],
            Self::DoorSensor => &[Door],
            Self::MotionSensor => &[Motion],
            Self::CardPower => &[Switch, CardDetection],
            Self::Thermostat => &[Climate, Temperature, Humidity],
            Self::TempHumidity => &[Temperature, Humidity],
            Self::FiveColorLight => &[Light, Brightness, ColorTemp, Rgb],
            Self::TransparentModule | Self::TransparentModule74 => &[Transparent],
            Self::SceneSwitch
            | Self::VoiceController
            | Self::DoorLock
            | Self::WaterAlarm
            | Self::SmokeAlarm
            | Self::TvBox
            | Self::SingleFireSceneSwitch
            | Self::Unknown(_) => &[],
        }
    }

    /// Number of controllable outputs for a given sub type
    pub fn channel_count(&self, sub_type: u8) -> u8 {
        if self.is_switch_family() {
            sub_type.clamp(1, switch::MAX_OUTPUTS)
        } else {
            1
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ZeroFireSwitch => "Zero-fire switch",
            Self::SingleFireSwitch => "Single-fire switch",
            Self::SmartSocket => "Smart socket",
            Self::SmartLight => "Smart light",
            Self::Curtain => "Curtain controller",
            Self::ScenePanel => "Scene panel",
            Self::DoorSensor => "Door sensor",
            Self::MotionSensor => "Motion sensor",
            Self::CardPower => "Card power switch",
            Self::Thermostat => "Thermostat",
            Self::TempHumidity => "Temperature/humidity sensor",
            Self::SceneSwitch => "Scene switch",
            Self::VoiceController => "Voice controller",
            Self::DoorLock => "Door lock",
            Self::WaterAlarm => "Water leak alarm",
            Self::SmokeAlarm => "Smoke alarm",
            Self::TvBox => "TV box",
            Self::SingleFireSceneSwitch => "Single-fire scene switch",
            Self::TransparentModule | Self::TransparentModule74 => "Transparent module",
            Self::FiveColorLight => "Five-color light",
            Self::Unknown(_) => "Unknown device",
        }
    }
}

/// What a device can do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Switch,
    PowerMonitoring,
    Light,
    Brightness,
    ColorTemp,
    Rgb,
    Cover,
    Position,
    SceneControl,
    Door,
    Motion,
    CardDetection,
    Climate,
    Temperature,
    Humidity,
    Transparent,
}

/// Curtain motor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverMotion {
    Opening,
    Closing,
    Stopped,
}

/// Where a device sighting came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameSource {
    /// Scan discovery event
    Discovery,
    /// Device-list response
    DeviceList,
    /// Auto pairing result
    Pairing,
    /// Loaded from the persisted device list
    Persisted,
}

/// Last-known state of a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    /// On/off per channel, index 0 is channel 1
    pub channels: Vec<bool>,
    pub brightness: Option<u8>,
    pub color_temp: Option<u8>,
    pub cover: Option<CoverMotion>,
    pub position: Option<u8>,
}

/// A device sighting extracted from a frame or the persisted list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    pub mac: MacAddress,
    /// 0 when the device has no mesh address yet
    pub network_address: u16,
    pub device_type: DeviceType,
    pub sub_type: u8,
    pub online: bool,
    pub rssi: Option<i8>,
    pub source: FrameSource,
}

impl DeviceReport {
    pub fn id(&self) -> DeviceId {
        DeviceId::from_mac(&self.mac)
    }

    pub fn channel_count(&self) -> u8 {
        self.device_type.channel_count(self.sub_type)
    }
}

/// One channel-level control handle exposed to the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelHandle {
    pub device: DeviceId,
    /// 1-based
    pub channel: u8,
    pub on: bool,
}

/// A mesh device known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub mac: MacAddress,
    /// Mesh unicast address, 0 until assigned
    pub network_address: u16,
    pub device_type: DeviceType,
    pub sub_type: u8,
    pub channel_count: u8,
    /// Derived from `device_type` at creation
    pub capabilities: Vec<Capability>,
    pub state: DeviceState,
    pub online: bool,
    /// Signal strength from the last scan sighting
    pub rssi: Option<i8>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub source: FrameSource,
}

impl Device {
    /// Create a device from its first sighting
    pub fn from_report(report: &DeviceReport) -> Self {
        let now = Utc::now();
        let channel_count = report.channel_count();
        Self {
            id: report.id(),
            mac: report.mac,
            network_address: report.network_address,
            device_type: report.device_type,
            sub_type: report.sub_type,
            channel_count,
            capabilities: report.device_type.capabilities().to_vec(),
            state: DeviceState {
                channels: vec![false; usize::from(channel_count)],
                ..Default::default()
            },
            online: report.online,
            rssi: report.rssi,
            first_seen: now,
            last_seen: now,
            source: report.source,
        }
    }

    pub fn name(&self) -> String {
        let suffix = self.id.as_str();
        let suffix = &suffix[suffix.len().saturating_sub(4)..];
        if self.channel_count > 1 {
            format!("{} {}ch {}", self.device_type.name(), self.channel_count, suffix)
        } else {
            format!("{} {}", self.device_type.name(), suffix)
        }
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Channel-level handles: `channel_count` for switches, 1 otherwise
    pub fn channels(&self) -> Vec<ChannelHandle> {
        (1..=self.channel_count)
            .map(|channel| ChannelHandle {
                device: self.id.clone(),
                channel,
                on: self.channel_state(channel).unwrap_or(false),
            })
            .collect()
    }

    /// On/off state of a 1-based channel
    pub fn channel_state(&self, channel: u8) -> Option<bool> {
        let idx = usize::from(channel).checked_sub(1)?;
        self.state.channels.get(idx).copied()
    }

    /// Grow the channel table, keeping existing states
    pub(crate) fn resize_channels(&mut self, channel_count: u8) {
        self.channel_count = channel_count;
        self.state.channels.resize(usize::from(channel_count), false);
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Parse the payload of a device-list response into reports.
///
/// The gateway sends one 16-byte entry per frame, some firmware versions pack
/// several. An empty payload marks the end of the list. Trailing bytes that do
/// not form a complete entry are ignored.
///
/// ```text
/// max | index | mac[6] | naddr (LE) | vendor (LE) | type | sub_type | status | resv
/// ```
pub fn parse_device_list(payload: &[u8]) -> Vec<DeviceReport> {
    payload
        .chunks_exact(DEVICE_LIST_ENTRY_LEN)
        .filter_map(|entry| {
            let mac = MacAddress::from_slice(&entry[2..8])?;
            let report = DeviceReport {
                mac,
                network_address: u16::from_le_bytes([entry[8], entry[9]]),
                device_type: DeviceType::from_code(entry[12]),
                sub_type: entry[13],
                online: entry[14] & 0x01 != 0,
                rssi: None,
                source: FrameSource::DeviceList,
            };
            trace!(
                index = entry[1],
                total = entry[0],
                mac = %report.mac,
                addr = format_args!("0x{:04X}", report.network_address),
                device_type = report.device_type.code(),
                "Parsed device-list entry"
            );
            Some(report)
        })
        .collect()
}

/// Parse a scan discovery payload.
///
/// ```text
/// rssi (i8) | mac[6] | vendor (LE) | type | sub_type | ...
/// ```
///
/// Returns `None` for short payloads and foreign vendors.
pub fn parse_discovery(payload: &[u8]) -> Option<DeviceReport> {
    if payload.len() < DISCOVERY_ENTRY_LEN {
        return None;
    }
    let vendor = u16::from_le_bytes([payload[7], payload[8]]);
    if vendor != SYMI_VENDOR_ID {
        trace!(vendor = format_args!("0x{:04X}", vendor), "Ignoring foreign vendor");
        return None;
    }
    Some(DeviceReport {
        mac: MacAddress::from_slice(&payload[1..7])?,
        network_address: 0,
        device_type: DeviceType::from_code(payload[9]),
        sub_type: payload[10],
        online: true,
        rssi: Some(payload[0] as i8),
        source: FrameSource::Discovery,
    })
}

/// Parse an auto-pairing event: `mac[6] | naddr (LE)`
pub fn parse_pairing(payload: &[u8]) -> Option<(MacAddress, u16)> {
    let mac = MacAddress::from_slice(payload)?;
    let addr = payload.get(6..8)?;
    Some((mac, u16::from_le_bytes([addr[0], addr[1]])))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_entry(mac: [u8; 6], addr: u16, device_type: u8, sub_type: u8) -> Vec<u8> {
        let mut entry = vec![2, 0];
        entry.extend_from_slice(&mac);
        entry.extend_from_slice(&addr.to_le_bytes());
        entry.extend_from_slice(&SYMI_VENDOR_ID.to_le_bytes());
        entry.extend_from_slice(&[device_type, sub_type, 0x01, 0x00]);
        entry
    }

    #[test]
    fn test_device_id_from_mac() {
        let mac = MacAddress([0x1A, 0xD0, 0x7D, 0x3D, 0x44, 0x9C]);
        assert_eq!(DeviceId::from_mac(&mac).as_str(), "1ad07d3d449c");
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "1a:d0:7d:3d:44:9c".parse().unwrap();
        assert_eq!(mac.to_string(), "1A:D0:7D:3D:44:9C");
        assert_eq!("1ad07d3d449c".parse::<MacAddress>().unwrap(), mac);
        assert!("1a:d0:7d".parse::<MacAddress>().is_err());
        assert!("zz:d0:7d:3d:44:9c".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_device_type_codes_roundtrip() {
        for code in 0..=u8::MAX {
            assert_eq!(DeviceType::from_code(code).code(), code);
        }
    }

    #[test]
    fn test_capability_table() {
        use Capability::*;
        let table: &[(u8, &[Capability])] = &[
            (1, &[Switch]),
            (2, &[Switch]),
            (3, &[Switch, PowerMonitoring]),
            (4, &[Light, Brightness, ColorTemp]),
            (5, &[Cover, Position]),
            (6, &[SceneControl]),
            (7, &[Door]),
            (8, &[Motion]),
            (9, &[Switch, CardDetection]),
            (10, &[Climate, Temperature, Humidity]),
            (11, &[Temperature, Humidity]),
            (20, &[Transparent]),
            (24, &[Light, Brightness, ColorTemp, Rgb]),
            (74, &[Transparent]),
            (16, &[]),
            (99, &[]),
        ];
        for (code, expected) in table {
            assert_eq!(DeviceType::from_code(*code).capabilities(), *expected, "type {code}");
        }
    }

    #[test]
    fn test_channel_count_per_type() {
        assert_eq!(DeviceType::ZeroFireSwitch.channel_count(0), 1);
        assert_eq!(DeviceType::ZeroFireSwitch.channel_count(4), 4);
        assert_eq!(DeviceType::ZeroFireSwitch.channel_count(8), 8);
        assert_eq!(DeviceType::SingleFireSwitch.channel_count(9), 8);
        assert_eq!(DeviceType::SmartLight.channel_count(4), 1);
        assert_eq!(DeviceType::Curtain.channel_count(0), 1);
    }

    #[test]
    fn test_parse_captured_list_entry() {
        let payload = [
            0x0B, 0x00, 0x1A, 0xD0, 0x7D, 0x3D, 0x44, 0x9C, 0x1B, 0x01, 0x7B, 0x00, 0x14, 0x00,
            0x00, 0x00,
        ];
        let reports = parse_device_list(&payload);
        assert_eq!(reports.len(), 1);
        let report = &reports[0];
        assert_eq!(report.id().as_str(), "1ad07d3d449c");
        assert_eq!(report.network_address, 0x011B);
        assert_eq!(report.device_type, DeviceType::TransparentModule);
        assert!(!report.online);
    }

    #[test]
    fn test_parse_bulk_list_and_end_marker() {
        let mut payload = list_entry([1, 2, 3, 4, 5, 6], 0x0010, 1, 4);
        payload.extend(list_entry([1, 2, 3, 4, 5, 7], 0x0011, 8, 0));
        payload.push(0xFF);
        let reports = parse_device_list(&payload);
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].channel_count(), 4);
        assert_eq!(reports[1].device_type, DeviceType::MotionSensor);
        assert!(reports[1].online);

        assert!(parse_device_list(&[]).is_empty());
    }

    #[test]
    fn test_parse_discovery() {
        let mut payload = vec![0xC4];
        payload.extend_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        payload.extend_from_slice(&SYMI_VENDOR_ID.to_le_bytes());
        payload.extend_from_slice(&[2, 3, 0, 0, 0, 0, 0]);
        let report = parse_discovery(&payload).unwrap();
        assert_eq!(report.rssi, Some(-60));
        assert_eq!(report.device_type, DeviceType::SingleFireSwitch);
        assert_eq!(report.channel_count(), 3);
        assert_eq!(report.source, FrameSource::Discovery);

        payload[7] = 0x00;
        assert!(parse_discovery(&payload).is_none());
        assert!(parse_discovery(&payload[..10]).is_none());
    }

    #[test]
    fn test_parse_pairing() {
        let payload = [1, 2, 3, 4, 5, 6, 0x34, 0x12];
        let (mac, addr) = parse_pairing(&payload).unwrap();
        assert_eq!(mac, MacAddress([1, 2, 3, 4, 5, 6]));
        assert_eq!(addr, 0x1234);
        assert!(parse_pairing(&payload[..7]).is_none());
    }

    #[test]
    fn test_channel_handles() {
        let switch = Device::from_report(&DeviceReport {
            mac: MacAddress([0, 0, 0, 0, 0, 1]),
            network_address: 1,
            device_type: DeviceType::ZeroFireSwitch,
            sub_type: 4,
            online: true,
            rssi: None,
            source: FrameSource::DeviceList,
        });
        let handles = switch.channels();
        assert_eq!(handles.len(), 4);
        assert_eq!(handles[3].channel, 4);
        assert!(handles.iter().all(|h| !h.on));

        let light = Device::from_report(&DeviceReport {
            mac: MacAddress([0, 0, 0, 0, 0, 2]),
            network_address: 2,
            device_type: DeviceType::FiveColorLight,
            sub_type: 3,
            online: true,
            rssi: None,
            source: FrameSource::Discovery,
        });
        assert_eq!(light.channels().len(), 1);
        assert!(light.has_capability(Capability::Rgb));
    }

    #[test]
    fn test_device_name() {
        let device = Device::from_report(&DeviceReport {
            mac: MacAddress([0, 0, 0, 0, 0xAB, 0xCD]),
            network_address: 0,
            device_type: DeviceType::ZeroFireSwitch,
            sub_type: 2,
            online: true,
            rssi: None,
            source: FrameSource::Discovery,
        });
        assert_eq!(device.name(), "Zero-fire switch 2ch abcd");
    }
}
