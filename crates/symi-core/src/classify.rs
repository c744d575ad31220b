//! Frame classification
//!
//! Only frames that report an actual device state change count as
//! device-control. Everything in the list/scan/query family is excluded so the
//! engine's own read-device-list responses can never schedule another sync.

use serde::Serialize;

use crate::frame::Frame;
use crate::protocol::{opcode, status};

/// Semantic kind of an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    /// Scan started or stopped
    ScanResponse,
    /// A device answered the scan
    DiscoveryResponse,
    /// One or more device-list entries, or the end-of-list marker
    DeviceListResponse,
    /// Auto pairing finished
    PairingEvent,
    /// Control command acknowledged
    DeviceControlResponse,
    SceneControlResponse,
    /// Device reported a state change on its own
    NodeStatusEvent,
    /// Software version, MAC or device count
    GatewayInfoResponse,
    Unknown,
}

impl FrameKind {
    /// Frames that represent an actual device state change
    pub fn is_device_control(&self) -> bool {
        matches!(
            self,
            Self::DeviceControlResponse | Self::SceneControlResponse | Self::NodeStatusEvent
        )
    }
}

pub fn classify(frame: &Frame) -> FrameKind {
    // Request-layout frames are our own traffic echoed back
    let Some(code) = frame.status else {
        return FrameKind::Unknown;
    };

    match (frame.opcode, code) {
        (opcode::RESP_SCAN, status::SUCCESS) => FrameKind::ScanResponse,
        (opcode::RESP_SCAN, status::SCAN_DISCOVERY_EVENT) => FrameKind::DiscoveryResponse,
        (opcode::RESP_STOP_SCAN, _) => FrameKind::ScanResponse,
        (opcode::RESP_DEVICE_LIST, status::SUCCESS) => FrameKind::DeviceListResponse,
        (
            opcode::RESP_DEVICE_LIST,
            status::PAIRING_SUCCESS_EVENT | status::PAIRING_FAILED_EVENT,
        ) => FrameKind::PairingEvent,
        (opcode::RESP_DEVICE_CONTROL, _) => FrameKind::DeviceControlResponse,
        (opcode::RESP_SCENE_CONTROL, _) => FrameKind::SceneControlResponse,
        (opcode::EVENT_NODE_NOTIFICATION, status::NODE_STATUS_EVENT) => FrameKind::NodeStatusEvent,
        (
            opcode::RESP_READ_SOFTWARE_VERSION
            | opcode::RESP_READ_MAC_ADDRESS
            | opcode::RESP_READ_DEVICE_COUNT,
            _,
        ) => FrameKind::GatewayInfoResponse,
        _ => FrameKind::Unknown,
    }
}

pub fn is_device_control_frame(frame: &Frame) -> bool {
    classify(frame).is_device_control()
}
