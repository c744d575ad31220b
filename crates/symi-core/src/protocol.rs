//! Wire constants for the Symi mesh gateway protocol
//!
//! Requests travel host → gateway with opcodes below 0x80. Responses and
//! events use the same opcode with the high bit set and carry a status byte.

/// Start-of-frame marker
pub const HEADER: u8 = 0x53;

/// Largest payload a single frame can carry (length field is one byte)
pub const MAX_PAYLOAD: usize = u8::MAX as usize;

/// Vendor ID reported by Symi devices in scan results
pub const SYMI_VENDOR_ID: u16 = 0x007B;

/// Default TCP port of the gateway's serial bridge
pub const DEFAULT_TCP_PORT: u16 = 8899;

/// Port probed during LAN discovery
pub const DISCOVERY_PORT: u16 = 4196;

/// Fixed serial line speed
pub const SERIAL_BAUD_RATE: u32 = 115_200;

/// Request and response opcodes
pub mod opcode {
    pub const READ_BLE_NAME: u8 = 0x01;
    pub const READ_SOFTWARE_VERSION: u8 = 0x02;
    pub const READ_MAC_ADDRESS: u8 = 0x03;
    pub const READ_MESH_NETKEY: u8 = 0x04;
    pub const FACTORY_RESET: u8 = 0x05;
    pub const REBOOT: u8 = 0x06;
    pub const START_SCAN: u8 = 0x10;
    pub const STOP_SCAN: u8 = 0x11;
    /// Read device list, or add a device when a MAC is supplied
    pub const READ_DEVICE_LIST: u8 = 0x12;
    pub const ADD_DEVICE: u8 = 0x12;
    pub const DELETE_DEVICE: u8 = 0x13;
    pub const CLEAR_ALL_DEVICES: u8 = 0x14;
    pub const READ_DEVICE_COUNT: u8 = 0x15;
    pub const SCENE_CONFIG: u8 = 0x20;
    pub const SCENE_DELETE: u8 = 0x21;
    pub const DEVICE_CONTROL: u8 = 0x30;
    pub const SCENE_CONTROL: u8 = 0x31;
    pub const DEVICE_STATUS_QUERY: u8 = 0x32;

    pub const EVENT_NODE_NOTIFICATION: u8 = 0x80;
    pub const RESP_READ_BLE_NAME: u8 = 0x81;
    pub const RESP_READ_SOFTWARE_VERSION: u8 = 0x82;
    pub const RESP_READ_MAC_ADDRESS: u8 = 0x83;
    pub const RESP_READ_MESH_NETKEY: u8 = 0x84;
    pub const RESP_FACTORY_RESET: u8 = 0x85;
    pub const RESP_REBOOT: u8 = 0x86;
    pub const RESP_SCAN: u8 = 0x90;
    pub const RESP_STOP_SCAN: u8 = 0x91;
    pub const RESP_DEVICE_LIST: u8 = 0x92;
    pub const RESP_DELETE_DEVICE: u8 = 0x93;
    pub const RESP_CLEAR_ALL_DEVICES: u8 = 0x94;
    pub const RESP_READ_DEVICE_COUNT: u8 = 0x95;
    pub const RESP_SCENE_CONFIG: u8 = 0xA0;
    pub const RESP_SCENE_DELETE: u8 = 0xA1;
    pub const RESP_DEVICE_CONTROL: u8 = 0xB0;
    pub const RESP_SCENE_CONTROL: u8 = 0xB1;
    pub const RESP_DEVICE_STATUS_QUERY: u8 = 0xB2;

    /// Opcodes the host sends. Anything else below 0x80 is line noise.
    pub const REQUESTS: &[u8] = &[
        READ_BLE_NAME,
        READ_SOFTWARE_VERSION,
        READ_MAC_ADDRESS,
        READ_MESH_NETKEY,
        FACTORY_RESET,
        REBOOT,
        START_SCAN,
        STOP_SCAN,
        READ_DEVICE_LIST,
        DELETE_DEVICE,
        CLEAR_ALL_DEVICES,
        READ_DEVICE_COUNT,
        SCENE_CONFIG,
        SCENE_DELETE,
        DEVICE_CONTROL,
        SCENE_CONTROL,
        DEVICE_STATUS_QUERY,
    ];

    /// Responses to list, scan, configuration and query requests.
    /// None of these report a device state change.
    pub const QUERY_FAMILY: &[u8] = &[
        RESP_READ_BLE_NAME,
        RESP_READ_SOFTWARE_VERSION,
        RESP_READ_MAC_ADDRESS,
        RESP_READ_MESH_NETKEY,
        RESP_FACTORY_RESET,
        RESP_REBOOT,
        RESP_SCAN,
        RESP_STOP_SCAN,
        RESP_DEVICE_LIST,
        RESP_DELETE_DEVICE,
        RESP_CLEAR_ALL_DEVICES,
        RESP_READ_DEVICE_COUNT,
        RESP_SCENE_CONFIG,
        RESP_SCENE_DELETE,
        RESP_DEVICE_STATUS_QUERY,
    ];

    /// Whether an opcode uses the response layout (with a status byte)
    pub const fn is_response(op: u8) -> bool {
        op >= EVENT_NODE_NOTIFICATION
    }
}

/// Status byte values carried by response frames
pub mod status {
    pub const SUCCESS: u8 = 0x00;
    pub const ERROR: u8 = 0x01;
    pub const SCAN_DISCOVERY_EVENT: u8 = 0x02;
    pub const PAIRING_SUCCESS_EVENT: u8 = 0x03;
    pub const PAIRING_FAILED_EVENT: u8 = 0x04;
    pub const NODE_ACK_EVENT: u8 = 0x05;
    pub const NODE_STATUS_EVENT: u8 = 0x06;
}

/// Message types inside device control and status payloads
pub mod msg_type {
    pub const STATUS_QUERY: u8 = 0x00;
    pub const SWITCH_CONTROL: u8 = 0x02;
    pub const BRIGHTNESS_CONTROL: u8 = 0x03;
    pub const COLOR_TEMP_CONTROL: u8 = 0x04;
    pub const CURTAIN_CONTROL: u8 = 0x05;
    pub const CURTAIN_POSITION: u8 = 0x06;
}

/// Switch control parameters, indexed by channel
pub mod switch {
    pub const ALL_OFF: u8 = 0x05;
    pub const ALL_ON: u8 = 0x0A;

    /// `(off, on)` parameter pairs for channels 1..=6
    pub const CHANNEL_PARAMS: [(u8, u8); 6] = [
        (0x01, 0x02),
        (0x03, 0x04),
        (0x06, 0x07),
        (0x08, 0x09),
        (0x0B, 0x0C),
        (0x0D, 0x0E),
    ];

    /// Highest channel the control table can address
    pub const MAX_CHANNELS: u8 = CHANNEL_PARAMS.len() as u8;

    /// Most outputs a switch reports in its sub type
    pub const MAX_OUTPUTS: u8 = 8;

    /// Parameter byte for switching one channel. `channel` is 1-based.
    pub fn param(channel: u8, on: bool) -> Option<u8> {
        let (off_param, on_param) = *CHANNEL_PARAMS.get(usize::from(channel).checked_sub(1)?)?;
        Some(if on { on_param } else { off_param })
    }

    /// Reverse lookup of a single-channel parameter into `(channel, on)`
    pub fn decode_param(param: u8) -> Option<(u8, bool)> {
        CHANNEL_PARAMS
            .iter()
            .enumerate()
            .find_map(|(idx, &(off_param, on_param))| {
                let channel = idx as u8 + 1;
                if param == on_param {
                    Some((channel, true))
                } else if param == off_param {
                    Some((channel, false))
                } else {
                    None
                }
            })
    }
}

/// Curtain control parameters
pub mod curtain {
    pub const OPEN: u8 = 0x01;
    pub const CLOSE: u8 = 0x02;
    pub const STOP: u8 = 0x03;
}

/// Length of one device-list entry in a 0x92 payload
pub const DEVICE_LIST_ENTRY_LEN: usize = 16;

/// Minimum length of a scan discovery payload
pub const DISCOVERY_ENTRY_LEN: usize = 16;
