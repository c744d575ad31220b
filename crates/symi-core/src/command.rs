//! Command encoding
//!
//! Turns capability-level intents into request frames. Device control uses
//! the payload `addr (u16 LE) | msg_type | param`.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Capability, Device, DeviceId, MacAddress};
use crate::frame::Frame;
use crate::protocol::{curtain, msg_type, opcode, switch};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("device {device} has no channel {channel} (channels: 1..={channel_count})")]
    InvalidChannel {
        device: DeviceId,
        channel: u8,
        channel_count: u8,
    },
    /// The channel exists but has no switch parameter
    #[error("channel {channel} of device {device} cannot be switched individually")]
    UnaddressableChannel { device: DeviceId, channel: u8 },
    #[error("device {device} does not support {capability:?}")]
    Unsupported {
        device: DeviceId,
        capability: Capability,
    },
    #[error("device {0} has no network address yet")]
    Unaddressed(DeviceId),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Curtain motor command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoverCommand {
    Open,
    Close,
    Stop,
}

fn control(address: u16, msg: u8, param: u8) -> Frame {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u16_le(address);
    payload.put_u8(msg);
    payload.put_u8(param);
    Frame::request(opcode::DEVICE_CONTROL, payload.freeze())
}

fn addressed(device: &Device) -> Result<u16> {
    match device.network_address {
        0 => Err(CommandError::Unaddressed(device.id.clone())),
        addr => Ok(addr),
    }
}

fn require(device: &Device, capability: Capability) -> Result<()> {
    if device.has_capability(capability) {
        Ok(())
    } else {
        Err(CommandError::Unsupported {
            device: device.id.clone(),
            capability,
        })
    }
}

/// Switch one channel of a device on or off.
///
/// `channel` must be in `1..=channel_count`. Single-channel devices use the
/// channel-1 parameters. Channels past the parameter table (7 and 8) can only
/// follow [`encode_all_channels`].
pub fn encode_channel_set(device: &Device, channel: u8, on: bool) -> Result<Frame> {
    if channel == 0 || channel > device.channel_count {
        return Err(CommandError::InvalidChannel {
            device: device.id.clone(),
            channel,
            channel_count: device.channel_count,
        });
    }
    let param = switch::param(channel, on).ok_or_else(|| CommandError::UnaddressableChannel {
        device: device.id.clone(),
        channel,
    })?;
    let address = addressed(device)?;
    Ok(control(address, msg_type::SWITCH_CONTROL, param))
}

/// Switch every channel of a device at once
pub fn encode_all_channels(device: &Device, on: bool) -> Result<Frame> {
    let address = addressed(device)?;
    let param = if on { switch::ALL_ON } else { switch::ALL_OFF };
    Ok(control(address, msg_type::SWITCH_CONTROL, param))
}

/// Brightness in percent, clamped to 0..=100
pub fn encode_brightness(device: &Device, percent: u8) -> Result<Frame> {
    require(device, Capability::Brightness)?;
    let address = addressed(device)?;
    Ok(control(address, msg_type::BRIGHTNESS_CONTROL, percent.min(100)))
}

/// Colour temperature in percent, clamped to 0..=100
pub fn encode_color_temp(device: &Device, percent: u8) -> Result<Frame> {
    require(device, Capability::ColorTemp)?;
    let address = addressed(device)?;
    Ok(control(address, msg_type::COLOR_TEMP_CONTROL, percent.min(100)))
}

pub fn encode_cover(device: &Device, command: CoverCommand) -> Result<Frame> {
    require(device, Capability::Cover)?;
    let address = addressed(device)?;
    let param = match command {
        CoverCommand::Open => curtain::OPEN,
        CoverCommand::Close => curtain::CLOSE,
        CoverCommand::Stop => curtain::STOP,
    };
    Ok(control(address, msg_type::CURTAIN_CONTROL, param))
}

/// Curtain position in percent, clamped to 0..=100
pub fn encode_cover_position(device: &Device, percent: u8) -> Result<Frame> {
    require(device, Capability::Position)?;
    let address = addressed(device)?;
    Ok(control(address, msg_type::CURTAIN_POSITION, percent.min(100)))
}

/// Ask a device to report its state
pub fn encode_status_query(device: &Device, msg: u8) -> Result<Frame> {
    let address = addressed(device)?;
    let mut payload = BytesMut::with_capacity(3);
    payload.put_u16_le(address);
    payload.put_u8(msg);
    Ok(Frame::request(opcode::DEVICE_STATUS_QUERY, payload.freeze()))
}

pub fn encode_scene(scene_id: u8) -> Frame {
    Frame::request(opcode::SCENE_CONTROL, Bytes::copy_from_slice(&[scene_id]))
}

/// Whitelist a discovered device. Address 0 lets the gateway assign one.
pub fn encode_add_device(mac: &MacAddress, address: u16) -> Frame {
    let mut payload = BytesMut::with_capacity(8);
    payload.put_slice(&mac.0);
    payload.put_u16_le(address);
    Frame::request(opcode::ADD_DEVICE, payload.freeze())
}

pub fn encode_delete_device(device: &Device) -> Result<Frame> {
    let address = addressed(device)?;
    Ok(Frame::request(
        opcode::DELETE_DEVICE,
        Bytes::copy_from_slice(&address.to_le_bytes()),
    ))
}

pub fn encode_read_device_list() -> Frame {
    Frame::request(opcode::READ_DEVICE_LIST, Bytes::new())
}

pub fn encode_start_scan() -> Frame {
    Frame::request(opcode::START_SCAN, Bytes::new())
}

pub fn encode_stop_scan() -> Frame {
    Frame::request(opcode::STOP_SCAN, Bytes::new())
}

pub fn encode_factory_reset() -> Frame {
    Frame::request(opcode::FACTORY_RESET, Bytes::new())
}

pub fn encode_reboot_gateway() -> Frame {
    Frame::request(opcode::REBOOT, Bytes::new())
}

pub fn encode_read_version() -> Frame {
    Frame::request(opcode::READ_SOFTWARE_VERSION, Bytes::new())
}

pub fn encode_read_mac() -> Frame {
    Frame::request(opcode::READ_MAC_ADDRESS, Bytes::new())
}

pub fn encode_read_device_count() -> Frame {
    Frame::request(opcode::READ_DEVICE_COUNT, Bytes::new())
}
