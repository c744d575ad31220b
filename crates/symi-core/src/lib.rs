//! Symi Core - Protocol engine for the Symi mesh gateway
//!
//! This crate provides everything between raw gateway bytes and a live view
//! of the mesh:
//! - Frame codec with resynchronization over a continuous byte stream
//! - Device model with the fixed type to capability table
//! - Device registry with change notifications and JSON persistence
//! - Frame classification and dispatch, including the debounced status sync
//!   and the discovery session
//! - Command encoding for control and gateway management requests

pub mod classify;
pub mod command;
pub mod device;
pub mod dispatch;
pub mod frame;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;
pub mod sync;

pub use classify::{classify, is_device_control_frame, FrameKind};
pub use command::{CommandError, CoverCommand};
pub use device::{
    Capability, ChannelHandle, CoverMotion, Device, DeviceId, DeviceReport, DeviceState,
    DeviceType, FrameSource, MacAddress,
};
pub use dispatch::{Dispatch, Dispatcher, GatewayInfo, GatewaySnapshot};
pub use frame::{Decoded, Frame, FrameCodec, FrameCorrupt, FrameError};
pub use registry::{DeviceRegistry, RegistryError, RegistryEvent, StateChange, UpsertOutcome};
pub use session::{DiscoverySession, SessionStatus, SCAN_TIMEOUT};
pub use store::{PersistedDevice, PersistedDevices, StoreError};
pub use sync::{SyncScheduler, SYNC_DEBOUNCE};
