//! Frame dispatch
//!
//! [`Dispatcher`] owns the timer state of the engine (pending status sync and
//! discovery session) and applies each classified frame to the registry. It
//! never touches the transport; frames it wants sent are returned to the
//! caller in arrival order.

use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::classify::{classify, FrameKind};
use crate::command;
use crate::device::{parse_device_list, parse_discovery, parse_pairing, Device, DeviceId, MacAddress};
use crate::frame::Frame;
use crate::protocol::{opcode, status};
use crate::registry::{DeviceRegistry, StateChange, UpsertOutcome};
use crate::session::{DiscoverySession, SessionStatus};
use crate::sync::SyncScheduler;

/// Gateway details read from info responses
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GatewayInfo {
    pub software_version: Option<String>,
    pub mac: Option<MacAddress>,
    pub device_count: Option<u8>,
}

/// Point-in-time view of everything the engine knows
#[derive(Debug, Clone, Serialize)]
pub struct GatewaySnapshot {
    pub devices: Vec<Device>,
    pub gateway: GatewayInfo,
    pub scanning: bool,
    pub scan_remaining_secs: u64,
    pub discovered: usize,
    pub sync_pending: bool,
}

/// Effects of dispatching one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub kind: FrameKind,
    /// Frames to send, in order
    pub outbound: Vec<Frame>,
    /// Frames no handler consumed, forwarded to listeners
    pub pass_through: Option<Frame>,
}

impl Dispatch {
    fn handled(kind: FrameKind) -> Self {
        Self {
            kind,
            outbound: Vec::new(),
            pass_through: None,
        }
    }
}

pub struct Dispatcher {
    registry: Arc<DeviceRegistry>,
    sync: SyncScheduler,
    session: DiscoverySession,
    gateway: GatewayInfo,
}

impl Dispatcher {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self::with_state(registry, SyncScheduler::default(), DiscoverySession::default())
    }

    pub fn with_state(
        registry: Arc<DeviceRegistry>,
        sync: SyncScheduler,
        session: DiscoverySession,
    ) -> Self {
        Self {
            registry,
            sync,
            session,
            gateway: GatewayInfo::default(),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn gateway_info(&self) -> &GatewayInfo {
        &self.gateway
    }

    pub fn session_status(&self, now: Instant) -> SessionStatus {
        self.session.status(now)
    }

    pub fn sync_pending(&self) -> bool {
        self.sync.is_pending()
    }

    /// Classify a frame and apply it
    pub async fn dispatch(&mut self, frame: Frame, now: Instant) -> Dispatch {
        let kind = classify(&frame);
        trace!(
            opcode = format_args!("0x{:02X}", frame.opcode),
            status = ?frame.status,
            kind = ?kind,
            "Dispatching frame"
        );

        let mut dispatch = Dispatch::handled(kind);
        match kind {
            FrameKind::DiscoveryResponse => self.on_discovery(&frame, &mut dispatch).await,
            FrameKind::DeviceListResponse => self.on_device_list(&frame).await,
            FrameKind::PairingEvent => self.on_pairing(&frame).await,
            FrameKind::ScanResponse => self.on_scan_response(&frame, now),
            FrameKind::GatewayInfoResponse => self.on_gateway_info(&frame),
            FrameKind::DeviceControlResponse
            | FrameKind::SceneControlResponse
            | FrameKind::NodeStatusEvent => self.on_device_control(kind, &frame, now).await,
            FrameKind::Unknown => {
                debug!(
                    opcode = format_args!("0x{:02X}", frame.opcode),
                    status = ?frame.status,
                    len = frame.payload.len(),
                    "Passing through unhandled frame"
                );
                dispatch.pass_through = Some(frame);
            }
        }
        dispatch
    }

    async fn on_discovery(&mut self, frame: &Frame, dispatch: &mut Dispatch) {
        let Some(report) = parse_discovery(&frame.payload) else {
            trace!(len = frame.payload.len(), "Ignoring discovery payload");
            return;
        };
        self.session.on_discovery();

        let mac = report.mac;
        let id = report.id();
        if self.registry.upsert(report).await == UpsertOutcome::Added {
            info!(device = %id, mac = %mac, "Discovered device, adding to whitelist");
            dispatch.outbound.push(command::encode_add_device(&mac, 0));
        }
    }

    async fn on_device_list(&mut self, frame: &Frame) {
        // A full list supersedes any pending sync
        if self.sync.cancel() {
            debug!("Device list received, pending sync cancelled");
        }

        if frame.payload.is_empty() {
            debug!("End of device list");
            return;
        }
        let reports = parse_device_list(&frame.payload);
        if reports.is_empty() {
            warn!(len = frame.payload.len(), "Malformed device-list payload");
            return;
        }
        self.registry.upsert_many(&reports).await;
    }

    async fn on_pairing(&mut self, frame: &Frame) {
        if frame.status_code() == status::PAIRING_FAILED_EVENT {
            warn!(payload = %hex::encode(&frame.payload), "Device pairing failed");
            return;
        }
        let Some((mac, address)) = parse_pairing(&frame.payload) else {
            warn!(len = frame.payload.len(), "Malformed pairing event");
            return;
        };
        let id = DeviceId::from_mac(&mac);
        // The gateway reuses addresses of devices it has since forgotten
        if let Some(previous) = self.registry.get_by_address(address).await {
            if previous.id != id {
                warn!(
                    device = %id,
                    previous = %previous.id,
                    addr = format_args!("0x{:04X}", address),
                    "Mesh address reassigned"
                );
            }
        }
        if self.registry.assign_address(&id, address).await.is_none() {
            warn!(device = %id, "Pairing event for unknown device");
        }
    }

    fn on_scan_response(&mut self, frame: &Frame, now: Instant) {
        if frame.status_code() != status::SUCCESS {
            warn!(
                opcode = format_args!("0x{:02X}", frame.opcode),
                status = frame.status_code(),
                "Scan command rejected"
            );
            return;
        }
        if frame.opcode == opcode::RESP_STOP_SCAN {
            if self.session.stop() {
                info!("Device scan stopped");
            }
        } else {
            info!("Device scan started");
            self.session.start(now);
        }
    }

    fn on_gateway_info(&mut self, frame: &Frame) {
        if frame.status_code() != status::SUCCESS {
            return;
        }
        let payload = &frame.payload;
        match frame.opcode {
            opcode::RESP_READ_SOFTWARE_VERSION if payload.len() >= 4 => {
                let version = format!("{}.{}.{}.{}", payload[0], payload[1], payload[2], payload[3]);
                info!(version = %version, "Gateway software version");
                self.gateway.software_version = Some(version);
            }
            opcode::RESP_READ_MAC_ADDRESS => {
                if let Some(mac) = MacAddress::from_slice(payload) {
                    info!(mac = %mac, "Gateway MAC address");
                    self.gateway.mac = Some(mac);
                }
            }
            opcode::RESP_READ_DEVICE_COUNT if !payload.is_empty() => {
                info!(count = payload[0], "Gateway device count");
                self.gateway.device_count = Some(payload[0]);
            }
            _ => debug!(
                opcode = format_args!("0x{:02X}", frame.opcode),
                len = payload.len(),
                "Short gateway info payload"
            ),
        }
    }

    async fn on_device_control(&mut self, kind: FrameKind, frame: &Frame, now: Instant) {
        if self.sync.on_device_control(now) {
            debug!(kind = ?kind, "Status sync scheduled");
        }

        let Some(address) = frame.network_address() else {
            return;
        };
        let updated = match (kind, frame.payload.get(2..4)) {
            (FrameKind::NodeStatusEvent, Some(&[msg, value])) => {
                self.registry.apply_status(address, msg, value).await
            }
            (FrameKind::DeviceControlResponse, Some(&[msg, param])) => {
                if frame.status_code() != status::SUCCESS {
                    warn!(status = frame.status_code(), "Device control failed");
                    return;
                }
                let Some(change) = StateChange::from_control_ack(msg, param) else {
                    return;
                };
                self.registry.apply_state(address, change).await
            }
            _ => return,
        };

        match updated {
            Some(device) => debug!(device = %device.id, "Device state updated"),
            None => debug!(
                addr = format_args!("0x{:04X}", address),
                "No state change applied"
            ),
        }
    }

    /// Frames due from timers: a status sync and/or a stop-scan on expiry
    pub fn poll(&mut self, now: Instant) -> Vec<Frame> {
        let mut due = Vec::new();
        if self.sync.poll(now) {
            debug!("Status sync firing");
            due.push(command::encode_read_device_list());
        }
        if self.session.poll(now) {
            info!("Device scan timed out");
            due.push(command::encode_stop_scan());
        }
        due
    }

    /// Earliest instant at which [`poll`](Self::poll) has work
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.sync.deadline(), self.session.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Open a discovery session and return the start-scan frame
    pub fn begin_scan(&mut self, now: Instant) -> Frame {
        self.session.start(now);
        command::encode_start_scan()
    }

    /// Close the discovery session and return the stop-scan frame
    pub fn end_scan(&mut self) -> Frame {
        self.session.stop();
        command::encode_stop_scan()
    }

    /// Explicit full resync: drop any pending sync and read the list now
    pub fn full_resync(&mut self) -> Frame {
        self.sync.cancel();
        command::encode_read_device_list()
    }

    /// Drop all timer state, used whenever the link goes away
    pub fn reset(&mut self) {
        self.sync.cancel();
        self.session.stop();
    }

    pub async fn snapshot(&self, now: Instant) -> GatewaySnapshot {
        let session = self.session.status(now);
        GatewaySnapshot {
            devices: self.registry.all().await,
            gateway: self.gateway.clone(),
            scanning: session.scanning,
            scan_remaining_secs: session.remaining_secs,
            discovered: session.discovered,
            sync_pending: self.sync.is_pending(),
        }
    }
}
