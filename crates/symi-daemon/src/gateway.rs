//! Gateway engine
//!
//! Owns the link to one gateway. A reader task decodes inbound frames, feeds
//! them to the [`Dispatcher`] in arrival order and fires its timers; commands
//! from the API go out through the shared writer. [`Gateway::run`] keeps the
//! link up, reconnecting with capped exponential backoff.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use symi_core::command::{self, CoverCommand};
use symi_core::{
    CommandError, Device, DeviceId, DeviceRegistry, Dispatcher, Frame, FrameCodec, FrameError,
    GatewaySnapshot, MacAddress,
};
use symi_transport::{BoxedStream, Transport, TransportConfig, TransportError};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type FrameWriter = FramedWrite<WriteHalf<BoxedStream>, FrameCodec>;
type FrameReader = FramedRead<ReadHalf<BoxedStream>, FrameCodec>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("gateway not connected")]
    NotConnected,
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to write frame: {0}")]
    Frame(#[from] FrameError),
    #[error("gave up after {attempts} failed connection attempts")]
    ReconnectExhausted { attempts: u32 },
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Why a reader task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    Cancelled,
    Disconnected,
}

pub struct Gateway {
    registry: Arc<DeviceRegistry>,
    dispatcher: Mutex<Dispatcher>,
    writer: Mutex<Option<FrameWriter>>,
    /// Frames no handler consumed
    frames: broadcast::Sender<Frame>,
    cancel: CancellationToken,
    /// Wakes the reader when timer state changes outside it
    wake: Notify,
}

impl Gateway {
    pub fn new(registry: Arc<DeviceRegistry>) -> Arc<Self> {
        let (frames, _) = broadcast::channel(100);
        Arc::new(Self {
            dispatcher: Mutex::new(Dispatcher::new(registry.clone())),
            registry,
            writer: Mutex::new(None),
            frames,
            cancel: CancellationToken::new(),
            wake: Notify::new(),
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub async fn is_connected(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Subscribe to frames that were passed through unhandled
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.frames.subscribe()
    }

    /// Take over an open transport and start its reader task
    pub async fn attach(self: &Arc<Self>, transport: Transport) -> Result<JoinHandle<ReaderExit>> {
        let peer = transport.peer().to_string();
        let (read_half, write_half) = transport.split()?;
        *self.writer.lock().await = Some(FramedWrite::new(write_half, FrameCodec::new()));

        let reader = FramedRead::new(read_half, FrameCodec::new());
        info!(peer = %peer, "Gateway attached");
        Ok(tokio::spawn(self.clone().read_loop(reader)))
    }

    async fn read_loop(self: Arc<Self>, mut reader: FrameReader) -> ReaderExit {
        let exit = loop {
            let deadline = self.dispatcher.lock().await.next_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break ReaderExit::Cancelled,
                item = reader.next() => match item {
                    Some(Ok(frame)) => self.handle_frame(frame).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Gateway read failed");
                        break ReaderExit::Disconnected;
                    }
                    None => {
                        info!("Gateway closed the connection");
                        break ReaderExit::Disconnected;
                    }
                },
                _ = sleep_until_deadline(deadline) => self.fire_timers().await,
                _ = self.wake.notified() => {}
            }
        };

        let codec = reader.decoder();
        debug!(
            corrupt_frames = codec.corrupt_frames(),
            skipped_bytes = codec.skipped_bytes(),
            "Reader stopped"
        );
        *self.writer.lock().await = None;
        // Timers belong to the link that just went away
        self.dispatcher.lock().await.reset();
        exit
    }

    async fn handle_frame(&self, frame: Frame) {
        let dispatch = self.dispatcher.lock().await.dispatch(frame, Instant::now()).await;
        for frame in dispatch.outbound {
            if let Err(e) = self.send(frame).await {
                warn!(error = %e, "Failed to send follow-up frame");
            }
        }
        if let Some(frame) = dispatch.pass_through {
            let _ = self.frames.send(frame);
        }
    }

    async fn fire_timers(&self) {
        let due = self.dispatcher.lock().await.poll(Instant::now());
        for frame in due {
            if let Err(e) = self.send(frame).await {
                warn!(error = %e, "Failed to send scheduled frame");
            }
        }
    }

    /// Write one frame to the gateway.
    ///
    /// A lost link is reported as `TransportError::Disconnected`.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(EngineError::NotConnected)?;
        debug!(
            opcode = format_args!("0x{:02X}", frame.opcode),
            len = frame.payload.len(),
            "Sending frame"
        );
        sink.send(frame).await.map_err(|e| match e {
            FrameError::Io(io) => EngineError::Transport(TransportError::from_io(io)),
            other => EngineError::Frame(other),
        })
    }

    /// Keep a link to the gateway open until shutdown.
    ///
    /// Each fresh connection requests the gateway info and the device list.
    /// After `max_attempts` consecutive failed opens (0 = never give up) the
    /// engine stops with `ReconnectExhausted`.
    pub async fn run(self: &Arc<Self>, config: TransportConfig, max_attempts: u32) -> Result<()> {
        let mut failures = 0u32;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            match Transport::open(&config).await {
                Ok(transport) => {
                    failures = 0;
                    backoff = INITIAL_BACKOFF;
                    let reader = self.attach(transport).await?;
                    self.request_initial_state().await;
                    match reader.await {
                        Ok(ReaderExit::Cancelled) => return Ok(()),
                        Ok(ReaderExit::Disconnected) => {
                            warn!(peer = %config, "Gateway disconnected, reconnecting")
                        }
                        Err(e) => warn!(error = %e, "Reader task failed"),
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(
                        peer = %config,
                        error = %e,
                        attempt = failures,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Failed to open gateway link"
                    );
                    if max_attempts > 0 && failures >= max_attempts {
                        return Err(EngineError::ReconnectExhausted { attempts: failures });
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn request_initial_state(&self) {
        let frames = [
            command::encode_read_version(),
            command::encode_read_mac(),
            command::encode_read_device_count(),
            command::encode_read_device_list(),
        ];
        for frame in frames {
            if let Err(e) = self.send(frame).await {
                warn!(error = %e, "Failed to request gateway state");
                return;
            }
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected().await {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }

    /// Open a discovery session and ask the gateway to scan
    pub async fn start_scan(&self) -> Result<()> {
        self.ensure_connected().await?;
        let frame = self.dispatcher.lock().await.begin_scan(Instant::now());
        self.wake.notify_one();
        self.send(frame).await
    }

    pub async fn stop_scan(&self) -> Result<()> {
        let frame = self.dispatcher.lock().await.end_scan();
        self.wake.notify_one();
        self.send(frame).await
    }

    /// Read the whole device list now, dropping any pending sync
    pub async fn refresh(&self) -> Result<()> {
        let frame = self.dispatcher.lock().await.full_resync();
        self.wake.notify_one();
        self.send(frame).await
    }

    /// Reset the gateway. It forgets every paired device, so the registry
    /// is cleared as well.
    pub async fn factory_reset(&self) -> Result<()> {
        warn!("Requesting gateway factory reset");
        self.send(command::encode_factory_reset()).await?;
        self.registry.clear().await;
        Ok(())
    }

    pub async fn reboot(&self) -> Result<()> {
        info!("Requesting gateway reboot");
        self.send(command::encode_reboot_gateway()).await
    }

    async fn device(&self, id: &DeviceId) -> Result<Device> {
        self.registry
            .get(id)
            .await
            .ok_or_else(|| EngineError::UnknownDevice(id.clone()))
    }

    pub async fn set_channel(&self, id: &DeviceId, channel: u8, on: bool) -> Result<()> {
        let device = self.device(id).await?;
        let frame = command::encode_channel_set(&device, channel, on)?;
        self.send(frame).await
    }

    pub async fn set_all_channels(&self, id: &DeviceId, on: bool) -> Result<()> {
        let device = self.device(id).await?;
        self.send(command::encode_all_channels(&device, on)?).await
    }

    pub async fn set_brightness(&self, id: &DeviceId, percent: u8) -> Result<()> {
        let device = self.device(id).await?;
        self.send(command::encode_brightness(&device, percent)?).await
    }

    pub async fn set_color_temp(&self, id: &DeviceId, percent: u8) -> Result<()> {
        let device = self.device(id).await?;
        self.send(command::encode_color_temp(&device, percent)?).await
    }

    pub async fn control_cover(&self, id: &DeviceId, cover: CoverCommand) -> Result<()> {
        let device = self.device(id).await?;
        self.send(command::encode_cover(&device, cover)?).await
    }

    pub async fn set_cover_position(&self, id: &DeviceId, percent: u8) -> Result<()> {
        let device = self.device(id).await?;
        self.send(command::encode_cover_position(&device, percent)?).await
    }

    pub async fn query_status(&self, id: &DeviceId, msg: u8) -> Result<()> {
        let device = self.device(id).await?;
        self.send(command::encode_status_query(&device, msg)?).await
    }

    pub async fn trigger_scene(&self, scene_id: u8) -> Result<()> {
        self.send(command::encode_scene(scene_id)).await
    }

    /// Whitelist a device by MAC; address 0 lets the gateway pick one
    pub async fn add_device(&self, mac: &MacAddress, address: u16) -> Result<()> {
        self.send(command::encode_add_device(mac, address)).await
    }

    /// Remove a device from the gateway and the registry
    pub async fn delete_device(&self, id: &DeviceId) -> Result<()> {
        let device = self.device(id).await?;
        self.send(command::encode_delete_device(&device)?).await?;
        self.registry.remove(id).await;
        Ok(())
    }

    pub async fn snapshot(&self) -> GatewaySnapshot {
        self.dispatcher.lock().await.snapshot(Instant::now()).await
    }

    /// Stop the reader and drop all timer state
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.dispatcher.lock().await.reset();
        info!("Gateway engine shut down");
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
