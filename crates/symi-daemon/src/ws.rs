//! WebSocket handler for real-time updates

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use symi_core::{Device, Frame, GatewaySnapshot, RegistryEvent};

use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    #[serde(rename = "snapshot")]
    Snapshot(GatewaySnapshot),
    #[serde(rename = "device_added")]
    DeviceAdded(Device),
    #[serde(rename = "device_updated")]
    DeviceUpdated(Device),
    #[serde(rename = "device_removed")]
    DeviceRemoved { id: String },
    #[serde(rename = "devices_cleared")]
    DevicesCleared,
    /// A frame no handler consumed
    #[serde(rename = "frame")]
    Frame {
        opcode: u8,
        status: Option<u8>,
        payload: String,
    },
    #[serde(rename = "pong")]
    Pong,
}

impl From<RegistryEvent> for WsMessage {
    fn from(event: RegistryEvent) -> Self {
        match event {
            RegistryEvent::Added(device) => Self::DeviceAdded(device),
            RegistryEvent::Updated(device) => Self::DeviceUpdated(device),
            RegistryEvent::Removed(id) => Self::DeviceRemoved { id: id.0 },
            RegistryEvent::Cleared => Self::DevicesCleared,
        }
    }
}

impl From<Frame> for WsMessage {
    fn from(frame: Frame) -> Self {
        Self::Frame {
            opcode: frame.opcode,
            status: frame.status,
            payload: hex::encode(&frame.payload),
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut registry_events = state.registry().subscribe();
    let mut frames = state.gateway.subscribe_frames();

    info!("WebSocket client connected");

    // Subscribed before the snapshot, so no change is missed
    let snapshot = WsMessage::Snapshot(state.gateway.snapshot().await);
    if let Ok(json) = serde_json::to_string(&snapshot) {
        if sender.send(Message::Text(json.into())).await.is_err() {
            return;
        }
    }

    loop {
        let msg = tokio::select! {
            event = registry_events.recv() => match event {
                Ok(event) => WsMessage::from(event),
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Registry event channel lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },

            frame = frames.recv() => match frame {
                Ok(frame) => WsMessage::from(frame),
                Err(RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Frame channel lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },

            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                    continue;
                }
                Some(Ok(Message::Text(text))) if text.as_str() == "ping" => WsMessage::Pong,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => continue,
            },
        };

        match serde_json::to_string(&msg) {
            Ok(json) => {
                if sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize WebSocket message"),
        }
    }

    info!("WebSocket client disconnected");
}
