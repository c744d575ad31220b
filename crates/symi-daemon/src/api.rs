//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use symi_core::protocol::msg_type;
use symi_core::{CommandError, CoverCommand, DeviceId, MacAddress};
use symi_transport::{list_serial_ports, TransportError};

use crate::gateway::EngineError;
use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

fn error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotConnected
        | EngineError::ReconnectExhausted { .. }
        | EngineError::Transport(TransportError::Disconnected | TransportError::Closed) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        EngineError::UnknownDevice(_) => StatusCode::NOT_FOUND,
        EngineError::Command(CommandError::Unaddressed(_)) => StatusCode::CONFLICT,
        EngineError::Command(_) => StatusCode::BAD_REQUEST,
        EngineError::Transport(_) | EngineError::Frame(_) => StatusCode::BAD_GATEWAY,
    }
}

/// Map a command outcome to a response
fn sent(result: Result<(), EngineError>) -> Response {
    match result {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "status": "sent" })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Command failed");
            (error_status(&e), Json(ApiError::new(e.to_string()))).into_response()
        }
    }
}

/// List all known devices
pub async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.devices().await)
}

/// Get a specific device by ID
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.get_device(&id).await {
        Some(device) => Json(device).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError::new("Device not found")),
        )
            .into_response(),
    }
}

/// Registry, gateway info and scan state in one view
pub async fn get_snapshot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gateway.snapshot().await)
}

pub async fn start_scan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Device scan requested");
    sent(state.gateway.start_scan().await)
}

pub async fn stop_scan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sent(state.gateway.stop_scan().await)
}

pub async fn factory_reset(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sent(state.gateway.factory_reset().await)
}

pub async fn reboot(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sent(state.gateway.reboot().await)
}

/// Re-read the full device list from the gateway
pub async fn refresh_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    sent(state.gateway.refresh().await)
}

#[derive(Deserialize)]
pub struct SwitchRequest {
    on: bool,
}

pub async fn set_channel(
    State(state): State<Arc<AppState>>,
    Path((id, channel)): Path<(String, u8)>,
    Json(req): Json<SwitchRequest>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    info!(device = %id, channel, on = req.on, "Channel switch requested");
    sent(state.gateway.set_channel(&id, channel, req.on).await)
}

pub async fn set_all_channels(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SwitchRequest>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    sent(state.gateway.set_all_channels(&id, req.on).await)
}

/// Percentage value, clamped to 100 by the encoder
#[derive(Deserialize)]
pub struct LevelRequest {
    value: u8,
}

pub async fn set_brightness(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<LevelRequest>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    sent(state.gateway.set_brightness(&id, req.value).await)
}

pub async fn set_color_temp(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<LevelRequest>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    sent(state.gateway.set_color_temp(&id, req.value).await)
}

#[derive(Deserialize)]
pub struct CoverRequest {
    command: CoverCommand,
}

pub async fn control_cover(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CoverRequest>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    sent(state.gateway.control_cover(&id, req.command).await)
}

pub async fn set_cover_position(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<LevelRequest>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    sent(state.gateway.set_cover_position(&id, req.value).await)
}

#[derive(Deserialize)]
pub struct QueryRequest {
    /// Message type to query, defaults to a full status query
    #[serde(default)]
    msg_type: Option<u8>,
}

/// Ask one device to report its state
pub async fn query_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<QueryRequest>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    let msg = req.msg_type.unwrap_or(msg_type::STATUS_QUERY);
    sent(state.gateway.query_status(&id, msg).await)
}

pub async fn remove_device(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = DeviceId::from(id.as_str());
    info!(device = %id, "Device removal requested");
    sent(state.gateway.delete_device(&id).await)
}

#[derive(Deserialize)]
pub struct AddDeviceRequest {
    mac: MacAddress,
    /// Mesh address to assign; 0 lets the gateway choose
    #[serde(default)]
    address: u16,
}

pub async fn add_device(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AddDeviceRequest>,
) -> impl IntoResponse {
    info!(mac = %req.mac, "Manual device add requested");
    sent(state.gateway.add_device(&req.mac, req.address).await)
}

pub async fn trigger_scene(
    State(state): State<Arc<AppState>>,
    Path(scene_id): Path<u8>,
) -> impl IntoResponse {
    sent(state.gateway.trigger_scene(scene_id).await)
}

/// Scan the local networks for gateways
pub async fn list_gateways(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.scanner.scan_local() {
        Ok(scan) => Json(scan.collect().await).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(e.to_string())),
        )
            .into_response(),
    }
}

pub async fn list_ports() -> impl IntoResponse {
    Json(list_serial_ports())
}

/// Current configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use symi_core::FrameError;

    #[test]
    fn test_error_status_mapping() {
        let id = DeviceId::from("a4c138000001");
        assert_eq!(
            error_status(&EngineError::NotConnected),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&EngineError::UnknownDevice(id.clone())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&EngineError::Command(CommandError::InvalidChannel {
                device: id.clone(),
                channel: 7,
                channel_count: 2,
            })),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&EngineError::Command(CommandError::Unaddressed(id))),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&EngineError::Transport(TransportError::Disconnected)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            error_status(&EngineError::Frame(FrameError::PayloadTooLarge {
                size: 300,
                max: 255
            })),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_request_bodies() {
        let req: AddDeviceRequest =
            serde_json::from_str(r#"{ "mac": "A4:C1:38:00:00:01" }"#).unwrap();
        assert_eq!(req.address, 0);

        let req: CoverRequest = serde_json::from_str(r#"{ "command": "stop" }"#).unwrap();
        assert_eq!(req.command, CoverCommand::Stop);

        let req: QueryRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.msg_type, None);
    }
}
