//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::future::IntoFuture;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;
use crate::ws;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Registry
        .route("/api/devices", get(api::list_devices).post(api::add_device))
        .route("/api/devices/refresh", post(api::refresh_devices))
        .route(
            "/api/devices/{id}",
            get(api::get_device).delete(api::remove_device),
        )
        .route("/api/snapshot", get(api::get_snapshot))
        // Device commands
        .route("/api/devices/{id}/channels", post(api::set_all_channels))
        .route(
            "/api/devices/{id}/channels/{channel}",
            post(api::set_channel),
        )
        .route("/api/devices/{id}/brightness", post(api::set_brightness))
        .route("/api/devices/{id}/color-temp", post(api::set_color_temp))
        .route("/api/devices/{id}/cover", post(api::control_cover))
        .route("/api/devices/{id}/position", post(api::set_cover_position))
        .route("/api/devices/{id}/query", post(api::query_device))
        .route("/api/scenes/{scene_id}", post(api::trigger_scene))
        // Gateway commands
        .route("/api/scan/start", post(api::start_scan))
        .route("/api/scan/stop", post(api::stop_scan))
        .route("/api/gateway/factory-reset", post(api::factory_reset))
        .route("/api/gateway/reboot", post(api::reboot))
        // Discovery and setup
        .route("/api/gateways", get(api::list_gateways))
        .route("/api/ports", get(api::list_ports))
        .route("/api/config", get(api::get_config))
        // WebSocket for real-time updates
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the web server and the gateway engine until either stops
pub async fn run(state: Arc<AppState>, bind: &str) -> Result<()> {
    let app = router(state.clone());

    let gateway = state.gateway.clone();
    let transport = state.config.transport.to_transport_config();
    let max_attempts = state.config.daemon.max_reconnect_attempts;
    let engine = tokio::spawn(async move { gateway.run(transport, max_attempts).await });

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, "Starting web server");

    tokio::select! {
        served = axum::serve(listener, app).into_future() => served?,
        finished = engine => match finished {
            Ok(Ok(())) => info!("Gateway engine stopped"),
            Ok(Err(e)) => tracing::error!(error = %e, "Gateway engine failed"),
            Err(e) => tracing::error!(error = %e, "Gateway engine task panicked"),
        },
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    state.gateway.shutdown().await;
    Ok(())
}
