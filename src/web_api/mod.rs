//! Query Surface - HTTP API + Streaming Channel
//!
//! ## Responsibilities
//!
//! - Request/response endpoints over live state, history, alerts, registry
//! - Command and OTA mutations routed through the dispatcher/orchestrator
//! - WebSocket endpoint feeding clients from the fan-out hub
//!
//! Handlers never mutate device state directly. Reads run under a 2 s
//! deadline, writes under 5 s; deadline hits surface as structured errors.

mod routes;
mod ws;

pub use routes::create_router;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::models::HealthResponse;
use crate::state::AppState;

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        bus_connected: state.bus.is_connected(),
        store_healthy: state.writer.healthy(),
        device_count: state.store.device_count().await,
    };
    Json(response)
}
