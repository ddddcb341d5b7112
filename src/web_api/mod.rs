//! WebAPI - HTTP and WebSocket Endpoints
//!
//! ## Responsibilities
//!
//! - WebSocket endpoint feeding the message router
//! - Position polling for external clients
//! - Dispatch history (records, trip files, report photos)

mod routes;

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
        uptime_sec: state.started_at.elapsed().as_secs(),
        connections: state.realtime.connection_count(),
        detection_enabled: state.detection.is_some(),
        detection_queue_depth: state
            .detection
            .as_ref()
            .map(|d| d.queue_depth())
            .unwrap_or(0),
    };

    Json(response)
}
