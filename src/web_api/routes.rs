//! API Routes

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::NaiveDateTime;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::services::ServeDir;

use crate::dispatch_log::{report_photo_keys, trip_log_key, DispatchRecord, DispatchRepository};
use crate::error::Error;
use crate::models::{format_dispatch_time, ApiResponse, FILE_TS_FORMAT};
use crate::object_store::ObjectStore;
use crate::state::AppState;

/// Create API router
pub fn create_router(state: AppState) -> Router {
    let storage = ServeDir::new(&state.config.storage_dir);

    Router::new()
        // Health
        .route("/healthz", get(super::health_check))
        // Position polling
        .route("/position", get(get_position))
        .route("/api/ambulance/position", get(get_position))
        // Dispatch history
        .route("/api/dispatches", get(list_dispatches))
        .route("/api/dispatches/:car/:start_ts/images", get(list_dispatch_images))
        // Uploaded files
        .nest_service("/storage", storage)
        // WebSocket
        .route("/ws", get(websocket_handler))
        .with_state(state)
}

// ========================================
// Position Handlers
// ========================================

#[derive(Debug, Deserialize)]
struct PositionQuery {
    car: Option<String>,
}

/// GET /position?car=ID
async fn get_position(
    State(state): State<AppState>,
    Query(query): Query<PositionQuery>,
) -> impl IntoResponse {
    match query.car.filter(|c| !c.is_empty()) {
        Some(car) => match state.positions.position(&car).await {
            Some(fix) => Json(ApiResponse::success(fix)).into_response(),
            None => Error::NotFound(format!("no position for {}", car)).into_response(),
        },
        None => Json(ApiResponse::success(state.positions.all_positions().await)).into_response(),
    }
}

// ========================================
// Dispatch History Handlers
// ========================================

/// Dispatch record as listed on the history page
#[derive(Debug, Serialize)]
struct DispatchSummary {
    car_no: String,
    start_time: String,
    arrival_time: Option<String>,
    media_file: String,
    video_url: String,
    csv_url: Option<String>,
    has_images: bool,
}

async fn summarize(state: &AppState, record: DispatchRecord) -> DispatchSummary {
    let csv_key = trip_log_key(&record.car_no, &record.start_time);
    let csv_url = match state.store.exists(&csv_key).await {
        Ok(true) => Some(format!("/storage/{}", csv_key)),
        Ok(false) => None,
        Err(e) => {
            tracing::warn!(key = %csv_key, error = %e, "Failed to check trip log");
            None
        }
    };

    let has_images = match report_photo_keys(state.store.as_ref(), &record.car_no, &record.start_time).await {
        Ok(keys) => !keys.is_empty(),
        Err(e) => {
            tracing::warn!(car = %record.car_no, error = %e, "Failed to list report photos");
            false
        }
    };

    DispatchSummary {
        start_time: format_dispatch_time(&record.start_time),
        arrival_time: record.arrival_time.as_ref().map(format_dispatch_time),
        video_url: format!("/storage/videos/{}", record.media_file),
        csv_url,
        has_images,
        car_no: record.car_no,
        media_file: record.media_file,
    }
}

/// GET /api/dispatches
async fn list_dispatches(State(state): State<AppState>) -> impl IntoResponse {
    let records = match state.dispatches.list().await {
        Ok(r) => r,
        Err(e) => return e.into_response(),
    };

    let mut summaries = Vec::with_capacity(records.len());
    for record in records {
        summaries.push(summarize(&state, record).await);
    }

    Json(ApiResponse::success(summaries)).into_response()
}

#[derive(Debug, Serialize)]
struct DispatchImages {
    car_no: String,
    start_time: String,
    images: Vec<String>,
}

/// GET /api/dispatches/:car/:start_ts/images
async fn list_dispatch_images(
    State(state): State<AppState>,
    Path((car, start_ts)): Path<(String, String)>,
) -> impl IntoResponse {
    let start = match NaiveDateTime::parse_from_str(&start_ts, FILE_TS_FORMAT) {
        Ok(t) => t,
        Err(e) => {
            return Error::Parse(format!("invalid start timestamp '{}': {}", start_ts, e))
                .into_response()
        }
    };

    match state.dispatches.find(&car, start).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return Error::NotFound(format!("dispatch {} at {}", car, start_ts)).into_response()
        }
        Err(e) => return e.into_response(),
    }

    match report_photo_keys(state.store.as_ref(), &car, &start).await {
        Ok(images) => Json(ApiResponse::success(DispatchImages {
            car_no: car,
            start_time: format_dispatch_time(&start),
            images,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

// ========================================
// WebSocket Handler
// ========================================

/// WebSocket upgrade handler
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Wait for either connection task to end and abort the other
async fn join_first(mut send_task: JoinHandle<()>, mut recv_task: JoinHandle<()>) {
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

/// Handle WebSocket connection
async fn handle_websocket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let (conn_id, mut rx) = state.realtime.register().await;

    // Forward hub messages to the socket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    // One inbound message is handled to completion before the next read
    let router = state.router.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => router.handle_text(&conn_id, &text).await,
                Ok(Message::Binary(data)) => {
                    tracing::debug!(connection_id = %conn_id, bytes = data.len(), "Binary message ignored");
                }
                Ok(Message::Close(_)) => {
                    tracing::info!(connection_id = %conn_id, "WebSocket client closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    join_first(send_task, recv_task).await;

    // No implicit arrival: open recordings stay open until an explicit arrival
    state.realtime.unregister(&conn_id).await;
}
