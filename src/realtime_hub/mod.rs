//! RealtimeHub - WebSocket Connection Registry and Event Fan-Out
//!
//! ## Responsibilities
//!
//! - Connection registry (connection id -> outbound channel, bound vehicle id)
//! - Broadcast of derived events to every live connection
//! - Direct replies to a single connection (route acknowledgment)
//! - Draining detection worker events into broadcasts
//!
//! Each connection owns a bounded outbound channel drained by its own send
//! task, so a broadcast never waits on a slow socket. When the channel is full,
//! frame events are dropped for that connection and a control event
//! disconnects it.

use crate::crossroad_engine::{CrossroadTransition, CrossroadStatus, ExpectedCrossroad, TurnKind};
use crate::detection_worker::{DebugTrack, WorkerEvent};
use crate::geo_utils::Compass;
use crate::models::LatLng;
use chrono::Local;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Outbound messages buffered per connection
pub const OUTBOUND_CAPACITY: usize = 64;

/// Server -> client broadcast events
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    AmbulanceStart {
        car: String,
        start_time: String,
    },
    AmbulanceArrival {
        car: String,
        start_time: Option<String>,
        arrival_time: String,
    },
    AmbulanceRoute {
        car: String,
        route_points: Vec<LatLng>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    AmbulanceExpectedCrossroads {
        car: String,
        crossroads: Vec<ExpectedCrossroad>,
    },
    AmbulanceCurrent {
        car: String,
        current: LatLng,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
    },
    AmbulanceCrossroadApproach {
        car: String,
        crossroad_id: i64,
        crossroad_name: String,
        turn: TurnKind,
        in_dir: Option<Compass>,
        out_dir: Option<Compass>,
        explain: String,
        distance: f64,
        timestamp: String,
    },
    AmbulanceCrossroadArrived(CrossroadPassage),
    AmbulanceCrossroadPassed(CrossroadPassage),
    NormalcarCurrent {
        car: String,
        current: LatLng,
        same_road: bool,
        same_dir: bool,
        same_road_and_dir: bool,
        ref_ambulance_car: Option<String>,
    },
    Video {
        car: String,
        frame: String,
    },
    YoloDebug {
        car: String,
        frame: String,
        hud_time: String,
        gps: Option<LatLng>,
        tracks: Vec<DebugTrack>,
        reported_ids: Vec<i64>,
    },
    YoloReport {
        car: String,
        track_id: i64,
        key: String,
        uploaded: bool,
    },
}

/// Arrived / passed payload
#[derive(Debug, Clone, Serialize)]
pub struct CrossroadPassage {
    pub car: String,
    pub crossroad_id: i64,
    pub crossroad_name: String,
    pub distance: f64,
    pub timestamp: String,
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

impl HubEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::AmbulanceStart { .. } => "ambulance_start",
            HubEvent::AmbulanceArrival { .. } => "ambulance_arrival",
            HubEvent::AmbulanceRoute { .. } => "ambulance_route",
            HubEvent::AmbulanceExpectedCrossroads { .. } => "ambulance_expected_crossroads",
            HubEvent::AmbulanceCurrent { .. } => "ambulance_current",
            HubEvent::AmbulanceCrossroadApproach { .. } => "ambulance_crossroad_approach",
            HubEvent::AmbulanceCrossroadArrived(_) => "ambulance_crossroad_arrived",
            HubEvent::AmbulanceCrossroadPassed(_) => "ambulance_crossroad_passed",
            HubEvent::NormalcarCurrent { .. } => "normalcar_current",
            HubEvent::Video { .. } => "video",
            HubEvent::YoloDebug { .. } => "yolo_debug",
            HubEvent::YoloReport { .. } => "yolo_report",
        }
    }

    /// Video and annotated frames; droppable under backpressure
    pub fn is_frame(&self) -> bool {
        matches!(self, HubEvent::Video { .. } | HubEvent::YoloDebug { .. })
    }

    /// Event for a crossroad status change; `None` for transitions that are not announced
    pub fn from_transition(car: &str, t: &CrossroadTransition) -> Option<Self> {
        let c = &t.crossroad;
        let timestamp = Local::now().to_rfc3339();
        let passage = || CrossroadPassage {
            car: car.to_string(),
            crossroad_id: c.id,
            crossroad_name: c.name.clone(),
            distance: round1(t.distance_m),
            timestamp: timestamp.clone(),
        };

        match t.to {
            CrossroadStatus::Approaching => Some(HubEvent::AmbulanceCrossroadApproach {
                car: car.to_string(),
                crossroad_id: c.id,
                crossroad_name: c.name.clone(),
                turn: c.turn,
                in_dir: c.in_dir,
                out_dir: c.out_dir,
                explain: c.explain.clone(),
                distance: round1(t.distance_m),
                timestamp: timestamp.clone(),
            }),
            CrossroadStatus::Arrived => Some(HubEvent::AmbulanceCrossroadArrived(passage())),
            CrossroadStatus::Passed => Some(HubEvent::AmbulanceCrossroadPassed(passage())),
            CrossroadStatus::Pending => None,
        }
    }
}

impl From<WorkerEvent> for HubEvent {
    fn from(event: WorkerEvent) -> Self {
        match event {
            WorkerEvent::Debug(d) => HubEvent::YoloDebug {
                car: d.car,
                frame: d.frame,
                hud_time: d.hud_time,
                gps: d.gps,
                tracks: d.tracks,
                reported_ids: d.reported_ids,
            },
            WorkerEvent::Reported {
                car,
                track_id,
                key,
                uploaded,
            } => HubEvent::YoloReport {
                car,
                track_id,
                key,
                uploaded,
            },
        }
    }
}

/// Direct reply to the sender of a `route` message
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Ack {
    Success { status: &'static str },
    Error { error: String },
}

impl Ack {
    pub fn success() -> Self {
        Ack::Success { status: "success" }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Ack::Error { error: msg.into() }
    }
}

/// Client connection
struct ClientConnection {
    id: Uuid,
    vehicle: Option<String>,
    tx: mpsc::Sender<String>,
}

/// RealtimeHub instance
pub struct RealtimeHub {
    connections: RwLock<HashMap<Uuid, ClientConnection>>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    /// Create new RealtimeHub
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new client
    pub async fn register(&self) -> (Uuid, mpsc::Receiver<String>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let conn = ClientConnection {
            id,
            vehicle: None,
            tx,
        };

        {
            let mut connections = self.connections.write().await;
            connections.insert(id, conn);
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);

        tracing::info!(connection_id = %id, "Client connected");

        (id, rx)
    }

    /// Unregister a client; its vehicle binding goes with it
    pub async fn unregister(&self, id: &Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.remove(id) {
            self.connection_count.fetch_sub(1, Ordering::Relaxed);
            tracing::info!(
                connection_id = %id,
                vehicle = ?conn.vehicle,
                "Client disconnected"
            );
        }
    }

    /// Bind a connection to the vehicle it reports for
    pub async fn bind_vehicle(&self, id: &Uuid, car: &str) {
        if let Some(conn) = self.connections.write().await.get_mut(id) {
            conn.vehicle = Some(car.to_string());
            tracing::info!(connection_id = %id, car = %car, "Connection bound to vehicle");
        }
    }

    /// Vehicle bound to a connection
    pub async fn vehicle_for(&self, id: &Uuid) -> Option<String> {
        self.connections
            .read()
            .await
            .get(id)
            .and_then(|c| c.vehicle.clone())
    }

    /// Broadcast an event to all clients
    pub async fn broadcast(&self, event: &HubEvent) {
        let json = match serde_json::to_string(event) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(event = event.name(), error = %e, "Failed to serialize event");
                return;
            }
        };

        let mut lagging = Vec::new();
        {
            let connections = self.connections.read().await;
            if event.is_frame() {
                tracing::trace!(event = event.name(), client_count = connections.len(), "Broadcasting frame");
            } else {
                tracing::debug!(event = event.name(), client_count = connections.len(), "Broadcasting event");
            }

            for conn in connections.values() {
                match conn.tx.try_send(json.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) if event.is_frame() => {
                        tracing::warn!(connection_id = %conn.id, event = event.name(), "Outbound queue full, frame dropped");
                    }
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(connection_id = %conn.id, event = event.name(), "Outbound queue full, disconnecting client");
                        lagging.push(conn.id);
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::warn!(connection_id = %conn.id, "Failed to send message: channel closed");
                    }
                }
            }
        }

        for id in lagging {
            self.unregister(&id).await;
        }
    }

    /// Send a message to one connection
    pub async fn send_to<T: Serialize>(&self, id: &Uuid, message: &T) {
        let json = match serde_json::to_string(message) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize message");
                return;
            }
        };

        let connections = self.connections.read().await;
        if let Some(conn) = connections.get(id) {
            if let Err(e) = conn.tx.try_send(json) {
                tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send message");
            }
        }
    }

    /// Get connection count
    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }

    /// Broadcast detection worker events until the worker side closes
    pub fn spawn_worker_pump(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<WorkerEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                self.broadcast(&HubEvent::from(event)).await;
            }
            tracing::info!("Worker event pump stopped");
        })
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}
