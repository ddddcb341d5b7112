//! MessageRouter - Inbound Message Dispatch
//!
//! ## Responsibilities
//!
//! - Parse inbound text frames into `InboundMessage`
//! - One handler per message type, each with its own error boundary
//! - Feed the position cache, crossroad engine, trip recorder and detection queue
//! - Broadcast derived events through the hub
//!
//! Handlers run to completion before the connection's next frame is read.

pub mod types;

pub use types::{normalize_route, parse_inbound, Coord, InboundMessage, PositionInput, RoutePoint};

use crate::crossroad_engine::CrossroadEngine;
use crate::detection_worker::{DetectionHandle, EnqueueOutcome, FrameJob};
use crate::dispatch_log::{DispatchRecord, DispatchRepository};
use crate::error::{Error, Result};
use crate::models::{format_dispatch_time, parse_dispatch_time};
use crate::position_cache::PositionCache;
use crate::realtime_hub::{Ack, HubEvent, RealtimeHub};
use crate::route_matcher::{check_same_road_and_direction, MatcherConfig, RoadMatch};
use crate::trip_recorder::TripRecorder;
use std::sync::Arc;
use uuid::Uuid;

/// MessageRouter instance
pub struct MessageRouter {
    hub: Arc<RealtimeHub>,
    positions: Arc<PositionCache>,
    crossroads: Arc<CrossroadEngine>,
    matcher: MatcherConfig,
    dispatches: Arc<dyn DispatchRepository>,
    trips: Arc<TripRecorder>,
    detection: Option<Arc<DetectionHandle>>,
}

impl MessageRouter {
    /// Create new MessageRouter
    pub fn new(
        hub: Arc<RealtimeHub>,
        positions: Arc<PositionCache>,
        crossroads: Arc<CrossroadEngine>,
        dispatches: Arc<dyn DispatchRepository>,
        trips: Arc<TripRecorder>,
    ) -> Self {
        Self {
            hub,
            positions,
            crossroads,
            matcher: MatcherConfig::default(),
            dispatches,
            trips,
            detection: None,
        }
    }

    pub fn with_matcher(mut self, matcher: MatcherConfig) -> Self {
        self.matcher = matcher;
        self
    }

    /// Enable frame hand-off to the detection worker
    pub fn with_detection(mut self, detection: Arc<DetectionHandle>) -> Self {
        self.detection = Some(detection);
        self
    }

    pub fn detection(&self) -> Option<&Arc<DetectionHandle>> {
        self.detection.as_ref()
    }

    /// Handle one text frame from a connection; never fails
    pub async fn handle_text(&self, conn: &Uuid, text: &str) {
        let message = match parse_inbound(text) {
            Ok(m) => m,
            Err((kind, e)) => {
                tracing::warn!(
                    connection_id = %conn,
                    kind = ?kind,
                    error = %e,
                    "Inbound message dropped"
                );
                if kind.as_deref() == Some("route") {
                    self.hub.send_to(conn, &Ack::error(e.to_string())).await;
                }
                return;
            }
        };

        let kind = message.kind();
        if let Err(e) = self.dispatch(conn, message).await {
            tracing::error!(connection_id = %conn, kind = kind, error = %e, "Message handler failed");
        }
    }

    async fn dispatch(&self, conn: &Uuid, message: InboundMessage) -> Result<()> {
        match message {
            InboundMessage::Start { car, start_time } => self.on_start(conn, &car, &start_time).await,
            InboundMessage::Arrival {
                car,
                start_time,
                arrival_time,
            } => {
                self.on_arrival(&car, start_time.as_deref(), &arrival_time)
                    .await
            }
            InboundMessage::Route {
                car,
                route_points,
                duration,
            } => self.on_route(conn, &car, &route_points, duration.as_ref()).await,
            InboundMessage::Current {
                car,
                current,
                speed,
            } => self.on_current(&car, &current, speed.as_ref()).await,
            InboundMessage::NormalCurrent { car, current } => {
                self.on_normal_current(&car, &current).await
            }
            InboundMessage::Video { car, frame } => self.on_video(conn, car, frame).await,
        }
    }

    async fn on_start(&self, conn: &Uuid, car: &str, start_time: &str) -> Result<()> {
        let start = parse_dispatch_time(start_time)?;
        let record = DispatchRecord::started(car, start);

        if let Err(e) = self.dispatches.upsert_start(&record).await {
            tracing::warn!(car = %car, error = %e, "Failed to store dispatch start");
        }

        self.hub.bind_vehicle(conn, car).await;

        if let Err(e) = self.trips.start(car, start, &record.media_file).await {
            tracing::warn!(car = %car, error = %e, "Failed to open trip recording");
        }

        if let Some(detection) = &self.detection {
            detection.start_run(car, &start);
        }

        tracing::info!(car = %car, start_time = %format_dispatch_time(&start), "Dispatch started");

        self.hub
            .broadcast(&HubEvent::AmbulanceStart {
                car: car.to_string(),
                start_time: format_dispatch_time(&start),
            })
            .await;
        Ok(())
    }

    async fn on_arrival(
        &self,
        car: &str,
        start_time: Option<&str>,
        arrival_time: &str,
    ) -> Result<()> {
        let arrival = parse_dispatch_time(arrival_time)?;
        let start = start_time.map(parse_dispatch_time).transpose()?;

        let closed = match self.dispatches.mark_arrival(car, start, arrival).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                tracing::warn!(car = %car, "No dispatch record to close");
                None
            }
            Err(e) => {
                tracing::warn!(car = %car, error = %e, "Failed to store dispatch arrival");
                None
            }
        };

        if let Err(e) = self.trips.finish(car, arrival).await {
            tracing::warn!(car = %car, error = %e, "Failed to finalize trip recording");
        }

        self.crossroads.clear(car).await;
        self.positions.clear_route(car).await;

        let start_time = closed.map(|r| r.start_time).or(start);
        tracing::info!(car = %car, arrival_time = %format_dispatch_time(&arrival), "Dispatch arrived");

        self.hub
            .broadcast(&HubEvent::AmbulanceArrival {
                car: car.to_string(),
                start_time: start_time.as_ref().map(format_dispatch_time),
                arrival_time: format_dispatch_time(&arrival),
            })
            .await;
        Ok(())
    }

    async fn on_route(
        &self,
        conn: &Uuid,
        car: &str,
        points: &[RoutePoint],
        duration: Option<&Coord>,
    ) -> Result<()> {
        let parsed = normalize_route(points).and_then(|route| {
            let duration = duration.map(Coord::value).transpose()?;
            match duration {
                Some(d) if !d.is_finite() || d < 0.0 => Err(Error::Validation(format!(
                    "duration must be a non-negative number, got {}",
                    d
                ))),
                _ => Ok((route, duration)),
            }
        });

        let (route, duration) = match parsed {
            Ok(v) => v,
            Err(e) => {
                self.hub.send_to(conn, &Ack::error(e.to_string())).await;
                return Err(e);
            }
        };

        self.positions.set_route(car, route.clone()).await;

        if let Some(secs) = duration {
            self.apply_eta(car, secs).await;
        }

        let crossroads = self.crossroads.plan_route(car, &route).await;

        self.hub.send_to(conn, &Ack::success()).await;
        self.hub
            .broadcast(&HubEvent::AmbulanceRoute {
                car: car.to_string(),
                route_points: route,
                duration,
            })
            .await;
        self.hub
            .broadcast(&HubEvent::AmbulanceExpectedCrossroads {
                car: car.to_string(),
                crossroads,
            })
            .await;
        Ok(())
    }

    /// ETA = latest dispatch start + route duration
    async fn apply_eta(&self, car: &str, duration_secs: f64) {
        let latest = match self.dispatches.latest_for(car).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::debug!(car = %car, "No dispatch record, ETA not set");
                return;
            }
            Err(e) => {
                tracing::warn!(car = %car, error = %e, "Failed to read dispatch record for ETA");
                return;
            }
        };

        let eta = latest.start_time
            + chrono::Duration::milliseconds((duration_secs * 1000.0).round() as i64);
        self.trips.set_eta(car, eta).await;
    }

    async fn on_current(
        &self,
        car: &str,
        current: &PositionInput,
        speed: Option<&Coord>,
    ) -> Result<()> {
        let position = current.resolve()?;
        let speed = speed.map(Coord::value).transpose()?;

        self.positions
            .update_position(car, position.lat, position.lng, speed)
            .await;

        if let Err(e) = self
            .trips
            .log_point(car, position.lat, position.lng, speed)
            .await
        {
            tracing::warn!(car = %car, error = %e, "Failed to write trip log row");
        }

        for transition in self.crossroads.evaluate(car, &position).await {
            if let Some(event) = HubEvent::from_transition(car, &transition) {
                self.hub.broadcast(&event).await;
            }
        }

        self.hub
            .broadcast(&HubEvent::AmbulanceCurrent {
                car: car.to_string(),
                current: position,
                speed,
            })
            .await;
        Ok(())
    }

    async fn on_normal_current(&self, car: &str, current: &PositionInput) -> Result<()> {
        let position = current.resolve()?;
        let track = self.positions.push_track_point(car, position).await;

        let (ref_car, verdict) = match self.positions.first_active_route().await {
            Some((ref_car, route)) => {
                let verdict = check_same_road_and_direction(&route, &track, &self.matcher);
                (Some(ref_car), verdict)
            }
            None => (None, RoadMatch::default()),
        };

        tracing::debug!(
            car = %car,
            ref_car = ?ref_car,
            same_road = verdict.same_road,
            same_dir = verdict.same_dir,
            "Third-party vehicle compared"
        );

        self.hub
            .broadcast(&HubEvent::NormalcarCurrent {
                car: car.to_string(),
                current: position,
                same_road: verdict.same_road,
                same_dir: verdict.same_dir,
                same_road_and_dir: verdict.same_road_and_dir(),
                ref_ambulance_car: ref_car,
            })
            .await;
        Ok(())
    }

    async fn on_video(&self, conn: &Uuid, car: Option<String>, frame: String) -> Result<()> {
        let car = match car.filter(|c| !c.is_empty()) {
            Some(c) => c,
            None => self.hub.vehicle_for(conn).await.ok_or_else(|| {
                Error::Validation("video frame without car and no bound vehicle".to_string())
            })?,
        };
        if frame.is_empty() {
            return Err(Error::Validation("empty video frame".to_string()));
        }

        self.hub
            .broadcast(&HubEvent::Video {
                car: car.clone(),
                frame: frame.clone(),
            })
            .await;

        if let Some(detection) = &self.detection {
            let gps = self.positions.last_coordinates(&car).await;
            let outcome = detection.enqueue(FrameJob {
                car: car.clone(),
                frame: frame.clone(),
                gps,
            });
            if outcome != EnqueueOutcome::Queued {
                tracing::trace!(car = %car, outcome = ?outcome, "Frame not queued for detection");
            }
        }

        if let Err(e) = self.trips.append_frame(&car, &frame).await {
            tracing::warn!(car = %car, error = %e, "Failed to record video frame");
        }
        Ok(())
    }
}
