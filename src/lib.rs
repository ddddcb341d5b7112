//! EV Dispatch Hub Library
//!
//! Live telemetry hub for emergency vehicles
//!
//! ## Architecture
//!
//! 1. RealtimeHub - WebSocket connection registry and broadcast
//! 2. MessageRouter - Inbound message dispatch per type
//! 3. PositionCache - Latest fixes, active routes, third-party tracks
//! 4. CrossroadEngine - Expected crossroads and approach state machine
//! 5. RouteMatcher - Same road / same direction test
//! 6. DetectionWorker - Frame queue, tracking, dwell and report capture
//! 7. DispatchLog - Dispatch records
//! 8. TripRecorder - Per-dispatch CSV log and frame recording
//! 9. ObjectStore - Upload target for logs, recordings and photos
//! 10. WebAPI - WebSocket, position polling and history endpoints

pub mod crossroad_engine;
pub mod detection_worker;
pub mod dispatch_log;
pub mod error;
pub mod geo_utils;
pub mod message_router;
pub mod models;
pub mod object_store;
pub mod position_cache;
pub mod realtime_hub;
pub mod route_matcher;
pub mod state;
pub mod trip_recorder;
pub mod web_api;

pub use error::{Error, Result};
pub use state::AppState;
