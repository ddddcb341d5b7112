//! Application state
//!
//! Holds all shared components and state

use crate::detection_worker::DetectionHandle;
use crate::dispatch_log::DispatchRepository;
use crate::message_router::MessageRouter;
use crate::object_store::ObjectStore;
use crate::position_cache::PositionCache;
use crate::realtime_hub::RealtimeHub;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Database URL; in-memory dispatch records when unset
    pub database_url: Option<String>,
    /// Static crossroad table
    pub crossroad_csv: PathBuf,
    /// Root of the filesystem object store
    pub storage_dir: PathBuf,
    /// Local trip CSV / recording files
    pub recording_dir: PathBuf,
    /// Detect+track service; detection disabled when unset
    pub tracker_url: Option<String>,
    /// Keep one of every N video frames for detection
    pub frame_sample_every: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5000),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            crossroad_csv: std::env::var("CROSSROAD_CSV")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("static/crossroad_map/CrossroadMap.csv")),
            storage_dir: std::env::var("STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/ev_dispatch_hub/storage")),
            recording_dir: std::env::var("RECORDING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/var/lib/ev_dispatch_hub/recordings")),
            tracker_url: std::env::var("TRACKER_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            frame_sample_every: std::env::var("FRAME_SAMPLE_EVERY")
                .ok()
                .and_then(|p| p.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(1),
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Application config
    pub config: AppConfig,
    /// RealtimeHub (WebSocket fan-out)
    pub realtime: Arc<RealtimeHub>,
    /// Inbound message dispatch
    pub router: Arc<MessageRouter>,
    /// Latest fixes and active routes
    pub positions: Arc<PositionCache>,
    /// Dispatch records
    pub dispatches: Arc<dyn DispatchRepository>,
    /// Uploaded logs, recordings and report photos
    pub store: Arc<dyn ObjectStore>,
    /// Detection queue, when a tracker is configured
    pub detection: Option<Arc<DetectionHandle>>,
    pub started_at: Instant,
}
