//! EV Dispatch Hub
//!
//! Main entry point: wires the hub, engines and collaborators, then serves.

use ev_dispatch_hub::{
    crossroad_engine::{load_crossroad_table, CrossroadEngine},
    detection_worker::{
        spawn_detection_worker, DetectionConfig, FrameTracker, QueueConfig, RemoteTracker,
    },
    dispatch_log::{DispatchRepository, InMemoryDispatchRepository, MySqlDispatchRepository},
    message_router::MessageRouter,
    object_store::{LocalObjectStore, ObjectStore},
    position_cache::PositionCache,
    realtime_hub::RealtimeHub,
    state::{AppConfig, AppState},
    trip_recorder::TripRecorder,
    web_api,
};
use sqlx::mysql::MySqlPoolOptions;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Detect+track request timeout
const TRACKER_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for the detection queue to drain
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

async fn connect_dispatch_repository(config: &AppConfig) -> anyhow::Result<Arc<dyn DispatchRepository>> {
    let Some(url) = &config.database_url else {
        tracing::warn!("DATABASE_URL not set, dispatch records kept in memory");
        return Ok(Arc::new(InMemoryDispatchRepository::new()));
    };

    let pool = MySqlPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(url)
        .await?;
    tracing::info!("Database connected");

    let repo = MySqlDispatchRepository::new(pool);
    repo.ensure_schema().await?;
    Ok(Arc::new(repo))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ev_dispatch_hub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting EV Dispatch Hub v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::default();
    tracing::info!(
        database = config.database_url.is_some(),
        crossroad_csv = %config.crossroad_csv.display(),
        storage_dir = %config.storage_dir.display(),
        recording_dir = %config.recording_dir.display(),
        tracker_url = ?config.tracker_url,
        frame_sample_every = config.frame_sample_every,
        "Configuration loaded"
    );

    let table = load_crossroad_table(&config.crossroad_csv)?;
    let crossroads = Arc::new(CrossroadEngine::with_table(table));
    tracing::info!(crossroads = crossroads.table_len(), "Crossroad table loaded");

    let dispatches = connect_dispatch_repository(&config).await?;

    let store: Arc<dyn ObjectStore> = Arc::new(LocalObjectStore::new(config.storage_dir.clone()).await?);
    let trips = Arc::new(TripRecorder::new(config.recording_dir.clone(), store.clone()));

    let realtime = Arc::new(RealtimeHub::new());
    let positions = Arc::new(PositionCache::new());

    let mut router = MessageRouter::new(
        realtime.clone(),
        positions.clone(),
        crossroads,
        dispatches.clone(),
        trips,
    );

    // Detection worker: only with a detect+track service
    let (detection, worker) = match &config.tracker_url {
        Some(url) => {
            let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();
            let queue = QueueConfig {
                sample_every: config.frame_sample_every,
                ..QueueConfig::default()
            };
            let url = url.clone();
            let (handle, join) = spawn_detection_worker(
                DetectionConfig::default(),
                queue,
                store.clone(),
                events_tx,
                tokio::runtime::Handle::current(),
                move || {
                    let tracker: Box<dyn FrameTracker> =
                        Box::new(RemoteTracker::new(url, TRACKER_TIMEOUT)?);
                    Ok(tracker)
                },
            )?;
            realtime.clone().spawn_worker_pump(events_rx);

            let handle = Arc::new(handle);
            router = router.with_detection(handle.clone());
            (Some(handle), Some(join))
        }
        None => {
            tracing::warn!("TRACKER_URL not set, video frames are mirrored only");
            (None, None)
        }
    };

    let state = AppState {
        config: config.clone(),
        realtime,
        router: Arc::new(router),
        positions,
        dispatches,
        store,
        detection,
        started_at: Instant::now(),
    };

    let app = web_api::create_router(state.clone())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");

    // Dropping the last handle closes the queue; the worker drains it and exits
    drop(state);
    if let Some(join) = worker {
        let drained =
            tokio::time::timeout(WORKER_DRAIN_TIMEOUT, tokio::task::spawn_blocking(move || join.join()))
                .await;
        match drained {
            Ok(_) => tracing::info!("Detection worker stopped"),
            Err(_) => tracing::warn!("Detection worker still busy at exit"),
        }
    }

    Ok(())
}
