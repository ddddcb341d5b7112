//! DetectionWorker - Frame Detection, Track Merge and Yield-Violation Reports
//!
//! ## Responsibilities
//!
//! - Bounded frame queue fed by the hub without blocking (drop on overload)
//! - Single dedicated consumer thread running detect+track serially
//! - Per-track centred dwell, best frame, IoU identity merge
//! - Report photo upload after sustained centring, once per track
//! - Debug frames handed back to the hub over a channel
//!
//! ## Threading
//!
//! The consumer is a plain OS thread. Async collaborators (object storage) are
//! driven through a runtime `Handle`; events reach the hub through an unbounded
//! channel drained by the hub's own task.

mod annotate;
mod tracker;
mod tracks;

pub use annotate::{decode_frame, encode_jpeg, render_debug, render_report, DebugBox};
pub use tracker::{FrameTracker, RemoteTracker, ScriptedTracker, TrackResponse, TrackedBox};
pub use tracks::{BoxCoords, Observation, ReportCapture, TrackKey, TrackRegistry, TrackState};

use crate::error::{Error, Result};
use crate::models::{
    decode_frame_payload, normalize_vehicle_id, LatLng, DISPATCH_TIME_FORMAT, FILE_TS_FORMAT,
};
use crate::object_store::{upload_with_retry, ObjectStore, RetryPolicy};
use base64::Engine;
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

/// Detection thresholds and output settings
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Centre band as fractions of frame width (exclusive bounds)
    pub center_min: f64,
    pub center_max: f64,
    pub conf_threshold: f32,
    pub min_width: i32,
    pub min_height: i32,
    /// Merge a new id into a prior track when IoU is strictly above this
    pub merge_iou: f64,
    pub report_dwell_secs: f64,
    pub report_width: u32,
    pub report_height: u32,
    pub report_quality: u8,
    pub debug_quality: u8,
    pub image_prefix: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            center_min: 0.4,
            center_max: 0.6,
            conf_threshold: 0.3,
            min_width: 60,
            min_height: 60,
            merge_iou: 0.5,
            report_dwell_secs: 10.0,
            report_width: 640,
            report_height: 640,
            report_quality: 90,
            debug_quality: 70,
            image_prefix: "images".to_string(),
        }
    }
}

/// Queue sizing and admission policy
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub capacity: usize,
    /// Frames are dropped once depth exceeds this
    pub soft_limit: usize,
    /// Keep one frame out of every N
    pub sample_every: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 200,
            soft_limit: 50,
            sample_every: 1,
        }
    }
}

/// Immutable unit of work on the detection queue
#[derive(Debug, Clone)]
pub struct FrameJob {
    pub car: String,
    /// Base64 JPEG as received
    pub frame: String,
    /// Last known position at enqueue time
    pub gps: Option<LatLng>,
}

/// Per-track entry of a debug event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugTrack {
    pub track_id: i64,
    pub confidence: f32,
    pub centered: bool,
    pub dwell_secs: f64,
    pub width: i32,
    pub height: i32,
}

/// Annotated frame for observers
#[derive(Debug, Clone)]
pub struct DebugFrame {
    pub car: String,
    /// Base64 JPEG
    pub frame: String,
    pub hud_time: String,
    pub gps: Option<LatLng>,
    pub tracks: Vec<DebugTrack>,
    pub reported_ids: Vec<i64>,
}

/// Events the worker hands back to the hub
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Debug(DebugFrame),
    Reported {
        car: String,
        track_id: i64,
        key: String,
        uploaded: bool,
    },
}

/// Result of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Skipped by input sampling
    Sampled,
    /// Depth above the soft limit
    Overloaded,
    Full,
    /// Worker gone
    Closed,
}

/// State shared by the hub side and the worker thread
#[derive(Debug)]
struct SharedTracks {
    registry: TrackRegistry,
    /// vehicle id -> dispatch start, `YYYYmmdd_HHMMSS`
    run_starts: HashMap<String, String>,
}

type Shared = Arc<Mutex<SharedTracks>>;

fn lock(shared: &Shared) -> std::sync::MutexGuard<'_, SharedTracks> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hub-side handle: enqueue frames, reset tracks on a new dispatch
pub struct DetectionHandle {
    tx: mpsc::Sender<FrameJob>,
    shared: Shared,
    queue: QueueConfig,
    counter: AtomicU64,
}

impl DetectionHandle {
    /// Non-blocking enqueue with sampling and backpressure
    pub fn enqueue(&self, job: FrameJob) -> EnqueueOutcome {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        if n % self.queue.sample_every.max(1) != 0 {
            return EnqueueOutcome::Sampled;
        }

        let depth = self.queue_depth();
        if depth > self.queue.soft_limit {
            tracing::warn!(car = %job.car, depth = depth, "Detection queue overloaded, frame dropped");
            return EnqueueOutcome::Overloaded;
        }

        match self.tx.try_send(job) {
            Ok(()) => EnqueueOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(job)) => {
                tracing::warn!(car = %job.car, "Detection queue full, frame dropped");
                EnqueueOutcome::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Jobs waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Record the dispatch start used in report names and drop the vehicle's tracks
    pub fn start_run(&self, car: &str, start_time: &NaiveDateTime) {
        let ts = start_time.format(FILE_TS_FORMAT).to_string();
        let mut shared = lock(&self.shared);
        let cleared = shared.registry.reset_vehicle(car);
        shared.run_starts.insert(car.to_string(), ts.clone());
        tracing::info!(car = %car, run_start = %ts, cleared_tracks = cleared, "Detection run started");
    }

    /// Reported track ids of a vehicle
    pub fn reported_ids(&self, car: &str) -> Vec<i64> {
        lock(&self.shared).registry.reported_ids(car)
    }
}

/// Create the queue, the handle and an idle worker
pub fn detection_channel(
    config: DetectionConfig,
    queue: QueueConfig,
    store: Arc<dyn ObjectStore>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    runtime: Handle,
) -> (DetectionHandle, mpsc::Receiver<FrameJob>, WorkerParts) {
    let (tx, rx) = mpsc::channel(queue.capacity.max(1));
    let shared = Arc::new(Mutex::new(SharedTracks {
        registry: TrackRegistry::new(config.merge_iou, config.report_dwell_secs),
        run_starts: HashMap::new(),
    }));

    let handle = DetectionHandle {
        tx,
        shared: shared.clone(),
        queue,
        counter: AtomicU64::new(0),
    };

    let parts = WorkerParts {
        config,
        shared,
        store,
        retry: RetryPolicy::default(),
        events,
        runtime,
    };

    (handle, rx, parts)
}

/// Everything a worker needs except its tracker
pub struct WorkerParts {
    config: DetectionConfig,
    shared: Shared,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    events: mpsc::UnboundedSender<WorkerEvent>,
    runtime: Handle,
}

impl WorkerParts {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn into_worker(self, tracker: Box<dyn FrameTracker>) -> DetectionWorker {
        DetectionWorker {
            parts: self,
            tracker,
            clock: Instant::now(),
        }
    }
}

/// Start the consumer thread
///
/// The tracker is built on the worker thread. The thread exits once every
/// `DetectionHandle` is dropped and the queue is drained.
pub fn spawn_detection_worker<F>(
    config: DetectionConfig,
    queue: QueueConfig,
    store: Arc<dyn ObjectStore>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    runtime: Handle,
    make_tracker: F,
) -> Result<(DetectionHandle, JoinHandle<()>)>
where
    F: FnOnce() -> Result<Box<dyn FrameTracker>> + Send + 'static,
{
    let (handle, rx, parts) = detection_channel(config, queue, store, events, runtime);

    let join = std::thread::Builder::new()
        .name("detection-worker".to_string())
        .spawn(move || match make_tracker() {
            Ok(tracker) => parts.into_worker(tracker).run(rx),
            Err(e) => tracing::error!(error = %e, "Detection tracker init failed, worker not running"),
        })?;

    tracing::info!("Detection worker started");
    Ok((handle, join))
}

/// Single serial consumer
pub struct DetectionWorker {
    parts: WorkerParts,
    tracker: Box<dyn FrameTracker>,
    clock: Instant,
}

impl DetectionWorker {
    /// Consume until the queue closes
    pub fn run(mut self, mut rx: mpsc::Receiver<FrameJob>) {
        while let Some(job) = rx.blocking_recv() {
            let car = job.car.clone();
            match panic::catch_unwind(AssertUnwindSafe(|| self.process_job(job))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(car = %car, error = %e, "Frame skipped"),
                Err(_) => tracing::error!(car = %car, "Frame processing panicked, frame skipped"),
            }
        }
        tracing::info!("Detection worker stopped");
    }

    /// Process one job on the worker clock
    pub fn process_job(&mut self, job: FrameJob) -> Result<()> {
        let now = self.clock.elapsed().as_secs_f64();
        self.process_at(job, now)
    }

    /// Process one job at an explicit clock reading (seconds)
    pub fn process_at(&mut self, job: FrameJob, now: f64) -> Result<()> {
        let cfg = self.parts.config.clone();
        let bytes = decode_frame_payload(&job.frame)?;
        let frame = decode_frame(&bytes)?;
        let frame_width = frame.width() as f64;

        let boxes = self
            .tracker
            .track(&job.car, &frame)
            .map_err(|e| Error::Detection(format!("detect+track failed: {}", e)))?;

        let mut debug_tracks = Vec::new();
        let mut debug_boxes = Vec::new();
        let mut reports = Vec::new();

        let (reported_ids, run_start) = {
            let mut shared = lock(&self.parts.shared);

            for b in &boxes {
                let Some(track_id) = b.track_id else {
                    continue;
                };
                if b.confidence < cfg.conf_threshold {
                    continue;
                }
                let Some(bbox) =
                    BoxCoords::from_frame_coords(b.x1, b.y1, b.x2, b.y2, frame.width(), frame.height())
                else {
                    tracing::debug!(car = %job.car, track_id = track_id, "Non-finite box discarded");
                    continue;
                };
                if bbox.width() < cfg.min_width || bbox.height() < cfg.min_height {
                    continue;
                }

                let cx_norm = bbox.center().0 / frame_width;
                let centered = cfg.center_min < cx_norm && cx_norm < cfg.center_max;

                let obs = shared.registry.observe(
                    TrackKey::new(&job.car, track_id),
                    bbox,
                    b.confidence,
                    centered,
                    now,
                    &frame,
                );

                tracing::debug!(
                    car = %job.car,
                    track_id = track_id,
                    confidence = b.confidence,
                    centered = centered,
                    dwell_secs = obs.dwell_secs,
                    "Track observed"
                );

                debug_tracks.push(DebugTrack {
                    track_id,
                    confidence: b.confidence,
                    centered,
                    dwell_secs: obs.dwell_secs,
                    width: bbox.width(),
                    height: bbox.height(),
                });
                debug_boxes.push(DebugBox { bbox, centered });
                if let Some(report) = obs.report {
                    reports.push(report);
                }
            }

            (
                shared.registry.reported_ids(&job.car),
                shared.run_starts.get(&job.car).cloned(),
            )
        };

        for report in reports {
            self.upload_report(report, run_start.as_deref());
        }

        self.emit_debug(&job, &frame, &debug_boxes, debug_tracks, reported_ids);
        Ok(())
    }

    fn upload_report(&self, report: ReportCapture, run_start: Option<&str>) {
        let cfg = &self.parts.config;
        let run_start = run_start
            .map(str::to_string)
            .unwrap_or_else(|| Local::now().format(FILE_TS_FORMAT).to_string());
        let key = format!(
            "{}/{}_track{}_{}.jpg",
            cfg.image_prefix,
            normalize_vehicle_id(&report.key.car),
            report.key.track_id,
            run_start
        );

        let uploaded = match render_report(
            &report.frame,
            &report.bbox,
            cfg.report_width,
            cfg.report_height,
            cfg.report_quality,
        ) {
            Ok(jpeg) => self.parts.runtime.block_on(upload_with_retry(
                self.parts.store.as_ref(),
                &jpeg,
                &key,
                "image/jpeg",
                &self.parts.retry,
            )),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Report encode failed, upload skipped");
                false
            }
        };

        tracing::info!(
            car = %report.key.car,
            track_id = report.key.track_id,
            key = %key,
            uploaded = uploaded,
            "Yield violation reported"
        );

        let event = WorkerEvent::Reported {
            car: report.key.car,
            track_id: report.key.track_id,
            key,
            uploaded,
        };
        if self.parts.events.send(event).is_err() {
            tracing::debug!("Hub gone, report event discarded");
        }
    }

    fn emit_debug(
        &self,
        job: &FrameJob,
        frame: &image::RgbImage,
        boxes: &[DebugBox],
        tracks: Vec<DebugTrack>,
        reported_ids: Vec<i64>,
    ) {
        let cfg = &self.parts.config;
        let jpeg = match render_debug(frame, (cfg.center_min, cfg.center_max), boxes, cfg.debug_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                tracing::warn!(car = %job.car, error = %e, "Debug frame encode failed");
                return;
            }
        };

        let event = WorkerEvent::Debug(DebugFrame {
            car: job.car.clone(),
            frame: base64::engine::general_purpose::STANDARD.encode(jpeg),
            hud_time: Local::now().format(DISPATCH_TIME_FORMAT).to_string(),
            gps: job.gps,
            tracks,
            reported_ids,
        });

        if self.parts.events.send(event).is_err() {
            tracing::debug!(car = %job.car, "Hub gone, debug frame discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_dispatch_time;
    use crate::object_store::MemoryObjectStore;
    use image::RgbImage;
    use std::time::Duration;

    fn frame_b64() -> String {
        let img = RgbImage::from_pixel(320, 240, image::Rgb([90, 90, 90]));
        base64::engine::general_purpose::STANDARD.encode(encode_jpeg(&img, 70).unwrap())
    }

    fn job(car: &str) -> FrameJob {
        FrameJob {
            car: car.to_string(),
            frame: frame_b64(),
            gps: Some(LatLng::new(37.5, 127.0)),
        }
    }

    /// Centred 60x70 box on a 320-wide frame
    fn centred_box(track_id: i64) -> TrackedBox {
        TrackedBox {
            track_id: Some(track_id),
            confidence: 0.8,
            x1: 130.0,
            y1: 50.0,
            x2: 190.0,
            y2: 120.0,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        }
    }

    struct Fixture {
        rt: tokio::runtime::Runtime,
        store: Arc<MemoryObjectStore>,
        events: mpsc::UnboundedReceiver<WorkerEvent>,
        handle: DetectionHandle,
        worker: DetectionWorker,
    }

    fn fixture(script: Vec<Result<Vec<TrackedBox>>>) -> Fixture {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let (events_tx, events) = mpsc::unbounded_channel();
        let (handle, _rx, parts) = detection_channel(
            DetectionConfig::default(),
            QueueConfig::default(),
            store.clone(),
            events_tx,
            rt.handle().clone(),
        );
        let worker = parts
            .with_retry(fast_retry())
            .into_worker(Box::new(ScriptedTracker::new(script)));
        Fixture {
            rt,
            store,
            events,
            handle,
            worker,
        }
    }

    fn drain(events: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
        let mut out = Vec::new();
        while let Ok(e) = events.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_centred_track_reports_once_with_run_start_name() {
        let script = (0..15).map(|_| Ok(vec![centred_box(5)])).collect();
        let mut fx = fixture(script);
        fx.handle
            .start_run("119다119", &parse_dispatch_time("2025-12-05 15:00:00").unwrap());

        for step in 0..15 {
            fx.worker.process_at(job("119다119"), step as f64).unwrap();
        }

        let keys = fx.rt.block_on(fx.store.keys());
        assert_eq!(keys, vec!["images/119da119_track5_20251205_150000.jpg"]);

        let events = drain(&mut fx.events);
        let reported: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::Reported { uploaded: true, .. }))
            .collect();
        assert_eq!(reported.len(), 1);

        let debug_count = events
            .iter()
            .filter(|e| matches!(e, WorkerEvent::Debug(_)))
            .count();
        assert_eq!(debug_count, 15);
        assert_eq!(fx.handle.reported_ids("119다119"), vec![5]);
    }

    #[test]
    fn test_small_and_weak_boxes_are_ignored() {
        let small = TrackedBox {
            track_id: Some(1),
            confidence: 0.9,
            x1: 140.0,
            y1: 50.0,
            x2: 190.0,
            y2: 100.0,
        };
        let weak = TrackedBox {
            confidence: 0.2,
            ..centred_box(2)
        };
        let anonymous = TrackedBox {
            track_id: None,
            ..centred_box(3)
        };
        let mut fx = fixture(vec![Ok(vec![small, weak, anonymous])]);
        fx.worker.process_at(job("amb1"), 0.0).unwrap();

        match drain(&mut fx.events).pop() {
            Some(WorkerEvent::Debug(debug)) => {
                assert!(debug.tracks.is_empty());
                assert_eq!(debug.gps, Some(LatLng::new(37.5, 127.0)));
            }
            other => panic!("expected debug frame, got {:?}", other),
        }
    }

    #[test]
    fn test_off_centre_box_is_tracked_but_not_centred() {
        let left = TrackedBox {
            x1: 0.0,
            x2: 70.0,
            ..centred_box(4)
        };
        let mut fx = fixture(vec![Ok(vec![left])]);
        fx.worker.process_at(job("amb1"), 0.0).unwrap();

        let Some(WorkerEvent::Debug(debug)) = drain(&mut fx.events).pop() else {
            panic!("expected debug frame");
        };
        assert_eq!(debug.tracks.len(), 1);
        assert!(!debug.tracks[0].centered);
        assert_eq!(debug.tracks[0].width, 70);
    }

    #[test]
    fn test_bad_frame_and_tracker_failure_skip_frame() {
        let mut fx = fixture(vec![Err(Error::Detection("offline".to_string()))]);

        let garbage = FrameJob {
            frame: "bm90IGFuIGltYWdl".to_string(),
            ..job("amb1")
        };
        assert!(fx.worker.process_at(garbage, 0.0).is_err());
        assert!(fx.worker.process_at(job("amb1"), 1.0).is_err());

        // next frame processes normally
        fx.worker.process_at(job("amb1"), 2.0).unwrap();
        assert_eq!(drain(&mut fx.events).len(), 1);
    }

    #[test]
    fn test_out_of_range_and_nan_boxes_keep_worker_alive() {
        let huge = TrackedBox {
            x1: -3e9,
            x2: 3e9,
            ..centred_box(6)
        };
        let nan = TrackedBox {
            y1: f32::NAN,
            ..centred_box(7)
        };
        let mut fx = fixture(vec![Ok(vec![huge, nan]), Ok(vec![centred_box(8)])]);

        fx.worker.process_at(job("amb1"), 0.0).unwrap();
        let Some(WorkerEvent::Debug(debug)) = drain(&mut fx.events).pop() else {
            panic!("expected debug frame");
        };
        assert_eq!(debug.tracks.len(), 1);
        assert_eq!(debug.tracks[0].track_id, 6);
        assert_eq!(debug.tracks[0].width, 320);

        fx.worker.process_at(job("amb1"), 1.0).unwrap();
        assert_eq!(drain(&mut fx.events).len(), 1);
    }

    #[test]
    fn test_reports_continue_after_hub_is_gone() {
        let script = (0..11).map(|_| Ok(vec![centred_box(9)])).collect();
        let Fixture {
            rt,
            store,
            events,
            handle,
            mut worker,
        } = fixture(script);
        drop(events);

        for step in 0..11 {
            worker.process_at(job("amb1"), step as f64).unwrap();
        }
        assert_eq!(rt.block_on(store.keys()).len(), 1);
        assert_eq!(handle.reported_ids("amb1"), vec![9]);
    }

    #[test]
    fn test_report_upload_failure_is_not_fatal() {
        let script = (0..11).map(|_| Ok(vec![centred_box(8)])).collect();
        let mut fx = fixture(script);
        fx.store.fail_next_puts(10);

        for step in 0..11 {
            fx.worker.process_at(job("amb1"), step as f64).unwrap();
        }
        assert_eq!(fx.store.put_calls(), 3);
        assert!(drain(&mut fx.events)
            .iter()
            .any(|e| matches!(e, WorkerEvent::Reported { uploaded: false, .. })));
    }

    #[test]
    fn test_start_run_resets_vehicle_tracks() {
        let script = (0..11).map(|_| Ok(vec![centred_box(1)])).collect();
        let mut fx = fixture(script);
        for step in 0..11 {
            fx.worker.process_at(job("amb1"), step as f64).unwrap();
        }
        assert_eq!(fx.handle.reported_ids("amb1"), vec![1]);

        fx.handle
            .start_run("amb1", &parse_dispatch_time("2025-12-05 16:00:00").unwrap());
        assert!(fx.handle.reported_ids("amb1").is_empty());
    }

    #[test]
    fn test_backpressure_drops_above_soft_limit() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (handle, _rx, _parts) = detection_channel(
            DetectionConfig::default(),
            QueueConfig::default(),
            Arc::new(MemoryObjectStore::new()),
            events_tx,
            rt.handle().clone(),
        );

        let outcomes: Vec<EnqueueOutcome> = (0..60).map(|_| handle.enqueue(job("amb1"))).collect();
        let queued = outcomes.iter().filter(|o| **o == EnqueueOutcome::Queued).count();
        let dropped = outcomes
            .iter()
            .filter(|o| **o == EnqueueOutcome::Overloaded)
            .count();
        assert_eq!(queued, 51);
        assert_eq!(dropped, 9);
        assert_eq!(handle.queue_depth(), 51);
    }

    #[test]
    fn test_full_queue_and_sampling() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (handle, _rx, _parts) = detection_channel(
            DetectionConfig::default(),
            QueueConfig {
                capacity: 3,
                soft_limit: 50,
                sample_every: 2,
            },
            Arc::new(MemoryObjectStore::new()),
            events_tx,
            rt.handle().clone(),
        );

        let outcomes: Vec<EnqueueOutcome> = (0..10).map(|_| handle.enqueue(job("amb1"))).collect();
        assert_eq!(outcomes[0], EnqueueOutcome::Sampled);
        assert_eq!(outcomes[1], EnqueueOutcome::Queued);
        assert_eq!(
            outcomes.iter().filter(|o| **o == EnqueueOutcome::Queued).count(),
            3
        );
        assert_eq!(outcomes[7], EnqueueOutcome::Full);
    }

    #[test]
    fn test_closed_queue() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (events_tx, _events) = mpsc::unbounded_channel();
        let (handle, rx, _parts) = detection_channel(
            DetectionConfig::default(),
            QueueConfig::default(),
            Arc::new(MemoryObjectStore::new()),
            events_tx,
            rt.handle().clone(),
        );
        drop(rx);
        assert_eq!(handle.enqueue(job("amb1")), EnqueueOutcome::Closed);
    }

    #[test]
    fn test_spawned_worker_drains_and_exits() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let (handle, join) = spawn_detection_worker(
            DetectionConfig::default(),
            QueueConfig::default(),
            Arc::new(MemoryObjectStore::new()),
            events_tx,
            rt.handle().clone(),
            || Ok(Box::new(ScriptedTracker::default()) as Box<dyn FrameTracker>),
        )
        .unwrap();

        assert_eq!(handle.enqueue(job("amb1")), EnqueueOutcome::Queued);
        assert_eq!(handle.enqueue(job("amb1")), EnqueueOutcome::Queued);
        drop(handle);
        join.join().unwrap();

        assert_eq!(drain(&mut events).len(), 2);
    }
}
