//! TripRecorder - Per-Dispatch CSV Trip Log and Frame Recording
//!
//! ## Responsibilities
//!
//! - CSV trip log per vehicle: one `point` row per fix, one `summary` row on arrival
//! - Motion-JPEG recording of the vehicle's video frames
//! - Upload of both to object storage when the dispatch closes
//!
//! Sessions are keyed by vehicle id; a new `start` replaces the vehicle's session.

use crate::error::{Error, Result};
use crate::models::{decode_frame_payload, format_dispatch_time, DISPATCH_TIME_FORMAT};
use crate::dispatch_log::dispatch_stem;
use crate::object_store::{upload_with_retry, ObjectStore, RetryPolicy};
use chrono::{Local, NaiveDateTime};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::Mutex;

/// CSV header of a trip log
pub const TRIP_LOG_HEADER: [&str; 10] = [
    "type",
    "car_no",
    "timestamp",
    "lat",
    "lng",
    "speed",
    "start_time",
    "eta_time",
    "arrival_time",
    "time_saved_sec",
];

/// Seconds gained against the ETA (positive when early)
pub fn time_saved_secs(eta: &NaiveDateTime, arrival: &NaiveDateTime) -> i64 {
    (*eta - *arrival).num_seconds()
}

/// Per-dispatch CSV trip log
pub struct TripLogger {
    car_no: String,
    start_time: NaiveDateTime,
    eta_time: Option<NaiveDateTime>,
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl TripLogger {
    /// Create the log file and write the header
    pub fn create(dir: &Path, car_no: &str, start_time: NaiveDateTime) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.csv", dispatch_stem(car_no, &start_time)));
        let mut writer = csv::Writer::from_path(&path)?;
        writer.write_record(TRIP_LOG_HEADER)?;

        Ok(Self {
            car_no: car_no.to_string(),
            start_time,
            eta_time: None,
            path,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn set_eta(&mut self, eta: NaiveDateTime) {
        self.eta_time = Some(eta);
    }

    pub fn eta(&self) -> Option<NaiveDateTime> {
        self.eta_time
    }

    /// Append a `point` row
    pub fn log_point(
        &mut self,
        timestamp: &NaiveDateTime,
        lat: f64,
        lng: f64,
        speed: Option<f64>,
    ) -> Result<()> {
        let timestamp = format_dispatch_time(timestamp);
        let lat = format!("{:.8}", lat);
        let lng = format!("{:.8}", lng);
        let speed = speed.map(|s| format!("{:.2}", s)).unwrap_or_default();
        self.writer.write_record([
            "point",
            self.car_no.as_str(),
            timestamp.as_str(),
            lat.as_str(),
            lng.as_str(),
            speed.as_str(),
            "",
            "",
            "",
            "",
        ])?;
        Ok(())
    }

    /// Append the `summary` row and close the file
    pub fn finish(mut self, arrival: Option<NaiveDateTime>) -> Result<PathBuf> {
        let fmt = |t: Option<NaiveDateTime>| {
            t.map(|t| t.format(DISPATCH_TIME_FORMAT).to_string())
                .unwrap_or_default()
        };
        let time_saved = match (self.eta_time, arrival) {
            (Some(eta), Some(arrival)) => time_saved_secs(&eta, &arrival).to_string(),
            _ => String::new(),
        };

        let start = format_dispatch_time(&self.start_time);
        let eta = fmt(self.eta_time);
        let arrival = fmt(arrival);
        self.writer.write_record([
            "summary",
            self.car_no.as_str(),
            "",
            "",
            "",
            "",
            start.as_str(),
            eta.as_str(),
            arrival.as_str(),
            time_saved.as_str(),
        ])?;
        self.writer.flush()?;

        Ok(self.path)
    }
}

/// Motion-JPEG recording: concatenated JPEG frames
pub struct FrameRecorder {
    file_name: String,
    path: PathBuf,
    out: BufWriter<File>,
    frames: u64,
}

impl FrameRecorder {
    /// Create the recording file `{media_file}` under `dir`
    pub fn create(dir: &Path, media_file: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(media_file);
        let out = BufWriter::new(File::create(&path)?);

        Ok(Self {
            file_name: media_file.to_string(),
            path,
            out,
            frames: 0,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Append a base64 JPEG frame; non-JPEG payloads are rejected
    pub fn append_frame_b64(&mut self, frame: &str) -> Result<()> {
        let bytes = decode_frame_payload(frame)?;
        if !bytes.starts_with(&[0xFF, 0xD8]) {
            return Err(Error::Validation("frame is not a JPEG".to_string()));
        }
        self.out.write_all(&bytes)?;
        self.frames += 1;
        Ok(())
    }

    /// Flush and close; returns the path and frame count
    pub fn finish(mut self) -> Result<(PathBuf, u64)> {
        self.out.flush()?;
        Ok((self.path, self.frames))
    }
}

/// Open recording state of one vehicle
struct TripSession {
    logger: TripLogger,
    recorder: FrameRecorder,
}

/// Local files left by a closed session
struct ClosedTrip {
    csv_path: Option<PathBuf>,
    video_path: Option<PathBuf>,
    file_name: String,
    frames: u64,
}

impl TripSession {
    /// Finish both files; a failure on one still leaves the other for upload
    fn close(self, car: &str, arrival: NaiveDateTime) -> ClosedTrip {
        let file_name = self.recorder.file_name().to_string();

        let (video_path, frames) = match self.recorder.finish() {
            Ok((path, frames)) => (Some(path), frames),
            Err(e) => {
                tracing::error!(car = %car, error = %e, "Failed to close recording");
                (None, 0)
            }
        };

        let csv_path = match self.logger.finish(Some(arrival)) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(car = %car, error = %e, "Failed to close trip log");
                None
            }
        };

        ClosedTrip {
            csv_path,
            video_path,
            file_name,
            frames,
        }
    }
}

/// Session slot; emptied when the trip closes
type SessionSlot = Arc<StdMutex<Option<TripSession>>>;

fn lock_slot(slot: &SessionSlot) -> MutexGuard<'_, Option<TripSession>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Storage keys written when a trip closes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TripUploads {
    pub csv_key: Option<String>,
    pub video_key: Option<String>,
}

/// TripRecorder instance
///
/// File writes run on the blocking pool; the session map lock is only held to
/// look up a vehicle's slot.
pub struct TripRecorder {
    dir: PathBuf,
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    sessions: Mutex<HashMap<String, SessionSlot>>,
}

impl TripRecorder {
    /// Create new TripRecorder writing local files under `dir`
    pub fn new(dir: PathBuf, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            dir,
            store,
            retry: RetryPolicy::default(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn slot(&self, car: &str) -> Option<SessionSlot> {
        self.sessions.lock().await.get(car).cloned()
    }

    /// Run blocking file work against a vehicle's open session
    async fn with_session<F>(&self, car: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut TripSession) -> Result<()> + Send + 'static,
    {
        let Some(slot) = self.slot(car).await else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_slot(&slot);
            match guard.as_mut() {
                Some(session) => f(session),
                None => Ok(()),
            }
        })
        .await
        .map_err(|e| Error::Internal(format!("trip writer task failed: {}", e)))?
    }

    /// Open the CSV log and recording for a new dispatch
    pub async fn start(&self, car: &str, start_time: NaiveDateTime, media_file: &str) -> Result<()> {
        let dir = self.dir.clone();
        let (owned_car, owned_media) = (car.to_string(), media_file.to_string());
        let session = tokio::task::spawn_blocking(move || -> Result<TripSession> {
            Ok(TripSession {
                logger: TripLogger::create(&dir, &owned_car, start_time)?,
                recorder: FrameRecorder::create(&dir, &owned_media)?,
            })
        })
        .await
        .map_err(|e| Error::Internal(format!("trip writer task failed: {}", e)))??;

        tracing::info!(
            car = %car,
            csv = %session.logger.path().display(),
            recording = %media_file,
            "Trip recording started"
        );

        let previous = self
            .sessions
            .lock()
            .await
            .insert(car.to_string(), Arc::new(StdMutex::new(Some(session))));
        if previous.is_some() {
            tracing::warn!(car = %car, "Previous trip session replaced without arrival");
        }
        Ok(())
    }

    /// Whether the vehicle has an open session
    pub async fn is_recording(&self, car: &str) -> bool {
        self.sessions.lock().await.contains_key(car)
    }

    /// Set the ETA used by the summary row
    pub async fn set_eta(&self, car: &str, eta: NaiveDateTime) {
        let Some(slot) = self.slot(car).await else {
            return;
        };
        let mut guard = lock_slot(&slot);
        if let Some(session) = guard.as_mut() {
            session.logger.set_eta(eta);
            tracing::info!(car = %car, eta = %format_dispatch_time(&eta), "Trip ETA set");
        }
    }

    /// Append a position row; ignored when no session is open
    pub async fn log_point(&self, car: &str, lat: f64, lng: f64, speed: Option<f64>) -> Result<()> {
        let timestamp = Local::now().naive_local();
        self.with_session(car, move |session| {
            session.logger.log_point(&timestamp, lat, lng, speed)
        })
        .await
    }

    /// Append a video frame; ignored when no session is open
    pub async fn append_frame(&self, car: &str, frame_b64: &str) -> Result<()> {
        let frame = frame_b64.to_string();
        self.with_session(car, move |session| session.recorder.append_frame_b64(&frame))
            .await
    }

    /// Close the vehicle's session and upload its files
    ///
    /// File and upload failures are logged; the returned keys only list successful uploads.
    pub async fn finish(&self, car: &str, arrival: NaiveDateTime) -> Result<TripUploads> {
        let Some(slot) = self.sessions.lock().await.remove(car) else {
            tracing::warn!(car = %car, "No open trip session at arrival");
            return Ok(TripUploads::default());
        };

        let owned_car = car.to_string();
        let closed = tokio::task::spawn_blocking(move || {
            let session = lock_slot(&slot).take();
            session.map(|session| session.close(&owned_car, arrival))
        })
        .await
        .map_err(|e| Error::Internal(format!("trip writer task failed: {}", e)))?;
        let Some(closed) = closed else {
            return Ok(TripUploads::default());
        };

        let mut uploads = TripUploads::default();

        if let Some(csv_path) = &closed.csv_path {
            if let Some(name) = csv_path.file_name().and_then(|n| n.to_str()) {
                let key = format!("logs/{}", name);
                match tokio::fs::read(csv_path).await {
                    Ok(bytes) => {
                        if upload_with_retry(self.store.as_ref(), &bytes, &key, "text/csv", &self.retry).await {
                            uploads.csv_key = Some(key);
                        }
                    }
                    Err(e) => tracing::error!(car = %car, error = %e, "Failed to read trip log"),
                }
            }
        }

        match &closed.video_path {
            Some(video_path) if closed.frames > 0 => {
                let key = format!("videos/{}", closed.file_name);
                match tokio::fs::read(video_path).await {
                    Ok(bytes) => {
                        if upload_with_retry(
                            self.store.as_ref(),
                            &bytes,
                            &key,
                            "video/x-motion-jpeg",
                            &self.retry,
                        )
                        .await
                        {
                            uploads.video_key = Some(key);
                        }
                    }
                    Err(e) => tracing::error!(car = %car, error = %e, "Failed to read recording"),
                }
            }
            _ => tracing::info!(car = %car, "Recording has no frames, skipping upload"),
        }

        tracing::info!(
            car = %car,
            frames = closed.frames,
            csv_key = ?uploads.csv_key,
            video_key = ?uploads.video_key,
            "Trip recording finished"
        );

        Ok(uploads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::parse_dispatch_time;
    use crate::object_store::MemoryObjectStore;
    use base64::Engine;
    use std::time::Duration;

    fn t(raw: &str) -> NaiveDateTime {
        parse_dispatch_time(raw).unwrap()
    }

    fn jpeg_b64() -> String {
        base64::engine::general_purpose::STANDARD.encode([0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0xFF, 0xD9])
    }

    #[test]
    fn test_time_saved() {
        assert_eq!(
            time_saved_secs(&t("2025-12-05 15:30:00"), &t("2025-12-05 15:25:00")),
            300
        );
        assert_eq!(
            time_saved_secs(&t("2025-12-05 15:30:00"), &t("2025-12-05 15:31:00")),
            -60
        );
    }

    #[test]
    fn test_trip_logger_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = TripLogger::create(dir.path(), "119다119", t("2025-12-05 15:00:00")).unwrap();
        logger.set_eta(t("2025-12-05 15:30:00"));
        logger
            .log_point(&t("2025-12-05 15:01:00"), 37.5, 127.0, Some(42.126))
            .unwrap();
        logger.log_point(&t("2025-12-05 15:02:00"), 37.6, 127.1, None).unwrap();
        let path = logger.finish(Some(t("2025-12-05 15:25:00"))).unwrap();

        assert!(path.ends_with("119da119_20251205_150000.csv"));

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let header: Vec<String> = rdr.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(header, TRIP_LOG_HEADER.to_vec());
        let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[0][0], "point");
        assert_eq!(&rows[0][3], "37.50000000");
        assert_eq!(&rows[0][5], "42.13");
        assert_eq!(&rows[1][5], "");
        assert_eq!(&rows[2][0], "summary");
        assert_eq!(&rows[2][6], "2025-12-05 15:00:00");
        assert_eq!(&rows[2][7], "2025-12-05 15:30:00");
        assert_eq!(&rows[2][9], "300");
    }

    #[test]
    fn test_frame_recorder_rejects_non_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = FrameRecorder::create(dir.path(), "a.mjpeg").unwrap();
        rec.append_frame_b64(&jpeg_b64()).unwrap();
        let png_like = base64::engine::general_purpose::STANDARD.encode([0x89, 0x50, 0x4E, 0x47]);
        assert!(rec.append_frame_b64(&png_like).is_err());
        assert!(rec.append_frame_b64("not base64!").is_err());
        let (path, frames) = rec.finish().unwrap();
        assert_eq!(frames, 1);
        assert_eq!(std::fs::read(path).unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_trip_session_uploads_on_finish() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let recorder = TripRecorder::new(dir.path().to_path_buf(), store.clone()).with_retry(RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
        });

        let start = t("2025-12-05 15:00:00");
        recorder.start("amb1", start, "amb1_20251205_150000.mjpeg").await.unwrap();
        assert!(recorder.is_recording("amb1").await);

        recorder.set_eta("amb1", t("2025-12-05 15:30:00")).await;
        recorder.log_point("amb1", 37.5, 127.0, Some(30.0)).await.unwrap();
        recorder.append_frame("amb1", &jpeg_b64()).await.unwrap();
        recorder.append_frame("amb1", &jpeg_b64()).await.unwrap();

        let uploads = recorder.finish("amb1", t("2025-12-05 15:20:00")).await.unwrap();
        assert_eq!(uploads.csv_key.as_deref(), Some("logs/amb1_20251205_150000.csv"));
        assert_eq!(uploads.video_key.as_deref(), Some("videos/amb1_20251205_150000.mjpeg"));
        assert!(!recorder.is_recording("amb1").await);

        let video = store.get("videos/amb1_20251205_150000.mjpeg").await.unwrap();
        assert_eq!(video.data.len(), 14);
        let csv = store.get("logs/amb1_20251205_150000.csv").await.unwrap();
        assert_eq!(csv.content_type, "text/csv");
        assert!(String::from_utf8(csv.data).unwrap().contains("summary,amb1"));
    }

    #[tokio::test]
    async fn test_lost_trip_log_still_uploads_recording() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let recorder = TripRecorder::new(dir.path().to_path_buf(), store.clone());

        recorder
            .start("amb1", t("2025-12-05 15:00:00"), "amb1_20251205_150000.mjpeg")
            .await
            .unwrap();
        recorder.append_frame("amb1", &jpeg_b64()).await.unwrap();
        std::fs::remove_file(dir.path().join("amb1_20251205_150000.csv")).unwrap();

        let uploads = recorder.finish("amb1", t("2025-12-05 15:20:00")).await.unwrap();
        assert_eq!(uploads.csv_key, None);
        assert_eq!(uploads.video_key.as_deref(), Some("videos/amb1_20251205_150000.mjpeg"));
        assert_eq!(store.keys().await, vec!["videos/amb1_20251205_150000.mjpeg".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_vehicles_record_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let recorder = Arc::new(TripRecorder::new(dir.path().to_path_buf(), store.clone()));

        for car in ["amb1", "amb2"] {
            recorder
                .start(car, t("2025-12-05 15:00:00"), &format!("{}_20251205_150000.mjpeg", car))
                .await
                .unwrap();
        }

        let tasks: Vec<_> = ["amb1", "amb2"]
            .into_iter()
            .map(|car| {
                let recorder = recorder.clone();
                tokio::spawn(async move {
                    for i in 0..20 {
                        recorder.log_point(car, 37.0 + i as f64, 127.0, None).await.unwrap();
                        recorder.append_frame(car, &jpeg_b64()).await.unwrap();
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        recorder.finish("amb1", t("2025-12-05 15:20:00")).await.unwrap();
        let csv = store.get("logs/amb1_20251205_150000.csv").await.unwrap();
        let text = String::from_utf8(csv.data).unwrap();
        let lats: Vec<&str> = text
            .lines()
            .filter(|l| l.starts_with("point,"))
            .map(|l| l.split(',').nth(3).unwrap())
            .collect();
        assert_eq!(lats.len(), 20);
        assert_eq!(lats[0], "37.00000000");
        assert_eq!(lats[19], "56.00000000");

        let video = store.get("videos/amb1_20251205_150000.mjpeg").await.unwrap();
        assert_eq!(video.data.len(), 7 * 20);
        assert!(recorder.is_recording("amb2").await);
    }

    #[tokio::test]
    async fn test_finish_without_session_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = TripRecorder::new(dir.path().to_path_buf(), Arc::new(MemoryObjectStore::new()));
        recorder.log_point("ghost", 1.0, 1.0, None).await.unwrap();
        let uploads = recorder.finish("ghost", t("2025-12-05 15:20:00")).await.unwrap();
        assert_eq!(uploads, TripUploads::default());
    }
}
