//! Track registry: per-(vehicle, track id) dwell and best-frame bookkeeping

use image::RgbImage;
use serde::Serialize;
use std::collections::HashMap;

/// Integer pixel box (x1, y1) top-left, (x2, y2) bottom-right
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoxCoords {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoxCoords {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Pixel box from tracker coordinates, clamped to a `width` x `height` frame.
    /// `None` when any coordinate is not finite.
    pub fn from_frame_coords(x1: f32, y1: f32, x2: f32, y2: f32, width: u32, height: u32) -> Option<Self> {
        if ![x1, y1, x2, y2].iter().all(|v| v.is_finite()) {
            return None;
        }
        let clamp_x = |v: f32| v.clamp(0.0, width as f32) as i32;
        let clamp_y = |v: f32| v.clamp(0.0, height as f32) as i32;
        Some(Self::new(clamp_x(x1), clamp_y(y1), clamp_x(x2), clamp_y(y2)))
    }

    pub fn width(&self) -> i32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> i32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.x1 as f64 + self.x2 as f64) / 2.0,
            (self.y1 as f64 + self.y2 as f64) / 2.0,
        )
    }

    fn area(&self) -> i64 {
        self.width().max(0) as i64 * self.height().max(0) as i64
    }

    /// Intersection over union
    pub fn iou(&self, other: &BoxCoords) -> f64 {
        let ix = (self.x2.min(other.x2) as i64 - self.x1.max(other.x1) as i64).max(0);
        let iy = (self.y2.min(other.y2) as i64 - self.y1.max(other.y1) as i64).max(0);
        let inter = ix * iy;
        if inter <= 0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        if union <= 0 {
            return 0.0;
        }
        inter as f64 / union as f64
    }
}

/// Composite key of a detection track
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackKey {
    pub car: String,
    pub track_id: i64,
}

impl TrackKey {
    pub fn new(car: &str, track_id: i64) -> Self {
        Self {
            car: car.to_string(),
            track_id,
        }
    }
}

/// Accumulated state of one track
#[derive(Debug, Clone)]
pub struct TrackState {
    pub dwell_secs: f64,
    pub best_frame: Option<RgbImage>,
    pub best_score: f32,
    pub best_box: Option<BoxCoords>,
    pub last_box: BoxCoords,
    /// Seconds on the worker clock
    pub last_update: f64,
    pub reported: bool,
}

impl TrackState {
    fn fresh(bbox: BoxCoords, now: f64) -> Self {
        Self {
            dwell_secs: 0.0,
            best_frame: None,
            best_score: 0.0,
            best_box: None,
            last_box: bbox,
            last_update: now,
            reported: false,
        }
    }
}

/// Best frame ready to be turned into a report photo
#[derive(Debug, Clone)]
pub struct ReportCapture {
    pub key: TrackKey,
    pub frame: RgbImage,
    pub bbox: BoxCoords,
}

/// Outcome of feeding one box into the registry
#[derive(Debug, Clone)]
pub struct Observation {
    pub dwell_secs: f64,
    /// Old key whose state was inherited, if any
    pub merged_from: Option<TrackKey>,
    pub report: Option<ReportCapture>,
}

/// TrackRegistry instance
#[derive(Debug)]
pub struct TrackRegistry {
    states: HashMap<TrackKey, TrackState>,
    merge_iou: f64,
    report_dwell_secs: f64,
}

impl TrackRegistry {
    pub fn new(merge_iou: f64, report_dwell_secs: f64) -> Self {
        Self {
            states: HashMap::new(),
            merge_iou,
            report_dwell_secs,
        }
    }

    pub fn get(&self, key: &TrackKey) -> Option<&TrackState> {
        self.states.get(key)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop every track of a vehicle (new dispatch)
    pub fn reset_vehicle(&mut self, car: &str) -> usize {
        let before = self.states.len();
        self.states.retain(|k, _| k.car != car);
        before - self.states.len()
    }

    /// Best-overlapping prior track of the same vehicle with IoU strictly above the threshold
    pub fn find_merge_candidate(&self, car: &str, bbox: &BoxCoords) -> Option<TrackKey> {
        self.states
            .iter()
            .filter(|(k, _)| k.car == car)
            .map(|(k, s)| (k, s.last_box.iou(bbox)))
            .filter(|(_, iou)| *iou > self.merge_iou)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(k, _)| k.clone())
    }

    /// Reported track ids of a vehicle, ascending
    pub fn reported_ids(&self, car: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .states
            .iter()
            .filter(|(k, s)| k.car == car && s.reported)
            .map(|(k, _)| k.track_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Feed one surviving box
    ///
    /// `frame` is the snapshot kept as best frame when this box beats the track's best score.
    pub fn observe(
        &mut self,
        key: TrackKey,
        bbox: BoxCoords,
        confidence: f32,
        centered: bool,
        now: f64,
        frame: &RgbImage,
    ) -> Observation {
        let mut merged_from = None;

        if !self.states.contains_key(&key) {
            let inherited = self
                .find_merge_candidate(&key.car, &bbox)
                .and_then(|old| self.states.remove(&old).map(|state| (old, state)));

            let state = match inherited {
                Some((old, state)) => {
                    tracing::debug!(
                        car = %key.car,
                        from = old.track_id,
                        to = key.track_id,
                        "Track id merged by overlap"
                    );
                    merged_from = Some(old);
                    state
                }
                None => TrackState::fresh(bbox, now),
            };
            self.states.insert(key.clone(), state);
        }

        let report_dwell_secs = self.report_dwell_secs;
        let Some(state) = self.states.get_mut(&key) else {
            return Observation {
                dwell_secs: 0.0,
                merged_from,
                report: None,
            };
        };

        let mut report = None;

        if centered {
            state.dwell_secs += (now - state.last_update).max(0.0);

            if confidence > state.best_score {
                state.best_score = confidence;
                state.best_frame = Some(frame.clone());
                state.best_box = Some(bbox);
            }

            if state.dwell_secs >= report_dwell_secs && !state.reported {
                if let (Some(best), Some(best_box)) = (state.best_frame.take(), state.best_box) {
                    report = Some(ReportCapture {
                        key: key.clone(),
                        frame: best,
                        bbox: best_box,
                    });
                    state.reported = true;
                    state.dwell_secs = 0.0;
                    state.best_score = 0.0;
                    state.best_box = None;
                } else {
                    tracing::warn!(car = %key.car, track_id = key.track_id, "No best frame, report skipped");
                }
            }
        }

        state.last_update = now;
        state.last_box = bbox;

        Observation {
            dwell_secs: state.dwell_secs,
            merged_from,
            report,
        }
    }
}
