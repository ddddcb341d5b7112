//! FrameTracker - Detect+Track Service Adapter
//!
//! ## Responsibilities
//!
//! - Send one frame to the detect+track service and parse tracked boxes
//! - Keep tracker identity per vehicle session (`session` query parameter)
//!
//! The model itself is opaque; the worker only sees `TrackedBox` lists.

use super::annotate::encode_jpeg;
use crate::error::{Error, Result};
use image::RgbImage;
use reqwest::blocking::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// One tracked detection in pixel coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedBox {
    /// Tracker-assigned id; boxes without an id are ignored
    #[serde(default)]
    pub track_id: Option<i64>,
    pub confidence: f32,
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

/// Detect+track response body
#[derive(Debug, Clone, Deserialize)]
pub struct TrackResponse {
    #[serde(default)]
    pub boxes: Vec<TrackedBox>,
}

/// Detect+track step, invoked serially by the detection worker
pub trait FrameTracker: Send {
    fn track(&mut self, car: &str, frame: &RgbImage) -> Result<Vec<TrackedBox>>;
}

/// HTTP client for a remote detect+track service
pub struct RemoteTracker {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl RemoteTracker {
    /// Create new RemoteTracker
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl FrameTracker for RemoteTracker {
    fn track(&mut self, car: &str, frame: &RgbImage) -> Result<Vec<TrackedBox>> {
        let url = format!("{}/track", self.base_url);
        let jpeg = encode_jpeg(frame, 90)?;

        let form = Form::new().part(
            "frame",
            Part::bytes(jpeg)
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self
            .client
            .post(&url)
            .query(&[("session", car)])
            .multipart(form)
            .send()?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(Error::Detection(format!(
                "tracker returned {} - {}",
                status, body
            )));
        }

        let parsed: TrackResponse = resp.json()?;
        Ok(parsed.boxes)
    }
}

/// Tracker replaying prepared results, one list per frame
///
/// Runs out to empty results; a scripted `Err` simulates a service failure.
#[derive(Default)]
pub struct ScriptedTracker {
    script: VecDeque<Result<Vec<TrackedBox>>>,
}

impl ScriptedTracker {
    pub fn new(script: Vec<Result<Vec<TrackedBox>>>) -> Self {
        Self {
            script: script.into(),
        }
    }
}

impl FrameTracker for ScriptedTracker {
    fn track(&mut self, _car: &str, _frame: &RgbImage) -> Result<Vec<TrackedBox>> {
        self.script.pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}
