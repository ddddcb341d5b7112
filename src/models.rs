//! Shared models and types
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use crate::error::{Error, Result};
use base64::Engine;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Wire format of dispatch timestamps ("2025-12-05 15:18:27")
pub const DISPATCH_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp format used in file names and storage keys ("20251205_151827")
pub const FILE_TS_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub connections: u64,
    pub detection_enabled: bool,
    pub detection_queue_depth: usize,
}

/// A geographic point in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Parse a dispatch timestamp in wire format
pub fn parse_dispatch_time(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), DISPATCH_TIME_FORMAT)
        .map_err(|e| Error::Parse(format!("invalid timestamp '{}': {}", raw, e)))
}

/// Format a dispatch timestamp in wire format
pub fn format_dispatch_time(t: &NaiveDateTime) -> String {
    t.format(DISPATCH_TIME_FORMAT).to_string()
}

/// Decode a base64 frame payload (bare or `data:image/jpeg;base64,...`)
pub fn decode_frame_payload(frame: &str) -> Result<Vec<u8>> {
    let encoded = match frame.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, data)| data)
            .ok_or_else(|| Error::Parse("malformed data URL frame".to_string()))?,
        None => frame,
    };
    if encoded.is_empty() {
        return Err(Error::Validation("empty frame".to_string()));
    }
    base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Parse(format!("frame base64: {}", e)))
}

/// Convert a vehicle id (plate number) into a string safe for file names and storage keys
///
/// Hangul plate syllables are romanized, ASCII alphanumerics pass through,
/// everything else becomes `_`.
pub fn normalize_vehicle_id(vehicle_id: &str) -> String {
    vehicle_id
        .chars()
        .map(|ch| match romanize_plate_syllable(ch) {
            Some(roman) => roman.to_string(),
            None if ch.is_ascii_alphanumeric() => ch.to_string(),
            None => "_".to_string(),
        })
        .collect()
}

fn romanize_plate_syllable(ch: char) -> Option<&'static str> {
    let roman = match ch {
        '가' => "ga",
        '나' => "na",
        '다' => "da",
        '라' => "ra",
        '마' => "ma",
        '바' => "ba",
        '사' => "sa",
        '아' => "a",
        '자' => "ja",
        '차' => "cha",
        '카' => "ka",
        '타' => "ta",
        '파' => "pa",
        '하' => "ha",
        _ => return None,
    };
    Some(roman)
}
