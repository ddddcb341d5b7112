//! Crossroad engine types

use crate::geo_utils::Compass;
use serde::{Deserialize, Serialize};

/// Static junction loaded once from the crossroad map CSV
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Crossroad {
    #[serde(rename = "itstId")]
    pub id: i64,
    #[serde(rename = "itstNm")]
    pub name: String,
    #[serde(rename = "mapCtptIntLat")]
    pub lat: f64,
    #[serde(rename = "mapCtptIntLot")]
    pub lon: f64,
}

/// Approach status of one crossroad on the active route
///
/// Ordered: Pending -> Approaching -> Arrived -> Passed (terminal)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossroadStatus {
    Pending,
    Approaching,
    Arrived,
    Passed,
}

impl CrossroadStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CrossroadStatus::Passed)
    }
}

/// Turn classification through a crossroad
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Straight,
    Left,
    Right,
    UTurn,
    /// Angle falls between the named buckets; see `rel_angle`
    Other,
    /// Not enough route points around the crossroad
    Unknown,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnKind::Straight => "straight",
            TurnKind::Left => "left",
            TurnKind::Right => "right",
            TurnKind::UTurn => "u_turn",
            TurnKind::Other => "other",
            TurnKind::Unknown => "unknown",
        }
    }
}

/// A crossroad the active route passes, with precomputed geometry and live status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedCrossroad {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
    pub in_angle: Option<f64>,
    pub in_dir: Option<Compass>,
    pub out_angle: Option<f64>,
    pub out_dir: Option<Compass>,
    pub turn: TurnKind,
    pub rel_angle: Option<f64>,
    pub explain: String,
    pub status: CrossroadStatus,
}

/// A status change produced by a live distance sample
#[derive(Debug, Clone, PartialEq)]
pub struct CrossroadTransition {
    pub crossroad: ExpectedCrossroad,
    pub from: CrossroadStatus,
    pub to: CrossroadStatus,
    pub distance_m: f64,
}

/// Crossroad engine thresholds
#[derive(Debug, Clone)]
pub struct CrossroadConfig {
    /// Route points within this radius of a crossroad mark it as on-route (m)
    pub route_radius_m: f64,
    /// Pending -> Approaching at or below this distance (m)
    pub approach_m: f64,
    /// Approaching -> Arrived at or below, Arrived -> Passed above this distance (m)
    pub arrive_m: f64,
}

impl Default for CrossroadConfig {
    fn default() -> Self {
        Self {
            route_radius_m: 50.0,
            approach_m: 300.0,
            arrive_m: 50.0,
        }
    }
}
