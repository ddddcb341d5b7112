//! PositionCache - Latest Fix, Active Route and Recent Track Storage
//!
//! ## Responsibilities
//!
//! - Latest GPS fix per vehicle (HTTP polling, detection HUD)
//! - Active route polyline per vehicle (at most one, replaced wholesale)
//! - Bounded recent-track ring per third-party vehicle

use crate::models::LatLng;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

/// Recent-track capacity per third-party vehicle
pub const TRACK_RING_CAPACITY: usize = 10;

/// Latest fix for a vehicle, as served by the polling interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFix {
    pub car: String,
    pub lat: f64,
    pub lng: f64,
    pub speed: Option<f64>,
    pub timestamp: DateTime<Local>,
}

/// Fixed-capacity FIFO of track points; oldest evicted on overflow
#[derive(Debug, Clone)]
pub struct TrackRing {
    points: VecDeque<LatLng>,
    capacity: usize,
}

impl TrackRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: LatLng) {
        if self.points.len() >= self.capacity {
            self.points.pop_front();
        }
        self.points.push_back(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points oldest first
    pub fn to_vec(&self) -> Vec<LatLng> {
        self.points.iter().copied().collect()
    }
}

/// Cached route with registration order
struct RouteEntry {
    seq: u64,
    points: Vec<LatLng>,
}

#[derive(Default)]
struct RouteTable {
    routes: HashMap<String, RouteEntry>,
    next_seq: u64,
}

/// PositionCache instance
pub struct PositionCache {
    positions: RwLock<HashMap<String, PositionFix>>,
    routes: RwLock<RouteTable>,
    tracks: RwLock<HashMap<String, TrackRing>>,
}

impl PositionCache {
    /// Create new PositionCache
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            routes: RwLock::new(RouteTable::default()),
            tracks: RwLock::new(HashMap::new()),
        }
    }

    /// Store the latest fix for a vehicle
    pub async fn update_position(&self, car: &str, lat: f64, lng: f64, speed: Option<f64>) {
        let fix = PositionFix {
            car: car.to_string(),
            lat,
            lng,
            speed,
            timestamp: Local::now(),
        };
        self.positions.write().await.insert(car.to_string(), fix);
    }

    /// Latest fix for a vehicle
    pub async fn position(&self, car: &str) -> Option<PositionFix> {
        self.positions.read().await.get(car).cloned()
    }

    /// Latest coordinates for a vehicle
    pub async fn last_coordinates(&self, car: &str) -> Option<LatLng> {
        self.positions
            .read()
            .await
            .get(car)
            .map(|f| LatLng::new(f.lat, f.lng))
    }

    /// All latest fixes (vehicle id -> fix)
    pub async fn all_positions(&self) -> HashMap<String, PositionFix> {
        self.positions.read().await.clone()
    }

    /// Replace the vehicle's active route
    pub async fn set_route(&self, car: &str, points: Vec<LatLng>) {
        let mut table = self.routes.write().await;
        let seq = match table.routes.get(car) {
            Some(existing) => existing.seq,
            None => {
                table.next_seq += 1;
                table.next_seq
            }
        };
        table.routes.insert(car.to_string(), RouteEntry { seq, points });
    }

    /// Active route for a vehicle
    pub async fn route(&self, car: &str) -> Option<Vec<LatLng>> {
        self.routes
            .read()
            .await
            .routes
            .get(car)
            .map(|e| e.points.clone())
    }

    /// Earliest-registered vehicle with a non-empty route
    pub async fn first_active_route(&self) -> Option<(String, Vec<LatLng>)> {
        let table = self.routes.read().await;
        table
            .routes
            .iter()
            .filter(|(_, e)| !e.points.is_empty())
            .min_by_key(|(_, e)| e.seq)
            .map(|(car, e)| (car.clone(), e.points.clone()))
    }

    /// Drop the vehicle's active route
    pub async fn clear_route(&self, car: &str) {
        self.routes.write().await.routes.remove(car);
    }

    /// Append to a third-party vehicle's recent track and return the track, oldest first
    pub async fn push_track_point(&self, car: &str, point: LatLng) -> Vec<LatLng> {
        let mut tracks = self.tracks.write().await;
        let ring = tracks
            .entry(car.to_string())
            .or_insert_with(|| TrackRing::new(TRACK_RING_CAPACITY));
        ring.push(point);
        ring.to_vec()
    }
}

impl Default for PositionCache {
    fn default() -> Self {
        Self::new()
    }
}
