//! Geodesic helpers shared by the crossroad engine and the road matcher

use crate::models::LatLng;
use serde::{Deserialize, Serialize};

/// Mean earth radius (m)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters (haversine)
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let dlat = (lat2 - lat1).to_radians();
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * a.sqrt().min(1.0).asin()
}

/// Distance between two points in meters
pub fn distance_m(a: &LatLng, b: &LatLng) -> f64 {
    haversine_m(a.lat, a.lng, b.lat, b.lng)
}

/// Initial (forward) bearing from `a` to `b` in degrees, 0 = north, clockwise, in [0, 360)
pub fn bearing_deg(a: &LatLng, b: &LatLng) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let dlambda = (b.lng - a.lng).to_radians();

    let y = dlambda.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * dlambda.cos();
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Absolute angular difference normalized to [0, 180]
pub fn angle_diff_deg(a: f64, b: f64) -> f64 {
    let diff = (a - b).abs() % 360.0;
    if diff > 180.0 {
        360.0 - diff
    } else {
        diff
    }
}

/// 8-way compass bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compass {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

impl Compass {
    const ALL: [Compass; 8] = [
        Compass::N,
        Compass::NE,
        Compass::E,
        Compass::SE,
        Compass::S,
        Compass::SW,
        Compass::W,
        Compass::NW,
    ];

    /// Bucket a bearing by rounding to the nearest 45°, wrapping at 360°
    pub fn from_bearing(bearing: f64) -> Self {
        let idx = ((bearing.rem_euclid(360.0) / 45.0 + 0.5) as usize) % 8;
        Self::ALL[idx]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Compass::N => "N",
            Compass::NE => "NE",
            Compass::E => "E",
            Compass::SE => "SE",
            Compass::S => "S",
            Compass::SW => "SW",
            Compass::W => "W",
            Compass::NW => "NW",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_haversine_symmetric() {
        let d1 = haversine_m(37.5665, 126.9780, 37.5700, 126.9900);
        let d2 = haversine_m(37.5700, 126.9900, 37.5665, 126.9780);
        assert!((d1 - d2).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_self_is_zero() {
        assert_eq!(haversine_m(37.5665, 126.9780, 37.5665, 126.9780), 0.0);
    }

    #[test]
    fn test_haversine_known_offset() {
        // 0.001° of latitude is ~111.2 m
        let d = haversine_m(0.0, 0.0, 0.001, 0.0);
        assert!((d - 111.19).abs() < 0.5, "got {}", d);
    }

    #[test]
    fn test_bearing_cardinals() {
        let origin = LatLng::new(0.0, 0.0);
        assert!((bearing_deg(&origin, &LatLng::new(0.01, 0.0)) - 0.0).abs() < 1e-6);
        assert!((bearing_deg(&origin, &LatLng::new(0.0, 0.01)) - 90.0).abs() < 1e-6);
        assert!((bearing_deg(&origin, &LatLng::new(-0.01, 0.0)) - 180.0).abs() < 1e-6);
        assert!((bearing_deg(&origin, &LatLng::new(0.0, -0.01)) - 270.0).abs() < 1e-6);
    }

    #[test]
    fn test_compass_buckets_wrap() {
        assert_eq!(Compass::from_bearing(0.0), Compass::N);
        assert_eq!(Compass::from_bearing(22.4), Compass::N);
        assert_eq!(Compass::from_bearing(22.6), Compass::NE);
        assert_eq!(Compass::from_bearing(180.0), Compass::S);
        assert_eq!(Compass::from_bearing(337.6), Compass::N);
        assert_eq!(Compass::from_bearing(359.9), Compass::N);
        assert_eq!(Compass::from_bearing(300.0), Compass::NW);
    }

    #[test]
    fn test_angle_diff() {
        assert_eq!(angle_diff_deg(10.0, 350.0), 20.0);
        assert_eq!(angle_diff_deg(90.0, 270.0), 180.0);
        assert_eq!(angle_diff_deg(45.0, 45.0), 0.0);
    }
}
