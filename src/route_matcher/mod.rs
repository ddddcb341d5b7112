//! RouteMatcher - Same Road / Same Direction Test
//!
//! Decides whether a third-party vehicle's recent track lies on the active
//! vehicle's route and heads the same way.

use crate::geo_utils::{angle_diff_deg, bearing_deg, distance_m};
use crate::models::LatLng;
use serde::{Deserialize, Serialize};

/// Matcher thresholds
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// A track point counts as on-route within this distance of its nearest route point (m)
    pub dist_threshold_m: f64,
    /// Minimum fraction of on-route track points
    pub ratio_threshold: f64,
    /// Maximum heading difference for "same direction" (deg)
    pub angle_threshold_deg: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            dist_threshold_m: 25.0,
            ratio_threshold: 0.7,
            angle_threshold_deg: 45.0,
        }
    }
}

/// Result of comparing a track against a route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoadMatch {
    pub same_road: bool,
    pub same_dir: bool,
}

impl RoadMatch {
    pub fn same_road_and_dir(&self) -> bool {
        self.same_road && self.same_dir
    }
}

/// Nearest route point by linear scan: (distance m, index)
///
/// Returns `None` for an empty route.
pub fn nearest_route_point(point: &LatLng, route: &[LatLng]) -> Option<(f64, usize)> {
    route
        .iter()
        .enumerate()
        .map(|(i, p)| (distance_m(point, p), i))
        .fold(None, |best, (d, i)| match best {
            Some((best_d, _)) if best_d <= d => best,
            _ => Some((d, i)),
        })
}

/// Same-road test
///
/// Returns the verdict and, per track point, the index of its nearest route point.
pub fn is_on_same_road(
    route: &[LatLng],
    track: &[LatLng],
    config: &MatcherConfig,
) -> (bool, Vec<usize>) {
    if route.is_empty() || track.is_empty() {
        return (false, Vec::new());
    }

    let mut close_count = 0usize;
    let mut nearest = Vec::with_capacity(track.len());

    for p in track {
        if let Some((d, idx)) = nearest_route_point(p, route) {
            nearest.push(idx);
            if d <= config.dist_threshold_m {
                close_count += 1;
            }
        }
    }

    let ratio = close_count as f64 / track.len() as f64;
    (ratio >= config.ratio_threshold, nearest)
}

/// Same-direction test: track heading (last two points) vs route heading at the last match
pub fn is_same_direction(
    route: &[LatLng],
    track: &[LatLng],
    nearest: &[usize],
    config: &MatcherConfig,
) -> bool {
    if track.len() < 2 || route.len() < 2 {
        return false;
    }
    let Some(&last_idx) = nearest.last() else {
        return false;
    };

    let p1 = &track[track.len() - 2];
    let p2 = &track[track.len() - 1];
    let track_heading = bearing_deg(p1, p2);

    let idx = last_idx.min(route.len() - 2);
    let route_heading = bearing_deg(&route[idx], &route[idx + 1]);

    angle_diff_deg(track_heading, route_heading) <= config.angle_threshold_deg
}

/// Combined check; direction is only evaluated when the road matches
pub fn check_same_road_and_direction(
    route: &[LatLng],
    track: &[LatLng],
    config: &MatcherConfig,
) -> RoadMatch {
    let (same_road, nearest) = is_on_same_road(route, track, config);
    if !same_road {
        return RoadMatch::default();
    }

    RoadMatch {
        same_road,
        same_dir: is_same_direction(route, track, &nearest, config),
    }
}
