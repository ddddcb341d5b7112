//! CrossroadEngine - Crossroad Proximity State Machine
//!
//! ## Responsibilities
//!
//! - Load the static crossroad table
//! - Precompute entry/exit bearings and turn type for crossroads on a new route
//! - Advance per-vehicle, per-crossroad approach status from live distance samples
//!
//! Only transitions are reported, so callers broadcast each state change exactly once.

mod types;

pub use types::*;

use crate::error::{Error, Result};
use crate::geo_utils::{bearing_deg, haversine_m, Compass};
use crate::models::LatLng;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// Load the crossroad table (columns: itstId, itstNm, mapCtptIntLat, mapCtptIntLot)
pub fn load_crossroad_table(path: &Path) -> Result<Vec<Crossroad>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Config(format!("crossroad map {}: {}", path.display(), e)))?;
    parse_crossroad_table(file)
}

/// Parse a crossroad table from any CSV source (extra columns are ignored)
pub fn parse_crossroad_table<R: std::io::Read>(reader: R) -> Result<Vec<Crossroad>> {
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut table = Vec::new();
    for row in rdr.deserialize() {
        let crossroad: Crossroad = row?;
        table.push(crossroad);
    }
    Ok(table)
}

/// Classify the turn between an entry vector (prev -> cross) and exit vector (cross -> next)
///
/// Vectors are planar in (lng, lat) order. Returns the kind and the angle between the vectors.
pub fn classify_turn(prev: &LatLng, cross: &LatLng, next: &LatLng) -> (TurnKind, f64) {
    let vin = (cross.lng - prev.lng, cross.lat - prev.lat);
    let vout = (next.lng - cross.lng, next.lat - cross.lat);

    let vin_mag = (vin.0 * vin.0 + vin.1 * vin.1).sqrt();
    let vout_mag = (vout.0 * vout.0 + vout.1 * vout.1).sqrt();
    if vin_mag == 0.0 || vout_mag == 0.0 {
        return (TurnKind::Unknown, 0.0);
    }

    let dot = vin.0 * vout.0 + vin.1 * vout.1;
    let cos_theta = (dot / (vin_mag * vout_mag)).clamp(-1.0, 1.0);
    let angle = cos_theta.acos().to_degrees();

    let cross_val = vin.0 * vout.1 - vin.1 * vout.0;

    let kind = if angle < 30.0 {
        TurnKind::Straight
    } else if (60.0..=120.0).contains(&angle) {
        if cross_val > 0.0 {
            TurnKind::Left
        } else {
            TurnKind::Right
        }
    } else if angle > 150.0 {
        TurnKind::UTurn
    } else {
        TurnKind::Other
    };

    (kind, angle)
}

/// Find every crossroad the route passes within `radius_m` and precompute its geometry
///
/// All returned crossroads start in `Pending`.
pub fn compute_expected_crossroads(
    route: &[LatLng],
    table: &[Crossroad],
    radius_m: f64,
) -> Vec<ExpectedCrossroad> {
    let mut results = Vec::new();

    for crossroad in table {
        let inside: Vec<usize> = route
            .iter()
            .enumerate()
            .filter(|(_, p)| haversine_m(p.lat, p.lng, crossroad.lat, crossroad.lon) <= radius_m)
            .map(|(i, _)| i)
            .collect();

        let (first_idx, last_idx) = match (inside.first(), inside.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => continue,
        };

        let has_prev = first_idx > 0;
        let has_next = last_idx + 1 < route.len();

        let in_angle = has_prev.then(|| bearing_deg(&route[first_idx - 1], &route[first_idx]));
        let out_angle = has_next.then(|| bearing_deg(&route[last_idx], &route[last_idx + 1]));
        let in_dir = in_angle.map(Compass::from_bearing);
        let out_dir = out_angle.map(Compass::from_bearing);

        let (turn, rel_angle) = if has_prev && has_next {
            let mid = &route[(first_idx + last_idx) / 2];
            let (kind, angle) = classify_turn(&route[first_idx - 1], mid, &route[last_idx + 1]);
            (kind, Some(angle))
        } else {
            (TurnKind::Unknown, None)
        };

        let explain = explain_passage(in_dir, out_dir, turn, rel_angle);

        tracing::debug!(
            crossroad = %crossroad.name,
            first_idx = first_idx,
            last_idx = last_idx,
            in_dir = ?in_dir,
            out_dir = ?out_dir,
            turn = ?turn,
            rel_angle = ?rel_angle,
            "Crossroad on route"
        );

        results.push(ExpectedCrossroad {
            id: crossroad.id,
            name: crossroad.name.clone(),
            lat: crossroad.lat,
            lon: crossroad.lon,
            in_angle,
            in_dir,
            out_angle,
            out_dir,
            turn,
            rel_angle,
            explain,
            status: CrossroadStatus::Pending,
        });
    }

    results
}

fn explain_passage(
    in_dir: Option<Compass>,
    out_dir: Option<Compass>,
    turn: TurnKind,
    rel_angle: Option<f64>,
) -> String {
    match (in_dir, out_dir) {
        (Some(i), Some(o)) => {
            let turn = turn.as_str();
            match rel_angle {
                Some(angle) => format!(
                    "approach from {} -> leave toward {} ({}, {:.1}°)",
                    i.as_str(),
                    o.as_str(),
                    turn,
                    angle
                ),
                None => format!(
                    "approach from {} -> leave toward {} ({})",
                    i.as_str(),
                    o.as_str(),
                    turn
                ),
            }
        }
        (Some(i), None) => format!("approach from {} (exit direction unknown)", i.as_str()),
        (None, Some(o)) => format!("leave toward {} (entry direction unknown)", o.as_str()),
        (None, None) => "not enough route points around crossroad".to_string(),
    }
}

/// Next status for a live distance sample, if any
///
/// At most one transition per sample. A pending crossroad only advances via the
/// approach threshold, even when the sample is already inside the arrival radius.
pub fn next_status(
    status: CrossroadStatus,
    distance_m: f64,
    config: &CrossroadConfig,
) -> Option<CrossroadStatus> {
    match status {
        CrossroadStatus::Pending if distance_m <= config.approach_m => {
            Some(CrossroadStatus::Approaching)
        }
        CrossroadStatus::Approaching if distance_m <= config.arrive_m => {
            Some(CrossroadStatus::Arrived)
        }
        CrossroadStatus::Arrived if distance_m > config.arrive_m => Some(CrossroadStatus::Passed),
        _ => None,
    }
}

/// CrossroadEngine instance
pub struct CrossroadEngine {
    table: Vec<Crossroad>,
    config: CrossroadConfig,
    /// vehicle id -> crossroads on the vehicle's active route
    expected: RwLock<HashMap<String, Vec<ExpectedCrossroad>>>,
}

impl CrossroadEngine {
    /// Create new CrossroadEngine
    pub fn new(table: Vec<Crossroad>, config: CrossroadConfig) -> Self {
        Self {
            table,
            config,
            expected: RwLock::new(HashMap::new()),
        }
    }

    /// Create with default thresholds
    pub fn with_table(table: Vec<Crossroad>) -> Self {
        Self::new(table, CrossroadConfig::default())
    }

    /// Number of crossroads in the static table
    pub fn table_len(&self) -> usize {
        self.table.len()
    }

    /// Replace the vehicle's expected crossroads from a new route
    pub async fn plan_route(&self, car: &str, route: &[LatLng]) -> Vec<ExpectedCrossroad> {
        let crossroads = compute_expected_crossroads(route, &self.table, self.config.route_radius_m);

        tracing::info!(
            car = %car,
            route_points = route.len(),
            crossroads = crossroads.len(),
            "Expected crossroads computed"
        );

        self.expected
            .write()
            .await
            .insert(car.to_string(), crossroads.clone());

        crossroads
    }

    /// Evaluate a live position and return the transitions it caused
    pub async fn evaluate(&self, car: &str, position: &LatLng) -> Vec<CrossroadTransition> {
        let mut expected = self.expected.write().await;
        let crossroads = match expected.get_mut(car) {
            Some(c) if !c.is_empty() => c,
            _ => {
                tracing::trace!(car = %car, "No expected crossroads for vehicle");
                return Vec::new();
            }
        };

        let mut transitions = Vec::new();
        for crossroad in crossroads.iter_mut() {
            if crossroad.status.is_terminal() {
                continue;
            }

            let d = haversine_m(position.lat, position.lng, crossroad.lat, crossroad.lon);
            if let Some(to) = next_status(crossroad.status, d, &self.config) {
                let from = crossroad.status;
                crossroad.status = to;

                tracing::info!(
                    car = %car,
                    crossroad = %crossroad.name,
                    from = ?from,
                    to = ?to,
                    distance_m = %format!("{:.1}", d),
                    "Crossroad status changed"
                );

                transitions.push(CrossroadTransition {
                    crossroad: crossroad.clone(),
                    from,
                    to,
                    distance_m: d,
                });
            }
        }

        transitions
    }

    /// Current expected crossroads for a vehicle
    pub async fn expected(&self, car: &str) -> Vec<ExpectedCrossroad> {
        self.expected
            .read()
            .await
            .get(car)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop the vehicle's expected crossroads (dispatch finished)
    pub async fn clear(&self, car: &str) {
        self.expected.write().await.remove(car);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M_PER_DEG_LAT: f64 = 111_194.93;

    fn crossroad_at(lat: f64, lon: f64) -> Crossroad {
        Crossroad {
            id: 1,
            name: "Main & 1st".to_string(),
            lat,
            lon,
        }
    }

    /// Straight route heading north through (37.0, 127.0), ~11 m spacing
    fn northbound_route() -> Vec<LatLng> {
        (0..100)
            .map(|i| LatLng::new(36.995 + i as f64 * 0.0001, 127.0))
            .collect()
    }

    /// Heads north to (37.0, 127.0), then turns east
    fn north_then_east_route() -> Vec<LatLng> {
        let mut route: Vec<LatLng> = (0..50)
            .map(|i| LatLng::new(36.995 + i as f64 * 0.0001, 127.0))
            .collect();
        route.extend((0..50).map(|i| LatLng::new(37.0, 127.0 + i as f64 * 0.0001)));
        route
    }

    fn north_of(c: &Crossroad, meters: f64) -> LatLng {
        LatLng::new(c.lat + meters / M_PER_DEG_LAT, c.lon)
    }

    #[test]
    fn test_parse_crossroad_table_trims_and_ignores_extra_columns() {
        let csv_data = " itstId , itstNm ,mapCtptIntLat,mapCtptIntLot,extra\n\
                        1001, City Hall ,37.5665,126.9780,x\n\
                        1002,Station,37.5547,126.9707,y\n";
        let table = parse_crossroad_table(csv_data.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0].id, 1001);
        assert_eq!(table[0].name, "City Hall");
        assert!((table[1].lon - 126.9707).abs() < 1e-9);
    }

    #[test]
    fn test_straight_route_through_crossroad() {
        let table = vec![crossroad_at(37.0, 127.0)];
        let result = compute_expected_crossroads(&northbound_route(), &table, 50.0);

        assert_eq!(result.len(), 1);
        let c = &result[0];
        assert_eq!(c.status, CrossroadStatus::Pending);
        assert_eq!(c.in_dir, Some(Compass::N));
        assert_eq!(c.out_dir, Some(Compass::N));
        assert_eq!(c.turn, TurnKind::Straight);
        assert!(c.rel_angle.unwrap() < 1.0);
    }

    #[test]
    fn test_right_turn_classified() {
        let table = vec![crossroad_at(37.0, 127.0)];
        let result = compute_expected_crossroads(&north_then_east_route(), &table, 50.0);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].in_dir, Some(Compass::N));
        assert_eq!(result[0].out_dir, Some(Compass::E));
        assert_eq!(result[0].turn, TurnKind::Right);
    }

    #[test]
    fn test_crossroad_off_route_skipped() {
        let table = vec![crossroad_at(37.0, 127.01)];
        let result = compute_expected_crossroads(&northbound_route(), &table, 50.0);
        assert!(result.is_empty());
    }

    #[test]
    fn test_route_starting_inside_radius_has_no_entry() {
        let table = vec![crossroad_at(36.995, 127.0)];
        let result = compute_expected_crossroads(&northbound_route(), &table, 50.0);

        assert_eq!(result.len(), 1);
        assert_eq!(result[0].in_dir, None);
        assert_eq!(result[0].out_dir, Some(Compass::N));
        assert_eq!(result[0].turn, TurnKind::Unknown);
        assert_eq!(result[0].rel_angle, None);
    }

    #[test]
    fn test_classify_turn_buckets() {
        let o = LatLng::new(0.0, 0.0);
        let south = LatLng::new(-1.0, 0.0);
        // heading north, then west = left
        let (kind, angle) = classify_turn(&south, &o, &LatLng::new(0.0, -1.0));
        assert_eq!(kind, TurnKind::Left);
        assert!((angle - 90.0).abs() < 1e-9);
        // heading north, then back south = U-turn
        let (kind, _) = classify_turn(&south, &o, &LatLng::new(-1.0, 0.0));
        assert_eq!(kind, TurnKind::UTurn);
        // 45° veer = other
        let (kind, angle) = classify_turn(&south, &o, &LatLng::new(1.0, 1.0));
        assert_eq!(kind, TurnKind::Other);
        assert!((angle - 45.0).abs() < 1e-9);
        // zero-length vector
        let (kind, _) = classify_turn(&o, &o, &south);
        assert_eq!(kind, TurnKind::Unknown);
    }

    #[test]
    fn test_next_status_boundaries_inclusive() {
        let cfg = CrossroadConfig::default();
        assert_eq!(next_status(CrossroadStatus::Pending, 300.1, &cfg), None);
        assert_eq!(
            next_status(CrossroadStatus::Pending, 300.0, &cfg),
            Some(CrossroadStatus::Approaching)
        );
        assert_eq!(next_status(CrossroadStatus::Approaching, 50.1, &cfg), None);
        assert_eq!(
            next_status(CrossroadStatus::Approaching, 50.0, &cfg),
            Some(CrossroadStatus::Arrived)
        );
        assert_eq!(next_status(CrossroadStatus::Arrived, 50.0, &cfg), None);
        assert_eq!(
            next_status(CrossroadStatus::Arrived, 50.1, &cfg),
            Some(CrossroadStatus::Passed)
        );
        assert_eq!(next_status(CrossroadStatus::Passed, 10.0, &cfg), None);
        assert_eq!(next_status(CrossroadStatus::Passed, 1000.0, &cfg), None);
    }

    #[test]
    fn test_pending_inside_arrival_radius_only_approaches() {
        let cfg = CrossroadConfig::default();
        assert_eq!(
            next_status(CrossroadStatus::Pending, 10.0, &cfg),
            Some(CrossroadStatus::Approaching)
        );
    }

    #[tokio::test]
    async fn test_distance_sequence_transitions() {
        let c = crossroad_at(37.0, 127.0);
        let engine = CrossroadEngine::with_table(vec![c.clone()]);
        engine.plan_route("119da119", &northbound_route()).await;

        let mut statuses = Vec::new();
        for d in [500.0, 200.0, 40.0, 60.0] {
            engine.evaluate("119da119", &north_of(&c, d)).await;
            statuses.push(engine.expected("119da119").await[0].status);
        }

        assert_eq!(
            statuses,
            vec![
                CrossroadStatus::Pending,
                CrossroadStatus::Approaching,
                CrossroadStatus::Arrived,
                CrossroadStatus::Passed,
            ]
        );
    }

    #[tokio::test]
    async fn test_passed_is_never_resurrected() {
        let c = crossroad_at(37.0, 127.0);
        let engine = CrossroadEngine::with_table(vec![c.clone()]);
        engine.plan_route("car", &northbound_route()).await;

        for d in [100.0, 20.0, 80.0] {
            engine.evaluate("car", &north_of(&c, d)).await;
        }
        for d in [250.0, 10.0, 60.0] {
            let transitions = engine.evaluate("car", &north_of(&c, d)).await;
            assert!(transitions.is_empty());
        }
        assert_eq!(engine.expected("car").await[0].status, CrossroadStatus::Passed);
    }

    #[tokio::test]
    async fn test_transition_reports_distance() {
        let c = crossroad_at(37.0, 127.0);
        let engine = CrossroadEngine::with_table(vec![c.clone()]);
        engine.plan_route("car", &northbound_route()).await;

        let transitions = engine.evaluate("car", &north_of(&c, 150.0)).await;
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, CrossroadStatus::Pending);
        assert_eq!(transitions[0].to, CrossroadStatus::Approaching);
        assert!((transitions[0].distance_m - 150.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn test_unknown_vehicle_and_clear() {
        let c = crossroad_at(37.0, 127.0);
        let engine = CrossroadEngine::with_table(vec![c.clone()]);
        assert!(engine.evaluate("ghost", &north_of(&c, 10.0)).await.is_empty());

        engine.plan_route("car", &northbound_route()).await;
        assert_eq!(engine.expected("car").await.len(), 1);
        engine.clear("car").await;
        assert!(engine.expected("car").await.is_empty());
        assert!(engine.evaluate("car", &north_of(&c, 100.0)).await.is_empty());
    }

    #[tokio::test]
    async fn test_new_route_replaces_statuses() {
        let c = crossroad_at(37.0, 127.0);
        let engine = CrossroadEngine::with_table(vec![c.clone()]);
        engine.plan_route("car", &northbound_route()).await;
        engine.evaluate("car", &north_of(&c, 100.0)).await;
        assert_eq!(engine.expected("car").await[0].status, CrossroadStatus::Approaching);

        engine.plan_route("car", &northbound_route()).await;
        assert_eq!(engine.expected("car").await[0].status, CrossroadStatus::Pending);
    }
}
