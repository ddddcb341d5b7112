//! Inbound wire messages

use crate::error::{Error, Result};
use crate::models::LatLng;
use serde::Deserialize;

/// Number that may arrive as a JSON number or a numeric string
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Coord {
    Num(f64),
    Text(String),
}

impl Coord {
    /// Finite numeric value; `"NaN"` and `"inf"` strings are rejected
    pub fn value(&self) -> Result<f64> {
        let v = match self {
            Coord::Num(v) => *v,
            Coord::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::Parse(format!("not a number: '{}'", s)))?,
        };
        if !v.is_finite() {
            return Err(Error::Validation(format!("not a finite number: {}", v)));
        }
        Ok(v)
    }
}

/// Route point as `[lat, lng]` or `{lat, lng}`
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RoutePoint {
    Pair(Vec<Coord>),
    Object { lat: Coord, lng: Coord },
}

/// `{lat, lng}` object with both fields optional on the wire
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PositionInput {
    #[serde(default)]
    pub lat: Option<Coord>,
    #[serde(default)]
    pub lng: Option<Coord>,
}

impl PositionInput {
    /// Both coordinates, or a validation error
    pub fn resolve(&self) -> Result<LatLng> {
        match (&self.lat, &self.lng) {
            (Some(lat), Some(lng)) => Ok(LatLng::new(lat.value()?, lng.value()?)),
            _ => Err(Error::Validation("current.lat and current.lng are required".to_string())),
        }
    }
}

/// Client -> server message
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Start {
        car: String,
        #[serde(alias = "time")]
        start_time: String,
    },
    Arrival {
        car: String,
        #[serde(default)]
        start_time: Option<String>,
        #[serde(alias = "time")]
        arrival_time: String,
    },
    Route {
        car: String,
        #[serde(default, alias = "path")]
        route_points: Vec<RoutePoint>,
        #[serde(default)]
        duration: Option<Coord>,
    },
    Current {
        car: String,
        #[serde(default)]
        current: PositionInput,
        #[serde(default)]
        speed: Option<Coord>,
    },
    NormalCurrent {
        car: String,
        #[serde(default)]
        current: PositionInput,
    },
    Video {
        #[serde(default)]
        car: Option<String>,
        #[serde(default)]
        frame: String,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Start { .. } => "start",
            InboundMessage::Arrival { .. } => "arrival",
            InboundMessage::Route { .. } => "route",
            InboundMessage::Current { .. } => "current",
            InboundMessage::NormalCurrent { .. } => "normal_current",
            InboundMessage::Video { .. } => "video",
        }
    }
}

/// Parse a text frame; the `type` found (if any) is returned alongside parse errors
pub fn parse_inbound(text: &str) -> std::result::Result<InboundMessage, (Option<String>, Error)> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| (None, Error::Parse(format!("invalid JSON: {}", e))))?;

    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string);

    match kind.as_deref() {
        None => Err((None, Error::Validation("missing 'type'".to_string()))),
        Some("start" | "arrival" | "route" | "current" | "normal_current" | "video") => {
            serde_json::from_value(value).map_err(|e| (kind.clone(), Error::Parse(e.to_string())))
        }
        Some(other) => Err((
            kind.clone(),
            Error::Validation(format!("unknown message type '{}'", other)),
        )),
    }
}

/// Normalise route points; short pairs are skipped, unparsable numbers fail
pub fn normalize_route(points: &[RoutePoint]) -> Result<Vec<LatLng>> {
    let mut out = Vec::with_capacity(points.len());
    for p in points {
        match p {
            RoutePoint::Pair(pair) if pair.len() >= 2 => {
                out.push(LatLng::new(pair[0].value()?, pair[1].value()?));
            }
            RoutePoint::Pair(_) => continue,
            RoutePoint::Object { lat, lng } => {
                out.push(LatLng::new(lat.value()?, lng.value()?));
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_start_with_time_alias() {
        let msg = parse_inbound(r#"{"type":"start","car":"amb1","time":"2025-12-05 15:00:00"}"#).unwrap();
        match msg {
            InboundMessage::Start { car, start_time } => {
                assert_eq!(car, "amb1");
                assert_eq!(start_time, "2025-12-05 15:00:00");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_route_mixed_points() {
        let msg = parse_inbound(
            r#"{"type":"route","car":"amb1","path":[[37.1,127.1],{"lat":"37.2","lng":127.2},[1]],"duration":"600"}"#,
        )
        .unwrap();
        let InboundMessage::Route {
            route_points,
            duration,
            ..
        } = msg
        else {
            panic!("expected route");
        };
        let pts = normalize_route(&route_points).unwrap();
        assert_eq!(pts, vec![LatLng::new(37.1, 127.1), LatLng::new(37.2, 127.2)]);
        assert_eq!(duration.unwrap().value().unwrap(), 600.0);
    }

    #[test]
    fn test_route_with_bad_number_fails() {
        let InboundMessage::Route { route_points, .. } =
            parse_inbound(r#"{"type":"route","car":"a","route_points":[["x",1]]}"#).unwrap()
        else {
            panic!("expected route");
        };
        assert!(normalize_route(&route_points).is_err());
    }

    #[test]
    fn test_current_requires_both_coordinates() {
        let InboundMessage::Current { current, .. } =
            parse_inbound(r#"{"type":"current","car":"a","current":{"lat":37.0}}"#).unwrap()
        else {
            panic!("expected current");
        };
        assert!(matches!(current.resolve(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_non_finite_numbers_rejected() {
        for raw in ["NaN", "inf", "-infinity"] {
            let coord = Coord::Text(raw.to_string());
            assert!(matches!(coord.value(), Err(Error::Validation(_))), "{}", raw);
        }
        assert_eq!(Coord::Text(" 37.5 ".to_string()).value().unwrap(), 37.5);

        let InboundMessage::Current { current, .. } =
            parse_inbound(r#"{"type":"current","car":"a","current":{"lat":"NaN","lng":127.0}}"#).unwrap()
        else {
            panic!("expected current");
        };
        assert!(matches!(current.resolve(), Err(Error::Validation(_))));

        let InboundMessage::Route { route_points, .. } =
            parse_inbound(r#"{"type":"route","car":"a","route_points":[["inf",127.0]]}"#).unwrap()
        else {
            panic!("expected route");
        };
        assert!(normalize_route(&route_points).is_err());
    }

    #[test]
    fn test_parse_errors_report_type() {
        let (kind, err) = parse_inbound("{not json").unwrap_err();
        assert!(kind.is_none());
        assert!(matches!(err, Error::Parse(_)));

        let (kind, err) = parse_inbound(r#"{"type":"teleport"}"#).unwrap_err();
        assert_eq!(kind.as_deref(), Some("teleport"));
        assert!(matches!(err, Error::Validation(_)));

        let (kind, _) = parse_inbound(r#"{"type":"route"}"#).unwrap_err();
        assert_eq!(kind.as_deref(), Some("route"));

        let (kind, _) = parse_inbound(r#"{"car":"a"}"#).unwrap_err();
        assert!(kind.is_none());
    }

    #[test]
    fn test_video_car_is_optional() {
        let msg = parse_inbound(r#"{"type":"video","frame":"AAAA"}"#).unwrap();
        assert_eq!(msg.kind(), "video");
        assert!(matches!(msg, InboundMessage::Video { car: None, .. }));
    }
}
