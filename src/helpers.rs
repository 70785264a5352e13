//! Shared helpers for hourly timestamps and numeric output.
//!
//! Upstream hourly timestamps are local wall-clock times without an offset
//! (`2026-06-01T13:00`), so they are handled as `NaiveDateTime` throughout
//! the pipeline and rendered back to ISO 8601 strings only in the payload.

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};

/// ISO 8601 rendering used for every hour in a payload.
const HOUR_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse an upstream hourly timestamp, with or without seconds.
pub(crate) fn parse_hour(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, HOUR_FORMAT))
        .ok()
}

/// Render an hour as an ISO 8601 string.
pub(crate) fn format_hour(dt: NaiveDateTime) -> String {
    dt.format(HOUR_FORMAT).to_string()
}

/// Floor a datetime to the start of its hour.
pub(crate) fn floor_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.date_naive()
        .and_hms_opt(dt.time().hour(), 0, 0)
        .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        .unwrap_or(dt)
}

/// Round to 3 decimal places, defaulting to 0 for non-finite inputs.
///
/// Used for model output (kWh and its confidence band) where watt-hour
/// precision is plenty.
pub(crate) fn round_3dp(v: f64) -> f64 {
    if !v.is_finite() {
        tracing::warn!("round_3dp received non-finite value {}, defaulting to 0", v);
        return 0.0;
    }
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hour_without_seconds() {
        let dt = parse_hour("2026-06-01T13:00").unwrap();
        assert_eq!(dt.hour(), 13);
    }

    #[test]
    fn test_parse_hour_with_seconds() {
        let dt = parse_hour("2026-06-01T13:00:00").unwrap();
        assert_eq!(format_hour(dt), "2026-06-01T13:00:00");
    }

    #[test]
    fn test_parse_hour_garbage() {
        assert!(parse_hour("yesterday").is_none());
    }

    #[test]
    fn test_floor_to_hour() {
        let dt = "2026-03-01T07:45:30Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(
            floor_to_hour(dt),
            "2026-03-01T07:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_floor_to_hour_exact() {
        let dt = "2026-03-01T07:00:00Z".parse::<DateTime<Utc>>().unwrap();
        assert_eq!(floor_to_hour(dt), dt);
    }

    #[test]
    fn test_round_3dp() {
        assert_eq!(round_3dp(1.23456), 1.235);
        assert_eq!(round_3dp(0.0004), 0.0);
    }

    #[test]
    fn test_round_3dp_non_finite() {
        assert_eq!(round_3dp(f64::NAN), 0.0);
        assert_eq!(round_3dp(f64::INFINITY), 0.0);
    }
}
