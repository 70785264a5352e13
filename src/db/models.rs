use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Precomputed forecast for one location, as stored in the cache and served
/// to clients. All numeric series are parallel to `hours`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CachePayload {
    /// Location key (e.g. "paris")
    pub location: String,
    /// When this payload was generated; drives debounce
    pub generated_at_utc: DateTime<Utc>,
    /// IANA timezone of the forecast hours (e.g. "Europe/Paris")
    pub timezone: String,
    /// Timezone abbreviation (e.g. "CEST")
    #[serde(default)]
    pub timezone_abbr: String,
    /// Local forecast hours in ISO 8601, strictly increasing
    pub hours: Vec<String>,
    /// Predicted solar yield per hour in kWh (never negative)
    pub pred_kwh: Vec<f64>,
    /// Confidence band per hour in kWh
    pub confidence: Vec<f64>,
    /// CO2 avoided per hour in kg
    pub co2_kg_per_hour: Vec<f64>,
    /// CO2 avoided over the delivered hours in kg
    pub co2_kg_total: f64,
    /// Model that produced the prediction ("V0-Heuristic" without an artifact)
    #[serde(default)]
    pub model_version: String,
    /// True when built from a synthetic forecast because upstream was unavailable
    #[serde(default)]
    pub is_fallback: bool,
    /// UV index per hour
    #[serde(default)]
    pub uv_index: Vec<f64>,
    /// Highest UV index over the delivered hours
    #[serde(default)]
    pub peak_uv: f64,
    /// Hour index of the UV peak
    #[serde(default)]
    pub peak_uv_hour: usize,
    /// WHO UV risk category ("Low" .. "Extreme")
    #[serde(default)]
    pub uv_risk_level: String,
    /// Safe unprotected sun exposure in minutes
    #[serde(default)]
    pub safe_sun_exposure_mins: u32,
    /// Hour indices suitable for sun-drying crops
    #[serde(default)]
    pub agri_drying_windows: Vec<usize>,
    /// Best irrigation window
    #[serde(default)]
    pub agri_irrigation_advice: String,
}

impl CachePayload {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.generated_at_utc
    }

    /// Younger than `threshold` at `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, threshold: std::time::Duration) -> bool {
        match Duration::from_std(threshold) {
            Ok(threshold) => self.age(now) < threshold,
            Err(_) => true,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_payload(location: &str, generated_at_utc: DateTime<Utc>) -> CachePayload {
    CachePayload {
        location: location.to_string(),
        generated_at_utc,
        timezone: "Europe/Paris".to_string(),
        timezone_abbr: "CEST".to_string(),
        hours: vec![
            "2026-06-01T11:00:00".to_string(),
            "2026-06-01T12:00:00".to_string(),
        ],
        pred_kwh: vec![4.2, 6.8],
        confidence: vec![0.504, 0.816],
        co2_kg_per_hour: vec![0.231, 0.374],
        co2_kg_total: 0.605,
        model_version: "V0-Heuristic".to_string(),
        is_fallback: false,
        uv_index: vec![5.0, 6.0],
        peak_uv: 6.0,
        peak_uv_hour: 1,
        uv_risk_level: "High".to_string(),
        safe_sun_exposure_mins: 25,
        agri_drying_windows: vec![1],
        agri_irrigation_advice: "Morning (06:00-09:00)".to_string(),
    }
}
