//! UV health and agricultural advisories derived from the raw forecast.
//!
//! Computed over the delivered prediction horizon and stored alongside the
//! yield prediction in each payload.

use crate::services::features::{DEFAULT_CLOUD_PCT, DEFAULT_RADIATION, DEFAULT_TEMPERATURE_C};
use crate::services::weather::RawForecast;

/// Radiation above which an hour is good for sun-drying crops (W/m²).
const DRYING_MIN_RADIATION: f64 = 400.0;
/// Cloud cover below which an hour is good for sun-drying crops (%).
const DRYING_MAX_CLOUD_PCT: f64 = 30.0;
/// Hours averaged for the irrigation temperature check.
const IRRIGATION_WINDOW_HOURS: usize = 12;
const IRRIGATION_HOT_TEMP_C: f64 = 28.0;
const IRRIGATION_HIGH_UV: f64 = 6.0;
/// Reported when no hour has any UV.
const DEFAULT_PEAK_UV_HOUR: usize = 12;

pub const IRRIGATE_EVENING: &str = "Evening (after 17:00)";
pub const IRRIGATE_MORNING: &str = "Morning (06:00-09:00)";

/// WHO UV index exposure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UvRisk {
    Low,
    Moderate,
    High,
    VeryHigh,
    Extreme,
}

impl UvRisk {
    pub fn classify(peak_uv: f64) -> Self {
        if peak_uv >= 11.0 {
            UvRisk::Extreme
        } else if peak_uv >= 8.0 {
            UvRisk::VeryHigh
        } else if peak_uv >= 6.0 {
            UvRisk::High
        } else if peak_uv >= 3.0 {
            UvRisk::Moderate
        } else {
            UvRisk::Low
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            UvRisk::Low => "Low",
            UvRisk::Moderate => "Moderate",
            UvRisk::High => "High",
            UvRisk::VeryHigh => "Very High",
            UvRisk::Extreme => "Extreme",
        }
    }

    /// Minutes of unprotected exposure before burning risk for fair skin.
    pub fn safe_exposure_mins(self) -> u32 {
        match self {
            UvRisk::Low => 60,
            UvRisk::Moderate => 45,
            UvRisk::High => 25,
            UvRisk::VeryHigh => 15,
            UvRisk::Extreme => 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForecastInsights {
    pub uv_index: Vec<f64>,
    pub peak_uv: f64,
    pub peak_uv_hour: usize,
    pub uv_risk: UvRisk,
    pub drying_windows: Vec<usize>,
    pub irrigation_advice: &'static str,
}

fn at(values: &[Option<f64>], i: usize, default: f64) -> f64 {
    values.get(i).copied().flatten().filter(|v| v.is_finite()).unwrap_or(default)
}

/// Summarize the first `hours` hours of `forecast`.
pub fn derive(forecast: &RawForecast, hours: usize) -> ForecastInsights {
    let n = forecast.time.len().min(hours);

    let uv_index: Vec<f64> = (0..n).map(|i| at(&forecast.uv_index, i, 0.0)).collect();

    // First hour reaching the maximum.
    let (peak_uv_hour, peak_uv) = uv_index
        .iter()
        .copied()
        .enumerate()
        .fold((DEFAULT_PEAK_UV_HOUR, 0.0), |(best_i, best), (i, uv)| {
            if uv > best {
                (i, uv)
            } else {
                (best_i, best)
            }
        });

    let drying_windows = (0..n)
        .filter(|&i| {
            at(&forecast.shortwave_radiation, i, DEFAULT_RADIATION) > DRYING_MIN_RADIATION
                && at(&forecast.cloud_cover_pct, i, DEFAULT_CLOUD_PCT) < DRYING_MAX_CLOUD_PCT
        })
        .collect();

    let avg_temp = if forecast.temperature_c.len() >= IRRIGATION_WINDOW_HOURS {
        (0..IRRIGATION_WINDOW_HOURS)
            .map(|i| at(&forecast.temperature_c, i, DEFAULT_TEMPERATURE_C))
            .sum::<f64>()
            / IRRIGATION_WINDOW_HOURS as f64
    } else {
        DEFAULT_TEMPERATURE_C
    };
    let irrigation_advice = if avg_temp > IRRIGATION_HOT_TEMP_C && peak_uv > IRRIGATION_HIGH_UV {
        IRRIGATE_EVENING
    } else {
        IRRIGATE_MORNING
    };

    ForecastInsights {
        uv_index,
        peak_uv,
        peak_uv_hour,
        uv_risk: UvRisk::classify(peak_uv),
        drying_windows,
        irrigation_advice,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::weather::synthetic_forecast;
    use chrono::{DateTime, Utc};

    fn forecast(uv: Vec<f64>, temp: f64) -> RawForecast {
        let anchor = "2026-06-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let mut f = synthetic_forecast(uv.len(), anchor);
        f.uv_index = uv.into_iter().map(Some).collect();
        f.temperature_c = vec![Some(temp); f.time.len()];
        f
    }

    #[test]
    fn test_uv_risk_bands() {
        assert_eq!(UvRisk::classify(0.0), UvRisk::Low);
        assert_eq!(UvRisk::classify(3.0), UvRisk::Moderate);
        assert_eq!(UvRisk::classify(6.5), UvRisk::High);
        assert_eq!(UvRisk::classify(8.0), UvRisk::VeryHigh);
        assert_eq!(UvRisk::classify(11.2), UvRisk::Extreme);
        assert_eq!(UvRisk::Extreme.safe_exposure_mins(), 10);
        assert_eq!(UvRisk::VeryHigh.label(), "Very High");
    }

    #[test]
    fn test_peak_uv_picks_first_maximum() {
        let mut uv = vec![0.0; 24];
        uv[10] = 7.0;
        uv[14] = 7.0;
        let insights = derive(&forecast(uv, 20.0), 24);
        assert_eq!(insights.peak_uv, 7.0);
        assert_eq!(insights.peak_uv_hour, 10);
        assert_eq!(insights.uv_risk, UvRisk::High);
    }

    #[test]
    fn test_no_uv_reports_noon() {
        let insights = derive(&forecast(vec![0.0; 24], 20.0), 24);
        assert_eq!(insights.peak_uv_hour, 12);
        assert_eq!(insights.uv_risk, UvRisk::Low);
    }

    #[test]
    fn test_drying_windows() {
        let mut f = forecast(vec![5.0; 24], 20.0);
        f.shortwave_radiation = (0..24)
            .map(|h| Some(if (10..=13).contains(&h) { 600.0 } else { 100.0 }))
            .collect();
        f.cloud_cover_pct = vec![Some(10.0); 24];
        f.cloud_cover_pct[12] = Some(45.0);

        let insights = derive(&f, 24);
        assert_eq!(insights.drying_windows, vec![10, 11, 13]);
    }

    #[test]
    fn test_irrigation_advice() {
        let mut uv = vec![0.0; 24];
        uv[12] = 9.0;
        assert_eq!(derive(&forecast(uv.clone(), 32.0), 24).irrigation_advice, IRRIGATE_EVENING);
        assert_eq!(derive(&forecast(uv, 20.0), 24).irrigation_advice, IRRIGATE_MORNING);
    }

    #[test]
    fn test_horizon_limits_uv_series() {
        let insights = derive(&forecast(vec![1.0; 48], 20.0), 24);
        assert_eq!(insights.uv_index.len(), 24);
    }
}
