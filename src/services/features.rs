//! Hourly feature engineering for the yield model.
//!
//! Missing or short upstream arrays are padded with neutral defaults rather
//! than rejected, so a partial forecast still yields a full frame. Lag and
//! rolling statistics only look backwards within the frame.

use chrono::{Datelike, NaiveDateTime, Timelike};

use crate::services::weather::RawForecast;

pub const DEFAULT_TEMPERATURE_C: f64 = 25.0;
pub const DEFAULT_CLOUD_PCT: f64 = 50.0;
pub const DEFAULT_RADIATION: f64 = 0.0;
pub const DEFAULT_UV: f64 = 0.0;

/// Window of the rolling radiation mean, current hour included.
const ROLLING_WINDOW: usize = 3;

/// Features for one forecast hour.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub time: NaiveDateTime,
    pub temperature_c: f64,
    pub cloud_cover_pct: f64,
    /// Shortwave radiation (GHI) in W/m².
    pub radiation: f64,
    pub uv_index: f64,
    /// Previous hour's radiation; 0 for the first hour.
    pub radiation_lag1: f64,
    /// Mean radiation over this hour and up to two before it.
    pub radiation_roll3: f64,
    pub hour: u32,
    pub day_of_year: u32,
}

/// Ordered per-hour features derived from one `RawForecast`.
#[derive(Debug, Clone, Default)]
pub struct FeatureFrame {
    pub records: Vec<FeatureRecord>,
}

impl FeatureFrame {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn value_at(values: &[Option<f64>], i: usize, default: f64) -> f64 {
    values
        .get(i)
        .copied()
        .flatten()
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

/// Build the feature frame. One record per timestamp; deterministic.
pub fn build(forecast: &RawForecast) -> FeatureFrame {
    let mut records = Vec::with_capacity(forecast.time.len());
    let mut radiation_history: Vec<f64> = Vec::with_capacity(forecast.time.len());

    for (i, &time) in forecast.time.iter().enumerate() {
        let radiation = value_at(&forecast.shortwave_radiation, i, DEFAULT_RADIATION);
        let radiation_lag1 = radiation_history.last().copied().unwrap_or(0.0);

        radiation_history.push(radiation);
        let window_start = radiation_history.len().saturating_sub(ROLLING_WINDOW);
        let window = &radiation_history[window_start..];
        let radiation_roll3 = window.iter().sum::<f64>() / window.len() as f64;

        records.push(FeatureRecord {
            time,
            temperature_c: value_at(&forecast.temperature_c, i, DEFAULT_TEMPERATURE_C),
            cloud_cover_pct: value_at(&forecast.cloud_cover_pct, i, DEFAULT_CLOUD_PCT),
            radiation,
            uv_index: value_at(&forecast.uv_index, i, DEFAULT_UV),
            radiation_lag1,
            radiation_roll3,
            hour: time.hour(),
            day_of_year: time.ordinal(),
        });
    }

    FeatureFrame { records }
}
