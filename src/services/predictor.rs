//! Solar yield prediction.
//!
//! The model is chosen once at startup: a trained linear artifact exported as
//! JSON when one is available, otherwise a radiation-proportional heuristic.
//! Both sit behind `YieldModel`; `Predictor` applies the horizon, the
//! non-negativity clamp, the night-time guardrail and the confidence band
//! uniformly, whatever the model returned.

use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::helpers::round_3dp;
use crate::services::features::{FeatureFrame, FeatureRecord};

/// Confidence band as a fraction of the predicted value.
pub const CONFIDENCE_FRACTION: f64 = 0.12;

pub const HEURISTIC_VERSION: &str = "V0-Heuristic";

/// kWh per W/m² of radiation for a ~10 kW peak system (50 m² at 20%).
const SYSTEM_CAPACITY_FACTOR: f64 = 0.01;

/// Full overcast (100%) keeps a third of clear-sky yield.
const CLOUD_DERATE_DIVISOR: f64 = 150.0;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Model artifact requires unknown column '{0}'")]
    UnknownColumn(String),
    #[error("Model produced {got} values for {expected} hours")]
    LengthMismatch { expected: usize, got: usize },
    #[error("Model produced a non-finite value at hour {0}")]
    NonFinite(usize),
}

/// A source of raw (unguarded) hourly yield estimates.
pub trait YieldModel: Send + Sync {
    fn version(&self) -> &str;
    fn predict_raw(&self, records: &[FeatureRecord]) -> Result<Vec<f64>, ModelError>;
}

/// Yield proportional to radiation, de-rated by cloud cover.
#[derive(Debug, Default)]
pub struct HeuristicPredictor;

impl YieldModel for HeuristicPredictor {
    fn version(&self) -> &str {
        HEURISTIC_VERSION
    }

    fn predict_raw(&self, records: &[FeatureRecord]) -> Result<Vec<f64>, ModelError> {
        Ok(records
            .iter()
            .map(|r| {
                let derate = 1.0 - r.cloud_cover_pct / CLOUD_DERATE_DIVISOR;
                (r.radiation * SYSTEM_CAPACITY_FACTOR * derate).max(0.0)
            })
            .collect())
    }
}

/// Columns of the artifact's training schema. Radiation is called `ghi` there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactColumn {
    Temp,
    Cloud,
    Ghi,
    GhiLag1,
    GhiRoll3,
    Hour,
    DayOfYear,
    Uv,
}

impl ArtifactColumn {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "temp" => Some(Self::Temp),
            "cloud" => Some(Self::Cloud),
            "ghi" | "radiation" => Some(Self::Ghi),
            "ghi_lag1" => Some(Self::GhiLag1),
            "ghi_roll3" => Some(Self::GhiRoll3),
            "hour" => Some(Self::Hour),
            "dayofyear" => Some(Self::DayOfYear),
            "uv" => Some(Self::Uv),
            _ => None,
        }
    }

    fn value(self, r: &FeatureRecord) -> f64 {
        match self {
            Self::Temp => r.temperature_c,
            Self::Cloud => r.cloud_cover_pct,
            Self::Ghi => r.radiation,
            Self::GhiLag1 => r.radiation_lag1,
            Self::GhiRoll3 => r.radiation_roll3,
            Self::Hour => r.hour as f64,
            Self::DayOfYear => r.day_of_year as f64,
            Self::Uv => r.uv_index,
        }
    }
}

/// On-disk artifact format.
#[derive(Debug, Deserialize)]
struct ArtifactFile {
    model_version: String,
    #[serde(default)]
    intercept: f64,
    coefficients: BTreeMap<String, f64>,
}

/// Linear model exported by the training job.
#[derive(Debug)]
pub struct ArtifactPredictor {
    version: String,
    intercept: f64,
    weights: Vec<(ArtifactColumn, f64)>,
}

impl ArtifactPredictor {
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ModelError> {
        let file: ArtifactFile = serde_json::from_str(raw)?;
        let weights = file
            .coefficients
            .into_iter()
            .map(|(name, w)| {
                ArtifactColumn::from_name(&name)
                    .map(|col| (col, w))
                    .ok_or(ModelError::UnknownColumn(name))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version: file.model_version,
            intercept: file.intercept,
            weights,
        })
    }
}

impl YieldModel for ArtifactPredictor {
    fn version(&self) -> &str {
        &self.version
    }

    fn predict_raw(&self, records: &[FeatureRecord]) -> Result<Vec<f64>, ModelError> {
        Ok(records
            .iter()
            .map(|r| {
                self.weights
                    .iter()
                    .fold(self.intercept, |acc, (col, w)| acc + w * col.value(r))
            })
            .collect())
    }
}

/// Hourly yield prediction. An empty result means "prediction unavailable",
/// never "zero yield".
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub hours: Vec<NaiveDateTime>,
    pub pred_kwh: Vec<f64>,
    pub confidence: Vec<f64>,
    pub model_version: String,
}

impl PredictionResult {
    fn empty(model_version: &str) -> Self {
        Self {
            hours: Vec::new(),
            pred_kwh: Vec::new(),
            confidence: Vec::new(),
            model_version: model_version.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pred_kwh.is_empty()
    }
}

/// Model wrapper enforcing output invariants.
pub struct Predictor {
    model: Box<dyn YieldModel>,
    horizon_hours: usize,
}

impl Predictor {
    pub fn new(model: Box<dyn YieldModel>, horizon_hours: usize) -> Self {
        Self {
            model,
            horizon_hours,
        }
    }

    pub fn heuristic(horizon_hours: usize) -> Self {
        Self::new(Box::new(HeuristicPredictor), horizon_hours)
    }

    /// Load the artifact at `path`, or fall back to the heuristic.
    pub fn from_artifact_path(path: &str, horizon_hours: usize) -> Self {
        let path = Path::new(path);
        if !path.exists() {
            tracing::info!(
                "No model artifact found at {}; using heuristic predictor",
                path.display()
            );
            return Self::heuristic(horizon_hours);
        }

        match ArtifactPredictor::load(path) {
            Ok(artifact) => {
                tracing::info!(
                    "Loaded model artifact {} from {}",
                    artifact.version(),
                    path.display()
                );
                Self::new(Box::new(artifact), horizon_hours)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to load model artifact at {}: {}; using heuristic predictor",
                    path.display(),
                    e
                );
                Self::heuristic(horizon_hours)
            }
        }
    }

    pub fn model_version(&self) -> &str {
        self.model.version()
    }

    /// Predict the first `horizon_hours` hours of `frame`.
    ///
    /// Any model fault yields an empty result instead of an error.
    pub fn predict_next_24h(&self, frame: &FeatureFrame) -> PredictionResult {
        let n = frame.len().min(self.horizon_hours);
        let records = &frame.records[..n];
        if records.is_empty() {
            tracing::warn!("Prediction requested for an empty feature frame");
            return PredictionResult::empty(self.model.version());
        }

        match self.guarded_predict(records) {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Prediction error ({}): {}", self.model.version(), e);
                PredictionResult::empty(self.model.version())
            }
        }
    }

    fn guarded_predict(&self, records: &[FeatureRecord]) -> Result<PredictionResult, ModelError> {
        let raw = self.model.predict_raw(records)?;
        if raw.len() != records.len() {
            return Err(ModelError::LengthMismatch {
                expected: records.len(),
                got: raw.len(),
            });
        }
        if let Some(i) = raw.iter().position(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite(i));
        }

        let mut pred_kwh = Vec::with_capacity(records.len());
        let mut confidence = Vec::with_capacity(records.len());
        for (record, y) in records.iter().zip(raw) {
            // No sun, no yield, whatever the model says.
            let y = if record.radiation <= 0.0 { 0.0 } else { y.max(0.0) };
            let kwh = round_3dp(y);
            pred_kwh.push(kwh);
            confidence.push(round_3dp(kwh * CONFIDENCE_FRACTION));
        }

        Ok(PredictionResult {
            hours: records.iter().map(|r| r.time).collect(),
            pred_kwh,
            confidence,
            model_version: self.model.version().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::parse_hour;

    fn record(offset: u32, radiation: f64, cloud: f64) -> FeatureRecord {
        let time = parse_hour("2026-06-01T00:00").unwrap()
            + chrono::Duration::hours(offset as i64);
        FeatureRecord {
            time,
            temperature_c: 20.0,
            cloud_cover_pct: cloud,
            radiation,
            uv_index: 3.0,
            radiation_lag1: radiation,
            radiation_roll3: radiation,
            hour: offset % 24,
            day_of_year: 152,
        }
    }

    fn frame(radiation: &[f64]) -> FeatureFrame {
        FeatureFrame {
            records: radiation
                .iter()
                .enumerate()
                .map(|(h, &r)| record(h as u32, r, 0.0))
                .collect(),
        }
    }

    struct Broken;

    impl YieldModel for Broken {
        fn version(&self) -> &str {
            "broken"
        }
        fn predict_raw(&self, _: &[FeatureRecord]) -> Result<Vec<f64>, ModelError> {
            Ok(vec![f64::NAN])
        }
    }

    #[test]
    fn test_heuristic_yield() {
        let p = Predictor::heuristic(24);
        let f = FeatureFrame {
            records: vec![record(12, 1000.0, 0.0), record(13, 1000.0, 75.0)],
        };
        let result = p.predict_next_24h(&f);
        assert_eq!(result.pred_kwh, vec![10.0, 5.0]);
        assert_eq!(result.model_version, HEURISTIC_VERSION);
    }

    #[test]
    fn test_confidence_is_fixed_fraction() {
        let p = Predictor::heuristic(24);
        let result = p.predict_next_24h(&frame(&[500.0, 800.0]));
        for (kwh, conf) in result.pred_kwh.iter().zip(&result.confidence) {
            assert!((conf - kwh * CONFIDENCE_FRACTION).abs() < 1e-3);
        }
    }

    #[test]
    fn test_guardrail_zeroes_night_hours_for_artifact() {
        // Intercept alone would predict 5 kWh at midnight.
        let artifact = ArtifactPredictor::from_json(
            r#"{"model_version": "1.0-linear", "intercept": 5.0, "coefficients": {"temp": 0.1}}"#,
        )
        .unwrap();
        let p = Predictor::new(Box::new(artifact), 24);
        let result = p.predict_next_24h(&frame(&[0.0, -3.0, 400.0, 0.0]));

        assert_eq!(result.pred_kwh[0], 0.0);
        assert_eq!(result.pred_kwh[1], 0.0);
        assert!(result.pred_kwh[2] > 0.0);
        assert_eq!(result.pred_kwh[3], 0.0);
        assert_eq!(result.model_version, "1.0-linear");
    }

    #[test]
    fn test_guardrail_holds_for_any_features() {
        let p = Predictor::heuristic(24);
        for cloud in [0.0, 50.0, 100.0] {
            let f = FeatureFrame {
                records: vec![record(3, 0.0, cloud), record(4, -1.0, cloud)],
            };
            assert!(p.predict_next_24h(&f).pred_kwh.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_negative_outputs_are_clamped() {
        let artifact = ArtifactPredictor::from_json(
            r#"{"model_version": "neg", "intercept": -10.0, "coefficients": {"ghi": 0.001}}"#,
        )
        .unwrap();
        let p = Predictor::new(Box::new(artifact), 24);
        let result = p.predict_next_24h(&frame(&[800.0]));
        assert_eq!(result.pred_kwh, vec![0.0]);
    }

    #[test]
    fn test_artifact_maps_schema_columns() {
        let artifact = ArtifactPredictor::from_json(
            r#"{"model_version": "m", "intercept": 0.0,
                "coefficients": {"ghi": 0.01, "ghi_lag1": 0.001, "ghi_roll3": 0.0, "hour": 0.0, "dayofyear": 0.0, "cloud": 0.0}}"#,
        )
        .unwrap();
        let p = Predictor::new(Box::new(artifact), 24);
        let result = p.predict_next_24h(&frame(&[100.0]));
        // 100 * 0.01 + lag(100) * 0.001
        assert_eq!(result.pred_kwh, vec![1.1]);
    }

    #[test]
    fn test_artifact_rejects_unknown_column() {
        let err = ArtifactPredictor::from_json(
            r#"{"model_version": "m", "coefficients": {"wind_speed": 1.0}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ModelError::UnknownColumn(c) if c == "wind_speed"));
    }

    #[test]
    fn test_missing_artifact_selects_heuristic() {
        let p = Predictor::from_artifact_path("/definitely/not/here.json", 24);
        assert_eq!(p.model_version(), HEURISTIC_VERSION);
    }

    #[test]
    fn test_horizon_limits_output() {
        let p = Predictor::heuristic(24);
        let result = p.predict_next_24h(&frame(&[100.0; 48]));
        assert_eq!(result.hours.len(), 24);
        assert_eq!(result.pred_kwh.len(), 24);
        assert_eq!(result.confidence.len(), 24);
    }

    #[test]
    fn test_model_fault_yields_empty_result() {
        let p = Predictor::new(Box::new(Broken), 24);
        let result = p.predict_next_24h(&frame(&[100.0]));
        assert!(result.is_empty());
        assert!(result.hours.is_empty());
        assert!(result.confidence.is_empty());
    }

    #[test]
    fn test_empty_frame_yields_empty_result() {
        let p = Predictor::heuristic(24);
        assert!(p.predict_next_24h(&FeatureFrame::default()).is_empty());
    }
}
