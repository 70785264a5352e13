//! Forecast generation and the read path in front of the cache.
//!
//! `Pipeline` turns a location into a `CachePayload`: weather fetch, feature
//! frame, yield prediction, CO₂ estimate and UV/agri insights. `ForecastService`
//! serves reads: cache first, then (in on-demand mode) a collapsed pipeline run.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{normalize_location_key, AppConfig, Location, ReadMode};
use crate::db::models::CachePayload;
use crate::db::CacheStore;
use crate::errors::AppError;
use crate::helpers::format_hour;
use crate::services::collapser::RequestCollapser;
use crate::services::predictor::Predictor;
use crate::services::weather::{RawForecast, WeatherFetcher};
use crate::services::{co2, features, insights};

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Full forecast pipeline for one location. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    fetcher: WeatherFetcher,
    predictor: Arc<Predictor>,
    prediction_hours: usize,
}

impl Pipeline {
    pub fn new(fetcher: WeatherFetcher, predictor: Arc<Predictor>, prediction_hours: usize) -> Self {
        Self {
            fetcher,
            predictor,
            prediction_hours,
        }
    }

    /// Run the pipeline for `location`.
    ///
    /// With `allow_synthetic`, upstream failures degrade to a synthetic forecast
    /// (`is_fallback = true`); without it they surface as errors.
    pub async fn generate(
        &self,
        location: &Location,
        allow_synthetic: bool,
    ) -> Result<CachePayload, AppError> {
        let raw = if allow_synthetic {
            self.fetcher.fetch(location).await?
        } else {
            self.fetcher.fetch_live(location).await?
        };

        let payload = assemble_payload(
            location,
            &raw,
            &self.predictor,
            self.prediction_hours,
            Utc::now(),
        )?;

        tracing::info!(
            "Generated forecast for {} ({} hours, {:.3} kg CO2, model {}, fallback={})",
            location.name,
            payload.hours.len(),
            payload.co2_kg_total,
            payload.model_version,
            payload.is_fallback
        );
        Ok(payload)
    }
}

/// Build a payload from an already-fetched forecast. Pure apart from logging.
pub fn assemble_payload(
    location: &Location,
    raw: &RawForecast,
    predictor: &Predictor,
    prediction_hours: usize,
    now: DateTime<Utc>,
) -> Result<CachePayload, AppError> {
    let frame = features::build(raw);
    let prediction = predictor.predict_next_24h(&frame);
    if prediction.is_empty() {
        return Err(AppError::PredictionUnavailable(format!(
            "model {} produced no output for {}",
            prediction.model_version, location.name
        )));
    }

    let co2_kg_per_hour: Vec<f64> = prediction
        .pred_kwh
        .iter()
        .map(|&kwh| co2::avoided_co2_kg(kwh, &location.name))
        .collect();
    let co2_kg_total: f64 = co2_kg_per_hour.iter().take(prediction_hours).sum();

    let insights = insights::derive(raw, prediction_hours);

    Ok(CachePayload {
        location: location.name.clone(),
        generated_at_utc: now,
        timezone: raw.timezone.clone(),
        timezone_abbr: raw.timezone_abbreviation.clone(),
        hours: prediction.hours.iter().map(|&t| format_hour(t)).collect(),
        pred_kwh: prediction.pred_kwh,
        confidence: prediction.confidence,
        co2_kg_per_hour,
        co2_kg_total,
        model_version: prediction.model_version,
        is_fallback: raw.is_fallback,
        uv_index: insights.uv_index,
        peak_uv: insights.peak_uv,
        peak_uv_hour: insights.peak_uv_hour,
        uv_risk_level: insights.uv_risk.label().to_string(),
        safe_sun_exposure_mins: insights.uv_risk.safe_exposure_mins(),
        agri_drying_windows: insights.drying_windows,
        agri_irrigation_advice: insights.irrigation_advice.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Read path
// ---------------------------------------------------------------------------

/// Serves forecasts to HTTP handlers.
#[derive(Clone)]
pub struct ForecastService {
    locations: Arc<Vec<Location>>,
    pipeline: Pipeline,
    cache: CacheStore,
    collapser: Arc<RequestCollapser>,
    read_mode: ReadMode,
    on_demand_synthetic: bool,
    ttl: Duration,
}

impl ForecastService {
    pub fn new(
        config: &AppConfig,
        pipeline: Pipeline,
        cache: CacheStore,
        collapser: Arc<RequestCollapser>,
    ) -> Self {
        Self {
            locations: Arc::new(config.locations.clone()),
            pipeline,
            cache,
            collapser,
            read_mode: config.read_mode,
            on_demand_synthetic: config.on_demand_synthetic,
            ttl: config.scheduler.ttl,
        }
    }

    pub fn locations(&self) -> &[Location] {
        &self.locations
    }

    #[cfg(test)]
    pub(crate) fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Forecast for `raw_key`.
    ///
    /// A hit is returned as-is. On a miss: `NotReady` in precomputed-only
    /// mode, `UnknownLocation` for keys outside the configured set, otherwise
    /// one collapsed pipeline run whose result is cached with the configured TTL.
    pub async fn get_forecast(&self, raw_key: &str) -> Result<CachePayload, AppError> {
        let key = normalize_location_key(raw_key);

        if let Some(hit) = self.cache.get(&key).await {
            tracing::debug!("Cache hit for '{}'", key);
            return Ok(hit);
        }

        let location = self
            .locations
            .iter()
            .find(|l| l.name == key)
            .cloned()
            .ok_or_else(|| AppError::UnknownLocation(key.clone()))?;

        if self.read_mode == ReadMode::PrecomputedOnly {
            return Err(AppError::NotReady(format!(
                "Forecast for '{}' is still being computed",
                key
            )));
        }

        let pipeline = self.pipeline.clone();
        let allow_synthetic = self.on_demand_synthetic;
        self.collapser
            .get_or_compute(&self.cache, &key, Some(self.ttl), move || async move {
                pipeline.generate(&location, allow_synthetic).await
            })
            .await
    }
}
