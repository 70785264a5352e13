//! Open-Meteo hourly forecast client.
//!
//! Fetches temperature, cloud cover, shortwave radiation and UV index for a
//! location, retrying rate limits and transient failures with exponential
//! backoff plus jitter. `fetch` never fails for a valid location: once the
//! retry budget is spent it hands back a synthetic forecast instead.
//! See: https://open-meteo.com/en/docs

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Timelike, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::Deserialize;
use std::f64::consts::PI;
use std::time::Duration;

use crate::config::{Location, WeatherConfig};
use crate::helpers::{floor_to_hour, parse_hour};

const HOURLY_FIELDS: &str = "temperature_2m,cloudcover,shortwave_radiation,uv_index";
const USER_AGENT: &str = concat!("SolarSight/", env!("CARGO_PKG_VERSION"));

/// Cloud cover used by the synthetic forecast (%).
const SYNTHETIC_CLOUD_PCT: f64 = 30.0;
/// Clear-sky noon radiation of the synthetic forecast (W/m²).
const SYNTHETIC_PEAK_RADIATION: f64 = 800.0;
const SYNTHETIC_PEAK_UV: f64 = 8.0;
const SYNTHETIC_MEAN_TEMP_C: f64 = 22.0;
const SYNTHETIC_TEMP_AMPLITUDE_C: f64 = 6.0;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid coordinates: lat={lat}, lon={lon}")]
    InvalidCoordinates { lat: f64, lon: f64 },
    #[error("Rate limited by weather provider after {attempts} attempts")]
    RateLimited { attempts: u32 },
    #[error("Weather provider unavailable: {0}")]
    Unavailable(String),
    #[error("Weather provider rejected the request with HTTP {status}")]
    Rejected { status: u16 },
    #[error("Malformed weather response: {0}")]
    Malformed(String),
}

/// Hourly forecast bundle for one location. Arrays are parallel to `time`,
/// but may be shorter or contain gaps; the feature builder pads them.
#[derive(Debug, Clone)]
pub struct RawForecast {
    pub timezone: String,
    pub timezone_abbreviation: String,
    pub time: Vec<NaiveDateTime>,
    pub temperature_c: Vec<Option<f64>>,
    pub cloud_cover_pct: Vec<Option<f64>>,
    pub shortwave_radiation: Vec<Option<f64>>,
    pub uv_index: Vec<Option<f64>>,
    /// True when this forecast was synthesized rather than fetched.
    pub is_fallback: bool,
}

// --- Open-Meteo JSON response types ---

#[derive(Debug, Deserialize)]
struct OpenMeteoResponse {
    timezone: Option<String>,
    timezone_abbreviation: Option<String>,
    hourly: OpenMeteoHourly,
}

#[derive(Debug, Deserialize)]
struct OpenMeteoHourly {
    #[serde(default)]
    time: Vec<String>,
    #[serde(default)]
    temperature_2m: Vec<Option<f64>>,
    #[serde(default, alias = "cloud_cover")]
    cloudcover: Vec<Option<f64>>,
    #[serde(default)]
    shortwave_radiation: Vec<Option<f64>>,
    #[serde(default)]
    uv_index: Vec<Option<f64>>,
}

/// Outcome of a single HTTP attempt.
enum AttemptError {
    /// Worth retrying after a backoff. `rate_limited` marks HTTP 429.
    Retryable { rate_limited: bool, message: String },
    /// Retrying cannot help; give up immediately.
    Fatal(FetchError),
}

/// Client for the Open-Meteo forecast API.
#[derive(Debug, Clone)]
pub struct WeatherFetcher {
    client: reqwest::Client,
    config: WeatherConfig,
}

impl WeatherFetcher {
    pub fn new(config: WeatherConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self { client, config }
    }

    /// Fetch a forecast for `location`, falling back to synthetic data when the
    /// upstream is unreachable, persistently rate limited, or rejects the request.
    ///
    /// Only a configuration error (coordinates out of range) is returned.
    pub async fn fetch(&self, location: &Location) -> Result<RawForecast, FetchError> {
        match self.fetch_live(location).await {
            Ok(forecast) => Ok(forecast),
            Err(e @ FetchError::InvalidCoordinates { .. }) => Err(e),
            Err(e) => {
                tracing::warn!(
                    "Weather fetch for {} failed ({}), serving synthetic forecast",
                    location.name,
                    e
                );
                Ok(synthetic_forecast(self.config.fetch_hours, Utc::now()))
            }
        }
    }

    /// Fetch a forecast from upstream only, surfacing exhausted retries as errors.
    pub async fn fetch_live(&self, location: &Location) -> Result<RawForecast, FetchError> {
        validate_coordinates(location.lat, location.lon)?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_rate_limited = false;
        let mut last_message = String::new();

        for attempt in 0..max_attempts {
            match self.request_once(location).await {
                Ok(forecast) => return Ok(forecast),
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Retryable {
                    rate_limited,
                    message,
                }) => {
                    last_rate_limited = rate_limited;
                    last_message = message;
                    if attempt + 1 < max_attempts {
                        let wait = self.backoff_delay(attempt);
                        tracing::warn!(
                            "Weather fetch for {} failed: {}. Retrying in {:.2}s (attempt {}/{})",
                            location.name,
                            last_message,
                            wait.as_secs_f64(),
                            attempt + 1,
                            max_attempts
                        );
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        if last_rate_limited {
            Err(FetchError::RateLimited {
                attempts: max_attempts,
            })
        } else {
            Err(FetchError::Unavailable(last_message))
        }
    }

    /// `base^attempt + uniform(0, 1)` backoff units.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        let factor = self.config.backoff_base.max(0.0).powi(attempt as i32) + jitter;
        self.config.backoff_unit.mul_f64(factor)
    }

    async fn request_once(&self, location: &Location) -> Result<RawForecast, AttemptError> {
        let forecast_days = self.config.fetch_hours.div_ceil(24).clamp(1, 16);

        let response = self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("latitude", format!("{:.4}", location.lat)),
                ("longitude", format!("{:.4}", location.lon)),
                ("hourly", HOURLY_FIELDS.to_string()),
                ("forecast_days", forecast_days.to_string()),
                ("timezone", "auto".to_string()),
            ])
            .send()
            .await
            .map_err(|e| AttemptError::Retryable {
                rate_limited: false,
                message: format!("request failed: {}", e),
            })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AttemptError::Retryable {
                rate_limited: true,
                message: "HTTP 429 Too Many Requests".to_string(),
            });
        }
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(AttemptError::Retryable {
                rate_limited: false,
                message: format!("HTTP {}", status),
            });
        }
        if !status.is_success() {
            return Err(AttemptError::Fatal(FetchError::Rejected {
                status: status.as_u16(),
            }));
        }

        let body: OpenMeteoResponse = response
            .json()
            .await
            .map_err(|e| AttemptError::Fatal(FetchError::Malformed(e.to_string())))?;

        into_raw_forecast(body, self.config.fetch_hours).map_err(AttemptError::Fatal)
    }
}

fn validate_coordinates(lat: f64, lon: f64) -> Result<(), FetchError> {
    let lat_ok = lat.is_finite() && (-90.0..=90.0).contains(&lat);
    let lon_ok = lon.is_finite() && (-180.0..=180.0).contains(&lon);
    if lat_ok && lon_ok {
        Ok(())
    } else {
        Err(FetchError::InvalidCoordinates { lat, lon })
    }
}

/// Convert the upstream body into a `RawForecast` limited to `hours` entries.
fn into_raw_forecast(body: OpenMeteoResponse, hours: usize) -> Result<RawForecast, FetchError> {
    let hourly = body.hourly;
    if hourly.time.is_empty() {
        return Err(FetchError::Malformed("empty hourly.time".to_string()));
    }

    let time = hourly
        .time
        .iter()
        .take(hours)
        .map(|raw| {
            parse_hour(raw).ok_or_else(|| FetchError::Malformed(format!("bad timestamp {:?}", raw)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let truncate = |mut v: Vec<Option<f64>>| {
        v.truncate(hours);
        v
    };

    Ok(RawForecast {
        timezone: body.timezone.unwrap_or_else(|| "UTC".to_string()),
        timezone_abbreviation: body.timezone_abbreviation.unwrap_or_else(|| "UTC".to_string()),
        time,
        temperature_c: truncate(hourly.temperature_2m),
        cloud_cover_pct: truncate(hourly.cloudcover),
        shortwave_radiation: truncate(hourly.shortwave_radiation),
        uv_index: truncate(hourly.uv_index),
        is_fallback: false,
    })
}

/// Deterministic stand-in forecast anchored to the hour containing `anchor`.
///
/// Radiation and UV follow a half-sine between 06:00 and 18:00 UTC and are
/// zero at night; temperature peaks mid-afternoon; cloud cover is fixed.
pub fn synthetic_forecast(hours: usize, anchor: DateTime<Utc>) -> RawForecast {
    let start = floor_to_hour(anchor);
    let mut forecast = RawForecast {
        timezone: "UTC".to_string(),
        timezone_abbreviation: "UTC".to_string(),
        time: Vec::with_capacity(hours),
        temperature_c: Vec::with_capacity(hours),
        cloud_cover_pct: Vec::with_capacity(hours),
        shortwave_radiation: Vec::with_capacity(hours),
        uv_index: Vec::with_capacity(hours),
        is_fallback: true,
    };

    for i in 0..hours {
        let t = start + ChronoDuration::hours(i as i64);
        let hour = t.hour() as f64;
        let daylight = if hour > 6.0 && hour < 18.0 {
            (PI * (hour - 6.0) / 12.0).sin()
        } else {
            0.0
        };
        let temp = SYNTHETIC_MEAN_TEMP_C + SYNTHETIC_TEMP_AMPLITUDE_C * (PI * (hour - 9.0) / 12.0).sin();

        forecast.time.push(t.naive_utc());
        forecast.temperature_c.push(Some(temp));
        forecast.cloud_cover_pct.push(Some(SYNTHETIC_CLOUD_PCT));
        forecast
            .shortwave_radiation
            .push(Some(SYNTHETIC_PEAK_RADIATION * daylight));
        forecast.uv_index.push(Some(SYNTHETIC_PEAK_UV * daylight));
    }

    forecast
}
