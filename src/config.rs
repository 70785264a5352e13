use serde::{Deserialize, Serialize};
use std::time::Duration;
use utoipa::ToSchema;

/// Open-Meteo hourly forecast endpoint.
pub const DEFAULT_WEATHER_API_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// A configured forecast location. The name is the cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Location {
    /// Case-normalized identifier (e.g. "cape_town")
    pub name: String,
    /// Latitude (WGS84)
    #[serde(alias = "latitude")]
    pub lat: f64,
    /// Longitude (WGS84)
    #[serde(alias = "longitude")]
    pub lon: f64,
}

impl Location {
    pub fn new(name: &str, lat: f64, lon: f64) -> Self {
        Self {
            name: normalize_location_key(name),
            lat,
            lon,
        }
    }
}

/// Cache keys are trimmed and lower-cased so "Paris " and "paris" collide.
pub fn normalize_location_key(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Built-in location set used when `LOCATIONS` is unset or invalid.
pub fn default_locations() -> Vec<Location> {
    vec![
        Location::new("lagos", 6.5244, 3.3792),
        Location::new("nairobi", -1.286389, 36.817223),
        Location::new("cape_town", -33.9249, 18.4241),
        Location::new("london", 51.5074, -0.1278),
        Location::new("berlin", 52.52, 13.405),
        Location::new("paris", 48.8566, 2.3522),
        Location::new("tokyo", 35.6762, 139.6503),
        Location::new("new_york", 40.7128, -74.0060),
        Location::new("dubai", 25.2048, 55.2708),
        Location::new("sydney", -33.8688, 151.2093),
    ]
}

/// Parse a JSON location list, normalizing names. `None` for anything unusable.
fn parse_locations(raw: &str) -> Option<Vec<Location>> {
    let parsed: Vec<Location> = serde_json::from_str(raw).ok()?;
    if parsed.is_empty() {
        return None;
    }
    Some(
        parsed
            .into_iter()
            .map(|l| Location::new(&l.name, l.lat, l.lon))
            .collect(),
    )
}

/// How the read path behaves on a cache miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Run the collapsed pipeline synchronously and return the fresh payload.
    OnDemand,
    /// Serve only precomputed data; a miss tells the caller to retry shortly.
    PrecomputedOnly,
}

impl ReadMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "precomputed_only" | "precomputed" => ReadMode::PrecomputedOnly,
            _ => ReadMode::OnDemand,
        }
    }
}

/// Upstream weather client settings.
#[derive(Debug, Clone)]
pub struct WeatherConfig {
    pub api_url: String,
    pub request_timeout: Duration,
    /// Total attempts per fetch, including the first one.
    pub max_attempts: u32,
    /// Backoff before retry `n` (0-based) is `base^n + jitter(0,1)` units.
    pub backoff_base: f64,
    /// Length of one backoff unit; one second outside of tests.
    pub backoff_unit: Duration,
    /// Hours requested from upstream.
    pub fetch_hours: usize,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_WEATHER_API_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            max_attempts: 5,
            backoff_base: 2.0,
            backoff_unit: Duration::from_secs(1),
            fetch_hours: 48,
        }
    }
}

/// Cache storage selection and write policy.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    /// Networked backend connection string (Postgres). Probed once at startup.
    pub database_url: Option<String>,
    /// Local durable backend file (SQLite). `None` selects the volatile store.
    pub sqlite_path: Option<String>,
    /// Return serialization faults to the caller instead of logging and dropping.
    pub strict_serialization: bool,
}

/// Precompute scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub refresh_interval: Duration,
    pub initial_delay: Duration,
    pub debounce: Duration,
    pub ttl: Duration,
    /// Maximum locations refreshed concurrently within one cycle.
    pub concurrency: usize,
    /// Pause after each location's refresh; used with `concurrency = 1`.
    pub inter_location_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(900),
            initial_delay: Duration::from_secs(5),
            debounce: Duration::from_secs(720),
            ttl: Duration::from_secs(3600),
            concurrency: 3,
            inter_location_delay: Duration::ZERO,
        }
    }
}

/// Application configuration, parsed from environment variables once in `main`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub locations: Vec<Location>,
    pub model_path: String,
    /// Hours delivered in each payload.
    pub prediction_hours: usize,
    pub read_mode: ReadMode,
    /// Whether the on-demand path may serve synthetic data when upstream is exhausted.
    pub on_demand_synthetic: bool,
    pub weather: WeatherConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let locations = match std::env::var("LOCATIONS") {
            Ok(raw) => parse_locations(&raw).unwrap_or_else(|| {
                tracing::warn!("LOCATIONS is not a non-empty JSON list, using defaults");
                default_locations()
            }),
            Err(_) => default_locations(),
        };

        let sqlite_path = std::env::var("CACHE_SQLITE_PATH")
            .unwrap_or_else(|_| "./data/forecast_cache.db".to_string());

        Self {
            port: env_or("PORT", 8080),
            locations,
            model_path: std::env::var("MODEL_PATH")
                .unwrap_or_else(|_| "./ml/artifacts/yield_model.json".to_string()),
            prediction_hours: env_or("PREDICTION_HOURS", 24usize).max(1),
            read_mode: ReadMode::parse(
                &std::env::var("READ_MODE").unwrap_or_else(|_| "on_demand".to_string()),
            ),
            on_demand_synthetic: env_bool("ON_DEMAND_SYNTHETIC", true),
            weather: WeatherConfig {
                api_url: std::env::var("WEATHER_API_URL")
                    .unwrap_or_else(|_| DEFAULT_WEATHER_API_URL.to_string()),
                request_timeout: Duration::from_secs(env_or("WEATHER_TIMEOUT_SECS", 30)),
                max_attempts: env_or("WEATHER_MAX_ATTEMPTS", 5u32).clamp(1, 10),
                backoff_base: env_or("WEATHER_BACKOFF_BASE", 2.0f64),
                backoff_unit: Duration::from_secs(1),
                fetch_hours: env_or("FETCH_HOURS", 48usize).max(1),
            },
            cache: CacheConfig {
                database_url: std::env::var("CACHE_DATABASE_URL")
                    .ok()
                    .filter(|s| !s.trim().is_empty()),
                sqlite_path: Some(sqlite_path).filter(|s| !s.trim().is_empty()),
                strict_serialization: env_bool(
                    "STRICT_SERIALIZATION",
                    cfg!(debug_assertions),
                ),
            },
            scheduler: SchedulerConfig {
                refresh_interval: Duration::from_secs(env_or("REFRESH_INTERVAL_SECS", 900)),
                initial_delay: Duration::from_secs(env_or("INITIAL_DELAY_SECS", 5)),
                debounce: Duration::from_secs(env_or("DEBOUNCE_SECS", 720)),
                ttl: Duration::from_secs(env_or("CACHE_TTL_SECS", 3600)),
                concurrency: env_or("PRECOMPUTE_CONCURRENCY", 3usize).max(1),
                inter_location_delay: Duration::from_secs(env_or("INTER_LOCATION_DELAY_SECS", 0)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        // NOTE: set_var/remove_var is racy across parallel tests; only this test
        // touches these variables.
        unsafe {
            std::env::remove_var("PORT");
            std::env::remove_var("LOCATIONS");
            std::env::remove_var("PRECOMPUTE_CONCURRENCY");
            std::env::remove_var("DEBOUNCE_SECS");
            std::env::remove_var("READ_MODE");
        }

        let config = AppConfig::from_env();

        assert_eq!(config.port, 8080);
        assert_eq!(config.locations.len(), 10);
        assert_eq!(config.scheduler.concurrency, 3);
        assert_eq!(config.scheduler.debounce, Duration::from_secs(720));
        assert_eq!(config.read_mode, ReadMode::OnDemand);
        assert_eq!(config.weather.fetch_hours, 48);
    }

    #[test]
    fn test_parse_locations_normalizes_names() {
        let locs =
            parse_locations(r#"[{"name": " Paris ", "lat": 48.85, "lon": 2.35}]"#).unwrap();
        assert_eq!(locs.len(), 1);
        assert_eq!(locs[0].name, "paris");
    }

    #[test]
    fn test_parse_locations_rejects_empty_and_garbage() {
        assert!(parse_locations("[]").is_none());
        assert!(parse_locations("not json").is_none());
    }

    #[test]
    fn test_read_mode_parse() {
        assert_eq!(ReadMode::parse("precomputed_only"), ReadMode::PrecomputedOnly);
        assert_eq!(ReadMode::parse("ON_DEMAND"), ReadMode::OnDemand);
        assert_eq!(ReadMode::parse("whatever"), ReadMode::OnDemand);
    }

    #[test]
    fn test_normalize_location_key() {
        assert_eq!(normalize_location_key("  New_York "), "new_york");
    }
}
