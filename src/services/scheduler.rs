//! Background precompute scheduler.
//!
//! Refreshes the cache for every configured location on a fixed interval so
//! reads are normally served from cache.
//!
//! Architecture:
//! - Sleeps `initial_delay`, then runs a cycle every `refresh_interval`
//! - A cycle refreshes at most `concurrency` locations at a time
//! - A location whose cached payload is younger than `debounce` is skipped
//! - A failing location is logged and recorded; the cycle continues
//! - After each cycle expired entries and idle request locks are pruned
//! - State is in-memory (`Arc<RwLock<SchedulerState>>`) for the status endpoint

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use utoipa::ToSchema;

use crate::config::{Location, SchedulerConfig};
use crate::db::{CacheStore, WriteOutcome};
use crate::services::collapser::RequestCollapser;
use crate::services::pipeline::Pipeline;

// ---------------------------------------------------------------------------
// Scheduler state (in-memory, shared via Arc<RwLock<>>)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPhase {
    Idle,
    Running,
}

/// Outcome of a location's most recent refresh.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LocationRefreshStatus {
    pub location: String,
    /// "refreshed", "skipped_fresh", "error: ...", or "pending"
    pub last_result: String,
    /// `generated_at_utc` of the payload now in cache, when known
    pub generated_at: Option<DateTime<Utc>>,
    pub is_fallback: Option<bool>,
}

/// Global scheduler state, exposed via the status endpoint.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SchedulerState {
    pub phase: SchedulerPhase,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
    pub last_cycle_duration_ms: Option<u64>,
    pub total_cycles: u64,
    pub locations: Vec<LocationRefreshStatus>,
}

impl SchedulerState {
    pub fn new(locations: &[Location]) -> Self {
        Self {
            phase: SchedulerPhase::Idle,
            next_run_at: None,
            last_cycle_completed_at: None,
            last_cycle_duration_ms: None,
            total_cycles: 0,
            locations: locations
                .iter()
                .map(|l| LocationRefreshStatus {
                    location: l.name.clone(),
                    last_result: "pending".to_string(),
                    generated_at: None,
                    is_fallback: None,
                })
                .collect(),
        }
    }
}

/// Shared scheduler state handle.
pub type SharedSchedulerState = Arc<RwLock<SchedulerState>>;

// ---------------------------------------------------------------------------
// Single-location refresh
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum RefreshOutcome {
    Refreshed {
        generated_at: DateTime<Utc>,
        is_fallback: bool,
    },
    SkippedFresh {
        generated_at: DateTime<Utc>,
        is_fallback: bool,
    },
    Error(String),
}

impl RefreshOutcome {
    fn into_status(self, location: &str) -> LocationRefreshStatus {
        let (last_result, generated_at, is_fallback) = match self {
            RefreshOutcome::Refreshed {
                generated_at,
                is_fallback,
            } => ("refreshed".to_string(), Some(generated_at), Some(is_fallback)),
            RefreshOutcome::SkippedFresh {
                generated_at,
                is_fallback,
            } => ("skipped_fresh".to_string(), Some(generated_at), Some(is_fallback)),
            RefreshOutcome::Error(msg) => (format!("error: {}", msg), None, None),
        };
        LocationRefreshStatus {
            location: location.to_string(),
            last_result,
            generated_at,
            is_fallback,
        }
    }
}

/// Counts from one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct PrecomputeScheduler {
    pipeline: Pipeline,
    cache: CacheStore,
    collapser: Arc<RequestCollapser>,
    locations: Vec<Location>,
    config: SchedulerConfig,
    state: SharedSchedulerState,
}

impl PrecomputeScheduler {
    pub fn new(
        pipeline: Pipeline,
        cache: CacheStore,
        collapser: Arc<RequestCollapser>,
        locations: Vec<Location>,
        config: SchedulerConfig,
        state: SharedSchedulerState,
    ) -> Self {
        Self {
            pipeline,
            cache,
            collapser,
            locations,
            config,
            state,
        }
    }

    /// Run forever. Should be spawned via `tokio::spawn(scheduler.run())`.
    pub async fn run(self) {
        tracing::info!(
            "Precompute scheduler started ({} locations, every {}s, concurrency {})",
            self.locations.len(),
            self.config.refresh_interval.as_secs(),
            self.config.concurrency
        );

        self.set_next_run(self.config.initial_delay).await;
        tokio::time::sleep(self.config.initial_delay).await;

        loop {
            self.run_cycle().await;
            self.set_next_run(self.config.refresh_interval).await;
            tokio::time::sleep(self.config.refresh_interval).await;
        }
    }

    async fn set_next_run(&self, after: Duration) {
        let next = ChronoDuration::from_std(after)
            .ok()
            .map(|d| Utc::now() + d);
        self.state.write().await.next_run_at = next;
    }

    /// Refresh every location once.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle_start = Utc::now();
        self.state.write().await.phase = SchedulerPhase::Running;
        tracing::info!("Scheduler: refreshing {} locations", self.locations.len());

        // `buffered` keeps results in location order while running up to
        // `concurrency` refreshes at once.
        let statuses: Vec<LocationRefreshStatus> = stream::iter(self.locations.clone())
            .map(|location| async move {
                let outcome = self.refresh_location(&location).await;
                if !self.config.inter_location_delay.is_zero() {
                    tokio::time::sleep(self.config.inter_location_delay).await;
                }
                outcome.into_status(&location.name)
            })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut report = CycleReport::default();
        for status in &statuses {
            match status.last_result.as_str() {
                "refreshed" => report.refreshed += 1,
                "skipped_fresh" => report.skipped += 1,
                _ => report.failed += 1,
            }
        }

        match self.cache.purge_expired().await {
            Ok(0) => {}
            Ok(n) => tracing::debug!("Scheduler: purged {} expired cache entries", n),
            Err(e) => tracing::warn!("Scheduler: failed to purge expired entries: {}", e),
        }
        let pruned = self.collapser.prune_idle();
        if pruned > 0 {
            tracing::debug!(
                "Scheduler: pruned {} idle request locks ({} remain)",
                pruned,
                self.collapser.len()
            );
        }

        let duration_ms = (Utc::now() - cycle_start).num_milliseconds().max(0) as u64;
        {
            let mut s = self.state.write().await;
            s.phase = SchedulerPhase::Idle;
            s.locations = statuses;
            s.last_cycle_completed_at = Some(Utc::now());
            s.last_cycle_duration_ms = Some(duration_ms);
            s.total_cycles += 1;
        }

        tracing::info!(
            "Scheduler: cycle complete in {}ms ({} refreshed, {} skipped, {} failed)",
            duration_ms,
            report.refreshed,
            report.skipped,
            report.failed
        );
        report
    }

    async fn refresh_location(&self, location: &Location) -> RefreshOutcome {
        if let Some(existing) = self.cache.get(&location.name).await {
            if existing.is_fresh(Utc::now(), self.config.debounce) {
                tracing::debug!(
                    "Scheduler: {} is fresh (generated {}), skipping",
                    location.name,
                    existing.generated_at_utc
                );
                return RefreshOutcome::SkippedFresh {
                    generated_at: existing.generated_at_utc,
                    is_fallback: existing.is_fallback,
                };
            }
        }

        let payload = match self.pipeline.generate(location, true).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Scheduler: pipeline failed for {}: {}", location.name, e);
                return RefreshOutcome::Error(e.to_string());
            }
        };

        match self
            .cache
            .set(&location.name, &payload, Some(self.config.ttl))
            .await
        {
            Ok(WriteOutcome::Stored) => {}
            Ok(WriteOutcome::Dropped) => {
                return RefreshOutcome::Error(
                    "payload dropped by cache canonicalization".to_string(),
                );
            }
            Err(e) => {
                tracing::error!("Scheduler: failed to cache {}: {}", location.name, e);
                return RefreshOutcome::Error(e.to_string());
            }
        }

        RefreshOutcome::Refreshed {
            generated_at: payload.generated_at_utc,
            is_fallback: payload.is_fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeatherConfig;
    use crate::db::models::sample_payload;
    use crate::services::predictor::Predictor;
    use crate::services::weather::WeatherFetcher;
    use std::sync::Mutex;
    use std::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn open_meteo_body() -> serde_json::Value {
        let time: Vec<String> = (0..24).map(|h| format!("2026-06-01T{:02}:00", h)).collect();
        serde_json::json!({
            "timezone": "UTC",
            "timezone_abbreviation": "UTC",
            "hourly": {
                "time": time,
                "temperature_2m": vec![20.0; 24],
                "cloudcover": vec![10.0; 24],
                "shortwave_radiation": vec![400.0; 24],
                "uv_index": vec![5.0; 24],
            }
        })
    }

    fn scheduler_config(concurrency: usize) -> SchedulerConfig {
        SchedulerConfig {
            refresh_interval: Duration::from_secs(900),
            initial_delay: Duration::ZERO,
            debounce: Duration::from_secs(720),
            ttl: Duration::from_secs(3600),
            concurrency,
            inter_location_delay: Duration::ZERO,
        }
    }

    fn scheduler(
        server: &MockServer,
        locations: Vec<Location>,
        cache: CacheStore,
        concurrency: usize,
    ) -> PrecomputeScheduler {
        let weather = WeatherConfig {
            api_url: format!("{}/v1/forecast", server.uri()),
            request_timeout: Duration::from_secs(5),
            max_attempts: 1,
            backoff_base: 2.0,
            backoff_unit: Duration::from_millis(1),
            fetch_hours: 24,
        };
        let pipeline = Pipeline::new(
            WeatherFetcher::new(weather),
            Arc::new(Predictor::heuristic(24)),
            24,
        );
        let state = Arc::new(RwLock::new(SchedulerState::new(&locations)));
        PrecomputeScheduler::new(
            pipeline,
            cache,
            Arc::new(RequestCollapser::new()),
            locations,
            scheduler_config(concurrency),
            state,
        )
    }

    fn paris() -> Location {
        Location::new("paris", 48.8566, 2.3522)
    }

    #[tokio::test]
    async fn test_fresh_entry_is_debounced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_body()))
            .expect(0)
            .mount(&server)
            .await;

        let cache = CacheStore::in_memory(true);
        let cached = sample_payload("paris", Utc::now() - ChronoDuration::minutes(5));
        cache.set("paris", &cached, None).await.unwrap();

        let s = scheduler(&server, vec![paris()], cache.clone(), 3);
        let report = s.run_cycle().await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.refreshed, 0);
        assert_eq!(cache.get("paris").await.unwrap(), cached);
    }

    #[tokio::test]
    async fn test_stale_entry_is_refreshed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_body()))
            .expect(1)
            .mount(&server)
            .await;

        let cache = CacheStore::in_memory(true);
        let stale_at = Utc::now() - ChronoDuration::minutes(20);
        cache
            .set("paris", &sample_payload("paris", stale_at), None)
            .await
            .unwrap();

        let s = scheduler(&server, vec![paris()], cache.clone(), 3);
        let report = s.run_cycle().await;

        assert_eq!(report.refreshed, 1);
        let refreshed = cache.get("paris").await.unwrap();
        assert!(refreshed.generated_at_utc > stale_at);
        assert!(!refreshed.is_fallback);
    }

    #[tokio::test]
    async fn test_back_to_back_cycles_fetch_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_body()))
            .expect(1)
            .mount(&server)
            .await;

        let s = scheduler(&server, vec![paris()], CacheStore::in_memory(true), 3);
        let first = s.run_cycle().await;
        let second = s.run_cycle().await;

        assert_eq!(first.refreshed, 1);
        assert_eq!(second.skipped, 1);
    }

    #[tokio::test]
    async fn test_failing_location_does_not_stop_cycle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_body()))
            .mount(&server)
            .await;

        let broken = Location::new("nowhere", 123.0, 500.0);
        let cache = CacheStore::in_memory(true);
        let s = scheduler(&server, vec![broken, paris()], cache.clone(), 1);
        let report = s.run_cycle().await;

        assert_eq!(report.failed, 1);
        assert_eq!(report.refreshed, 1);
        assert!(cache.get("paris").await.is_some());
        assert!(cache.get("nowhere").await.is_none());

        let state = s.state.read().await;
        assert!(state.locations[0].last_result.starts_with("error: "));
        assert_eq!(state.locations[1].last_result, "refreshed");
    }

    #[tokio::test]
    async fn test_upstream_outage_caches_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cache = CacheStore::in_memory(true);
        let s = scheduler(&server, vec![paris()], cache.clone(), 3);
        let report = s.run_cycle().await;

        assert_eq!(report.refreshed, 1);
        assert!(cache.get("paris").await.unwrap().is_fallback);
    }

    #[tokio::test]
    async fn test_state_after_cycle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(open_meteo_body()))
            .mount(&server)
            .await;

        let locations = vec![paris(), Location::new("london", 51.5074, -0.1278)];
        let s = scheduler(&server, locations, CacheStore::in_memory(true), 2);
        {
            let state = s.state.read().await;
            assert_eq!(state.phase, SchedulerPhase::Idle);
            assert!(state.locations.iter().all(|l| l.last_result == "pending"));
        }

        s.run_cycle().await;

        let state = s.state.read().await;
        assert_eq!(state.phase, SchedulerPhase::Idle);
        assert_eq!(state.total_cycles, 1);
        assert!(state.last_cycle_completed_at.is_some());
        let names: Vec<&str> = state.locations.iter().map(|l| l.location.as_str()).collect();
        assert_eq!(names, vec!["paris", "london"]);
        assert!(state.locations.iter().all(|l| l.generated_at.is_some()));
    }

    /// Records when each upstream request arrives.
    struct ArrivalRecorder {
        arrivals: Arc<Mutex<Vec<Instant>>>,
    }

    impl Respond for ArrivalRecorder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.arrivals.lock().unwrap().push(Instant::now());
            ResponseTemplate::new(200)
                .set_body_json(open_meteo_body())
                .set_delay(Duration::from_millis(200))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_is_bounded() {
        let server = MockServer::start().await;
        let arrivals = Arc::new(Mutex::new(Vec::new()));
        Mock::given(method("GET"))
            .respond_with(ArrivalRecorder {
                arrivals: arrivals.clone(),
            })
            .mount(&server)
            .await;

        let locations = vec![
            paris(),
            Location::new("london", 51.5074, -0.1278),
            Location::new("berlin", 52.52, 13.405),
            Location::new("madrid", 40.4168, -3.7038),
        ];
        let s = scheduler(&server, locations, CacheStore::in_memory(true), 2);
        let report = s.run_cycle().await;
        assert_eq!(report.refreshed, 4);

        let mut arrivals = arrivals.lock().unwrap().clone();
        arrivals.sort();
        assert_eq!(arrivals.len(), 4);
        // With two slots, the third request can only start once one of the
        // first two has finished.
        assert!(arrivals[2].duration_since(arrivals[0]) >= Duration::from_millis(150));
        assert!(arrivals[3].duration_since(arrivals[1]) >= Duration::from_millis(150));
    }
}
