//! Forecast cache storage.
//!
//! One `CacheStore` fronts three interchangeable backends, chosen once at
//! startup by probing in order: networked Postgres, local SQLite file,
//! in-process map. Entries carry an optional absolute expiry; expired and
//! missing keys both read as absent. Every write passes through
//! `canonicalize`, so only finite numbers and strings reach storage.

pub mod models;
pub mod queries;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use models::CachePayload;

/// How long to wait for the networked backend during the startup probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const DB_POOL_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("Payload cannot be canonicalized: {0}")]
    Serialization(String),
    #[error("Cached payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result of a cache write that did not hit a backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    /// Lenient mode only: the payload failed canonicalization and was skipped.
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Postgres,
    Sqlite,
    Memory,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Postgres => "postgres",
            BackendKind::Sqlite => "sqlite",
            BackendKind::Memory => "memory",
        }
    }
}

#[derive(Debug)]
struct MemoryEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

#[derive(Clone)]
enum Backend {
    Postgres(PgPool),
    Sqlite(SqlitePool),
    Memory(Arc<DashMap<String, MemoryEntry>>),
}

/// Shared handle to the forecast cache. Cheap to clone.
#[derive(Clone)]
pub struct CacheStore {
    backend: Backend,
    strict: bool,
}

fn check_finite(field: &str, values: &[f64]) -> Result<(), CacheError> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(i) => Err(CacheError::Serialization(format!(
            "{}[{}] is not a finite number",
            field, i
        ))),
        None => Ok(()),
    }
}

/// Convert a payload into the primitive-only JSON that is persisted.
///
/// Rejects non-finite numbers, negative yield, and parallel series of
/// unequal length; renders the generation time as an ISO 8601 string.
pub fn canonicalize(payload: &CachePayload) -> Result<serde_json::Value, CacheError> {
    check_finite("pred_kwh", &payload.pred_kwh)?;
    check_finite("confidence", &payload.confidence)?;
    check_finite("co2_kg_per_hour", &payload.co2_kg_per_hour)?;
    check_finite("uv_index", &payload.uv_index)?;
    check_finite("co2_kg_total", &[payload.co2_kg_total])?;
    check_finite("peak_uv", &[payload.peak_uv])?;

    let n = payload.hours.len();
    if payload.pred_kwh.len() != n
        || payload.confidence.len() != n
        || payload.co2_kg_per_hour.len() != n
    {
        return Err(CacheError::Serialization(format!(
            "series lengths differ: hours={}, pred_kwh={}, confidence={}, co2_kg_per_hour={}",
            n,
            payload.pred_kwh.len(),
            payload.confidence.len(),
            payload.co2_kg_per_hour.len()
        )));
    }
    if let Some(i) = payload.pred_kwh.iter().position(|&v| v < 0.0) {
        return Err(CacheError::Serialization(format!("pred_kwh[{}] is negative", i)));
    }

    serde_json::to_value(payload).map_err(|e| CacheError::Serialization(e.to_string()))
}

/// The payload exactly as a later `get` will return it.
pub fn canonical_form(payload: &CachePayload) -> Result<CachePayload, CacheError> {
    Ok(serde_json::from_value(canonicalize(payload)?)?)
}

fn expiry_from(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl?).ok()?;
    now.checked_add_signed(ttl)
}

impl CacheStore {
    /// Probe backends once, in preference order, and keep the first that works.
    pub async fn connect(config: &CacheConfig) -> Self {
        let strict = config.strict_serialization;

        if let Some(url) = &config.database_url {
            match Self::connect_postgres(url, strict).await {
                Ok(store) => {
                    tracing::info!("Cache backend: postgres");
                    return store;
                }
                Err(e) => tracing::warn!("Postgres cache unavailable ({}), falling back", e),
            }
        }

        if let Some(path) = &config.sqlite_path {
            match Self::connect_sqlite_file(path, strict).await {
                Ok(store) => {
                    tracing::info!("Cache backend: sqlite ({})", path);
                    return store;
                }
                Err(e) => tracing::warn!("SQLite cache unavailable at {} ({}), falling back", path, e),
            }
        }

        tracing::warn!("Cache backend: in-memory (entries are lost on restart)");
        Self::in_memory(strict)
    }

    async fn connect_postgres(url: &str, strict: bool) -> Result<Self, CacheError> {
        let pool = PgPoolOptions::new()
            .max_connections(DB_POOL_MAX_CONNECTIONS)
            .acquire_timeout(PROBE_TIMEOUT)
            .connect(url)
            .await?;
        queries::pg_init(&pool).await?;
        Ok(Self {
            backend: Backend::Postgres(pool),
            strict,
        })
    }

    async fn connect_sqlite_file(path: &str, strict: bool) -> Result<Self, CacheError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::Backend(e.into()))?;
            }
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(DB_POOL_MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::from_sqlite_pool(pool, strict).await
    }

    /// Wrap an existing SQLite pool, creating the table if needed.
    pub async fn from_sqlite_pool(pool: SqlitePool, strict: bool) -> Result<Self, CacheError> {
        queries::sqlite_init(&pool).await?;
        Ok(Self {
            backend: Backend::Sqlite(pool),
            strict,
        })
    }

    pub fn in_memory(strict: bool) -> Self {
        Self {
            backend: Backend::Memory(Arc::new(DashMap::new())),
            strict,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        match self.backend {
            Backend::Postgres(_) => BackendKind::Postgres,
            Backend::Sqlite(_) => BackendKind::Sqlite,
            Backend::Memory(_) => BackendKind::Memory,
        }
    }

    /// Read a payload. Missing, expired, unreadable and undecodable entries
    /// are all reported as absent.
    pub async fn get(&self, key: &str) -> Option<CachePayload> {
        let raw = match self.get_raw(key).await {
            Ok(raw) => raw?,
            Err(e) => {
                tracing::warn!("Cache read for '{}' failed: {}", key, e);
                return None;
            }
        };

        match serde_json::from_value::<CachePayload>(raw) {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!("Discarding undecodable cache entry '{}': {}", key, e);
                None
            }
        }
    }

    async fn get_raw(&self, key: &str) -> Result<Option<serde_json::Value>, CacheError> {
        let now = Utc::now();
        match &self.backend {
            Backend::Postgres(pool) => Ok(queries::pg_get(pool, key, now).await?),
            Backend::Sqlite(pool) => match queries::sqlite_get(pool, key, now).await? {
                Some(text) => Ok(Some(serde_json::from_str(&text)?)),
                None => Ok(None),
            },
            Backend::Memory(map) => {
                let live = map.get(key).and_then(|entry| {
                    let expired = entry.expires_at.is_some_and(|t| t <= Instant::now());
                    (!expired).then(|| entry.value.clone())
                });
                if live.is_none() {
                    map.remove_if(key, |_, e| e.expires_at.is_some_and(|t| t <= Instant::now()));
                }
                Ok(live)
            }
        }
    }

    /// Canonicalize and store `payload` under `key`. `ttl = None` never expires.
    ///
    /// A payload that fails canonicalization is returned as an error in
    /// strict mode; otherwise it is logged and reported as `Dropped`.
    pub async fn set(
        &self,
        key: &str,
        payload: &CachePayload,
        ttl: Option<Duration>,
    ) -> Result<WriteOutcome, CacheError> {
        let value = match canonicalize(payload) {
            Ok(v) => v,
            Err(e) if self.strict => return Err(e),
            Err(e) => {
                tracing::error!("Dropping cache write for '{}': {}", key, e);
                return Ok(WriteOutcome::Dropped);
            }
        };

        match &self.backend {
            Backend::Postgres(pool) => {
                queries::pg_upsert(pool, key, &value, expiry_from(Utc::now(), ttl)).await?
            }
            Backend::Sqlite(pool) => {
                let text = serde_json::to_string(&value)?;
                queries::sqlite_upsert(pool, key, &text, expiry_from(Utc::now(), ttl)).await?
            }
            Backend::Memory(map) => {
                let expires_at = ttl.and_then(|d| Instant::now().checked_add(d));
                map.insert(key.to_string(), MemoryEntry { value, expires_at });
            }
        }
        Ok(WriteOutcome::Stored)
    }

    /// Delete expired entries. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, CacheError> {
        let now = Utc::now();
        match &self.backend {
            Backend::Postgres(pool) => Ok(queries::pg_purge_expired(pool, now).await?),
            Backend::Sqlite(pool) => Ok(queries::sqlite_purge_expired(pool, now).await?),
            Backend::Memory(map) => {
                let before = map.len();
                let instant = Instant::now();
                map.retain(|_, e| e.expires_at.map_or(true, |t| t > instant));
                Ok((before - map.len()) as u64)
            }
        }
    }

    /// Whether the backend currently answers.
    pub async fn ping(&self) -> bool {
        match &self.backend {
            Backend::Postgres(pool) => queries::pg_ping(pool).await,
            Backend::Sqlite(pool) => queries::sqlite_ping(pool).await,
            Backend::Memory(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::sample_payload;

    async fn sqlite_store() -> CacheStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        CacheStore::from_sqlite_pool(pool, true).await.unwrap()
    }

    #[tokio::test]
    async fn test_memory_set_then_get() {
        let store = CacheStore::in_memory(true);
        let payload = sample_payload("paris", Utc::now());
        store
            .set("paris", &payload, Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(store.get("paris").await, Some(payload));
    }

    #[tokio::test]
    async fn test_missing_key_is_absent() {
        let store = CacheStore::in_memory(true);
        assert_eq!(store.get("nowhere").await, None);
    }

    #[tokio::test]
    async fn test_memory_ttl_expiry() {
        let store = CacheStore::in_memory(true);
        let payload = sample_payload("paris", Utc::now());
        store
            .set("paris", &payload, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert!(store.get("paris").await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.get("paris").await.is_none());
    }

    #[tokio::test]
    async fn test_no_ttl_never_expires() {
        let store = CacheStore::in_memory(true);
        store
            .set("paris", &sample_payload("paris", Utc::now()), None)
            .await
            .unwrap();
        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert!(store.get("paris").await.is_some());
    }

    #[tokio::test]
    async fn test_overwrite_is_last_writer_wins() {
        let store = CacheStore::in_memory(true);
        let first = sample_payload("paris", Utc::now());
        let mut second = first.clone();
        second.co2_kg_total = 9.0;
        store.set("paris", &first, None).await.unwrap();
        store.set("paris", &second, None).await.unwrap();
        assert_eq!(store.get("paris").await.unwrap().co2_kg_total, 9.0);
    }

    #[tokio::test]
    async fn test_purge_expired_memory() {
        let store = CacheStore::in_memory(true);
        let p = sample_payload("paris", Utc::now());
        store.set("a", &p, Some(Duration::from_millis(10))).await.unwrap();
        store.set("b", &p, Some(Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.get("b").await.is_some());
    }

    #[tokio::test]
    async fn test_sqlite_round_trip_and_expiry() {
        let store = sqlite_store().await;
        assert_eq!(store.backend_kind(), BackendKind::Sqlite);
        assert!(store.ping().await);

        let payload = sample_payload("london", Utc::now());
        store
            .set("london", &payload, Some(Duration::from_millis(80)))
            .await
            .unwrap();
        assert_eq!(store.get("london").await, Some(payload));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(store.get("london").await.is_none());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }

    #[test]
    fn test_canonicalize_produces_primitives_only() {
        let now = "2026-06-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let value = canonicalize(&sample_payload("paris", now)).unwrap();
        assert!(value["generated_at_utc"].is_string());
        assert!(value["hours"][0].is_string());
        assert!(value["pred_kwh"][0].is_f64());
        assert!(value["co2_kg_total"].is_f64());
    }

    #[test]
    fn test_canonicalize_rejects_nan() {
        let mut payload = sample_payload("paris", Utc::now());
        payload.pred_kwh[1] = f64::NAN;
        let err = canonicalize(&payload).unwrap_err();
        assert!(err.to_string().contains("pred_kwh[1]"));
    }

    #[test]
    fn test_canonicalize_rejects_ragged_series() {
        let mut payload = sample_payload("paris", Utc::now());
        payload.confidence.pop();
        assert!(matches!(
            canonicalize(&payload),
            Err(CacheError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn test_strict_store_surfaces_serialization_fault() {
        let store = CacheStore::in_memory(true);
        let mut payload = sample_payload("paris", Utc::now());
        payload.co2_kg_total = f64::INFINITY;
        let err = store.set("paris", &payload, None).await.unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(store.get("paris").await.is_none());
    }

    #[tokio::test]
    async fn test_lenient_store_drops_bad_payload() {
        let store = CacheStore::in_memory(false);
        let mut payload = sample_payload("paris", Utc::now());
        payload.co2_kg_total = f64::NAN;
        let outcome = store.set("paris", &payload, None).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Dropped);
        assert!(store.get("paris").await.is_none());
    }

    #[tokio::test]
    async fn test_sqlite_floats_match_canonical_form() {
        let store = sqlite_store().await;
        let mut payload = sample_payload("paris", Utc::now());
        for i in 0..200u32 {
            let kwh = f64::from(i) * 0.007 + 1.0 / 3.0;
            payload.pred_kwh = vec![kwh, kwh * 1.1];
            payload.co2_kg_per_hour = payload.pred_kwh.iter().map(|k| k * 55.0 / 1000.0).collect();
            payload.co2_kg_total = payload.co2_kg_per_hour.iter().sum();
            let expected = canonical_form(&payload).unwrap();
            assert_eq!(expected, payload);
            assert_eq!(
                store.set("paris", &payload, None).await.unwrap(),
                WriteOutcome::Stored
            );
            assert_eq!(store.get("paris").await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_connect_without_backends_uses_memory() {
        let store = CacheStore::connect(&CacheConfig::default()).await;
        assert_eq!(store.backend_kind(), BackendKind::Memory);
    }
}
