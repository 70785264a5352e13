//! Single-flight execution of the forecast pipeline per cache key.
//!
//! Callers that miss the cache queue on a per-key mutex. The holder re-checks
//! the cache before computing, so concurrent misses for one key run the
//! pipeline once. The mutex also guards the last completed result, which
//! waiters fall back to when the cache write did not land. The computation
//! runs in its own task that owns the lock guard: dropping a waiting caller
//! never aborts work other callers are waiting on.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::db::models::CachePayload;
use crate::db::{canonical_form, CacheError, CacheStore, WriteOutcome};
use crate::errors::AppError;

/// Last payload produced under a key's lock.
#[derive(Debug)]
struct Completed {
    payload: CachePayload,
    at: Instant,
}

type Slot = Arc<Mutex<Option<Completed>>>;

/// Registry of per-key pipeline locks.
#[derive(Debug, Default)]
pub struct RequestCollapser {
    locks: DashMap<String, Slot>,
}

impl RequestCollapser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `key`, created on first use. `entry` makes the
    /// insert-if-absent atomic, so racing first callers share one lock.
    fn lock_for(&self, key: &str) -> Slot {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Return the cached payload for `key`, or compute and store it, running
    /// `compute` at most once across concurrent callers for the same key.
    ///
    /// Every caller gets the payload in the form the cache hands back, so a
    /// computing caller and a later reader see identical values. A failed
    /// computation releases the lock and caches nothing.
    pub async fn get_or_compute<F, Fut>(
        &self,
        cache: &CacheStore,
        key: &str,
        ttl: Option<Duration>,
        compute: F,
    ) -> Result<CachePayload, AppError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<CachePayload, AppError>> + Send + 'static,
    {
        if let Some(hit) = cache.get(key).await {
            return Ok(hit);
        }
        let missed_at = Instant::now();

        let mut slot = self.lock_for(key).lock_owned().await;
        let cache = cache.clone();
        let key = key.to_string();

        let task = tokio::spawn(async move {
            // Finished while we queued: reuse it even if the write failed.
            if let Some(done) = (*slot).as_ref().filter(|done| done.at >= missed_at) {
                tracing::debug!("Collapsed request for '{}' served by in-flight result", key);
                return Ok(done.payload.clone());
            }

            if let Some(hit) = cache.get(&key).await {
                tracing::debug!("Collapsed request for '{}' served from cache", key);
                return Ok(hit);
            }

            tracing::info!("Cache miss for '{}', running on-demand pipeline", key);
            let payload = compute().await?;
            let payload = canonical_form(&payload).map_err(serialization_fault)?;

            match cache.set(&key, &payload, ttl).await {
                Ok(WriteOutcome::Stored) => {}
                Ok(WriteOutcome::Dropped) => {
                    return Err(AppError::SerializationFault(format!(
                        "payload for '{}' was dropped by the cache",
                        key
                    )));
                }
                Err(CacheError::Serialization(msg)) => {
                    return Err(AppError::SerializationFault(msg));
                }
                Err(e) => {
                    tracing::warn!("Failed to cache on-demand payload for '{}': {}", key, e);
                }
            }

            *slot = Some(Completed {
                payload: payload.clone(),
                at: Instant::now(),
            });
            Ok(payload)
        });

        task.await
            .map_err(|e| AppError::Internal(format!("Pipeline task failed: {}", e)))?
    }

    /// Drop locks nobody holds or waits on. Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }
}

fn serialization_fault(e: CacheError) -> AppError {
    match e {
        CacheError::Serialization(msg) => AppError::SerializationFault(msg),
        other => AppError::SerializationFault(other.to_string()),
    }
}
