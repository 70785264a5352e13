use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::CacheStore;

/// State for the health endpoint.
#[derive(Clone)]
pub(crate) struct HealthState {
    pub(crate) cache: CacheStore,
    pub(crate) model_version: String,
}

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Service status ("ok" when healthy, "degraded" when the cache is unreachable)
    pub status: String,
    /// API version
    pub version: String,
    /// Active cache backend ("postgres", "sqlite" or "memory")
    pub cache_backend: String,
    /// Whether the cache backend answers
    pub cache: bool,
    /// Version of the loaded yield model
    pub model_version: String,
}

/// Health check endpoint.
///
/// Returns the API status and version. Pings the cache backend; returns
/// status "degraded" (still 200) if it is unreachable, so load balancers can
/// distinguish partial failures.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
    )
)]
pub async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    let cache_ok = state.cache.ping().await;

    Json(HealthResponse {
        status: if cache_ok {
            "ok".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache_backend: state.cache.backend_kind().as_str().to_string(),
        cache: cache_ok,
        model_version: state.model_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_with_memory_cache() {
        let state = HealthState {
            cache: CacheStore::in_memory(false),
            model_version: "V0-Heuristic".to_string(),
        };

        let Json(body) = health_check(State(state)).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.cache_backend, "memory");
        assert!(body.cache);
        assert_eq!(body.model_version, "V0-Heuristic");
    }
}
