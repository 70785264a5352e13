//! Prediction HTTP endpoint.
//!
//! - GET /api/v1/predictions/:location

use axum::extract::{Path, State};
use axum::Json;

use crate::db::models::CachePayload;
use crate::errors::{AppError, ErrorResponse};
use crate::services::pipeline::ForecastService;

/// Get the 24-hour yield forecast for a location.
///
/// Served from cache when available. On a miss the forecast is computed on
/// demand (collapsed across concurrent callers) unless the service runs in
/// precomputed-only mode, in which case 503 with `Retry-After` is returned.
#[utoipa::path(
    get,
    path = "/api/v1/predictions/{location}",
    tag = "Predictions",
    params(
        ("location" = String, Path, description = "Location name (case-insensitive, e.g. \"paris\")")
    ),
    responses(
        (status = 200, description = "Hourly yield forecast", body = CachePayload),
        (status = 404, description = "Location not supported", body = ErrorResponse),
        (status = 429, description = "Upstream weather provider rate limited", body = ErrorResponse),
        (status = 503, description = "Forecast not ready or temporarily unavailable", body = ErrorResponse),
    )
)]
pub async fn get_prediction(
    State(service): State<ForecastService>,
    Path(location): Path<String>,
) -> Result<Json<CachePayload>, AppError> {
    let payload = service.get_forecast(&location).await?;
    Ok(Json(payload))
}
