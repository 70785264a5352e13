use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::db::CacheError;
use crate::services::weather::FetchError;

/// Seconds a client is told to wait before retrying a transient failure.
pub const RETRY_AFTER_SECS: u64 = 30;

/// Standard error response body.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Human-readable error message
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Upstream weather provider is rate limiting requests")]
    UpstreamRateLimited { retry_after_secs: u64 },

    #[error("Upstream weather provider unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    #[error("Prediction unavailable: {0}")]
    PredictionUnavailable(String),

    #[error("Serialization fault: {0}")]
    SerializationFault(String),

    #[error("Forecast not ready: {0}")]
    NotReady(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::UnknownLocation(_) => StatusCode::NOT_FOUND,
            AppError::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (message, retry_after) = match &self {
            AppError::UnknownLocation(loc) => (format!("Location '{}' is not supported", loc), None),
            AppError::UpstreamRateLimited { retry_after_secs } => (
                format!(
                    "The weather data provider is temporarily busy. Please try again in {} seconds.",
                    retry_after_secs
                ),
                Some(*retry_after_secs),
            ),
            AppError::NotReady(msg) => (
                format!("{}. Please try again shortly.", msg),
                Some(RETRY_AFTER_SECS),
            ),
            AppError::SerializationFault(msg) | AppError::Internal(msg) => {
                tracing::error!("Internal fault: {}", msg);
                ("Forecast temporarily unavailable".to_string(), None)
            }
            AppError::UpstreamUnavailable(_) | AppError::PredictionUnavailable(_) => {
                (self.to_string(), None)
            }
        };

        let mut response = (status, axum::Json(ErrorResponse { error: message })).into_response();
        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<FetchError> for AppError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::RateLimited { .. } => AppError::UpstreamRateLimited {
                retry_after_secs: RETRY_AFTER_SECS,
            },
            FetchError::InvalidCoordinates { .. } => AppError::Internal(err.to_string()),
            other => AppError::UpstreamUnavailable(other.to_string()),
        }
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Serialization(msg) => AppError::SerializationFault(msg),
            other => AppError::Internal(other.to_string()),
        }
    }
}
