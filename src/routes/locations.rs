use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::Location;
use crate::services::pipeline::ForecastService;

#[derive(Debug, Serialize, ToSchema)]
pub struct LocationsResponse {
    pub locations: Vec<Location>,
}

/// List the locations forecasts are served for.
#[utoipa::path(
    get,
    path = "/api/v1/locations",
    tag = "Predictions",
    responses(
        (status = 200, description = "Configured locations", body = LocationsResponse),
    )
)]
pub async fn list_locations(State(service): State<ForecastService>) -> Json<LocationsResponse> {
    Json(LocationsResponse {
        locations: service.locations().to_vec(),
    })
}
