// SolarSight API v0.1
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod errors;
mod helpers;
mod routes;
mod services;

use config::AppConfig;
use db::CacheStore;
use routes::health::HealthState;
use services::collapser::RequestCollapser;
use services::pipeline::{ForecastService, Pipeline};
use services::predictor::Predictor;
use services::scheduler::{PrecomputeScheduler, SchedulerState, SharedSchedulerState};
use services::weather::WeatherFetcher;

/// SolarSight API OpenAPI document.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "SolarSight API",
        version = "0.1.0",
        description = "Solar yield forecasting API. Predicts hourly PV output for the next \
            24 hours from Open-Meteo weather forecasts, estimates avoided CO2 against the \
            local grid, and adds UV and agricultural guidance. Forecasts are precomputed \
            on a schedule and served from cache.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Predictions", description = "Solar yield forecasts per location"),
        (name = "Scheduler", description = "Background precompute scheduler status"),
    ),
    paths(
        routes::health::health_check,
        routes::predictions::get_prediction,
        routes::locations::list_locations,
        routes::scheduler::get_scheduler_status,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::locations::LocationsResponse,
            config::Location,
            db::models::CachePayload,
            services::scheduler::SchedulerState,
            services::scheduler::SchedulerPhase,
            services::scheduler::LocationRefreshStatus,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "solarsight_api=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    // LOG_FORMAT=json switches to one JSON object per line.
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = AppConfig::from_env();
    tracing::info!(
        "Serving {} locations in {:?} mode",
        config.locations.len(),
        config.read_mode
    );

    let cache = CacheStore::connect(&config.cache).await;

    let predictor = Arc::new(Predictor::from_artifact_path(
        &config.model_path,
        config.prediction_hours,
    ));
    let model_version = predictor.model_version().to_string();

    let pipeline = Pipeline::new(
        WeatherFetcher::new(config.weather.clone()),
        predictor,
        config.prediction_hours,
    );
    let collapser = Arc::new(RequestCollapser::new());

    let forecast_service =
        ForecastService::new(&config, pipeline.clone(), cache.clone(), collapser.clone());

    // Create shared scheduler state and spawn the precompute scheduler
    let scheduler_state: SharedSchedulerState =
        Arc::new(RwLock::new(SchedulerState::new(&config.locations)));
    let scheduler = PrecomputeScheduler::new(
        pipeline,
        cache.clone(),
        collapser,
        config.locations.clone(),
        config.scheduler.clone(),
        scheduler_state.clone(),
    );
    tokio::spawn(scheduler.run());

    // CORS: read-only API, restrict methods to GET
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any)
        .expose_headers([axum::http::header::RETRY_AFTER]);

    let prediction_routes = Router::new()
        .route(
            "/api/v1/predictions/:location",
            get(routes::predictions::get_prediction),
        )
        .route("/api/v1/locations", get(routes::locations::list_locations))
        .with_state(forecast_service);

    // Health check pings the cache backend
    let health_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .with_state(HealthState {
            cache,
            model_version,
        });

    let scheduler_routes = Router::new()
        .route(
            "/api/v1/scheduler/status",
            get(routes::scheduler::get_scheduler_status),
        )
        .with_state(scheduler_state);

    let app = Router::new()
        .merge(health_routes)
        .merge(prediction_routes)
        .merge(scheduler_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
