//! Precompute scheduler status.
//!
//! GET /api/v1/scheduler/status reports whether a refresh cycle is in flight,
//! when the next one is due, and how each configured location fared last time.

use axum::extract::State;
use axum::Json;

use crate::services::scheduler::{SchedulerState, SharedSchedulerState};

/// Snapshot of the precompute scheduler.
///
/// `phase` is `running` while a cycle refreshes locations with bounded
/// concurrency. Per location, `last_result` is `refreshed`, `skipped_fresh`
/// when the cached payload was younger than the debounce window, `error: ...`
/// or `pending` before the first cycle. `next_run_at` is set once a cycle ends.
#[utoipa::path(
    get,
    path = "/api/v1/scheduler/status",
    tag = "Scheduler",
    responses(
        (status = 200, description = "Scheduler phase, cycle timing and per-location refresh results", body = SchedulerState),
    )
)]
pub async fn get_scheduler_status(
    State(state): State<SharedSchedulerState>,
) -> Json<SchedulerState> {
    Json(state.read().await.clone())
}
