use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use pipwatch_engine::JobInfo;

use crate::app::AppState;

/// GET /jobs. One row per (timezone, time) digest key, sorted by id.
pub async fn jobs_handler(State(state): State<Arc<AppState>>) -> Json<Vec<JobInfo>> {
    Json(state.scheduler.list_scheduled_jobs())
}
