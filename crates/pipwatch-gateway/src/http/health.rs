use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health. Reports `degraded` until the digest loop is running.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let health = state.scheduler.health_check();
    let status = if health.running { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "running": health.running,
        "job_count": health.job_count,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipwatch_engine::DigestScheduler;

    #[tokio::test]
    async fn health_is_degraded_before_the_loop_starts() {
        let scheduler = Arc::new(DigestScheduler::new());
        scheduler
            .schedule_recipient_digest(7, "Europe/Prague", "08:00")
            .unwrap();
        let state = Arc::new(AppState::new(scheduler));

        let Json(body) = health_handler(State(state)).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["running"], false);
        assert_eq!(body["job_count"], 1);
        assert!(body["uptime_secs"].as_u64().is_some());
    }
}
