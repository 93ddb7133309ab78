//! Shared state and router for the monitoring endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use pipwatch_engine::DigestScheduler;

pub struct AppState {
    pub scheduler: Arc<DigestScheduler>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(scheduler: Arc<DigestScheduler>) -> Self {
        Self {
            scheduler,
            started_at: Instant::now(),
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/jobs", get(crate::http::jobs::jobs_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
