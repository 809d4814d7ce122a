//! Operational HTTP surface: `/health` and `/ready` only.

pub mod health;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::db::DocumentStore;
use crate::queue::JobQueue;
use crate::shutdown::LifecycleHandle;
use crate::worker::WorkerStatus;

#[derive(Clone)]
pub struct AppState {
    pub status: Arc<WorkerStatus>,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn DocumentStore>,
    pub lifecycle: LifecycleHandle,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
