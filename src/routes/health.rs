use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;

use crate::models::{HealthResponse, ServiceHealth, WorkerHealth};

use super::AppState;

/// Liveness: always answers while the process is up, reporting worker flags
/// and backend connectivity.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_backend = probe(state.queue.ping().await);
    let storage = probe(state.store.ping().await);
    let degraded = queue_backend != "connected" || storage != "connected";

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        worker: WorkerHealth {
            running: state.status.running(),
            paused: state.status.paused(),
            name: state.status.name().to_string(),
        },
        services: ServiceHealth {
            queue_backend,
            storage,
        },
    })
}

/// Readiness: true only when every backend is reachable and the pool is not
/// mid-shutdown.
pub async fn readiness_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let ready = state.queue.ping().await.is_ok()
        && state.store.ping().await.is_ok()
        && !state.lifecycle.is_draining();

    if ready {
        (StatusCode::OK, Json(serde_json::json!({"status": "ready"})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "not ready"})),
        )
    }
}

fn probe(result: crate::types::AppResult<()>) -> String {
    match result {
        Ok(()) => "connected".to_string(),
        Err(_) => "unreachable".to_string(),
    }
}
