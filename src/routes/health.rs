use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub durable_cache: ComponentHealth,
    pub worker_pool: WorkerPoolHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
}

#[derive(Serialize)]
pub struct WorkerPoolHealth {
    pub status: String,
    pub available_workers: usize,
}

/// GET /health — component health. The durable cache being down degrades
/// the report but never the pipeline itself.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let cache_check = match state.orchestrator.cache().ping_durable().await {
        Some(true) => ComponentHealth {
            status: "ok".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
        },
        Some(false) => ComponentHealth {
            status: "unreachable".to_string(),
            latency_ms: None,
        },
        None => ComponentHealth {
            status: "disabled".to_string(),
            latency_ms: None,
        },
    };

    let available = state.orchestrator.available_workers();
    let worker_check = WorkerPoolHealth {
        status: if available > 0 { "ok" } else { "saturated" }.to_string(),
        available_workers: available,
    };

    // Degraded, not down: the in-process tier keeps serving.
    let status = if cache_check.status == "unreachable" {
        "degraded"
    } else {
        "ok"
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            checks: HealthChecks {
                durable_cache: cache_check,
                worker_pool: worker_check,
            },
        }),
    )
}
