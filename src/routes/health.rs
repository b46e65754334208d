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
    pub database: ComponentHealth,
    pub vision_backend: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: String,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_check<T, E>(result: Result<T, E>, started: std::time::Instant) -> Self {
        match result {
            Ok(_) => Self {
                status: "ok".to_string(),
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(_) => Self {
                status: "error".to_string(),
                latency_ms: None,
            },
        }
    }
}

/// GET /health: database and vision backend reachability.
///
/// The database is required; an unreachable vision backend only degrades
/// the service, since jobs fail individually until it returns.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let start = std::time::Instant::now();
    let database = ComponentHealth::from_check(
        sqlx::query("SELECT 1").execute(&state.db).await,
        start,
    );

    let backend_start = std::time::Instant::now();
    let vision_backend =
        ComponentHealth::from_check(state.engine.available_models().await, backend_start);

    let status_code = if database.status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let status = if database.status == "ok" && vision_backend.status == "ok" {
        "ok"
    } else {
        "degraded"
    };

    let response = HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        checks: HealthChecks {
            database,
            vision_backend,
        },
    };

    (status_code, Json(response))
}
