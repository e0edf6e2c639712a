use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Json, Router, routing::get};
use serde::Serialize;

use crate::circuit::BreakerState;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    /// "ok", or "degraded" when the database or every chat backend is down
    pub status: String,
    pub version: String,
    pub database: bool,
    pub backends: Vec<BackendHealth>,
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct BackendHealth {
    pub name: String,
    pub circuit: BreakerState,
}

/// Health check endpoint: database reachability and chat backend circuits
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.db)
        .await
        .is_ok();

    let registered = state.orchestrator.selector().backends();
    let any_backend = registered.iter().any(|b| b.is_available());
    let backends = registered
        .iter()
        .map(|b| BackendHealth {
            name: b.name().to_string(),
            circuit: b.breaker.state(),
        })
        .collect();

    let healthy = db_ok && any_backend;
    let http_status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(HealthResponse {
            status: if healthy { "ok" } else { "degraded" }.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            database: db_ok,
            backends,
        }),
    )
}
