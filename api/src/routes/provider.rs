use axum::extract::State;
use axum::{Json, Router, routing::get, routing::post};
use chatguard_core::breaker::HealthStatus;
use chatguard_core::resilience::HealthCheckReport;

use crate::auth::OperatorAuth;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/provider/health", get(provider_health))
        .route("/v1/provider/health/check", post(provider_health_check))
}

/// Circuit breaker status for the LLM provider
#[utoipa::path(
    get,
    path = "/v1/provider/health",
    responses(
        (status = 200, description = "Breaker status", body = HealthStatus),
        (status = 401, description = "Missing or invalid operator token", body = chatguard_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "provider"
)]
pub async fn provider_health(
    State(state): State<AppState>,
    _operator: OperatorAuth,
) -> Result<Json<HealthStatus>, AppError> {
    Ok(Json(state.provider.health_status()))
}

/// Probe the provider now, whatever the breaker state
///
/// The probe updates reporting counters only. The breaker's failure streak
/// and state are left to real traffic.
#[utoipa::path(
    post,
    path = "/v1/provider/health/check",
    responses(
        (status = 200, description = "Probe result", body = HealthCheckReport),
        (status = 401, description = "Missing or invalid operator token", body = chatguard_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "provider"
)]
pub async fn provider_health_check(
    State(state): State<AppState>,
    _operator: OperatorAuth,
) -> Result<Json<HealthCheckReport>, AppError> {
    Ok(Json(state.provider.perform_health_check().await))
}
