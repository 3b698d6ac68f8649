use axum::extract::{Query, State};
use axum::{Json, Router, routing::get, routing::post};
use chatguard_core::checkpoint::retention_cutoff;
use chatguard_core::stats::{ChatIntegrityStats, OffenderRow, RecoveryStats, ViolationSummaryRow};
use chatguard_core::sweep::SweepReport;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::OperatorAuth;
use crate::error::AppError;
use crate::state::AppState;

const MAX_LOOKBACK_DAYS: i64 = 366;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/stats/chats", get(chat_stats))
        .route("/v1/admin/stats/recovery", get(recovery_stats))
        .route("/v1/admin/moderation/summary", get(moderation_summary))
        .route("/v1/admin/moderation/offenders", get(repeat_offenders))
        .route("/v1/admin/sweep", post(run_sweep))
        .route("/v1/admin/checkpoints/purge", post(purge_checkpoints))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct RecoveryStatsQuery {
    /// Look-back window in hours (default 24)
    pub since_hours: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SummaryQuery {
    pub organization_id: Uuid,
    /// Start of the window (default: 30 days ago)
    pub since: Option<DateTime<Utc>>,
    /// End of the window, exclusive (default: now)
    pub until: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct OffendersQuery {
    /// Restrict to one organization
    pub organization_id: Option<Uuid>,
    /// Look-back window in days (default 30)
    pub since_days: Option<i64>,
    /// Minimum blocked entries to be listed (default 3)
    pub min_blocked: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PurgeResponse {
    pub deleted: u64,
    pub cutoff: DateTime<Utc>,
}

fn bounded(field: &str, value: i64, max: i64) -> Result<i64, AppError> {
    if !(1..=max).contains(&value) {
        return Err(AppError::Validation {
            message: format!("{field} must be between 1 and {max}"),
            field: Some(field.to_string()),
            received: Some(serde_json::json!(value)),
            docs_hint: None,
        });
    }
    Ok(value)
}

/// Chat counts by state and orphaned tool messages in open chats
#[utoipa::path(
    get,
    path = "/v1/admin/stats/chats",
    responses((status = 200, description = "Integrity stats", body = ChatIntegrityStats)),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn chat_stats(
    State(state): State<AppState>,
    _operator: OperatorAuth,
) -> Result<Json<ChatIntegrityStats>, AppError> {
    Ok(Json(state.stores.chats.integrity_stats().await?))
}

/// Recovery outcomes and success rate over a trailing window
///
/// Success rate is (healed + forked) / closed, where closed counts every
/// recovery that ended, including failed and expired ones.
#[utoipa::path(
    get,
    path = "/v1/admin/stats/recovery",
    params(RecoveryStatsQuery),
    responses(
        (status = 200, description = "Recovery stats", body = RecoveryStats),
        (status = 400, description = "Validation error", body = chatguard_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn recovery_stats(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Query(query): Query<RecoveryStatsQuery>,
) -> Result<Json<RecoveryStats>, AppError> {
    let hours = bounded(
        "since_hours",
        query.since_hours.unwrap_or(24),
        MAX_LOOKBACK_DAYS * 24,
    )?;
    let since = Utc::now() - Duration::hours(hours);
    let tally = state.stores.recovery.tally_since(since).await?;
    Ok(Json(RecoveryStats::from_tally(since, tally)))
}

/// Violations grouped by type and action for one organization
#[utoipa::path(
    get,
    path = "/v1/admin/moderation/summary",
    params(SummaryQuery),
    responses(
        (status = 200, description = "Summary rows", body = Vec<ViolationSummaryRow>),
        (status = 400, description = "Validation error", body = chatguard_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn moderation_summary(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<Vec<ViolationSummaryRow>>, AppError> {
    let until = query.until.unwrap_or_else(Utc::now);
    let since = query.since.unwrap_or(until - Duration::days(30));
    if since >= until {
        return Err(AppError::Validation {
            message: "since must be before until".to_string(),
            field: Some("since".to_string()),
            received: None,
            docs_hint: None,
        });
    }
    let rows = state
        .ledger
        .violation_summary(query.organization_id, since, until)
        .await?;
    Ok(Json(rows))
}

/// Users with repeated blocked messages
#[utoipa::path(
    get,
    path = "/v1/admin/moderation/offenders",
    params(OffendersQuery),
    responses(
        (status = 200, description = "Offenders, most blocked first", body = Vec<OffenderRow>),
        (status = 400, description = "Validation error", body = chatguard_core::error::ApiError)
    ),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn repeat_offenders(
    State(state): State<AppState>,
    _operator: OperatorAuth,
    Query(query): Query<OffendersQuery>,
) -> Result<Json<Vec<OffenderRow>>, AppError> {
    let days = bounded("since_days", query.since_days.unwrap_or(30), MAX_LOOKBACK_DAYS)?;
    let min_blocked = bounded("min_blocked", query.min_blocked.unwrap_or(3), 10_000)?;
    let rows = state
        .ledger
        .repeat_offenders(
            query.organization_id,
            Utc::now() - Duration::days(days),
            min_blocked,
        )
        .await?;
    Ok(Json(rows))
}

/// Validate and heal every open chat now
#[utoipa::path(
    post,
    path = "/v1/admin/sweep",
    responses((status = 200, description = "Sweep totals", body = SweepReport)),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn run_sweep(
    State(state): State<AppState>,
    _operator: OperatorAuth,
) -> Result<Json<SweepReport>, AppError> {
    Ok(Json(state.sweep.run().await?))
}

/// Delete checkpoints older than the retention period
#[utoipa::path(
    post,
    path = "/v1/admin/checkpoints/purge",
    responses((status = 200, description = "Checkpoints removed", body = PurgeResponse)),
    security(("bearer_auth" = [])),
    tag = "admin"
)]
pub async fn purge_checkpoints(
    State(state): State<AppState>,
    _operator: OperatorAuth,
) -> Result<Json<PurgeResponse>, AppError> {
    let cutoff = retention_cutoff(Utc::now(), state.config.checkpoint_retention());
    let deleted = state.stores.checkpoints.purge_older_than(cutoff).await?;
    tracing::info!(deleted, cutoff = %cutoff, "checkpoints purged");
    Ok(Json(PurgeResponse { deleted, cutoff }))
}
