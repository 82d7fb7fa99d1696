//! Execution log inspection and manual replay handlers.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use fluxgate_core::AttemptId;

use crate::error::{ApiError, ApiResult};
use crate::handlers::OrgScope;
use crate::logger::ExecutionLog;
use crate::router::GatewayState;

/// Query parameters for the replay endpoint.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ReplayQuery {
    pub org_id: fluxgate_core::OrgId,
    /// Overrides the duplicate-replay guard.
    #[serde(default)]
    pub force: bool,
}

/// Response for a replay request.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayResponse {
    pub success: bool,
    pub attempt_id: AttemptId,
    pub status: String,
    pub attempts: u32,
}

/// Get one execution log.
#[utoipa::path(
    get,
    path = "/deliveries/{id}",
    tag = "Deliveries",
    params(
        ("id" = String, Path, description = "Attempt id"),
        ("org_id" = String, Query, description = "Owning organization"),
    ),
    responses(
        (status = 200, description = "Execution log with ordered steps"),
        (status = 404, description = "Attempt not found"),
    )
)]
pub async fn get_delivery_handler(
    State(state): State<GatewayState>,
    Path(id): Path<AttemptId>,
    Query(scope): Query<OrgScope>,
) -> ApiResult<Json<ExecutionLog>> {
    let log = state
        .log_store
        .find_by_id(scope.org_id, id)
        .await?
        .ok_or(ApiError::AttemptNotFound)?;

    Ok(Json(log))
}

/// Replay a prior attempt as a brand-new attempt record.
///
/// Duplicate replays of the same record are rejected unless `force=true`.
#[utoipa::path(
    post,
    path = "/deliveries/{id}/replay",
    tag = "Deliveries",
    params(
        ("id" = String, Path, description = "Attempt id"),
        ("org_id" = String, Query, description = "Owning organization"),
        ("force" = Option<bool>, Query, description = "Override the duplicate-replay guard"),
    ),
    responses(
        (status = 200, description = "New attempt created"),
        (status = 404, description = "Attempt not found"),
        (status = 409, description = "Already replayed and force not set"),
    )
)]
pub async fn replay_handler(
    State(state): State<GatewayState>,
    Path(id): Path<AttemptId>,
    Query(query): Query<ReplayQuery>,
) -> ApiResult<Json<ReplayResponse>> {
    let outcome = state
        .pipeline
        .replay(query.org_id, id, query.force)
        .await
        .map_err(ApiError::from)?;

    Ok(Json(ReplayResponse {
        success: true,
        attempt_id: outcome.attempt_id,
        status: format!("{:?}", outcome.status).to_lowercase(),
        attempts: outcome.attempts,
    }))
}
