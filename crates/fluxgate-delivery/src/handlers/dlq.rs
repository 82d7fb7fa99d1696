//! HTTP handlers for the dead letter queue API.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use fluxgate_core::{DlqEntryId, IntegrationId, OrgId};

use crate::dlq::{BulkOutcome, DlqEntry, DlqEntryList, DlqFilter, DlqRetryOutcome, DlqStatus};
use crate::error::{ApiError, ApiResult};
use crate::router::GatewayState;

/// Query parameters for listing DLQ entries.
#[derive(Debug, Clone, Deserialize)]
pub struct ListDlqQuery {
    pub org_id: OrgId,
    pub integration_id: Option<IntegrationId>,
    pub event_type: Option<String>,
    pub status: Option<DlqStatus>,
    pub from: Option<chrono::DateTime<chrono::Utc>>,
    pub to: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// Body for single-entry abandon.
#[derive(Debug, Clone, Deserialize)]
pub struct AbandonRequest {
    pub org_id: OrgId,
    pub notes: Option<String>,
}

/// Body for bulk operations.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkRequest {
    pub org_id: OrgId,
    pub ids: Vec<DlqEntryId>,
    pub notes: Option<String>,
}

const MAX_BULK_IDS: usize = 100;

// ---------------------------------------------------------------------------
// List and detail handlers
// ---------------------------------------------------------------------------

/// List dead letter queue entries.
#[utoipa::path(
    get,
    path = "/dlq",
    tag = "Dead Letter Queue",
    params(
        ("org_id" = String, Query, description = "Owning organization"),
        ("integration_id" = Option<String>, Query, description = "Filter by integration"),
        ("event_type" = Option<String>, Query, description = "Filter by event type"),
        ("status" = Option<String>, Query, description = "Filter by disposition status"),
        ("from" = Option<String>, Query, description = "Entries created after this time"),
        ("to" = Option<String>, Query, description = "Entries created before this time"),
        ("limit" = Option<i64>, Query, description = "Max entries to return (default 50, max 100)"),
        ("offset" = Option<i64>, Query, description = "Offset for pagination"),
    ),
    responses(
        (status = 200, description = "Paginated DLQ entries"),
    )
)]
pub async fn list_dlq_entries_handler(
    State(state): State<GatewayState>,
    Query(query): Query<ListDlqQuery>,
) -> ApiResult<Json<DlqEntryList>> {
    let filter = DlqFilter {
        integration_id: query.integration_id,
        event_type: query.event_type,
        status: query.status,
        from: query.from,
        to: query.to,
    };

    let result = state
        .dlq_service
        .list_entries(query.org_id, filter, query.limit, query.offset)
        .await?;

    Ok(Json(result))
}

/// Get details of a DLQ entry.
#[utoipa::path(
    get,
    path = "/dlq/{id}",
    tag = "Dead Letter Queue",
    params(
        ("id" = String, Path, description = "DLQ entry id"),
        ("org_id" = String, Query, description = "Owning organization"),
    ),
    responses(
        (status = 200, description = "DLQ entry detail"),
        (status = 404, description = "Entry not found"),
    )
)]
pub async fn get_dlq_entry_handler(
    State(state): State<GatewayState>,
    Path(id): Path<DlqEntryId>,
    Query(scope): Query<crate::handlers::OrgScope>,
) -> ApiResult<Json<DlqEntry>> {
    state
        .dlq_service
        .get_entry(scope.org_id, id)
        .await
        .map(Json)
        .map_err(|_| ApiError::DlqEntryNotFound)
}

/// Delete a DLQ entry.
#[utoipa::path(
    delete,
    path = "/dlq/{id}",
    tag = "Dead Letter Queue",
    params(
        ("id" = String, Path, description = "DLQ entry id"),
        ("org_id" = String, Query, description = "Owning organization"),
    ),
    responses(
        (status = 204, description = "Entry deleted"),
        (status = 404, description = "Entry not found"),
    )
)]
pub async fn delete_dlq_entry_handler(
    State(state): State<GatewayState>,
    Path(id): Path<DlqEntryId>,
    Query(scope): Query<crate::handlers::OrgScope>,
) -> ApiResult<StatusCode> {
    let deleted = state.dlq_service.delete(scope.org_id, id).await?;

    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::DlqEntryNotFound)
    }
}

// ---------------------------------------------------------------------------
// Disposition handlers
// ---------------------------------------------------------------------------

/// Retry a single DLQ entry: transitions it to `retrying` and re-enters the
/// pipeline as a new attempt.
#[utoipa::path(
    post,
    path = "/dlq/{id}/retry",
    tag = "Dead Letter Queue",
    params(
        ("id" = String, Path, description = "DLQ entry id"),
        ("org_id" = String, Query, description = "Owning organization"),
    ),
    responses(
        (status = 200, description = "Entry re-entered the pipeline"),
        (status = 404, description = "Entry not found"),
    )
)]
pub async fn retry_dlq_entry_handler(
    State(state): State<GatewayState>,
    Path(id): Path<DlqEntryId>,
    Query(scope): Query<crate::handlers::OrgScope>,
) -> ApiResult<Json<DlqRetryOutcome>> {
    let outcome = state.dlq_service.retry(scope.org_id, id).await?;
    Ok(Json(outcome))
}

/// Abandon a single DLQ entry with operator notes. Terminal.
#[utoipa::path(
    post,
    path = "/dlq/{id}/abandon",
    tag = "Dead Letter Queue",
    params(
        ("id" = String, Path, description = "DLQ entry id"),
    ),
    responses(
        (status = 204, description = "Entry abandoned"),
        (status = 404, description = "Entry not found"),
    )
)]
pub async fn abandon_dlq_entry_handler(
    State(state): State<GatewayState>,
    Path(id): Path<DlqEntryId>,
    Json(request): Json<AbandonRequest>,
) -> ApiResult<StatusCode> {
    state
        .dlq_service
        .abandon(request.org_id, id, request.notes)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Bulk retry. Each id is processed independently; the response carries a
/// per-id success/failure breakdown.
#[utoipa::path(
    post,
    path = "/dlq/retry",
    tag = "Dead Letter Queue",
    responses(
        (status = 200, description = "Per-id breakdown"),
        (status = 400, description = "Too many ids"),
    )
)]
pub async fn bulk_retry_handler(
    State(state): State<GatewayState>,
    Json(request): Json<BulkRequest>,
) -> ApiResult<Json<BulkOutcome>> {
    validate_bulk(&request)?;
    let outcome = state
        .dlq_service
        .bulk_retry(request.org_id, request.ids)
        .await?;
    Ok(Json(outcome))
}

/// Bulk abandon. Each id is processed independently.
#[utoipa::path(
    post,
    path = "/dlq/abandon",
    tag = "Dead Letter Queue",
    responses(
        (status = 200, description = "Per-id breakdown"),
        (status = 400, description = "Too many ids"),
    )
)]
pub async fn bulk_abandon_handler(
    State(state): State<GatewayState>,
    Json(request): Json<BulkRequest>,
) -> ApiResult<Json<BulkOutcome>> {
    validate_bulk(&request)?;
    let outcome = state
        .dlq_service
        .bulk_abandon(request.org_id, request.ids, request.notes)
        .await?;
    Ok(Json(outcome))
}

fn validate_bulk(request: &BulkRequest) -> ApiResult<()> {
    if request.ids.is_empty() {
        return Err(ApiError::Validation("ids must not be empty".to_string()));
    }
    if request.ids.len() > MAX_BULK_IDS {
        return Err(ApiError::Validation(format!(
            "maximum {MAX_BULK_IDS} ids per bulk operation"
        )));
    }
    Ok(())
}
