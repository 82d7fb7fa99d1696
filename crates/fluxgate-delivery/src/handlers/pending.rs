//! Handlers for inspecting and editing deferred deliveries.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use fluxgate_core::{OrgId, PendingDeliveryId};

use crate::error::{ApiError, ApiResult};
use crate::handlers::OrgScope;
use crate::pending::PendingDelivery;
use crate::router::GatewayState;

/// Body for rescheduling a pending delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct RescheduleRequest {
    pub org_id: OrgId,
    pub scheduled_for: DateTime<Utc>,
}

/// List deferred deliveries for an organization.
#[utoipa::path(
    get,
    path = "/pending",
    tag = "Pending Deliveries",
    params(
        ("org_id" = String, Query, description = "Owning organization"),
    ),
    responses(
        (status = 200, description = "Deferred deliveries ordered by scheduled time"),
    )
)]
pub async fn list_pending_handler(
    State(state): State<GatewayState>,
    Query(scope): Query<OrgScope>,
) -> ApiResult<Json<Vec<PendingDelivery>>> {
    let deliveries = state.pending_store.list(scope.org_id).await?;
    Ok(Json(deliveries))
}

/// Get one deferred delivery.
#[utoipa::path(
    get,
    path = "/pending/{id}",
    tag = "Pending Deliveries",
    params(
        ("id" = String, Path, description = "Pending delivery id"),
        ("org_id" = String, Query, description = "Owning organization"),
    ),
    responses(
        (status = 200, description = "Deferred delivery"),
        (status = 404, description = "Not found"),
    )
)]
pub async fn get_pending_handler(
    State(state): State<GatewayState>,
    Path(id): Path<PendingDeliveryId>,
    Query(scope): Query<OrgScope>,
) -> ApiResult<Json<PendingDelivery>> {
    let delivery = state
        .pending_store
        .find_by_id(scope.org_id, id)
        .await?
        .ok_or(ApiError::PendingDeliveryNotFound)?;
    Ok(Json(delivery))
}

/// Move the scheduled time of a not-yet-fired delivery.
#[utoipa::path(
    patch,
    path = "/pending/{id}",
    tag = "Pending Deliveries",
    params(
        ("id" = String, Path, description = "Pending delivery id"),
    ),
    responses(
        (status = 200, description = "Rescheduled"),
        (status = 404, description = "Not found or no longer editable"),
    )
)]
pub async fn reschedule_pending_handler(
    State(state): State<GatewayState>,
    Path(id): Path<PendingDeliveryId>,
    Json(request): Json<RescheduleRequest>,
) -> ApiResult<Json<PendingDelivery>> {
    let rescheduled = state
        .pending_store
        .reschedule(request.org_id, id, request.scheduled_for)
        .await?;

    if !rescheduled {
        return Err(ApiError::PendingDeliveryNotFound);
    }

    let delivery = state
        .pending_store
        .find_by_id(request.org_id, id)
        .await?
        .ok_or(ApiError::PendingDeliveryNotFound)?;
    Ok(Json(delivery))
}

/// Cancel a deferred delivery before it fires.
#[utoipa::path(
    delete,
    path = "/pending/{id}",
    tag = "Pending Deliveries",
    params(
        ("id" = String, Path, description = "Pending delivery id"),
        ("org_id" = String, Query, description = "Owning organization"),
    ),
    responses(
        (status = 204, description = "Cancelled"),
        (status = 404, description = "Not found or no longer cancellable"),
    )
)]
pub async fn cancel_pending_handler(
    State(state): State<GatewayState>,
    Path(id): Path<PendingDeliveryId>,
    Query(scope): Query<OrgScope>,
) -> ApiResult<StatusCode> {
    let cancelled = state.pending_store.cancel(scope.org_id, id).await?;

    if cancelled {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::PendingDeliveryNotFound)
    }
}
