//! Event push intake and synchronous integration invocation.
//!
//! `POST /events` is the direct-push source adapter: it normalizes the
//! caller's payload into an event and hands it to intake. `POST
//! /integrations/{id}/invoke` runs one integration synchronously and hands
//! the (transformed or streamed) upstream response back to the caller;
//! streaming responses forward the upstream status code and a filtered
//! header set verbatim.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use fluxgate_core::{InboundEvent, IntegrationId, OrgId, TriggerType};

use crate::error::{ApiError, ApiResult};
use crate::handlers::OrgScope;
use crate::logger::AttemptStatus;
use crate::pipeline::IngestDisposition;
use crate::router::GatewayState;

/// Body of a direct HTTP event push.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEventRequest {
    pub org_id: OrgId,
    pub event_type: String,
    pub payload: Value,
    #[serde(default = "default_source_id")]
    pub source_id: String,
}

fn default_source_id() -> String {
    "http-push".to_string()
}

/// Summary returned for an ingested event.
#[derive(Debug, Clone, Serialize)]
pub struct PushEventResponse {
    pub success: bool,
    pub event_id: fluxgate_core::EventId,
    pub dispositions: Vec<Value>,
}

/// Accept a pushed event and route it through intake.
#[utoipa::path(
    post,
    path = "/events",
    tag = "Events",
    responses(
        (status = 200, description = "Per-integration disposition summary"),
        (status = 400, description = "Malformed event"),
    )
)]
pub async fn push_event_handler(
    State(state): State<GatewayState>,
    Json(request): Json<PushEventRequest>,
) -> ApiResult<Json<PushEventResponse>> {
    let event = InboundEvent::new(
        request.org_id,
        request.event_type,
        request.payload,
        request.source_id,
    );

    let dispositions = state.intake.ingest(&event).await?;

    let summaries = dispositions
        .iter()
        .map(|disposition| match disposition {
            IngestDisposition::Delivered(outcomes) => json!({
                "kind": "delivered",
                "attempts": outcomes
                    .iter()
                    .map(|o| json!({
                        "attempt_id": o.attempt_id,
                        "status": o.status,
                        "error_code": o.error_code,
                    }))
                    .collect::<Vec<_>>(),
            }),
            IngestDisposition::Scheduled {
                integration_id,
                pending_id,
                scheduled_for,
                is_overdue,
            } => json!({
                "kind": "scheduled",
                "integration_id": integration_id,
                "pending_id": pending_id,
                "scheduled_for": scheduled_for,
                "is_overdue": is_overdue,
            }),
            IngestDisposition::SchedulingFailed {
                integration_id,
                code,
                error,
            } => json!({
                "kind": "scheduling_failed",
                "integration_id": integration_id,
                "code": code,
                "error": error,
            }),
        })
        .collect();

    Ok(Json(PushEventResponse {
        success: true,
        event_id: event.event_id,
        dispositions: summaries,
    }))
}

/// Invoke one integration synchronously with the posted payload.
///
/// Buffered integrations answer with the transformed upstream response;
/// streaming integrations pipe the upstream body through, forwarding status
/// and filtered headers verbatim. A closed client connection drops the body
/// stream without affecting other deliveries.
#[utoipa::path(
    post,
    path = "/integrations/{id}/invoke",
    tag = "Events",
    params(
        ("id" = String, Path, description = "Integration id"),
        ("org_id" = String, Query, description = "Owning organization"),
    ),
    responses(
        (status = 200, description = "Upstream response (buffered or streamed)"),
        (status = 404, description = "Integration not found or inactive"),
    )
)]
pub async fn invoke_integration_handler(
    State(state): State<GatewayState>,
    Path(id): Path<IntegrationId>,
    Query(scope): Query<OrgScope>,
    Json(payload): Json<Value>,
) -> ApiResult<Response> {
    let integration = state
        .integrations
        .find_by_id(scope.org_id, id)
        .await
        .filter(|i| i.active)
        .ok_or(ApiError::IntegrationUnavailable)?;

    let event = InboundEvent::new(
        scope.org_id,
        integration.event_type.clone(),
        payload,
        "http-invoke",
    );

    if integration.streaming {
        return match state
            .pipeline
            .deliver_streaming(&event, &integration, TriggerType::Event)
            .await
        {
            Ok((_outcome, streaming)) => {
                let mut builder = Response::builder().status(streaming.status);
                for (name, value) in &streaming.headers {
                    builder = builder.header(name, value);
                }
                builder
                    .body(Body::from_stream(streaming.into_byte_stream()))
                    .map_err(|e| {
                        ApiError::Gateway(fluxgate_core::GatewayError::internal(format!(
                            "failed to build streaming response: {e}"
                        )))
                    })
            }
            Err(outcome) => Ok((
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "success": false,
                    "code": outcome.error_code,
                    "error": outcome.error_message,
                })),
            )
                .into_response()),
        };
    }

    let outcome = state
        .pipeline
        .deliver(&event, &integration, TriggerType::Event)
        .await;

    let response = match outcome.status {
        AttemptStatus::Success => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "response_status": outcome.response_status,
                "body": outcome.response_body,
            })),
        ),
        _ => (
            StatusCode::BAD_GATEWAY,
            Json(json!({
                "success": false,
                "code": outcome.error_code,
                "error": outcome.error_message,
                "response_status": outcome.response_status,
            })),
        ),
    };

    Ok(response.into_response())
}
