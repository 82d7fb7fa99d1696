//! Dry-run endpoints for operator configuration testing.
//!
//! These endpoints always answer HTTP 200: a failure of the *tested* thing
//! (script, mapping, connection) is reported in the body with a
//! machine-readable code, never as a transport-level error. Nothing they do
//! is persisted.

use std::time::Instant;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use fluxgate_core::{IntegrationId, OrgId};

use crate::auth::TokenCacheKey;
use crate::config::{AuthConfig, DeliveryMode, HttpMethod, TransformSpec};
use crate::router::GatewayState;
use crate::scheduler::SchedulePreview;
use crate::transform::TransformContext;

/// Body for the transformation test endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TestTransformRequest {
    pub org_id: OrgId,
    pub event_type: String,
    pub transform: TransformSpec,
    pub payload: Value,
}

/// Result of a transformation dry run.
#[derive(Debug, Clone, Serialize)]
pub struct TestTransformResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Body for the scheduling test endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TestScheduleRequest {
    pub org_id: OrgId,
    pub event_type: String,
    pub mode: DeliveryMode,
    pub sample_payload: Value,
}

/// Body for the connection test endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TestConnectionRequest {
    pub url: String,
    #[serde(default = "default_test_method")]
    pub method: HttpMethod,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default = "default_test_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_test_method() -> HttpMethod {
    HttpMethod::Get
}

fn default_test_timeout_secs() -> u64 {
    10
}

/// Result of a connection test.
#[derive(Debug, Clone, Serialize)]
pub struct TestConnectionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Dry-run a request transformation against a sample payload.
#[utoipa::path(
    post,
    path = "/test/transform",
    tag = "Testing",
    responses(
        (status = 200, description = "Transformation result; failures reported in the body"),
    )
)]
pub async fn test_transform_handler(
    State(state): State<GatewayState>,
    Json(request): Json<TestTransformRequest>,
) -> Json<TestTransformResponse> {
    let started = Instant::now();
    let ctx = TransformContext::new(request.event_type.as_str(), request.org_id);

    let response = match state
        .transformer
        .transform_request(&request.transform, &request.payload, &ctx)
    {
        Ok(output) => TestTransformResponse {
            success: true,
            output: Some(output),
            code: None,
            error: None,
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Err(e) => TestTransformResponse {
            success: false,
            output: None,
            code: Some(e.error_code().to_string()),
            error: Some(e.to_string()),
            duration_ms: started.elapsed().as_millis() as u64,
        },
    };

    Json(response)
}

/// Dry-run a scheduling script against representative sample data.
#[utoipa::path(
    post,
    path = "/test/schedule",
    tag = "Testing",
    responses(
        (status = 200, description = "Schedule preview; failures reported in the body"),
    )
)]
pub async fn test_schedule_handler(
    State(state): State<GatewayState>,
    Json(request): Json<TestScheduleRequest>,
) -> Json<SchedulePreview> {
    let ctx = TransformContext::new(request.event_type.as_str(), request.org_id);
    let preview = state
        .scheduler
        .test_schedule(&request.mode, &request.sample_payload, &ctx);
    Json(preview)
}

/// Probe a delivery target with the given auth configuration.
#[utoipa::path(
    post,
    path = "/test/connection",
    tag = "Testing",
    responses(
        (status = 200, description = "Connection result; failures reported in the body"),
    )
)]
pub async fn test_connection_handler(
    State(state): State<GatewayState>,
    Json(request): Json<TestConnectionRequest>,
) -> Json<TestConnectionResponse> {
    // Ephemeral cache slot; connection tests never reuse delivery tokens.
    let cache_key = TokenCacheKey::integration(IntegrationId::new());

    let headers = match state.auth.build(cache_key, &request.auth).await {
        Ok(headers) => headers,
        Err(e) => {
            return Json(TestConnectionResponse {
                success: false,
                status: None,
                latency_ms: None,
                code: Some(e.error_code().to_string()),
                error: Some(e.to_string()),
            });
        }
    };

    match state
        .executor
        .execute_buffered(
            request.method,
            &request.url,
            headers,
            None,
            std::time::Duration::from_secs(request.timeout_secs),
        )
        .await
    {
        Ok(response) => Json(TestConnectionResponse {
            success: response.is_success(),
            status: Some(response.status),
            latency_ms: Some(response.latency_ms),
            code: if response.is_success() {
                None
            } else {
                Some("UPSTREAM_ERROR".to_string())
            },
            error: if response.is_success() {
                None
            } else {
                Some(format!("target returned HTTP {}", response.status))
            },
        }),
        Err(e) => Json(TestConnectionResponse {
            success: false,
            status: None,
            latency_ms: None,
            code: Some(e.error_code().to_string()),
            error: Some(e.to_string()),
        }),
    }
}
