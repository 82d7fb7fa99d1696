//! Error types for the operator HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use fluxgate_core::GatewayError;

use crate::pipeline::ReplayError;

/// Operator API error variants.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Execution log not found")]
    AttemptNotFound,

    #[error("DLQ entry not found")]
    DlqEntryNotFound,

    #[error("Pending delivery not found")]
    PendingDeliveryNotFound,

    #[error("Integration not found or inactive")]
    IntegrationUnavailable,

    #[error("Attempt was already replayed; pass force=true to override")]
    ReplayDuplicate,

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl From<ReplayError> for ApiError {
    fn from(error: ReplayError) -> Self {
        match error {
            ReplayError::NotFound => ApiError::AttemptNotFound,
            ReplayError::Duplicate => ApiError::ReplayDuplicate,
            ReplayError::IntegrationUnavailable => ApiError::IntegrationUnavailable,
            ReplayError::Gateway(e) => ApiError::Gateway(e),
        }
    }
}

/// JSON error response returned by operator API endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub status: u16,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type) = match &self {
            ApiError::AttemptNotFound => (StatusCode::NOT_FOUND, "attempt_not_found"),
            ApiError::DlqEntryNotFound => (StatusCode::NOT_FOUND, "dlq_entry_not_found"),
            ApiError::PendingDeliveryNotFound => {
                (StatusCode::NOT_FOUND, "pending_delivery_not_found")
            }
            ApiError::IntegrationUnavailable => {
                (StatusCode::NOT_FOUND, "integration_unavailable")
            }
            ApiError::ReplayDuplicate => (StatusCode::CONFLICT, "replay_duplicate"),
            ApiError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::Gateway(e) => match e {
                GatewayError::Validation { .. } => (StatusCode::BAD_REQUEST, "validation_error"),
                GatewayError::RateLimitExceeded { .. } => {
                    (StatusCode::TOO_MANY_REQUESTS, "rate_limited")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            },
        };

        let body = ErrorResponse {
            error: error_type.to_string(),
            message: self.to_string(),
            status: status.as_u16(),
        };

        (status, axum::Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
