//! Error Types
//!
//! The delivery-pipeline error taxonomy with retryable/permanent
//! classification for the backoff controller.
//!
//! # Example
//!
//! ```
//! use fluxgate_core::{GatewayError, Result};
//!
//! fn check_payload(body: &str) -> Result<()> {
//!     if body.is_empty() {
//!         return Err(GatewayError::Validation {
//!             message: "payload must not be empty".to_string(),
//!         });
//!     }
//!     Ok(())
//! }
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ids::IntegrationId;

/// Kind of sandbox limit violation raised by tenant-supplied scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    /// Script exceeded its wall-clock deadline or operation budget.
    Timeout,
    /// Script raised a runtime error or threw a value.
    Runtime,
    /// Script exceeded an output/string/collection size cap.
    LimitExceeded,
}

impl std::fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxKind::Timeout => write!(f, "timeout"),
            SandboxKind::Runtime => write!(f, "runtime"),
            SandboxKind::LimitExceeded => write!(f, "limit exceeded"),
        }
    }
}

/// Error that can occur while delivering one event through the pipeline.
///
/// Variants split into retryable categories (which drive the intra-request
/// backoff loop) and permanent categories (which fail the attempt
/// immediately).
#[derive(Debug, Error)]
pub enum GatewayError {
    // Input errors (permanent)
    /// Bad input or configuration; never retried.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Request or response transformation failed; the attempt fails and is
    /// not retried within the same call.
    #[error("transformation failed: {message}")]
    Transformation { message: String },

    /// Credential or auth configuration problem; not retried.
    #[error("authentication failed: {message}")]
    Authentication { message: String },

    // Admission errors
    /// The per-integration rate limit window is exhausted. No attempt was
    /// made against the target; the caller receives remaining/reset info.
    #[error("rate limit exceeded for integration {integration_id}")]
    RateLimitExceeded {
        integration_id: IntegrationId,
        /// Seconds until the current window rolls over.
        retry_after_secs: i64,
        /// Instant at which the window resets.
        reset_at: DateTime<Utc>,
    },

    // Upstream errors
    /// The target returned a non-2xx status.
    #[error("upstream returned HTTP {status}")]
    Upstream {
        status: u16,
        /// Response body snapshot, capped for logging.
        body: Option<String>,
    },

    /// The outbound call exceeded its hard timeout. Distinct from generic
    /// failure so the audit trail can tell them apart.
    #[error("upstream call timed out after {timeout_secs} seconds")]
    UpstreamTimeout { timeout_secs: u64 },

    /// DNS failure, connection refused, or other connection-level error.
    #[error("network error: {message}")]
    Network { message: String },

    // Sandbox errors
    /// Tenant-supplied script exceeded a sandbox limit.
    #[error("script sandbox violation ({kind}): {message}")]
    Sandbox { kind: SandboxKind, message: String },

    // Internal errors
    /// Unexpected failure inside the gateway itself.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    /// Check whether this outcome should drive the intra-request retry loop.
    ///
    /// Only upstream 408/429/5xx responses, timeouts and connection-level
    /// network errors are retryable; every other category fails the attempt
    /// immediately.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Upstream { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            GatewayError::UpstreamTimeout { .. } | GatewayError::Network { .. } => true,
            _ => false,
        }
    }

    /// Get a machine-readable error code for classification.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            GatewayError::Validation { .. } => "INVALID_CONFIG",
            GatewayError::Transformation { .. } => "TRANSFORMATION_FAILED",
            GatewayError::Authentication { .. } => "AUTH_FAILED",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMITED",
            GatewayError::Upstream { .. } => "UPSTREAM_ERROR",
            GatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            GatewayError::Network { .. } => "NETWORK_ERROR",
            GatewayError::Sandbox { kind, .. } => match kind {
                SandboxKind::Timeout => "SANDBOX_TIMEOUT",
                SandboxKind::Runtime => "SANDBOX_RUNTIME",
                SandboxKind::LimitExceeded => "SANDBOX_LIMIT",
            },
            GatewayError::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    // Convenience constructors

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        GatewayError::Validation {
            message: message.into(),
        }
    }

    /// Create a transformation error carrying the original script message.
    pub fn transformation(message: impl Into<String>) -> Self {
        GatewayError::Transformation {
            message: message.into(),
        }
    }

    /// Create an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        GatewayError::Authentication {
            message: message.into(),
        }
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        GatewayError::Network {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        GatewayError::Internal {
            message: message.into(),
        }
    }
}

/// Type alias for Results using `GatewayError`.
pub type Result<T> = std::result::Result<T, GatewayError>;
