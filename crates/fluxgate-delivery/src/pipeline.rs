//! The delivery pipeline orchestrator.
//!
//! Composes rate limiting, transformation, authentication, outbound
//! execution, retry/backoff classification, dead-letter routing and
//! step-level logging into the end-to-end flow for one event. Steps within
//! one attempt are strictly sequential; attempts for the same integration
//! carry no ordering guarantee relative to each other — rate limiting, not
//! sequencing, bounds concurrent load per integration.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use fluxgate_core::{
    AttemptId, GatewayError, InboundEvent, IntegrationId, OrgId, Result, TriggerType,
};

use crate::auth::{AuthHeaderBuilder, TokenCacheKey};
use crate::config::{
    Action, ActionTarget, DeliveryMode, HttpMethod, IntegrationConfig, IntegrationStore,
    TransformSpec,
};
use crate::dlq::{entry_from_failure, DlqEntry, DlqStore, Redeliver};
use crate::executor::{BufferedResponse, DeliveryExecutor, StreamingStart, RESPONSE_BODY_CAP};
use crate::logger::{
    AttemptMeta, AttemptStatus, ExecutionLogStore, ExecutionLogger, ResponseSnapshot, StepStatus,
};
use crate::pending::{PendingDelivery, PendingDeliveryStore, PendingStatus};
use crate::rate_limit::RateLimiter;
use crate::retry::{parse_retry_after, RetryPolicy};
use crate::scheduler::{ScheduleOutcome, Scheduler};
use crate::transform::{ResponseContext, TransformContext, Transformer};

/// Response body recorded for streaming deliveries in place of a snapshot.
pub const STREAMED_BODY_MARKER: &str = "[STREAMED]";

/// Summary of one finished attempt.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub attempt_id: AttemptId,
    pub status: AttemptStatus,
    /// Outbound calls issued within the attempt.
    pub attempts: u32,
    pub response_status: Option<u16>,
    /// Transformed response handed back to the caller, when buffered and
    /// successful.
    pub response_body: Option<Value>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Error surface of the manual replay path.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("execution log not found")]
    NotFound,
    /// The record was already replayed and `force` was not set.
    #[error("attempt was already replayed; pass force=true to override")]
    Duplicate,
    #[error("integration is missing or inactive")]
    IntegrationUnavailable,
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

struct AttemptSuccess {
    response: BufferedResponse,
    transformed: Value,
}

struct AttemptFailure {
    error: GatewayError,
    status: Option<u16>,
    body: Option<String>,
}

impl From<GatewayError> for AttemptFailure {
    fn from(error: GatewayError) -> Self {
        Self {
            error,
            status: None,
            body: None,
        }
    }
}

/// End-to-end delivery flow for one event against one integration.
pub struct DeliveryPipeline {
    integrations: Arc<dyn IntegrationStore>,
    transformer: Arc<Transformer>,
    auth: Arc<AuthHeaderBuilder>,
    rate_limiter: Arc<RateLimiter>,
    executor: Arc<DeliveryExecutor>,
    log_store: Arc<dyn ExecutionLogStore>,
    dlq_store: Arc<dyn DlqStore>,
}

impl DeliveryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        transformer: Arc<Transformer>,
        auth: Arc<AuthHeaderBuilder>,
        rate_limiter: Arc<RateLimiter>,
        executor: Arc<DeliveryExecutor>,
        log_store: Arc<dyn ExecutionLogStore>,
        dlq_store: Arc<dyn DlqStore>,
    ) -> Self {
        Self {
            integrations,
            transformer,
            auth,
            rate_limiter,
            executor,
            log_store,
            dlq_store,
        }
    }

    /// Deliver one event to an integration's primary target and all of its
    /// fan-out actions. Returns one outcome per attempt record created.
    pub async fn deliver_all(
        &self,
        event: &InboundEvent,
        integration: &IntegrationConfig,
        trigger: TriggerType,
    ) -> Vec<AttemptOutcome> {
        let mut outcomes = Vec::with_capacity(1 + integration.actions.len());
        outcomes.push(self.deliver(event, integration, trigger).await);

        for action in &integration.actions {
            outcomes.push(self.deliver_action(event, integration, action, trigger).await);
        }

        outcomes
    }

    /// Run one buffered delivery attempt against the primary target.
    pub async fn deliver(
        &self,
        event: &InboundEvent,
        integration: &IntegrationConfig,
        trigger: TriggerType,
    ) -> AttemptOutcome {
        let mut logger = ExecutionLogger::start(
            self.log_store.clone(),
            AttemptMeta {
                org_id: integration.org_id,
                integration_id: integration.id,
                action_id: None,
                direction: integration.direction,
                trigger,
            },
            event,
        )
        .await;

        info!(
            target: "delivery",
            trace_id = %logger.trace_id(),
            integration_id = %integration.id,
            org_id = %integration.org_id,
            event_id = %event.event_id,
            event_type = %event.event_type,
            "Starting delivery attempt"
        );

        let result = self.run_attempt(&mut logger, event, integration).await;
        self.finalize(logger, event, integration, result).await
    }

    /// Run one delivery attempt for a fan-out action.
    pub async fn deliver_action(
        &self,
        event: &InboundEvent,
        integration: &IntegrationConfig,
        action: &Action,
        trigger: TriggerType,
    ) -> AttemptOutcome {
        let mut logger = ExecutionLogger::start(
            self.log_store.clone(),
            AttemptMeta {
                org_id: integration.org_id,
                integration_id: integration.id,
                action_id: Some(action.id),
                direction: integration.direction,
                trigger,
            },
            event,
        )
        .await;

        let result = self
            .run_action_attempt(&mut logger, event, integration, action)
            .await;
        self.finalize(logger, event, integration, result).await
    }

    /// Open a streaming delivery: the upstream status and filtered headers
    /// are forwarded verbatim; response transformation is skipped and the
    /// logged response body is the literal `[STREAMED]` marker.
    ///
    /// Once this returns, a mid-stream error can only terminate the byte
    /// stream; the attempt record is already finalized on headers.
    pub async fn deliver_streaming(
        &self,
        event: &InboundEvent,
        integration: &IntegrationConfig,
        trigger: TriggerType,
    ) -> std::result::Result<(AttemptOutcome, StreamingStart), AttemptOutcome> {
        let mut logger = ExecutionLogger::start(
            self.log_store.clone(),
            AttemptMeta {
                org_id: integration.org_id,
                integration_id: integration.id,
                action_id: None,
                direction: integration.direction,
                trigger,
            },
            event,
        )
        .await;

        let prepared = self.prepare(&mut logger, event, integration).await;
        let (transformed, headers) = match prepared {
            Ok(parts) => parts,
            Err(failure) => {
                let outcome = self
                    .finalize(logger, event, integration, Err(failure))
                    .await;
                return Err(outcome);
            }
        };

        let policy = RetryPolicy::from_settings(&integration.retry);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            logger.set_attempts(attempt);
            let call_started = Instant::now();

            match self
                .executor
                .execute_streaming(
                    integration.method,
                    &integration.target_url,
                    headers.clone(),
                    Some(&transformed),
                    integration.timeout(),
                )
                .await
            {
                Ok(streaming) => {
                    let duration_ms = call_started.elapsed().as_millis() as u64;
                    let success = streaming.is_success();
                    logger
                        .add_step(
                            "streaming",
                            if success {
                                StepStatus::Success
                            } else {
                                StepStatus::Failed
                            },
                            duration_ms,
                            Some(json!({"attempt": attempt, "status": streaming.status})),
                            None,
                        )
                        .await;

                    // The upstream response is forwarded verbatim either
                    // way; the attempt record reflects the upstream status.
                    let result = if success {
                        Ok(AttemptSuccess {
                            response: BufferedResponse {
                                status: streaming.status,
                                headers: json!({}),
                                body: STREAMED_BODY_MARKER.to_string(),
                                latency_ms: duration_ms,
                            },
                            transformed: Value::Null,
                        })
                    } else {
                        Err(AttemptFailure {
                            error: GatewayError::Upstream {
                                status: streaming.status,
                                body: None,
                            },
                            status: Some(streaming.status),
                            body: Some(STREAMED_BODY_MARKER.to_string()),
                        })
                    };

                    let outcome = self.finalize(logger, event, integration, result).await;
                    return Ok((outcome, streaming));
                }
                Err(e) => {
                    let duration_ms = call_started.elapsed().as_millis() as u64;
                    logger
                        .add_step(
                            "streaming",
                            StepStatus::Failed,
                            duration_ms,
                            Some(json!({"attempt": attempt})),
                            Some(e.to_string()),
                        )
                        .await;

                    // No bytes have reached the caller yet, so connection
                    // level failures may still retry.
                    if e.is_retryable() && attempt < policy.max_attempts() {
                        let delay = policy.backoff(attempt);
                        warn!(
                            target: "delivery",
                            trace_id = %logger.trace_id(),
                            attempt = attempt,
                            wait_ms = delay.as_millis() as u64,
                            error = %e,
                            "Streaming connect failed, retrying with backoff"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let outcome = self
                        .finalize(logger, event, integration, Err(AttemptFailure::from(e)))
                        .await;
                    return Err(outcome);
                }
            }
        }
    }

    /// Manual replay of a prior attempt.
    ///
    /// Idempotent w.r.t. duplicate replay requests: the original record
    /// carries a replay marker and a second replay without `force` is
    /// rejected. A brand-new attempt record is created; the original is
    /// never mutated beyond the marker.
    pub async fn replay(
        &self,
        org_id: OrgId,
        attempt_id: AttemptId,
        force: bool,
    ) -> std::result::Result<AttemptOutcome, ReplayError> {
        let log = self
            .log_store
            .find_by_id(org_id, attempt_id)
            .await
            .map_err(ReplayError::Gateway)?
            .ok_or(ReplayError::NotFound)?;

        if log.replayed_at.is_some() && !force {
            return Err(ReplayError::Duplicate);
        }

        let integration = self
            .integrations
            .find_by_id(org_id, log.integration_id)
            .await
            .filter(|i| i.active)
            .ok_or(ReplayError::IntegrationUnavailable)?;

        let marked = self
            .log_store
            .mark_replayed(org_id, attempt_id)
            .await
            .map_err(ReplayError::Gateway)?;
        if !marked {
            return Err(ReplayError::NotFound);
        }

        info!(
            target: "delivery",
            attempt_id = %attempt_id,
            integration_id = %integration.id,
            org_id = %org_id,
            force = force,
            "Replaying delivery attempt"
        );

        Ok(self
            .deliver(&log.event, &integration, TriggerType::Manual)
            .await)
    }

    /// Shared preamble: rate limit, request transform, auth headers.
    async fn prepare(
        &self,
        logger: &mut ExecutionLogger,
        event: &InboundEvent,
        integration: &IntegrationConfig,
    ) -> std::result::Result<(Value, reqwest::header::HeaderMap), AttemptFailure> {
        // Rate limit: denied checks make no attempt against the target.
        let started = Instant::now();
        let decision = self
            .rate_limiter
            .check(integration.id, &integration.rate_limit)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if !decision.allowed {
            let retry_after_secs = decision
                .retry_after
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            logger
                .add_step(
                    "rate_limit",
                    StepStatus::Failed,
                    duration_ms,
                    Some(json!({
                        "remaining": decision.remaining,
                        "reset_at": decision.reset_at,
                        "retry_after_secs": retry_after_secs,
                    })),
                    Some("rate limit window exhausted".to_string()),
                )
                .await;
            return Err(AttemptFailure::from(GatewayError::RateLimitExceeded {
                integration_id: integration.id,
                retry_after_secs,
                reset_at: decision.reset_at.unwrap_or_else(Utc::now),
            }));
        }

        logger
            .add_step(
                "rate_limit",
                StepStatus::Success,
                duration_ms,
                Some(json!({"remaining": decision.remaining})),
                None,
            )
            .await;

        // Request transform
        let ctx = context_for(event);
        let started = Instant::now();
        let transformed = match self.transformer.transform_request(
            &integration.request_transform,
            &event.payload,
            &ctx,
        ) {
            Ok(value) => value,
            Err(e) => {
                logger
                    .add_step(
                        "request_transform",
                        StepStatus::Failed,
                        started.elapsed().as_millis() as u64,
                        None,
                        Some(e.to_string()),
                    )
                    .await;
                return Err(AttemptFailure::from(e));
            }
        };
        logger
            .add_step(
                "request_transform",
                StepStatus::Success,
                started.elapsed().as_millis() as u64,
                Some(json!({"mode": transform_mode(&integration.request_transform)})),
                None,
            )
            .await;

        // Auth headers
        let started = Instant::now();
        let headers = match self
            .auth
            .build(TokenCacheKey::integration(integration.id), &integration.auth)
            .await
        {
            Ok(headers) => headers,
            Err(e) => {
                logger
                    .add_step(
                        "auth",
                        StepStatus::Failed,
                        started.elapsed().as_millis() as u64,
                        None,
                        Some(e.to_string()),
                    )
                    .await;
                return Err(AttemptFailure::from(e));
            }
        };
        logger
            .add_step(
                "auth",
                StepStatus::Success,
                started.elapsed().as_millis() as u64,
                None,
                None,
            )
            .await;

        Ok((transformed, headers))
    }

    /// Buffered attempt against the primary target.
    async fn run_attempt(
        &self,
        logger: &mut ExecutionLogger,
        event: &InboundEvent,
        integration: &IntegrationConfig,
    ) -> std::result::Result<AttemptSuccess, AttemptFailure> {
        let (transformed, headers) = self.prepare(logger, event, integration).await?;

        let policy = RetryPolicy::from_settings(&integration.retry);
        let response = self
            .call_with_retry(
                logger,
                integration.method,
                &integration.target_url,
                headers,
                &transformed,
                integration.timeout(),
                &policy,
            )
            .await?;

        // Response transform: a failure here fails the attempt even though
        // the upstream call succeeded.
        let ctx = context_for(event);
        let response_ctx = ResponseContext {
            status: response.status,
            headers: response.headers.clone(),
            body: parse_body(&response.body),
        };

        let started = Instant::now();
        match self.transformer.transform_response(
            &integration.response_transform,
            &response_ctx,
            &ctx,
        ) {
            Ok(value) => {
                logger
                    .add_step(
                        "response_transform",
                        StepStatus::Success,
                        started.elapsed().as_millis() as u64,
                        Some(json!({"mode": transform_mode(&integration.response_transform)})),
                        None,
                    )
                    .await;
                Ok(AttemptSuccess {
                    response,
                    transformed: value,
                })
            }
            Err(e) => {
                logger
                    .add_step(
                        "response_transform",
                        StepStatus::Failed,
                        started.elapsed().as_millis() as u64,
                        None,
                        Some(e.to_string()),
                    )
                    .await;
                Err(AttemptFailure {
                    error: e,
                    status: Some(response.status),
                    body: Some(response.body),
                })
            }
        }
    }

    /// Attempt for a fan-out action (HTTP or communication channel).
    async fn run_action_attempt(
        &self,
        logger: &mut ExecutionLogger,
        event: &InboundEvent,
        integration: &IntegrationConfig,
        action: &Action,
    ) -> std::result::Result<AttemptSuccess, AttemptFailure> {
        // Actions share the integration's rate-limit window.
        let started = Instant::now();
        let decision = self
            .rate_limiter
            .check(integration.id, &integration.rate_limit)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        if !decision.allowed {
            let retry_after_secs = decision
                .retry_after
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            logger
                .add_step(
                    "rate_limit",
                    StepStatus::Failed,
                    duration_ms,
                    None,
                    Some("rate limit window exhausted".to_string()),
                )
                .await;
            return Err(AttemptFailure::from(GatewayError::RateLimitExceeded {
                integration_id: integration.id,
                retry_after_secs,
                reset_at: decision.reset_at.unwrap_or_else(Utc::now),
            }));
        }
        logger
            .add_step("rate_limit", StepStatus::Success, duration_ms, None, None)
            .await;

        // Per-action request transform
        let ctx = context_for(event);
        let started = Instant::now();
        let transformed = match self.transformer.transform_request(
            &action.request_transform,
            &event.payload,
            &ctx,
        ) {
            Ok(value) => value,
            Err(e) => {
                logger
                    .add_step(
                        "request_transform",
                        StepStatus::Failed,
                        started.elapsed().as_millis() as u64,
                        None,
                        Some(e.to_string()),
                    )
                    .await;
                return Err(AttemptFailure::from(e));
            }
        };
        logger
            .add_step(
                "request_transform",
                StepStatus::Success,
                started.elapsed().as_millis() as u64,
                Some(json!({"action": action.name})),
                None,
            )
            .await;

        match &action.target {
            ActionTarget::Http {
                url,
                method,
                auth,
                timeout_secs,
            } => {
                let started = Instant::now();
                let headers = match self
                    .auth
                    .build(TokenCacheKey::action(integration.id, action.id), auth)
                    .await
                {
                    Ok(headers) => headers,
                    Err(e) => {
                        logger
                            .add_step(
                                "auth",
                                StepStatus::Failed,
                                started.elapsed().as_millis() as u64,
                                None,
                                Some(e.to_string()),
                            )
                            .await;
                        return Err(AttemptFailure::from(e));
                    }
                };
                logger
                    .add_step(
                        "auth",
                        StepStatus::Success,
                        started.elapsed().as_millis() as u64,
                        None,
                        None,
                    )
                    .await;

                let policy = RetryPolicy::from_settings(&integration.retry);
                let response = self
                    .call_with_retry(
                        logger,
                        *method,
                        url,
                        headers,
                        &transformed,
                        std::time::Duration::from_secs(*timeout_secs),
                        &policy,
                    )
                    .await?;

                let transformed_response = parse_body(&response.body);
                Ok(AttemptSuccess {
                    response,
                    transformed: transformed_response,
                })
            }
            ActionTarget::Communication { channel, provider } => {
                let started = Instant::now();
                match self
                    .executor
                    .execute_channel(channel, provider, &transformed)
                    .await
                {
                    Ok(message_id) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        logger
                            .add_step(
                                "channel_send",
                                StepStatus::Success,
                                duration_ms,
                                Some(json!({
                                    "channel": channel,
                                    "provider": provider,
                                    "message_id": message_id,
                                })),
                                None,
                            )
                            .await;
                        logger.set_attempts(1);
                        Ok(AttemptSuccess {
                            response: BufferedResponse {
                                status: 200,
                                headers: json!({}),
                                body: json!({ "message_id": message_id }).to_string(),
                                latency_ms: duration_ms,
                            },
                            transformed: json!({ "message_id": message_id }),
                        })
                    }
                    Err(e) => {
                        logger
                            .add_step(
                                "channel_send",
                                StepStatus::Failed,
                                started.elapsed().as_millis() as u64,
                                Some(json!({"channel": channel, "provider": provider})),
                                Some(e.to_string()),
                            )
                            .await;
                        logger.set_attempts(1);
                        Err(AttemptFailure::from(e))
                    }
                }
            }
        }
    }

    /// The intra-request retry loop. Reuses the already-transformed payload;
    /// the transformer is never re-invoked between attempts.
    #[allow(clippy::too_many_arguments)]
    async fn call_with_retry(
        &self,
        logger: &mut ExecutionLogger,
        method: HttpMethod,
        url: &str,
        headers: reqwest::header::HeaderMap,
        payload: &Value,
        timeout: std::time::Duration,
        policy: &RetryPolicy,
    ) -> std::result::Result<BufferedResponse, AttemptFailure> {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            logger.set_attempts(attempt);

            match self
                .executor
                .execute_buffered(method, url, headers.clone(), Some(payload), timeout)
                .await
            {
                Ok(response) if response.is_success() => {
                    logger
                        .add_step(
                            "http_call",
                            StepStatus::Success,
                            response.latency_ms,
                            Some(json!({"attempt": attempt, "status": response.status})),
                            None,
                        )
                        .await;
                    return Ok(response);
                }
                Ok(response) => {
                    logger
                        .add_step(
                            "http_call",
                            StepStatus::Failed,
                            response.latency_ms,
                            Some(json!({"attempt": attempt, "status": response.status})),
                            Some(format!("HTTP {}", response.status)),
                        )
                        .await;

                    if policy.should_retry_status(response.status)
                        && attempt < policy.max_attempts()
                    {
                        // 429 honors Retry-After when the upstream sent one
                        let delay = if response.status == 429 {
                            response
                                .retry_after()
                                .and_then(parse_retry_after)
                                .unwrap_or_else(|| policy.backoff(attempt))
                        } else {
                            policy.backoff(attempt)
                        };

                        warn!(
                            target: "delivery",
                            trace_id = %logger.trace_id(),
                            url = %url,
                            status = response.status,
                            attempt = attempt,
                            wait_ms = delay.as_millis() as u64,
                            "Retryable upstream status, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(AttemptFailure {
                        error: GatewayError::Upstream {
                            status: response.status,
                            body: Some(truncate(&response.body)),
                        },
                        status: Some(response.status),
                        body: Some(response.body),
                    });
                }
                Err(e) => {
                    logger
                        .add_step(
                            "http_call",
                            StepStatus::Failed,
                            0,
                            Some(json!({"attempt": attempt})),
                            Some(e.to_string()),
                        )
                        .await;

                    if e.is_retryable() && attempt < policy.max_attempts() {
                        let delay = policy.backoff(attempt);
                        warn!(
                            target: "delivery",
                            trace_id = %logger.trace_id(),
                            url = %url,
                            attempt = attempt,
                            wait_ms = delay.as_millis() as u64,
                            error = %e,
                            "Connection-level failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    return Err(AttemptFailure::from(e));
                }
            }
        }
    }

    /// Finalize the attempt record and run terminal-failure side effects.
    ///
    /// The failure is logged with its category before any DLQ side effect,
    /// so the audit trail is complete even if the DLQ write later fails.
    async fn finalize(
        &self,
        mut logger: ExecutionLogger,
        event: &InboundEvent,
        integration: &IntegrationConfig,
        result: std::result::Result<AttemptSuccess, AttemptFailure>,
    ) -> AttemptOutcome {
        match result {
            Ok(success) => {
                logger
                    .success(ResponseSnapshot {
                        status_code: Some(success.response.status),
                        body: Some(success.response.body.clone()),
                    })
                    .await;

                let log = logger.snapshot();
                info!(
                    target: "delivery",
                    trace_id = %log.trace_id,
                    attempt_id = %log.id,
                    integration_id = %integration.id,
                    status = success.response.status,
                    attempts = log.attempts,
                    "Delivery succeeded"
                );

                AttemptOutcome {
                    attempt_id: log.id,
                    status: log.status,
                    attempts: log.attempts,
                    response_status: Some(success.response.status),
                    response_body: Some(success.transformed),
                    error_code: None,
                    error_message: None,
                }
            }
            Err(failure) => {
                logger
                    .fail(&failure.error, failure.status, failure.body.clone())
                    .await;

                let log = logger.snapshot();
                warn!(
                    target: "delivery",
                    trace_id = %log.trace_id,
                    attempt_id = %log.id,
                    integration_id = %integration.id,
                    org_id = %integration.org_id,
                    event_id = %event.event_id,
                    error_code = failure.error.error_code(),
                    error = %failure.error,
                    attempts = log.attempts,
                    "Delivery failed"
                );

                if integration.create_dlq_entry && is_dead_letterable(&failure.error) {
                    let entry = entry_from_failure(
                        integration.org_id,
                        integration.id,
                        log.id,
                        event.event_id,
                        &event.event_type,
                        &failure.error,
                        event.payload.clone(),
                    );
                    if let Err(e) = self.dlq_store.insert(&entry).await {
                        tracing::error!(
                            target: "delivery",
                            attempt_id = %log.id,
                            error = %e,
                            "Failed to create DLQ entry"
                        );
                    }
                }

                AttemptOutcome {
                    attempt_id: log.id,
                    status: log.status,
                    attempts: log.attempts,
                    response_status: failure.status,
                    response_body: None,
                    error_code: Some(failure.error.error_code().to_string()),
                    error_message: Some(failure.error.to_string()),
                }
            }
        }
    }
}

#[async_trait]
impl Redeliver for DeliveryPipeline {
    async fn redeliver(&self, entry: &DlqEntry) -> Result<AttemptId> {
        let integration = self
            .integrations
            .find_by_id(entry.org_id, entry.integration_id)
            .await
            .filter(|i| i.active)
            .ok_or_else(|| {
                GatewayError::validation(format!(
                    "integration {} is missing or inactive",
                    entry.integration_id
                ))
            })?;

        let event = InboundEvent::with_id(
            entry.event_id,
            entry.org_id,
            entry.event_type.clone(),
            entry.payload.clone(),
            "dlq-replay",
        );

        let outcome = self
            .deliver(&event, &integration, TriggerType::Manual)
            .await;
        Ok(outcome.attempt_id)
    }
}

/// How an ingested event was handled for one integration.
#[derive(Debug, Clone)]
pub enum IngestDisposition {
    /// Delivered immediately; outcomes for the primary target and actions.
    Delivered(Vec<AttemptOutcome>),
    /// Deferred through the scheduler.
    Scheduled {
        integration_id: IntegrationId,
        pending_id: fluxgate_core::PendingDeliveryId,
        scheduled_for: chrono::DateTime<Utc>,
        is_overdue: bool,
    },
    /// The scheduling script failed; nothing was enqueued.
    SchedulingFailed {
        integration_id: IntegrationId,
        code: String,
        error: String,
    },
}

/// Intake boundary: matches an event against active integrations and either
/// delivers immediately or defers through the scheduler. The scheduler runs
/// before enqueue for DELAYED/RECURRING integrations.
pub struct EventIntake {
    integrations: Arc<dyn IntegrationStore>,
    pipeline: Arc<DeliveryPipeline>,
    scheduler: Arc<Scheduler>,
    pending: Arc<dyn PendingDeliveryStore>,
}

impl EventIntake {
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        pipeline: Arc<DeliveryPipeline>,
        scheduler: Arc<Scheduler>,
        pending: Arc<dyn PendingDeliveryStore>,
    ) -> Self {
        Self {
            integrations,
            pipeline,
            scheduler,
            pending,
        }
    }

    /// Ingest one normalized event from a source adapter.
    pub async fn ingest(&self, event: &InboundEvent) -> Result<Vec<IngestDisposition>> {
        event.validate()?;

        let integrations = self
            .integrations
            .find_active_by_event_type(event.org_id, &event.event_type)
            .await;

        if integrations.is_empty() {
            debug!(
                target: "intake",
                event_id = %event.event_id,
                event_type = %event.event_type,
                org_id = %event.org_id,
                "No active integrations match event type"
            );
            return Ok(Vec::new());
        }

        let mut dispositions = Vec::with_capacity(integrations.len());
        for integration in &integrations {
            dispositions.push(self.ingest_for(event, integration).await);
        }
        Ok(dispositions)
    }

    async fn ingest_for(
        &self,
        event: &InboundEvent,
        integration: &IntegrationConfig,
    ) -> IngestDisposition {
        if integration.delivery_mode == DeliveryMode::Immediate {
            let outcomes = self
                .pipeline
                .deliver_all(event, integration, TriggerType::Event)
                .await;
            return IngestDisposition::Delivered(outcomes);
        }

        let ctx = context_for(event);
        match self
            .scheduler
            .compute_schedule(&integration.delivery_mode, &event.payload, &ctx)
        {
            Ok(ScheduleOutcome::Delayed {
                scheduled_for,
                is_overdue,
            }) => {
                let mut pending = PendingDelivery::new_delayed(
                    integration.org_id,
                    integration.id,
                    event.clone(),
                    scheduled_for,
                );
                if is_overdue {
                    pending.status = PendingStatus::Overdue;
                }
                self.store_pending(integration, pending, scheduled_for, is_overdue)
                    .await
            }
            Ok(ScheduleOutcome::Recurring {
                first_occurrence,
                config,
            }) => {
                let pending = PendingDelivery::new_recurring(
                    integration.org_id,
                    integration.id,
                    event.clone(),
                    first_occurrence,
                    &config,
                );
                let is_overdue = first_occurrence <= Utc::now();
                self.store_pending(integration, pending, first_occurrence, is_overdue)
                    .await
            }
            Err(e) => {
                warn!(
                    target: "intake",
                    integration_id = %integration.id,
                    event_id = %event.event_id,
                    error_code = e.error_code(),
                    error = %e,
                    "Scheduling script failed; event not enqueued"
                );
                IngestDisposition::SchedulingFailed {
                    integration_id: integration.id,
                    code: e.error_code().to_string(),
                    error: e.to_string(),
                }
            }
        }
    }

    async fn store_pending(
        &self,
        integration: &IntegrationConfig,
        pending: PendingDelivery,
        scheduled_for: chrono::DateTime<Utc>,
        is_overdue: bool,
    ) -> IngestDisposition {
        let pending_id = pending.id;
        match self.pending.insert(&pending).await {
            Ok(()) => {
                info!(
                    target: "intake",
                    integration_id = %integration.id,
                    pending_id = %pending_id,
                    scheduled_for = %scheduled_for,
                    is_overdue = is_overdue,
                    "Delivery deferred"
                );
                IngestDisposition::Scheduled {
                    integration_id: integration.id,
                    pending_id,
                    scheduled_for,
                    is_overdue,
                }
            }
            Err(e) => IngestDisposition::SchedulingFailed {
                integration_id: integration.id,
                code: e.error_code().to_string(),
                error: e.to_string(),
            },
        }
    }
}

/// Build the script/transform context for an event.
fn context_for(event: &InboundEvent) -> TransformContext {
    let mut ctx = TransformContext::new(event.event_type.as_str(), event.org_id);
    ctx.body = event.payload.clone();
    ctx
}

fn transform_mode(spec: &TransformSpec) -> &'static str {
    match spec {
        TransformSpec::None => "none",
        TransformSpec::Simple { .. } => "simple",
        TransformSpec::Script { .. } => "script",
    }
}

fn parse_body(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

fn truncate(body: &str) -> String {
    body.chars().take(RESPONSE_BODY_CAP).collect()
}

/// Categories that route to the DLQ on terminal failure. Rate-limit
/// denials never made an attempt; validation failures are configuration
/// problems surfaced to the caller directly.
fn is_dead_letterable(error: &GatewayError) -> bool {
    !matches!(
        error,
        GatewayError::RateLimitExceeded { .. } | GatewayError::Validation { .. }
    )
}
