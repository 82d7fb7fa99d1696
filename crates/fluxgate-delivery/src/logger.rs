//! Step-level execution logging for delivery attempts.
//!
//! One record per invocation of the pipeline for one event against one
//! integration (or action). Steps are appended in the order they occur and
//! never reordered; a record is finalized exactly once. Log-store failures
//! are reported and swallowed: logging must never abort or alter the
//! outcome of the delivery itself.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

use fluxgate_core::{
    ActionId, AttemptId, GatewayError, InboundEvent, IntegrationId, OrgId, OrgScoped, Result,
    TriggerType,
};

use crate::config::Direction;

/// Overall status of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
}

/// Status of one recorded step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// One ordered step inside an attempt (auth, rate_limit, transform, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub name: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of the upstream response kept on the attempt record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status_code: Option<u16>,
    /// Masked/capped body; the literal `[STREAMED]` for streaming mode.
    pub body: Option<String>,
}

/// One execution log record (delivery attempt).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub id: AttemptId,
    /// Correlation id propagated through tracing fields.
    pub trace_id: String,
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    /// Set when this attempt delivered a fan-out action.
    pub action_id: Option<ActionId>,
    pub direction: Direction,
    pub trigger: TriggerType,
    /// Snapshot of the originating event; replay rebuilds from this.
    pub event: InboundEvent,
    pub steps: Vec<ExecutionStep>,
    pub status: AttemptStatus,
    pub response: Option<ResponseSnapshot>,
    /// Number of outbound calls issued within this attempt.
    pub attempts: u32,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Set when an operator replays this record.
    pub replayed_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionLog {
    /// Whether the attempt has reached a terminal status.
    #[must_use]
    pub fn is_finalized(&self) -> bool {
        matches!(
            self.status,
            AttemptStatus::Success | AttemptStatus::Failed | AttemptStatus::Timeout
        )
    }
}

impl OrgScoped for ExecutionLog {
    fn org_id(&self) -> OrgId {
        self.org_id
    }
}

/// Append-only sink for execution logs.
#[async_trait]
pub trait ExecutionLogStore: Send + Sync {
    async fn insert(&self, log: &ExecutionLog) -> Result<()>;
    async fn update(&self, log: &ExecutionLog) -> Result<()>;
    async fn find_by_id(&self, org_id: OrgId, id: AttemptId) -> Result<Option<ExecutionLog>>;
    /// Stamp the replay marker. Returns false when the record is missing.
    async fn mark_replayed(&self, org_id: OrgId, id: AttemptId) -> Result<bool>;
}

/// In-memory log store used by the gateway runtime and tests.
#[derive(Default)]
pub struct InMemoryLogStore {
    logs: Mutex<HashMap<AttemptId, ExecutionLog>>,
}

impl InMemoryLogStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All records for one integration, most recent last. Test helper.
    pub async fn find_by_integration(&self, integration_id: IntegrationId) -> Vec<ExecutionLog> {
        let guard = self.logs.lock().await;
        let mut logs: Vec<ExecutionLog> = guard
            .values()
            .filter(|l| l.integration_id == integration_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.started_at);
        logs
    }
}

#[async_trait]
impl ExecutionLogStore for InMemoryLogStore {
    async fn insert(&self, log: &ExecutionLog) -> Result<()> {
        let mut guard = self.logs.lock().await;
        guard.insert(log.id, log.clone());
        Ok(())
    }

    async fn update(&self, log: &ExecutionLog) -> Result<()> {
        let mut guard = self.logs.lock().await;
        if !guard.contains_key(&log.id) {
            return Err(GatewayError::internal(format!(
                "unknown execution log {}",
                log.id
            )));
        }
        guard.insert(log.id, log.clone());
        Ok(())
    }

    async fn find_by_id(&self, org_id: OrgId, id: AttemptId) -> Result<Option<ExecutionLog>> {
        let guard = self.logs.lock().await;
        Ok(guard.get(&id).filter(|l| l.org_id == org_id).cloned())
    }

    async fn mark_replayed(&self, org_id: OrgId, id: AttemptId) -> Result<bool> {
        let mut guard = self.logs.lock().await;
        match guard.get_mut(&id) {
            Some(log) if log.org_id == org_id => {
                log.replayed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Metadata describing one attempt at start time.
#[derive(Debug, Clone)]
pub struct AttemptMeta {
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    pub action_id: Option<ActionId>,
    pub direction: Direction,
    pub trigger: TriggerType,
}

/// Builds one execution log across the lifetime of an attempt.
///
/// All store writes are best-effort: a briefly unavailable log store is
/// reported via tracing and otherwise ignored.
pub struct ExecutionLogger {
    store: std::sync::Arc<dyn ExecutionLogStore>,
    log: ExecutionLog,
    finalized: bool,
}

impl ExecutionLogger {
    /// Open a new attempt record and persist it as `running`.
    pub async fn start(
        store: std::sync::Arc<dyn ExecutionLogStore>,
        meta: AttemptMeta,
        event: &InboundEvent,
    ) -> Self {
        let log = ExecutionLog {
            id: AttemptId::new(),
            trace_id: Uuid::new_v4().to_string(),
            org_id: meta.org_id,
            integration_id: meta.integration_id,
            action_id: meta.action_id,
            direction: meta.direction,
            trigger: meta.trigger,
            event: event.clone(),
            steps: Vec::new(),
            status: AttemptStatus::Running,
            response: None,
            attempts: 0,
            error_code: None,
            error_message: None,
            replayed_at: None,
            started_at: Utc::now(),
            finished_at: None,
        };

        if let Err(e) = store.insert(&log).await {
            error!(
                attempt_id = %log.id,
                error = %e,
                "Failed to insert execution log"
            );
        }

        Self {
            store,
            log,
            finalized: false,
        }
    }

    /// The attempt id of the record being built.
    #[must_use]
    pub fn attempt_id(&self) -> AttemptId {
        self.log.id
    }

    /// The correlation id of the record being built.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.log.trace_id
    }

    /// Append a step in occurrence order.
    pub async fn add_step(
        &mut self,
        name: &str,
        status: StepStatus,
        duration_ms: u64,
        metadata: Option<serde_json::Value>,
        step_error: Option<String>,
    ) {
        self.log.steps.push(ExecutionStep {
            name: name.to_string(),
            status,
            duration_ms,
            metadata,
            error: step_error,
        });
        self.persist_update().await;
    }

    /// Record how many outbound calls were issued.
    pub fn set_attempts(&mut self, attempts: u32) {
        self.log.attempts = attempts;
    }

    /// Finalize the record as successful. Second finalizations are rejected.
    pub async fn success(&mut self, response: ResponseSnapshot) {
        if self.check_finalized() {
            return;
        }
        self.log.status = AttemptStatus::Success;
        self.log.response = Some(response);
        self.log.finished_at = Some(Utc::now());
        self.persist_update().await;
    }

    /// Finalize the record as failed (or timed out, for timeout errors).
    /// Second finalizations are rejected.
    pub async fn fail(
        &mut self,
        cause: &GatewayError,
        status_code: Option<u16>,
        body: Option<String>,
    ) {
        if self.check_finalized() {
            return;
        }
        self.log.status = match cause {
            GatewayError::UpstreamTimeout { .. } => AttemptStatus::Timeout,
            _ => AttemptStatus::Failed,
        };
        self.log.error_code = Some(cause.error_code().to_string());
        self.log.error_message = Some(cause.to_string());
        self.log.response = Some(ResponseSnapshot { status_code, body });
        self.log.finished_at = Some(Utc::now());
        self.persist_update().await;
    }

    /// A copy of the record in its current state.
    #[must_use]
    pub fn snapshot(&self) -> ExecutionLog {
        self.log.clone()
    }

    fn check_finalized(&mut self) -> bool {
        if self.finalized {
            error!(
                attempt_id = %self.log.id,
                "Attempted to finalize an execution log twice"
            );
            return true;
        }
        self.finalized = true;
        false
    }

    async fn persist_update(&self) {
        if let Err(e) = self.store.update(&self.log).await {
            error!(
                attempt_id = %self.log.id,
                error = %e,
                "Failed to update execution log"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn meta(org_id: OrgId, integration_id: IntegrationId) -> AttemptMeta {
        AttemptMeta {
            org_id,
            integration_id,
            action_id: None,
            direction: Direction::Outbound,
            trigger: TriggerType::Event,
        }
    }

    fn event(org_id: OrgId) -> InboundEvent {
        InboundEvent::new(org_id, "order.created", serde_json::json!({}), "test")
    }

    #[tokio::test]
    async fn test_steps_are_appended_in_order() {
        let store = Arc::new(InMemoryLogStore::new());
        let org = OrgId::new();
        let integration = IntegrationId::new();

        let mut logger =
            ExecutionLogger::start(store.clone(), meta(org, integration), &event(org)).await;

        logger
            .add_step("rate_limit", StepStatus::Success, 1, None, None)
            .await;
        logger
            .add_step("request_transform", StepStatus::Success, 3, None, None)
            .await;
        logger
            .add_step("auth", StepStatus::Success, 0, None, None)
            .await;
        logger
            .success(ResponseSnapshot {
                status_code: Some(200),
                body: Some("ok".to_string()),
            })
            .await;

        let stored = store
            .find_by_id(org, logger.attempt_id())
            .await
            .unwrap()
            .unwrap();

        let names: Vec<&str> = stored.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["rate_limit", "request_transform", "auth"]);
        assert_eq!(stored.status, AttemptStatus::Success);
        assert!(stored.is_finalized());
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_finalize_exactly_once() {
        let store = Arc::new(InMemoryLogStore::new());
        let org = OrgId::new();

        let mut logger =
            ExecutionLogger::start(store.clone(), meta(org, IntegrationId::new()), &event(org))
                .await;

        logger
            .success(ResponseSnapshot {
                status_code: Some(200),
                body: None,
            })
            .await;

        // Second finalization is a no-op
        logger
            .fail(&GatewayError::internal("late failure"), None, None)
            .await;

        let stored = store
            .find_by_id(org, logger.attempt_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, AttemptStatus::Success);
        assert!(stored.error_code.is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_a_distinct_terminal_status() {
        let store = Arc::new(InMemoryLogStore::new());
        let org = OrgId::new();

        let mut logger =
            ExecutionLogger::start(store.clone(), meta(org, IntegrationId::new()), &event(org))
                .await;

        logger
            .fail(
                &GatewayError::UpstreamTimeout { timeout_secs: 5 },
                None,
                None,
            )
            .await;

        let stored = store
            .find_by_id(org, logger.attempt_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, AttemptStatus::Timeout);
        assert_eq!(stored.error_code.as_deref(), Some("UPSTREAM_TIMEOUT"));
    }

    #[tokio::test]
    async fn test_store_scoped_by_org() {
        let store = Arc::new(InMemoryLogStore::new());
        let org = OrgId::new();

        let logger =
            ExecutionLogger::start(store.clone(), meta(org, IntegrationId::new()), &event(org))
                .await;

        assert!(store
            .find_by_id(OrgId::new(), logger.attempt_id())
            .await
            .unwrap()
            .is_none());
        assert!(store
            .find_by_id(org, logger.attempt_id())
            .await
            .unwrap()
            .is_some());
    }

    struct FailingStore;

    #[async_trait]
    impl ExecutionLogStore for FailingStore {
        async fn insert(&self, _log: &ExecutionLog) -> Result<()> {
            Err(GatewayError::internal("store down"))
        }
        async fn update(&self, _log: &ExecutionLog) -> Result<()> {
            Err(GatewayError::internal("store down"))
        }
        async fn find_by_id(&self, _org: OrgId, _id: AttemptId) -> Result<Option<ExecutionLog>> {
            Err(GatewayError::internal("store down"))
        }
        async fn mark_replayed(&self, _org: OrgId, _id: AttemptId) -> Result<bool> {
            Err(GatewayError::internal("store down"))
        }
    }

    #[tokio::test]
    async fn test_store_failures_never_propagate() {
        let org = OrgId::new();
        let mut logger = ExecutionLogger::start(
            Arc::new(FailingStore),
            meta(org, IntegrationId::new()),
            &event(org),
        )
        .await;

        // None of these panic or error even though every write fails
        logger
            .add_step("auth", StepStatus::Success, 0, None, None)
            .await;
        logger
            .success(ResponseSnapshot {
                status_code: Some(200),
                body: None,
            })
            .await;

        assert_eq!(logger.snapshot().status, AttemptStatus::Success);
    }
}
