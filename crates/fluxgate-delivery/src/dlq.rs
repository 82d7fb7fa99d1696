//! Dead Letter Queue for terminally-failed deliveries.
//!
//! Entries are created only when a delivery exhausts its retries (or fails
//! permanently) and always reference the prior attempt record. Operators can
//! retry, abandon or delete entries, singly or in bulk; a failure on one id
//! never blocks the remaining ids in a batch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use fluxgate_core::{
    AttemptId, DlqEntryId, EventId, GatewayError, IntegrationId, OrgId, OrgScoped, Result,
};

/// Disposition state of a DLQ entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlqStatus {
    /// Awaiting operator disposition.
    Pending,
    /// Re-entered the pipeline as a new attempt.
    Retrying,
    /// Terminal; no further automatic processing.
    Abandoned,
}

/// A dead-lettered delivery awaiting manual disposition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: DlqEntryId,
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    /// The originating delivery attempt. Always a real prior record.
    pub attempt_id: AttemptId,
    pub event_id: EventId,
    pub event_type: String,
    pub error_code: String,
    pub error_message: String,
    /// Payload snapshot used to re-enter the pipeline on retry.
    pub payload: serde_json::Value,
    pub status: DlqStatus,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrgScoped for DlqEntry {
    fn org_id(&self) -> OrgId {
        self.org_id
    }
}

/// Filter for listing DLQ entries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DlqFilter {
    pub integration_id: Option<IntegrationId>,
    pub event_type: Option<String>,
    pub status: Option<DlqStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DlqFilter {
    fn matches(&self, entry: &DlqEntry) -> bool {
        if let Some(id) = self.integration_id {
            if entry.integration_id != id {
                return false;
            }
        }
        if let Some(ref event_type) = self.event_type {
            if &entry.event_type != event_type {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(from) = self.from {
            if entry.created_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.created_at > to {
                return false;
            }
        }
        true
    }
}

/// CRUD surface of the DLQ store.
#[async_trait]
pub trait DlqStore: Send + Sync {
    async fn insert(&self, entry: &DlqEntry) -> Result<()>;
    async fn find_by_id(&self, org_id: OrgId, id: DlqEntryId) -> Result<Option<DlqEntry>>;
    async fn list(
        &self,
        org_id: OrgId,
        filter: &DlqFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DlqEntry>>;
    async fn count(&self, org_id: OrgId, filter: &DlqFilter) -> Result<i64>;
    /// Transition an entry's status. Returns false when the entry is missing.
    async fn update_status(
        &self,
        org_id: OrgId,
        id: DlqEntryId,
        status: DlqStatus,
        notes: Option<String>,
    ) -> Result<bool>;
    /// Remove an entry. Returns false when the entry is missing.
    async fn delete(&self, org_id: OrgId, id: DlqEntryId) -> Result<bool>;
}

/// In-memory DLQ store used by the gateway runtime and tests.
#[derive(Default)]
pub struct InMemoryDlqStore {
    entries: Mutex<HashMap<DlqEntryId, DlqEntry>>,
}

impl InMemoryDlqStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DlqStore for InMemoryDlqStore {
    async fn insert(&self, entry: &DlqEntry) -> Result<()> {
        let mut guard = self.entries.lock().await;
        guard.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn find_by_id(&self, org_id: OrgId, id: DlqEntryId) -> Result<Option<DlqEntry>> {
        let guard = self.entries.lock().await;
        Ok(guard.get(&id).filter(|e| e.org_id == org_id).cloned())
    }

    async fn list(
        &self,
        org_id: OrgId,
        filter: &DlqFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<DlqEntry>> {
        let guard = self.entries.lock().await;
        let mut entries: Vec<DlqEntry> = guard
            .values()
            .filter(|e| e.org_id == org_id && filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count(&self, org_id: OrgId, filter: &DlqFilter) -> Result<i64> {
        let guard = self.entries.lock().await;
        Ok(guard
            .values()
            .filter(|e| e.org_id == org_id && filter.matches(e))
            .count() as i64)
    }

    async fn update_status(
        &self,
        org_id: OrgId,
        id: DlqEntryId,
        status: DlqStatus,
        notes: Option<String>,
    ) -> Result<bool> {
        let mut guard = self.entries.lock().await;
        match guard.get_mut(&id) {
            Some(entry) if entry.org_id == org_id => {
                entry.status = status;
                if notes.is_some() {
                    entry.notes = notes;
                }
                entry.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, org_id: OrgId, id: DlqEntryId) -> Result<bool> {
        let mut guard = self.entries.lock().await;
        match guard.get(&id) {
            Some(entry) if entry.org_id == org_id => {
                guard.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Re-enters a dead-lettered delivery into the pipeline.
///
/// Implemented by the delivery pipeline; kept as a trait so the DLQ service
/// does not depend on the orchestrator directly.
#[async_trait]
pub trait Redeliver: Send + Sync {
    /// Run a brand-new attempt for the entry's payload. The original attempt
    /// record is never mutated.
    async fn redeliver(&self, entry: &DlqEntry) -> Result<AttemptId>;
}

/// Outcome of a single-entry retry.
#[derive(Debug, Clone, Serialize)]
pub struct DlqRetryOutcome {
    pub dlq_id: DlqEntryId,
    pub attempt_id: AttemptId,
}

/// Per-id failure inside a bulk operation.
#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub id: DlqEntryId,
    pub code: String,
    pub error: String,
}

/// Per-id breakdown of a bulk operation.
#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<DlqEntryId>,
    pub failed: Vec<BulkFailure>,
}

/// Paginated DLQ listing.
#[derive(Debug, Clone, Serialize)]
pub struct DlqEntryList {
    pub entries: Vec<DlqEntry>,
    pub total: i64,
    pub has_more: bool,
}

/// Service for managing dead letter queue entries.
#[derive(Clone)]
pub struct DlqService {
    store: Arc<dyn DlqStore>,
    redeliver: Arc<dyn Redeliver>,
}

impl DlqService {
    /// Create a new DLQ service.
    pub fn new(store: Arc<dyn DlqStore>, redeliver: Arc<dyn Redeliver>) -> Self {
        Self { store, redeliver }
    }

    /// List entries with filtering and pagination.
    pub async fn list_entries(
        &self,
        org_id: OrgId,
        filter: DlqFilter,
        limit: i64,
        offset: i64,
    ) -> Result<DlqEntryList> {
        let limit = limit.clamp(1, 100);
        let offset = offset.max(0);

        let entries = self.store.list(org_id, &filter, limit, offset).await?;
        let total = self.store.count(org_id, &filter).await?;
        let has_more = (offset + limit) < total;

        Ok(DlqEntryList {
            entries,
            total,
            has_more,
        })
    }

    /// Get one entry.
    pub async fn get_entry(&self, org_id: OrgId, id: DlqEntryId) -> Result<DlqEntry> {
        self.store
            .find_by_id(org_id, id)
            .await?
            .ok_or_else(|| GatewayError::validation(format!("DLQ entry {id} not found")))
    }

    /// Retry one entry: transitions `pending → retrying` and re-enters the
    /// pipeline as a brand-new attempt.
    pub async fn retry(&self, org_id: OrgId, id: DlqEntryId) -> Result<DlqRetryOutcome> {
        let entry = self.get_entry(org_id, id).await?;

        if entry.status == DlqStatus::Abandoned {
            return Err(GatewayError::validation(format!(
                "DLQ entry {id} is abandoned"
            )));
        }

        self.store
            .update_status(org_id, id, DlqStatus::Retrying, None)
            .await?;

        let attempt_id = self.redeliver.redeliver(&entry).await?;

        tracing::info!(
            target: "dlq",
            dlq_id = %id,
            attempt_id = %attempt_id,
            integration_id = %entry.integration_id,
            org_id = %org_id,
            "DLQ entry re-entered the pipeline"
        );

        Ok(DlqRetryOutcome {
            dlq_id: id,
            attempt_id,
        })
    }

    /// Abandon one entry with operator notes. Terminal.
    pub async fn abandon(
        &self,
        org_id: OrgId,
        id: DlqEntryId,
        notes: Option<String>,
    ) -> Result<()> {
        let updated = self
            .store
            .update_status(org_id, id, DlqStatus::Abandoned, notes)
            .await?;

        if !updated {
            return Err(GatewayError::validation(format!(
                "DLQ entry {id} not found"
            )));
        }

        tracing::info!(
            target: "dlq",
            dlq_id = %id,
            org_id = %org_id,
            "DLQ entry abandoned"
        );
        Ok(())
    }

    /// Delete one entry. Audit-logged, not reversible.
    pub async fn delete(&self, org_id: OrgId, id: DlqEntryId) -> Result<bool> {
        let deleted = self.store.delete(org_id, id).await?;

        if deleted {
            tracing::info!(
                target: "dlq",
                dlq_id = %id,
                org_id = %org_id,
                "DLQ entry deleted"
            );
        }

        Ok(deleted)
    }

    /// Retry a batch of entries independently.
    pub async fn bulk_retry(&self, org_id: OrgId, ids: Vec<DlqEntryId>) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        for id in ids {
            match self.retry(org_id, id).await {
                Ok(_) => outcome.succeeded.push(id),
                Err(e) => {
                    tracing::warn!(
                        target: "dlq",
                        dlq_id = %id,
                        error = %e,
                        "Failed to retry DLQ entry"
                    );
                    outcome.failed.push(BulkFailure {
                        id,
                        code: e.error_code().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }

    /// Abandon a batch of entries independently.
    pub async fn bulk_abandon(
        &self,
        org_id: OrgId,
        ids: Vec<DlqEntryId>,
        notes: Option<String>,
    ) -> Result<BulkOutcome> {
        let mut outcome = BulkOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };

        for id in ids {
            match self.abandon(org_id, id, notes.clone()).await {
                Ok(()) => outcome.succeeded.push(id),
                Err(e) => {
                    tracing::warn!(
                        target: "dlq",
                        dlq_id = %id,
                        error = %e,
                        "Failed to abandon DLQ entry"
                    );
                    outcome.failed.push(BulkFailure {
                        id,
                        code: e.error_code().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(outcome)
    }
}

/// Build a DLQ entry from a terminally-failed attempt.
pub fn entry_from_failure(
    org_id: OrgId,
    integration_id: IntegrationId,
    attempt_id: AttemptId,
    event_id: EventId,
    event_type: &str,
    error: &GatewayError,
    payload: serde_json::Value,
) -> DlqEntry {
    let now = Utc::now();
    DlqEntry {
        id: DlqEntryId::new(),
        org_id,
        integration_id,
        attempt_id,
        event_id,
        event_type: event_type.to_string(),
        error_code: error.error_code().to_string(),
        error_message: error.to_string(),
        payload,
        status: DlqStatus::Pending,
        notes: None,
        created_at: now,
        updated_at: now,
    }
}
