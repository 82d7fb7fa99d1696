//! Deferred delivery units produced by the scheduler.
//!
//! A pending delivery holds the original event (and, once computed, the
//! transformed payload), its owning integration, and either a single
//! scheduled-for timestamp or recurrence state. The delivery worker consumes
//! due entries under a short lease so a crashed worker releases its claims
//! naturally; operators may cancel or reschedule an entry before it fires.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use fluxgate_core::{InboundEvent, IntegrationId, OrgId, OrgScoped, PendingDeliveryId, Result};

use crate::scheduler::RecurringConfig;

/// Status of a deferred delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PendingStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
    /// Scheduled time passed without the worker picking it up in time; still
    /// eligible for delivery.
    Overdue,
}

/// Remaining recurrence state for RECURRING integrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrenceState {
    pub interval_ms: i64,
    /// Occurrences left, including the one currently scheduled.
    pub remaining: Option<i64>,
    pub end_date: Option<DateTime<Utc>>,
}

/// A unit of deferred work awaiting its scheduled time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub id: PendingDeliveryId,
    pub org_id: OrgId,
    pub integration_id: IntegrationId,
    /// The original event as handed to intake.
    pub event: InboundEvent,
    /// Transformed payload, when the transform already ran at intake.
    pub transformed_payload: Option<serde_json::Value>,
    pub scheduled_for: DateTime<Utc>,
    pub recurrence: Option<RecurrenceState>,
    pub status: PendingStatus,
    /// Worker lease; entries with a live lease are skipped by `due`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingDelivery {
    /// Create a one-shot delayed delivery.
    pub fn new_delayed(
        org_id: OrgId,
        integration_id: IntegrationId,
        event: InboundEvent,
        scheduled_for: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PendingDeliveryId::new(),
            org_id,
            integration_id,
            event,
            transformed_payload: None,
            scheduled_for,
            recurrence: None,
            status: PendingStatus::Pending,
            claimed_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create the first occurrence of a recurring delivery.
    pub fn new_recurring(
        org_id: OrgId,
        integration_id: IntegrationId,
        event: InboundEvent,
        first_occurrence: DateTime<Utc>,
        config: &RecurringConfig,
    ) -> Self {
        let mut delivery = Self::new_delayed(org_id, integration_id, event, first_occurrence);
        delivery.recurrence = Some(RecurrenceState {
            interval_ms: config.interval_ms,
            remaining: config.max_occurrences,
            end_date: config
                .end_date
                .and_then(|ms| chrono::TimeZone::timestamp_millis_opt(&Utc, ms).single()),
        });
        delivery
    }

    /// Advance to the next occurrence after a fire.
    ///
    /// Returns false when the series is exhausted (occurrence budget spent
    /// or the end date passed); the entry is then terminal.
    pub fn advance(&mut self) -> bool {
        let Some(recurrence) = &mut self.recurrence else {
            return false;
        };

        if let Some(remaining) = &mut recurrence.remaining {
            *remaining -= 1;
            if *remaining <= 0 {
                return false;
            }
        }

        let next = self.scheduled_for + ChronoDuration::milliseconds(recurrence.interval_ms);
        if let Some(end) = recurrence.end_date {
            if next > end {
                return false;
            }
        }

        self.scheduled_for = next;
        self.status = PendingStatus::Pending;
        self.claimed_until = None;
        self.updated_at = Utc::now();
        true
    }
}

impl OrgScoped for PendingDelivery {
    fn org_id(&self) -> OrgId {
        self.org_id
    }
}

/// Store for deferred work consumed by the delivery worker.
#[async_trait]
pub trait PendingDeliveryStore: Send + Sync {
    async fn insert(&self, delivery: &PendingDelivery) -> Result<()>;
    async fn find_by_id(
        &self,
        org_id: OrgId,
        id: PendingDeliveryId,
    ) -> Result<Option<PendingDelivery>>;
    async fn list(&self, org_id: OrgId) -> Result<Vec<PendingDelivery>>;
    /// Claim up to `limit` due entries under a lease. Entries with a live
    /// lease are skipped, so concurrent polls never double-claim.
    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: ChronoDuration,
        limit: usize,
    ) -> Result<Vec<PendingDelivery>>;
    async fn update(&self, delivery: &PendingDelivery) -> Result<()>;
    /// Cancel before firing. Returns false when not in a cancellable state.
    async fn cancel(&self, org_id: OrgId, id: PendingDeliveryId) -> Result<bool>;
    /// Move the scheduled time of a not-yet-fired entry.
    async fn reschedule(
        &self,
        org_id: OrgId,
        id: PendingDeliveryId,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool>;
    /// Flag late pending entries as overdue. Returns how many were flagged.
    async fn mark_overdue(&self, now: DateTime<Utc>, grace: ChronoDuration) -> Result<u64>;
}

/// In-memory pending-delivery store used by the gateway runtime and tests.
#[derive(Default)]
pub struct InMemoryPendingStore {
    deliveries: Mutex<HashMap<PendingDeliveryId, PendingDelivery>>,
}

impl InMemoryPendingStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingDeliveryStore for InMemoryPendingStore {
    async fn insert(&self, delivery: &PendingDelivery) -> Result<()> {
        let mut guard = self.deliveries.lock().await;
        guard.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn find_by_id(
        &self,
        org_id: OrgId,
        id: PendingDeliveryId,
    ) -> Result<Option<PendingDelivery>> {
        let guard = self.deliveries.lock().await;
        Ok(guard.get(&id).filter(|d| d.org_id == org_id).cloned())
    }

    async fn list(&self, org_id: OrgId) -> Result<Vec<PendingDelivery>> {
        let guard = self.deliveries.lock().await;
        let mut deliveries: Vec<PendingDelivery> = guard
            .values()
            .filter(|d| d.org_id == org_id)
            .cloned()
            .collect();
        deliveries.sort_by_key(|d| d.scheduled_for);
        Ok(deliveries)
    }

    async fn claim_due(
        &self,
        now: DateTime<Utc>,
        lease: ChronoDuration,
        limit: usize,
    ) -> Result<Vec<PendingDelivery>> {
        let mut guard = self.deliveries.lock().await;
        let mut due_ids: Vec<PendingDeliveryId> = guard
            .values()
            .filter(|d| {
                matches!(d.status, PendingStatus::Pending | PendingStatus::Overdue)
                    && d.scheduled_for <= now
                    && d.claimed_until.map_or(true, |until| until <= now)
            })
            .map(|d| d.id)
            .collect();
        due_ids.sort_by_key(|id| guard[id].scheduled_for);
        due_ids.truncate(limit);

        let mut claimed = Vec::with_capacity(due_ids.len());
        for id in due_ids {
            if let Some(delivery) = guard.get_mut(&id) {
                delivery.claimed_until = Some(now + lease);
                claimed.push(delivery.clone());
            }
        }
        Ok(claimed)
    }

    async fn update(&self, delivery: &PendingDelivery) -> Result<()> {
        let mut guard = self.deliveries.lock().await;
        guard.insert(delivery.id, delivery.clone());
        Ok(())
    }

    async fn cancel(&self, org_id: OrgId, id: PendingDeliveryId) -> Result<bool> {
        let mut guard = self.deliveries.lock().await;
        match guard.get_mut(&id) {
            Some(delivery)
                if delivery.org_id == org_id
                    && matches!(
                        delivery.status,
                        PendingStatus::Pending | PendingStatus::Overdue
                    ) =>
            {
                delivery.status = PendingStatus::Cancelled;
                delivery.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reschedule(
        &self,
        org_id: OrgId,
        id: PendingDeliveryId,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool> {
        let mut guard = self.deliveries.lock().await;
        match guard.get_mut(&id) {
            Some(delivery)
                if delivery.org_id == org_id
                    && matches!(
                        delivery.status,
                        PendingStatus::Pending | PendingStatus::Overdue
                    ) =>
            {
                delivery.scheduled_for = scheduled_for;
                delivery.status = PendingStatus::Pending;
                delivery.claimed_until = None;
                delivery.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_overdue(&self, now: DateTime<Utc>, grace: ChronoDuration) -> Result<u64> {
        let mut guard = self.deliveries.lock().await;
        let cutoff = now - grace;
        let mut flagged = 0;
        for delivery in guard.values_mut() {
            if delivery.status == PendingStatus::Pending
                && delivery.scheduled_for < cutoff
                && delivery.claimed_until.map_or(true, |until| until <= now)
            {
                delivery.status = PendingStatus::Overdue;
                delivery.updated_at = Utc::now();
                flagged += 1;
            }
        }
        Ok(flagged)
    }
}
