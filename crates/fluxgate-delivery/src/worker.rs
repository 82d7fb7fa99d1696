//! Delivery Worker
//!
//! Background worker that fires due deferred deliveries. Claims due entries
//! under a short lease, runs each through the pipeline as an independent
//! task bounded by a concurrency semaphore, advances recurring series, and
//! flags entries that slipped past their scheduled time as overdue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use fluxgate_core::TriggerType;

use crate::config::IntegrationStore;
use crate::logger::AttemptStatus;
use crate::pending::{PendingDelivery, PendingDeliveryStore, PendingStatus};
use crate::pipeline::DeliveryPipeline;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent deliveries to process.
    pub concurrency: usize,

    /// How often to poll for due deliveries (in milliseconds).
    pub poll_interval_ms: u64,

    /// Claim lease per delivery (in seconds); a crashed worker's claims
    /// expire after this.
    pub lease_secs: i64,

    /// How often to flag late entries as overdue (in seconds).
    pub overdue_sweep_interval_secs: u64,

    /// Grace period before a late pending entry counts as overdue.
    pub overdue_grace_secs: i64,

    /// Maximum deliveries claimed per poll.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval_ms: 1000,
            lease_secs: 300,
            overdue_sweep_interval_secs: 60,
            overdue_grace_secs: 120,
            batch_size: 10,
        }
    }
}

/// Background worker that drains the pending-delivery store.
pub struct DeliveryWorker {
    pending: Arc<dyn PendingDeliveryStore>,
    integrations: Arc<dyn IntegrationStore>,
    pipeline: Arc<DeliveryPipeline>,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl DeliveryWorker {
    /// Create a new worker.
    pub fn new(
        pending: Arc<dyn PendingDeliveryStore>,
        integrations: Arc<dyn IntegrationStore>,
        pipeline: Arc<DeliveryPipeline>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            pending,
            integrations,
            pipeline,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the worker loop. Returns after a graceful shutdown request once
    /// in-flight deliveries complete.
    pub async fn run(&self) {
        info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval_ms,
            "Starting delivery worker"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut poll_interval = interval(Duration::from_millis(self.config.poll_interval_ms));
        let mut overdue_interval = interval(Duration::from_secs(
            self.config.overdue_sweep_interval_secs,
        ));

        loop {
            tokio::select! {
                _ = poll_interval.tick() => {
                    if self.shutdown.load(Ordering::Relaxed) {
                        info!("Worker shutdown requested, stopping poll loop");
                        break;
                    }
                    self.poll_and_process(&semaphore).await;
                }
                _ = overdue_interval.tick() => {
                    self.sweep_overdue().await;
                }
            }
        }

        // Wait for in-flight deliveries to complete
        info!("Waiting for in-flight deliveries to complete...");
        let _ = semaphore
            .acquire_many(self.config.concurrency as u32)
            .await;
        info!("Worker stopped");
    }

    /// Request graceful shutdown.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Check if shutdown was requested.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Claim due deliveries and process them concurrently.
    async fn poll_and_process(&self, semaphore: &Arc<Semaphore>) {
        let due = match self
            .pending
            .claim_due(
                Utc::now(),
                ChronoDuration::seconds(self.config.lease_secs),
                self.config.batch_size,
            )
            .await
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to claim due deliveries");
                return;
            }
        };

        if due.is_empty() {
            return;
        }

        debug!(count = due.len(), "Claimed due deliveries");

        for delivery in due {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                debug!("All worker slots busy, leaving remaining deliveries leased");
                return;
            };

            let pending = self.pending.clone();
            let integrations = self.integrations.clone();
            let pipeline = self.pipeline.clone();

            tokio::spawn(async move {
                let _permit = permit; // Hold permit until the task completes
                process_delivery(pending, integrations, pipeline, delivery).await;
            });
        }
    }

    /// Flag late pending entries as overdue.
    async fn sweep_overdue(&self) {
        match self
            .pending
            .mark_overdue(
                Utc::now(),
                ChronoDuration::seconds(self.config.overdue_grace_secs),
            )
            .await
        {
            Ok(count) if count > 0 => {
                warn!(count = count, "Flagged overdue deliveries");
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Failed to sweep overdue deliveries");
            }
        }
    }
}

/// Fire one deferred delivery and record its next state.
async fn process_delivery(
    pending: Arc<dyn PendingDeliveryStore>,
    integrations: Arc<dyn IntegrationStore>,
    pipeline: Arc<DeliveryPipeline>,
    mut delivery: PendingDelivery,
) {
    let integration = match integrations
        .find_by_id(delivery.org_id, delivery.integration_id)
        .await
    {
        Some(integration) if integration.active => integration,
        Some(_) | None => {
            // The integration was deactivated or deleted after scheduling
            info!(
                pending_id = %delivery.id,
                integration_id = %delivery.integration_id,
                "Cancelling deferred delivery; integration is unavailable"
            );
            delivery.status = PendingStatus::Cancelled;
            delivery.updated_at = Utc::now();
            if let Err(e) = pending.update(&delivery).await {
                error!(error = %e, "Failed to cancel deferred delivery");
            }
            return;
        }
    };

    info!(
        pending_id = %delivery.id,
        integration_id = %integration.id,
        scheduled_for = %delivery.scheduled_for,
        "Firing deferred delivery"
    );

    let outcomes = pipeline
        .deliver_all(&delivery.event, &integration, TriggerType::Scheduled)
        .await;
    let fired_ok = outcomes
        .first()
        .is_some_and(|o| o.status == AttemptStatus::Success);

    // Recurring series advance regardless of this occurrence's outcome;
    // one failed occurrence does not cancel the series.
    if delivery.recurrence.is_some() {
        if delivery.advance() {
            debug!(
                pending_id = %delivery.id,
                next = %delivery.scheduled_for,
                "Recurring delivery advanced"
            );
        } else {
            delivery.status = if fired_ok {
                PendingStatus::Sent
            } else {
                PendingStatus::Failed
            };
            delivery.updated_at = Utc::now();
            info!(pending_id = %delivery.id, "Recurring series exhausted");
        }
    } else {
        delivery.status = if fired_ok {
            PendingStatus::Sent
        } else {
            PendingStatus::Failed
        };
        delivery.claimed_until = None;
        delivery.updated_at = Utc::now();
    }

    if let Err(e) = pending.update(&delivery).await {
        error!(
            pending_id = %delivery.id,
            error = %e,
            "Failed to record deferred delivery state"
        );
    }
}
