//! Axum router setup for the operator API.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::auth::AuthHeaderBuilder;
use crate::config::IntegrationStore;
use crate::dlq::DlqService;
use crate::executor::DeliveryExecutor;
use crate::handlers::{deliveries, dlq, events, pending, testing};
use crate::logger::ExecutionLogStore;
use crate::pending::PendingDeliveryStore;
use crate::pipeline::{DeliveryPipeline, EventIntake};
use crate::scheduler::Scheduler;
use crate::transform::Transformer;

/// Shared state for operator API handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub integrations: Arc<dyn IntegrationStore>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub intake: Arc<EventIntake>,
    pub dlq_service: Arc<DlqService>,
    pub scheduler: Arc<Scheduler>,
    pub transformer: Arc<Transformer>,
    pub auth: Arc<AuthHeaderBuilder>,
    pub executor: Arc<DeliveryExecutor>,
    pub log_store: Arc<dyn ExecutionLogStore>,
    pub pending_store: Arc<dyn PendingDeliveryStore>,
}

/// Creates the operator router with all routes.
pub fn gateway_router(state: GatewayState) -> Router {
    Router::new()
        // Event intake and synchronous invocation
        .route("/events", post(events::push_event_handler))
        .route(
            "/integrations/:id/invoke",
            post(events::invoke_integration_handler),
        )
        // Execution logs and manual replay
        .route("/deliveries/:id", get(deliveries::get_delivery_handler))
        .route(
            "/deliveries/:id/replay",
            post(deliveries::replay_handler),
        )
        // Dead letter queue
        .route("/dlq", get(dlq::list_dlq_entries_handler))
        .route("/dlq/retry", post(dlq::bulk_retry_handler))
        .route("/dlq/abandon", post(dlq::bulk_abandon_handler))
        .route(
            "/dlq/:id",
            get(dlq::get_dlq_entry_handler).delete(dlq::delete_dlq_entry_handler),
        )
        .route("/dlq/:id/retry", post(dlq::retry_dlq_entry_handler))
        .route("/dlq/:id/abandon", post(dlq::abandon_dlq_entry_handler))
        // Deferred deliveries
        .route("/pending", get(pending::list_pending_handler))
        .route(
            "/pending/:id",
            get(pending::get_pending_handler)
                .patch(pending::reschedule_pending_handler)
                .delete(pending::cancel_pending_handler),
        )
        // Configuration dry runs
        .route("/test/transform", post(testing::test_transform_handler))
        .route("/test/schedule", post(testing::test_schedule_handler))
        .route("/test/connection", post(testing::test_connection_handler))
        .with_state(state)
}
