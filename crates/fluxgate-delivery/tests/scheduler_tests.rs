//! Integration tests for deferred delivery: scheduling at intake and the
//! background worker firing due entries.

mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer};

use fluxgate_core::OrgId;
use fluxgate_delivery::{
    DeliveryMode, DeliveryWorker, IngestDisposition, PendingDeliveryStore, PendingStatus,
    WorkerConfig,
};

#[tokio::test]
async fn test_delayed_integration_defers_instead_of_delivering() {
    let mock_server = MockServer::start().await;
    let counting = CountingResponder::new();

    Mock::given(method("POST"))
        .respond_with(counting.clone())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();

    let future_ms = (Utc::now() + ChronoDuration::hours(2)).timestamp_millis();
    let integration = integration_to(org, &format!("{}/hook", mock_server.uri()))
        .with_delivery_mode(DeliveryMode::Delayed {
            script: format!("{future_ms}"),
        });
    gateway.register(integration.clone()).await;

    let dispositions = gateway.intake.ingest(&order_event(org)).await.unwrap();
    assert_eq!(dispositions.len(), 1);

    match &dispositions[0] {
        IngestDisposition::Scheduled {
            scheduled_for,
            is_overdue,
            pending_id,
            ..
        } => {
            assert_eq!(scheduled_for.timestamp_millis(), future_ms);
            assert!(!is_overdue);

            let pending = gateway
                .pending_store
                .find_by_id(org, *pending_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pending.status, PendingStatus::Pending);
        }
        other => panic!("expected Scheduled disposition, got {other:?}"),
    }

    // Nothing was delivered at intake time
    assert_eq!(counting.count(), 0);
}

#[tokio::test]
async fn test_past_timestamp_is_overdue_not_an_error() {
    let gateway = TestGateway::new();
    let org = OrgId::new();

    let past_ms = (Utc::now() - ChronoDuration::hours(1)).timestamp_millis();
    let integration = integration_to(org, "https://example.com/hook").with_delivery_mode(
        DeliveryMode::Delayed {
            script: format!("{past_ms}"),
        },
    );
    gateway.register(integration.clone()).await;

    let dispositions = gateway.intake.ingest(&order_event(org)).await.unwrap();
    match &dispositions[0] {
        IngestDisposition::Scheduled {
            is_overdue,
            pending_id,
            ..
        } => {
            assert!(is_overdue);
            let pending = gateway
                .pending_store
                .find_by_id(org, *pending_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pending.status, PendingStatus::Overdue);
        }
        other => panic!("expected Scheduled disposition, got {other:?}"),
    }
}

#[tokio::test]
async fn test_recurring_without_bounds_is_rejected_before_enqueue() {
    let gateway = TestGateway::new();
    let org = OrgId::new();

    let first_ms = (Utc::now() + ChronoDuration::hours(1)).timestamp_millis();
    let integration = integration_to(org, "https://example.com/hook").with_delivery_mode(
        DeliveryMode::Recurring {
            script: format!(r#"#{{ firstOccurrence: {first_ms}, intervalMs: 3600000 }}"#),
        },
    );
    gateway.register(integration.clone()).await;

    let dispositions = gateway.intake.ingest(&order_event(org)).await.unwrap();
    match &dispositions[0] {
        IngestDisposition::SchedulingFailed { code, .. } => {
            assert_eq!(code, "INVALID_CONFIG");
        }
        other => panic!("expected SchedulingFailed disposition, got {other:?}"),
    }

    // No schedule entry was created
    assert!(gateway.pending_store.list(org).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recurring_integration_enqueues_with_recurrence_state() {
    let gateway = TestGateway::new();
    let org = OrgId::new();

    let first_ms = (Utc::now() + ChronoDuration::minutes(5)).timestamp_millis();
    let integration = integration_to(org, "https://example.com/hook").with_delivery_mode(
        DeliveryMode::Recurring {
            script: format!(
                r#"#{{ firstOccurrence: {first_ms}, intervalMs: 900000, maxOccurrences: 4 }}"#
            ),
        },
    );
    gateway.register(integration.clone()).await;

    let dispositions = gateway.intake.ingest(&order_event(org)).await.unwrap();
    let IngestDisposition::Scheduled { pending_id, .. } = &dispositions[0] else {
        panic!("expected Scheduled disposition");
    };

    let pending = gateway
        .pending_store
        .find_by_id(org, *pending_id)
        .await
        .unwrap()
        .unwrap();
    let recurrence = pending.recurrence.expect("recurrence state");
    assert_eq!(recurrence.interval_ms, 900_000);
    assert_eq!(recurrence.remaining, Some(4));
}

#[tokio::test]
async fn test_worker_fires_due_delivery() {
    let mock_server = MockServer::start().await;
    let counting = CountingResponder::new();

    Mock::given(method("POST"))
        .respond_with(counting.clone())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();

    // Already due when ingested
    let past_ms = (Utc::now() - ChronoDuration::minutes(1)).timestamp_millis();
    let integration = integration_to(org, &format!("{}/hook", mock_server.uri()))
        .with_delivery_mode(DeliveryMode::Delayed {
            script: format!("{past_ms}"),
        });
    gateway.register(integration.clone()).await;

    let dispositions = gateway.intake.ingest(&order_event(org)).await.unwrap();
    let IngestDisposition::Scheduled { pending_id, .. } = &dispositions[0] else {
        panic!("expected Scheduled disposition");
    };
    let pending_id = *pending_id;

    let worker = Arc::new(DeliveryWorker::new(
        gateway.pending_store.clone(),
        gateway.integrations.clone(),
        gateway.pipeline.clone(),
        WorkerConfig {
            poll_interval_ms: 25,
            ..Default::default()
        },
    ));

    let handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    // Give the worker a few poll ticks to claim and fire the delivery
    let mut fired = false;
    for _ in 0..40 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let pending = gateway
            .pending_store
            .find_by_id(org, pending_id)
            .await
            .unwrap()
            .unwrap();
        if pending.status == PendingStatus::Sent {
            fired = true;
            break;
        }
    }

    worker.shutdown();
    handle.await.unwrap();

    assert!(fired, "worker should mark the due delivery as sent");
    assert_eq!(counting.count(), 1);
}
