//! Integration tests for the manual replay path and its dedupe guard.

mod common;

use common::*;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer};

use fluxgate_core::{AttemptId, OrgId, TriggerType};
use fluxgate_delivery::{AttemptStatus, ExecutionLogStore, ReplayError};

#[tokio::test]
async fn test_replay_creates_a_new_attempt_record() {
    let mock_server = MockServer::start().await;
    let counting = CountingResponder::new();

    Mock::given(method("POST"))
        .respond_with(counting.clone())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();
    let integration = integration_to(org, &format!("{}/hook", mock_server.uri()));
    gateway.register(integration.clone()).await;

    let original = gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;

    let replayed = gateway
        .pipeline
        .replay(org, original.attempt_id, false)
        .await
        .unwrap();

    assert_ne!(replayed.attempt_id, original.attempt_id);
    assert_eq!(replayed.status, AttemptStatus::Success);
    assert_eq!(counting.count(), 2);

    // The original record gained only the replay marker
    let original_log = gateway
        .log_store
        .find_by_id(org, original.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert!(original_log.replayed_at.is_some());
    assert_eq!(original_log.status, AttemptStatus::Success);

    // The new attempt replays the identical source event
    let replay_log = gateway
        .log_store
        .find_by_id(org, replayed.attempt_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replay_log.event.event_id, original_log.event.event_id);
}

#[tokio::test]
async fn test_duplicate_replay_requires_force() {
    let mock_server = MockServer::start().await;
    let counting = CountingResponder::new();

    Mock::given(method("POST"))
        .respond_with(counting.clone())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();
    let integration = integration_to(org, &format!("{}/hook", mock_server.uri()));
    gateway.register(integration.clone()).await;

    let original = gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;

    gateway
        .pipeline
        .replay(org, original.attempt_id, false)
        .await
        .unwrap();

    // Second replay without force is rejected by the dedupe guard
    let err = gateway
        .pipeline
        .replay(org, original.attempt_id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplayError::Duplicate));
    assert_eq!(counting.count(), 2);

    // force=true overrides the guard and fires again
    let forced = gateway
        .pipeline
        .replay(org, original.attempt_id, true)
        .await
        .unwrap();
    assert_eq!(forced.status, AttemptStatus::Success);
    assert_eq!(counting.count(), 3);
}

#[tokio::test]
async fn test_replay_unknown_attempt() {
    let gateway = TestGateway::new();
    let err = gateway
        .pipeline
        .replay(OrgId::new(), AttemptId::new(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplayError::NotFound));
}

#[tokio::test]
async fn test_replay_rejected_for_inactive_integration() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(CountingResponder::new())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();
    let mut integration = integration_to(org, &format!("{}/hook", mock_server.uri()));
    gateway.register(integration.clone()).await;

    let original = gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;

    // Deactivate the integration, then attempt a replay
    integration.active = false;
    gateway.register(integration).await;

    let err = gateway
        .pipeline
        .replay(org, original.attempt_id, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplayError::IntegrationUnavailable));
}

#[tokio::test]
async fn test_replay_marker_survives_cross_org_probe() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(CountingResponder::new())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();
    let integration = integration_to(org, &format!("{}/hook", mock_server.uri()));
    gateway.register(integration.clone()).await;

    let original = gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;

    // A different org cannot replay another tenant's attempt
    let err = gateway
        .pipeline
        .replay(OrgId::new(), original.attempt_id, true)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplayError::NotFound));
}
