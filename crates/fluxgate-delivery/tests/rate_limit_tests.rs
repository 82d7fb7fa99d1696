//! Integration tests for per-integration rate limiting inside the pipeline.

mod common;

use common::*;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer};

use fluxgate_core::{OrgId, TriggerType};
use fluxgate_delivery::{
    AttemptStatus, DlqFilter, DlqStore, ExecutionLogStore, RateLimitSettings, StepStatus,
};

#[tokio::test]
async fn test_exactly_first_n_deliveries_admitted() {
    let mock_server = MockServer::start().await;
    let counting = CountingResponder::new();

    Mock::given(method("POST"))
        .respond_with(counting.clone())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();
    // Budget of 2 per hour-long window so the window cannot roll mid-test
    let integration = integration_to(org, &format!("{}/hook", mock_server.uri()))
        .with_rate_limit(RateLimitSettings::new(2, 3600));
    gateway.register(integration.clone()).await;

    let first = gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;
    let second = gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;
    let third = gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;

    assert_eq!(first.status, AttemptStatus::Success);
    assert_eq!(second.status, AttemptStatus::Success);
    assert_eq!(third.status, AttemptStatus::Failed);
    assert_eq!(third.error_code.as_deref(), Some("RATE_LIMITED"));

    // The denied delivery never reached the target
    assert_eq!(counting.count(), 2);
}

#[tokio::test]
async fn test_disabled_rate_limit_always_allows() {
    let mock_server = MockServer::start().await;
    let counting = CountingResponder::new();

    Mock::given(method("POST"))
        .respond_with(counting.clone())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();
    let integration = integration_to(org, &format!("{}/hook", mock_server.uri()))
        .with_rate_limit(RateLimitSettings::disabled());
    gateway.register(integration.clone()).await;

    for _ in 0..10 {
        let outcome = gateway
            .pipeline
            .deliver(&order_event(org), &integration, TriggerType::Event)
            .await;
        assert_eq!(outcome.status, AttemptStatus::Success);
    }

    assert_eq!(counting.count(), 10);
}

#[tokio::test]
async fn test_denied_delivery_logs_step_and_skips_dlq() {
    let mock_server = MockServer::start().await;
    let counting = CountingResponder::new();

    Mock::given(method("POST"))
        .respond_with(counting.clone())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();
    let integration = integration_to(org, &format!("{}/hook", mock_server.uri()))
        .with_rate_limit(RateLimitSettings::new(1, 3600));
    gateway.register(integration.clone()).await;

    gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;
    let denied = gateway
        .pipeline
        .deliver(&order_event(org), &integration, TriggerType::Event)
        .await;

    assert_eq!(denied.status, AttemptStatus::Failed);

    let log = gateway
        .log_store
        .find_by_id(org, denied.attempt_id)
        .await
        .unwrap()
        .unwrap();

    // The rate_limit step failed and nothing past it ran
    assert_eq!(log.steps.len(), 1);
    assert_eq!(log.steps[0].name, "rate_limit");
    assert_eq!(log.steps[0].status, StepStatus::Failed);
    let metadata = log.steps[0].metadata.as_ref().unwrap();
    assert!(metadata["retry_after_secs"].as_i64().unwrap() > 0);

    // No attempt was made against the target, so nothing is dead-lettered
    let entries = gateway
        .dlq_store
        .list(org, &DlqFilter::default(), 10, 0)
        .await
        .unwrap();
    assert!(entries.is_empty());
}

#[tokio::test]
async fn test_rate_limit_windows_are_per_integration() {
    let mock_server = MockServer::start().await;
    let counting = CountingResponder::new();

    Mock::given(method("POST"))
        .respond_with(counting.clone())
        .mount(&mock_server)
        .await;

    let gateway = TestGateway::new();
    let org = OrgId::new();
    let settings = RateLimitSettings::new(1, 3600);

    let first = integration_to(org, &format!("{}/hook", mock_server.uri()))
        .with_rate_limit(settings.clone());
    let second = integration_to(org, &format!("{}/hook", mock_server.uri()))
        .with_rate_limit(settings);
    gateway.register(first.clone()).await;
    gateway.register(second.clone()).await;

    let a = gateway
        .pipeline
        .deliver(&order_event(org), &first, TriggerType::Event)
        .await;
    // First integration is exhausted, the second still has budget
    let b = gateway
        .pipeline
        .deliver(&order_event(org), &first, TriggerType::Event)
        .await;
    let c = gateway
        .pipeline
        .deliver(&order_event(org), &second, TriggerType::Event)
        .await;

    assert_eq!(a.status, AttemptStatus::Success);
    assert_eq!(b.status, AttemptStatus::Failed);
    assert_eq!(c.status, AttemptStatus::Success);
}
