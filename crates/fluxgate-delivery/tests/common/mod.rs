//! Common test utilities for fluxgate-delivery integration tests.
//!
//! Provides mock servers, responders, and a fully wired in-memory gateway
//! for verifying delivery behavior without external stores.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use wiremock::{Request, Respond, ResponseTemplate};

use fluxgate_core::{InboundEvent, OrgId};
use fluxgate_delivery::{
    AuthHeaderBuilder, DeliveryExecutor, DeliveryPipeline, DlqService, EventIntake,
    GatewayState, InMemoryCounterStore, InMemoryDlqStore, InMemoryIntegrationStore,
    InMemoryLogStore, InMemoryPendingStore, IntegrationConfig, ProviderRegistry, RateLimiter,
    RetrySettings, Scheduler, Transformer,
};
use fluxgate_script::ScriptSandbox;

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// A fully wired pipeline over in-memory stores.
pub struct TestGateway {
    pub integrations: Arc<InMemoryIntegrationStore>,
    pub pipeline: Arc<DeliveryPipeline>,
    pub intake: Arc<EventIntake>,
    pub dlq_service: DlqService,
    pub scheduler: Arc<Scheduler>,
    pub transformer: Arc<Transformer>,
    pub auth: Arc<AuthHeaderBuilder>,
    pub executor: Arc<DeliveryExecutor>,
    pub log_store: Arc<InMemoryLogStore>,
    pub dlq_store: Arc<InMemoryDlqStore>,
    pub pending_store: Arc<InMemoryPendingStore>,
}

impl TestGateway {
    pub fn new() -> Self {
        Self::with_providers(ProviderRegistry::new())
    }

    pub fn with_providers(providers: ProviderRegistry) -> Self {
        let integrations = Arc::new(InMemoryIntegrationStore::new());
        let log_store = Arc::new(InMemoryLogStore::new());
        let dlq_store = Arc::new(InMemoryDlqStore::new());
        let pending_store = Arc::new(InMemoryPendingStore::new());

        let sandbox = Arc::new(ScriptSandbox::new());
        let transformer = Arc::new(Transformer::new(sandbox.clone()));
        let scheduler = Arc::new(Scheduler::new(sandbox));
        let executor =
            Arc::new(DeliveryExecutor::new().unwrap().with_providers(providers));
        let auth = Arc::new(AuthHeaderBuilder::new(executor.client().clone()));
        let rate_limiter = Arc::new(RateLimiter::new(Arc::new(InMemoryCounterStore::new())));

        let pipeline = Arc::new(DeliveryPipeline::new(
            integrations.clone(),
            transformer.clone(),
            auth.clone(),
            rate_limiter,
            executor.clone(),
            log_store.clone(),
            dlq_store.clone(),
        ));

        let dlq_service = DlqService::new(dlq_store.clone(), pipeline.clone());
        let intake = Arc::new(EventIntake::new(
            integrations.clone(),
            pipeline.clone(),
            scheduler.clone(),
            pending_store.clone(),
        ));

        Self {
            integrations,
            pipeline,
            intake,
            dlq_service,
            scheduler,
            transformer,
            auth,
            executor,
            log_store,
            dlq_store,
            pending_store,
        }
    }

    /// Assemble the handler state over the same components.
    pub fn state(&self) -> GatewayState {
        GatewayState {
            integrations: self.integrations.clone(),
            pipeline: self.pipeline.clone(),
            intake: self.intake.clone(),
            dlq_service: Arc::new(self.dlq_service.clone()),
            scheduler: self.scheduler.clone(),
            transformer: self.transformer.clone(),
            auth: self.auth.clone(),
            executor: self.executor.clone(),
            log_store: self.log_store.clone(),
            pending_store: self.pending_store.clone(),
        }
    }

    pub async fn register(&self, integration: IntegrationConfig) {
        self.integrations
            .register(integration)
            .await
            .expect("integration should validate");
    }
}

impl Default for TestGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// An outbound integration aimed at a mock server, with fast retries and no
/// rate limiting so tests stay deterministic.
pub fn integration_to(org_id: OrgId, url: &str) -> IntegrationConfig {
    IntegrationConfig::new(org_id, "orders-webhook", "order.created", url)
        .with_rate_limit(fluxgate_delivery::RateLimitSettings::disabled())
        .with_retry(
            RetrySettings::new(3)
                .with_initial_backoff(5)
                .with_max_backoff(50)
                .with_jitter(5),
        )
        .with_timeout_secs(5)
}

/// An order.created event.
pub fn order_event(org_id: OrgId) -> InboundEvent {
    InboundEvent::new(
        org_id,
        "order.created",
        serde_json::json!({
            "order_id": "o-1001",
            "total": 125,
            "currency": "EUR"
        }),
        "table-poller",
    )
}

// ---------------------------------------------------------------------------
// CapturedRequest - for inspecting delivered requests
// ---------------------------------------------------------------------------

/// A captured HTTP request with body and headers.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl CapturedRequest {
    /// Parse the body as JSON.
    pub fn body_json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_lowercase() == name_lower)
            .map(|(_, v)| v.as_str())
    }
}

// ---------------------------------------------------------------------------
// CaptureResponder - captures requests and returns a fixed status
// ---------------------------------------------------------------------------

/// A wiremock responder that captures incoming requests.
#[derive(Clone)]
pub struct CaptureResponder {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
    response_code: u16,
    response_body: Option<String>,
}

impl CaptureResponder {
    /// Create a capture responder that returns 200 OK.
    pub fn new() -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: 200,
            response_body: None,
        }
    }

    /// Create a capture responder with a custom status code.
    pub fn with_status(status: u16) -> Self {
        Self {
            requests: Arc::new(Mutex::new(Vec::new())),
            response_code: status,
            response_body: None,
        }
    }

    /// Set a JSON body to return.
    pub fn with_body(mut self, body: &str) -> Self {
        self.response_body = Some(body.to_string());
        self
    }

    /// Get all captured requests.
    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Get the number of captured requests.
    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Default for CaptureResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CaptureResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let captured = CapturedRequest {
            body: request.body.clone(),
            headers: request
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect(),
            timestamp: Utc::now(),
        };
        self.requests.lock().unwrap().push(captured);

        let template = ResponseTemplate::new(self.response_code);
        match &self.response_body {
            Some(body) => template.set_body_string(body.clone()),
            None => template,
        }
    }
}

// ---------------------------------------------------------------------------
// CountingResponder - counts requests
// ---------------------------------------------------------------------------

/// A wiremock responder that counts incoming requests.
#[derive(Clone)]
pub struct CountingResponder {
    count: Arc<AtomicU32>,
    response_code: u16,
}

impl CountingResponder {
    /// Create a counting responder that returns 200 OK.
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicU32::new(0)),
            response_code: 200,
        }
    }

    /// Create a counting responder that returns a custom status code.
    pub fn with_status(status: u16) -> Self {
        Self {
            count: Arc::new(AtomicU32::new(0)),
            response_code: status,
        }
    }

    /// Get the current request count.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }
}

impl Default for CountingResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Respond for CountingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        self.count.fetch_add(1, Ordering::SeqCst);
        ResponseTemplate::new(self.response_code)
    }
}

// ---------------------------------------------------------------------------
// FailingResponder - fails N times then succeeds
// ---------------------------------------------------------------------------

/// A wiremock responder that fails a specified number of times before
/// succeeding.
#[derive(Clone)]
pub struct FailingResponder {
    attempt_count: Arc<AtomicU32>,
    failures_before_success: u32,
    failure_code: u16,
    success_code: u16,
}

impl FailingResponder {
    /// Create a responder that fails `n` times with 500, then returns 200.
    pub fn fail_times(n: u32) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code: 500,
            success_code: 200,
        }
    }

    /// Create a responder that fails with a custom status code.
    pub fn fail_with_status(n: u32, failure_code: u16) -> Self {
        Self {
            attempt_count: Arc::new(AtomicU32::new(0)),
            failures_before_success: n,
            failure_code,
            success_code: 200,
        }
    }

    /// Get the current attempt count.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count.load(Ordering::SeqCst)
    }
}

impl Respond for FailingResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.attempt_count.fetch_add(1, Ordering::SeqCst);
        if n < self.failures_before_success {
            ResponseTemplate::new(self.failure_code)
        } else {
            ResponseTemplate::new(self.success_code)
        }
    }
}

// ---------------------------------------------------------------------------
// DelayedResponder - adds response delay
// ---------------------------------------------------------------------------

/// A wiremock responder that adds a delay before responding.
#[derive(Clone)]
pub struct DelayedResponder {
    delay_ms: u64,
    response_code: u16,
}

impl DelayedResponder {
    /// Create a responder that delays for `ms` milliseconds.
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            response_code: 200,
        }
    }

    /// Create a delayed responder with a custom status code.
    pub fn with_status(delay_ms: u64, response_code: u16) -> Self {
        Self {
            delay_ms,
            response_code,
        }
    }
}

impl Respond for DelayedResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(self.response_code)
            .set_delay(std::time::Duration::from_millis(self.delay_ms))
    }
}
