//! Integration configuration types
//!
//! A tenant-owned delivery rule is a tagged union over direction, delivery
//! mode, transformation mode and authentication scheme, validated at
//! configuration-load time rather than at delivery time. The pipeline reads
//! configurations; it never mutates them.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use fluxgate_core::{ActionId, GatewayError, IntegrationId, OrgId, OrgScoped, Result};

/// Direction of an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    /// Events arrive from an external caller and are forwarded inward.
    Inbound,
    /// Events originate internally and are pushed to external targets.
    Outbound,
}

/// HTTP method for outbound calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Get the string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// When the pipeline fires for a matched event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    /// Deliver as soon as the event arrives.
    Immediate,
    /// A scheduling script computes a single future timestamp.
    Delayed { script: String },
    /// A scheduling script computes a recurrence description.
    Recurring { script: String },
}

impl DeliveryMode {
    /// Whether this mode defers delivery through the scheduler.
    #[must_use]
    pub fn is_deferred(&self) -> bool {
        !matches!(self, DeliveryMode::Immediate)
    }
}

/// A single static field mapping used by `Simple` transformations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Source field path in the payload (dot notation, e.g. "order.id").
    pub source: String,
    /// Target field path in the transformed output.
    pub target: String,
    /// Whether the transformation fails if the source is missing.
    #[serde(default)]
    pub required: bool,
    /// Value to use when the source is missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

/// Request or response reshaping configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformSpec {
    /// Pass the payload through untouched.
    #[default]
    None,

    /// Static field mapping and static values. No code execution.
    Simple {
        #[serde(default)]
        mappings: Vec<FieldMapping>,
        /// Static values injected into the output (target path → value).
        #[serde(default)]
        statics: HashMap<String, serde_json::Value>,
    },

    /// Tenant-supplied script executed in the sandbox.
    Script { script: String },
}

/// Authentication method configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,

    /// Basic authentication (username/password).
    Basic {
        username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// API key authentication via a named header.
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header_name: String,
    },

    /// Static bearer token authentication.
    Bearer { token: String },

    /// OAuth2 client credentials flow with a cached, refreshable token.
    #[serde(rename = "oauth2")]
    OAuth2 {
        token_url: String,
        client_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        #[serde(default)]
        scopes: Vec<String>,
    },

    /// Arbitrary custom header set.
    Custom { headers: HashMap<String, String> },
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

impl AuthConfig {
    /// Create basic authentication config.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        AuthConfig::Basic {
            username: username.into(),
            password: Some(password.into()),
        }
    }

    /// Create API key authentication config.
    pub fn api_key(key: impl Into<String>) -> Self {
        AuthConfig::ApiKey {
            key: key.into(),
            header_name: default_api_key_header(),
        }
    }

    /// Create bearer token authentication config.
    pub fn bearer(token: impl Into<String>) -> Self {
        AuthConfig::Bearer {
            token: token.into(),
        }
    }

    /// Create OAuth2 client credentials config.
    pub fn oauth2(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        AuthConfig::OAuth2 {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: Some(client_secret.into()),
            scopes: Vec::new(),
        }
    }

    /// Create a redacted version for logging/display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        match self {
            AuthConfig::None => AuthConfig::None,
            AuthConfig::Basic { username, .. } => AuthConfig::Basic {
                username: username.clone(),
                password: Some("***REDACTED***".to_string()),
            },
            AuthConfig::ApiKey { header_name, .. } => AuthConfig::ApiKey {
                key: "***REDACTED***".to_string(),
                header_name: header_name.clone(),
            },
            AuthConfig::Bearer { .. } => AuthConfig::Bearer {
                token: "***REDACTED***".to_string(),
            },
            AuthConfig::OAuth2 {
                token_url,
                client_id,
                scopes,
                ..
            } => AuthConfig::OAuth2 {
                token_url: token_url.clone(),
                client_id: client_id.clone(),
                client_secret: Some("***REDACTED***".to_string()),
                scopes: scopes.clone(),
            },
            AuthConfig::Custom { headers } => AuthConfig::Custom {
                headers: headers
                    .keys()
                    .map(|k| (k.clone(), "***REDACTED***".to_string()))
                    .collect(),
            },
        }
    }
}

/// Per-integration rate limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Whether rate limiting is enabled for this integration.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum requests allowed per window.
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_requests() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitSettings {
    /// Create settings with a custom request budget.
    #[must_use]
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            enabled: true,
            max_requests,
            window_secs,
        }
    }

    /// Disable rate limiting.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Retry settings for the intra-request backoff loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Maximum number of retry attempts after the first call.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Upper bound of the additive random jitter in milliseconds.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_jitter_ms() -> u64 {
    250
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl RetrySettings {
    /// Create settings with a custom retry count.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Disable retries.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the initial backoff.
    #[must_use]
    pub fn with_initial_backoff(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub fn with_max_backoff(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Set the jitter bound.
    #[must_use]
    pub fn with_jitter(mut self, ms: u64) -> Self {
        self.jitter_ms = ms;
        self
    }
}

/// Target of a sub-action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionTarget {
    /// HTTP fan-out target with its own auth.
    Http {
        url: String,
        method: HttpMethod,
        #[serde(default)]
        auth: AuthConfig,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },

    /// Communication-channel send dispatched to a provider adapter.
    Communication { channel: String, provider: String },
}

/// A sub-unit of an integration enabling fan-out to additional targets or
/// communication channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: ActionId,
    pub name: String,
    pub target: ActionTarget,
    /// Request reshaping for this action, independent of the integration's.
    #[serde(default)]
    pub request_transform: TransformSpec,
}

fn default_timeout_secs() -> u64 {
    30
}

/// A tenant-owned delivery rule mapping an event type to a target.
///
/// Read-only input to the pipeline; mutated only through its management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub id: IntegrationId,
    pub org_id: OrgId,
    pub name: String,
    pub direction: Direction,

    /// Event type selector matched against inbound events.
    pub event_type: String,

    /// Primary delivery target.
    pub target_url: String,
    #[serde(default = "default_method")]
    pub method: HttpMethod,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Hard timeout for each outbound call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub request_transform: TransformSpec,
    #[serde(default)]
    pub response_transform: TransformSpec,

    /// Fan-out sub-actions delivered alongside the primary target.
    #[serde(default)]
    pub actions: Vec<Action>,

    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default = "default_delivery_mode")]
    pub delivery_mode: DeliveryMode,

    /// Stream the upstream response directly back to the caller instead of
    /// buffering it.
    #[serde(default)]
    pub streaming: bool,

    #[serde(default = "default_true")]
    pub active: bool,

    /// Whether a terminal failure creates a DLQ entry (vs. leaving the event
    /// to a periodic retry sweep).
    #[serde(default = "default_true")]
    pub create_dlq_entry: bool,
}

fn default_method() -> HttpMethod {
    HttpMethod::Post
}

fn default_delivery_mode() -> DeliveryMode {
    DeliveryMode::Immediate
}

impl IntegrationConfig {
    /// Create a minimal outbound integration for the given event type and
    /// target.
    pub fn new(
        org_id: OrgId,
        name: impl Into<String>,
        event_type: impl Into<String>,
        target_url: impl Into<String>,
    ) -> Self {
        Self {
            id: IntegrationId::new(),
            org_id,
            name: name.into(),
            direction: Direction::Outbound,
            event_type: event_type.into(),
            target_url: target_url.into(),
            method: default_method(),
            auth: AuthConfig::None,
            timeout_secs: default_timeout_secs(),
            retry: RetrySettings::default(),
            request_transform: TransformSpec::None,
            response_transform: TransformSpec::None,
            actions: Vec::new(),
            rate_limit: RateLimitSettings::default(),
            delivery_mode: DeliveryMode::Immediate,
            streaming: false,
            active: true,
            create_dlq_entry: true,
        }
    }

    /// Set authentication.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Set the request transformation.
    #[must_use]
    pub fn with_request_transform(mut self, spec: TransformSpec) -> Self {
        self.request_transform = spec;
        self
    }

    /// Set the response transformation.
    #[must_use]
    pub fn with_response_transform(mut self, spec: TransformSpec) -> Self {
        self.response_transform = spec;
        self
    }

    /// Set rate limiting.
    #[must_use]
    pub fn with_rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.rate_limit = settings;
        self
    }

    /// Set retry behavior.
    #[must_use]
    pub fn with_retry(mut self, settings: RetrySettings) -> Self {
        self.retry = settings;
        self
    }

    /// Set the delivery mode.
    #[must_use]
    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Set the per-call timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Enable streaming passthrough of the upstream response.
    #[must_use]
    pub fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    /// Add a fan-out action.
    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// The outbound call timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }

    /// Validate the configuration at load time.
    ///
    /// All shape constraints are enforced here so the delivery pipeline can
    /// assume a well-formed rule.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatewayError::validation("integration name is required"));
        }
        if self.event_type.is_empty() {
            return Err(GatewayError::validation("event_type selector is required"));
        }

        url::Url::parse(&self.target_url)
            .map_err(|e| GatewayError::validation(format!("invalid target_url: {e}")))?;

        if self.timeout_secs == 0 {
            return Err(GatewayError::validation("timeout_secs must be positive"));
        }

        if self.streaming && self.direction != Direction::Outbound {
            return Err(GatewayError::validation(
                "streaming is only supported for outbound integrations",
            ));
        }

        if self.rate_limit.enabled {
            if self.rate_limit.max_requests == 0 {
                return Err(GatewayError::validation(
                    "rate_limit.max_requests must be positive when enabled",
                ));
            }
            if self.rate_limit.window_secs == 0 {
                return Err(GatewayError::validation(
                    "rate_limit.window_secs must be positive when enabled",
                ));
            }
        }

        match &self.delivery_mode {
            DeliveryMode::Immediate => {}
            DeliveryMode::Delayed { script } | DeliveryMode::Recurring { script } => {
                if script.trim().is_empty() {
                    return Err(GatewayError::validation(
                        "deferred delivery modes require a scheduling script",
                    ));
                }
            }
        }

        if let AuthConfig::OAuth2 { token_url, .. } = &self.auth {
            url::Url::parse(token_url)
                .map_err(|e| GatewayError::validation(format!("invalid OAuth2 token_url: {e}")))?;
        }

        for action in &self.actions {
            if action.name.is_empty() {
                return Err(GatewayError::validation("action name is required"));
            }
            if let ActionTarget::Http { url, timeout_secs, .. } = &action.target {
                url::Url::parse(url).map_err(|e| {
                    GatewayError::validation(format!("invalid action url for {}: {e}", action.name))
                })?;
                if *timeout_secs == 0 {
                    return Err(GatewayError::validation(format!(
                        "action {} timeout_secs must be positive",
                        action.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Create a redacted version of this config (for logging/display).
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        config.auth = config.auth.redacted();
        for action in &mut config.actions {
            if let ActionTarget::Http { auth, .. } = &mut action.target {
                *auth = auth.redacted();
            }
        }
        config
    }
}

impl OrgScoped for IntegrationConfig {
    fn org_id(&self) -> OrgId {
        self.org_id
    }
}

/// Read-only integration configuration source consumed by the pipeline.
#[async_trait]
pub trait IntegrationStore: Send + Sync {
    /// Look up one integration by id within an organization.
    async fn find_by_id(&self, org_id: OrgId, id: IntegrationId) -> Option<IntegrationConfig>;

    /// All active integrations of an organization matching an event type.
    async fn find_active_by_event_type(
        &self,
        org_id: OrgId,
        event_type: &str,
    ) -> Vec<IntegrationConfig>;
}

/// In-memory integration store used by the gateway runtime and tests.
#[derive(Default)]
pub struct InMemoryIntegrationStore {
    integrations: RwLock<HashMap<IntegrationId, IntegrationConfig>>,
}

impl InMemoryIntegrationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an integration after validating it.
    pub async fn register(&self, integration: IntegrationConfig) -> Result<()> {
        integration.validate()?;
        let mut guard = self.integrations.write().await;
        guard.insert(integration.id, integration);
        Ok(())
    }
}

#[async_trait]
impl IntegrationStore for InMemoryIntegrationStore {
    async fn find_by_id(&self, org_id: OrgId, id: IntegrationId) -> Option<IntegrationConfig> {
        let guard = self.integrations.read().await;
        guard.get(&id).filter(|i| i.org_id == org_id).cloned()
    }

    async fn find_active_by_event_type(
        &self,
        org_id: OrgId,
        event_type: &str,
    ) -> Vec<IntegrationConfig> {
        let guard = self.integrations.read().await;
        guard
            .values()
            .filter(|i| i.org_id == org_id && i.active && i.event_type == event_type)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_integration() -> IntegrationConfig {
        IntegrationConfig::new(
            OrgId::new(),
            "orders-webhook",
            "order.created",
            "https://example.com/hook",
        )
    }

    #[test]
    fn test_minimal_integration_is_valid() {
        assert!(base_integration().validate().is_ok());
    }

    #[test]
    fn test_invalid_target_url_rejected() {
        let mut integration = base_integration();
        integration.target_url = "not-a-url".to_string();
        assert!(integration.validate().is_err());
    }

    #[test]
    fn test_deferred_mode_requires_script() {
        let integration = base_integration().with_delivery_mode(DeliveryMode::Delayed {
            script: "   ".to_string(),
        });
        assert!(integration.validate().is_err());

        let integration = base_integration().with_delivery_mode(DeliveryMode::Delayed {
            script: "payload.send_at".to_string(),
        });
        assert!(integration.validate().is_ok());
    }

    #[test]
    fn test_streaming_requires_outbound() {
        let mut integration = base_integration().with_streaming();
        integration.direction = Direction::Inbound;
        assert!(integration.validate().is_err());
    }

    #[test]
    fn test_enabled_rate_limit_requires_budget() {
        let integration =
            base_integration().with_rate_limit(RateLimitSettings::new(0, 60));
        assert!(integration.validate().is_err());

        let integration =
            base_integration().with_rate_limit(RateLimitSettings::disabled());
        assert!(integration.validate().is_ok());
    }

    #[test]
    fn test_auth_config_redacted() {
        let auth = AuthConfig::basic("admin", "secret");
        let redacted = auth.redacted();
        if let AuthConfig::Basic { username, password } = redacted {
            assert_eq!(username, "admin");
            assert_eq!(password, Some("***REDACTED***".to_string()));
        } else {
            panic!("Expected Basic auth");
        }
    }

    #[test]
    fn test_auth_config_serialization() {
        let auth = AuthConfig::OAuth2 {
            token_url: "https://auth.example.com/token".to_string(),
            client_id: "my-client".to_string(),
            client_secret: Some("secret".to_string()),
            scopes: vec!["events:write".to_string()],
        };

        let json = serde_json::to_string(&auth).unwrap();
        assert!(json.contains("\"type\":\"oauth2\""));

        let parsed: AuthConfig = serde_json::from_str(&json).unwrap();
        if let AuthConfig::OAuth2 { client_id, .. } = parsed {
            assert_eq!(client_id, "my-client");
        } else {
            panic!("Expected OAuth2 auth");
        }
    }

    #[test]
    fn test_transform_spec_default_is_none() {
        let json = r#"{"type":"none"}"#;
        let parsed: TransformSpec = serde_json::from_str(json).unwrap();
        assert_eq!(parsed, TransformSpec::None);
        assert_eq!(TransformSpec::default(), TransformSpec::None);
    }

    #[test]
    fn test_delivery_mode_serialization() {
        let mode = DeliveryMode::Recurring {
            script: "schedule()".to_string(),
        };
        let json = serde_json::to_string(&mode).unwrap();
        assert!(json.contains("\"mode\":\"RECURRING\""));
        assert!(mode.is_deferred());
        assert!(!DeliveryMode::Immediate.is_deferred());
    }

    #[tokio::test]
    async fn test_store_filters_by_org_and_activity() {
        let store = InMemoryIntegrationStore::new();
        let org = OrgId::new();

        let mut active = base_integration();
        active.org_id = org;
        let mut inactive = base_integration();
        inactive.org_id = org;
        inactive.active = false;

        store.register(active.clone()).await.unwrap();
        store.register(inactive.clone()).await.unwrap();

        let matches = store
            .find_active_by_event_type(org, "order.created")
            .await;
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id, active.id);

        // Cross-org lookups miss
        assert!(store.find_by_id(OrgId::new(), active.id).await.is_none());
        assert!(store.find_by_id(org, active.id).await.is_some());
    }
}
