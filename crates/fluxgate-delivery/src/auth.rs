//! Outbound authentication header construction.
//!
//! Resolves the authentication scheme configured on an integration into the
//! headers attached to outbound calls. OAuth2 tokens are fetched via the
//! client credentials flow and cached per integration; credential rotation
//! invalidates exactly one integration's token without touching others.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use fluxgate_core::{ActionId, GatewayError, IntegrationId, Result};

use crate::config::AuthConfig;

/// Cache slot for an OAuth2 token: one per integration, and one per action
/// for actions carrying their own OAuth2 config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenCacheKey {
    integration: IntegrationId,
    action: Option<ActionId>,
}

impl TokenCacheKey {
    /// Slot for an integration's primary target.
    #[must_use]
    pub fn integration(integration: IntegrationId) -> Self {
        Self {
            integration,
            action: None,
        }
    }

    /// Slot for a fan-out action.
    #[must_use]
    pub fn action(integration: IntegrationId, action: ActionId) -> Self {
        Self {
            integration,
            action: Some(action),
        }
    }
}

/// Safety margin subtracted from `expires_in` so a token is refreshed
/// before the provider rejects it.
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 30;

/// A cached OAuth2 access token.
#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    /// None when the provider did not report a lifetime.
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }
}

/// Builds outbound auth headers for integrations and actions.
///
/// Constructed once per process and shared across attempts; the token cache
/// supports safe concurrent reads with serialized refresh.
pub struct AuthHeaderBuilder {
    client: Client,
    tokens: RwLock<HashMap<TokenCacheKey, CachedToken>>,
}

impl AuthHeaderBuilder {
    /// Create a builder using the shared HTTP client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve an auth configuration into outbound headers.
    pub async fn build(&self, key: TokenCacheKey, auth: &AuthConfig) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();

        match auth {
            AuthConfig::None => {}
            AuthConfig::Basic { username, password } => {
                let credentials =
                    format!("{}:{}", username, password.as_deref().unwrap_or(""));
                let encoded = BASE64.encode(credentials);
                insert_header(
                    &mut headers,
                    AUTHORIZATION,
                    &format!("Basic {encoded}"),
                )?;
            }
            AuthConfig::ApiKey { key, header_name } => {
                let name = HeaderName::from_bytes(header_name.as_bytes()).map_err(|e| {
                    GatewayError::authentication(format!(
                        "invalid API key header name '{header_name}': {e}"
                    ))
                })?;
                insert_header(&mut headers, name, key)?;
            }
            AuthConfig::Bearer { token } => {
                insert_header(&mut headers, AUTHORIZATION, &format!("Bearer {token}"))?;
            }
            AuthConfig::OAuth2 {
                token_url,
                client_id,
                client_secret,
                scopes,
            } => {
                let token = self
                    .oauth_token(key, token_url, client_id, client_secret.as_deref(), scopes)
                    .await?;
                insert_header(&mut headers, AUTHORIZATION, &format!("Bearer {token}"))?;
            }
            AuthConfig::Custom { headers: custom } => {
                for (name, value) in custom {
                    let header_name =
                        HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                            GatewayError::authentication(format!(
                                "invalid custom header name '{name}': {e}"
                            ))
                        })?;
                    insert_header(&mut headers, header_name, value)?;
                }
            }
        }

        Ok(headers)
    }

    /// Drop every cached token belonging to one integration (its primary
    /// target and all of its actions).
    ///
    /// Used after credential rotation; other integrations keep their tokens.
    pub async fn invalidate(&self, integration_id: IntegrationId) {
        let mut guard = self.tokens.write().await;
        let before = guard.len();
        guard.retain(|key, _| key.integration != integration_id);
        if guard.len() != before {
            debug!(integration_id = %integration_id, "OAuth2 tokens invalidated");
        }
    }

    /// Return a cached token or fetch a fresh one.
    async fn oauth_token(
        &self,
        key: TokenCacheKey,
        token_url: &str,
        client_id: &str,
        client_secret: Option<&str>,
        scopes: &[String],
    ) -> Result<String> {
        {
            let guard = self.tokens.read().await;
            if let Some(cached) = guard.get(&key) {
                if !cached.is_expired(Utc::now()) {
                    return Ok(cached.token.clone());
                }
            }
        }

        // Serialize refresh under the write lock so concurrent expired
        // callers do not stampede the provider.
        let mut guard = self.tokens.write().await;
        if let Some(cached) = guard.get(&key) {
            if !cached.is_expired(Utc::now()) {
                return Ok(cached.token.clone());
            }
        }

        let fetched = self
            .fetch_oauth_token(token_url, client_id, client_secret, scopes)
            .await?;
        let token = fetched.token.clone();
        guard.insert(key, fetched);

        Ok(token)
    }

    /// Fetch an OAuth2 token using the client credentials flow.
    async fn fetch_oauth_token(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: Option<&str>,
        scopes: &[String],
    ) -> Result<CachedToken> {
        let mut params = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", client_id.to_string()),
        ];

        if let Some(secret) = client_secret {
            params.push(("client_secret", secret.to_string()));
        }

        if !scopes.is_empty() {
            params.push(("scope", scopes.join(" ")));
        }

        let response = self
            .client
            .post(token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                GatewayError::authentication(format!("token endpoint unreachable: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                token_url = %token_url,
                status = %status,
                "OAuth2 token request rejected"
            );
            return Err(GatewayError::authentication(format!(
                "token endpoint returned HTTP {status}"
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            GatewayError::authentication(format!("failed to parse token response: {e}"))
        })?;

        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| {
                GatewayError::authentication("token response missing access_token")
            })?;

        let expires_at = body
            .get("expires_in")
            .and_then(serde_json::Value::as_i64)
            .map(|secs| {
                Utc::now()
                    + ChronoDuration::seconds((secs - TOKEN_EXPIRY_MARGIN_SECS).max(0))
            });

        Ok(CachedToken { token, expires_at })
    }
}

fn insert_header(
    headers: &mut HeaderMap,
    name: impl reqwest::header::IntoHeaderName,
    value: &str,
) -> Result<()> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| GatewayError::authentication(format!("invalid header value: {e}")))?;
    headers.insert(name, value);
    Ok(())
}
