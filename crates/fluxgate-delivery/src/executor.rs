//! Outbound call execution.
//!
//! Issues the HTTP request (buffered or streaming) or delegates to a
//! communication-channel provider, applies the hard per-call timeout, and
//! maps connection-level failures onto the gateway taxonomy. Outcome
//! classification by status code drives the retry controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use tracing::debug;

use fluxgate_core::{GatewayError, Result};

use crate::config::HttpMethod;

/// Cap applied to buffered response bodies kept for logging.
pub const RESPONSE_BODY_CAP: usize = 5000;

/// Hop-by-hop headers stripped from proxied streaming responses.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct BufferedResponse {
    pub status: u16,
    /// Response headers as a JSON-serializable map.
    pub headers: Value,
    /// Body text, capped at [`RESPONSE_BODY_CAP`] characters.
    pub body: String,
    pub latency_ms: u64,
}

impl BufferedResponse {
    /// Whether the upstream answered 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Retry-After header value, when the upstream sent one.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        self.headers
            .get("retry-after")
            .and_then(Value::as_str)
    }
}

/// A successfully opened streaming response, ready to pipe to the caller.
///
/// Hop-by-hop headers are already stripped; status and the remaining headers
/// are forwarded verbatim.
#[derive(Debug)]
pub struct StreamingStart {
    pub status: u16,
    pub headers: HeaderMap,
    response: reqwest::Response,
}

impl StreamingStart {
    /// Whether the upstream answered 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Consume into the upstream byte stream.
    ///
    /// Once bytes flow, a mid-stream error can only terminate the stream;
    /// the caller cannot be handed a clean error response at that point.
    pub fn into_byte_stream(
        self,
    ) -> impl futures_util::Stream<Item = std::result::Result<bytes::Bytes, reqwest::Error>> {
        self.response.bytes_stream()
    }
}

/// Adapter for a non-HTTP communication channel (email/SMS-style providers).
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    /// Deliver the payload; returns the provider-assigned message id.
    async fn send(&self, payload: &Value) -> Result<String>;
}

/// Registry of channel providers keyed by `(channel, provider)`.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<(String, String), Arc<dyn ChannelProvider>>,
}

impl ProviderRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider adapter.
    pub fn register(
        &mut self,
        channel: impl Into<String>,
        provider: impl Into<String>,
        adapter: Arc<dyn ChannelProvider>,
    ) {
        self.providers
            .insert((channel.into(), provider.into()), adapter);
    }

    /// Look up a provider adapter.
    #[must_use]
    pub fn get(&self, channel: &str, provider: &str) -> Option<Arc<dyn ChannelProvider>> {
        self.providers
            .get(&(channel.to_string(), provider.to_string()))
            .cloned()
    }
}

/// Executes outbound calls for the delivery pipeline.
pub struct DeliveryExecutor {
    client: Client,
    providers: ProviderRegistry,
}

impl DeliveryExecutor {
    /// Create an executor with a shared HTTP client.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Internal` if the HTTP client cannot be built.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent("fluxgate/0.1")
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            providers: ProviderRegistry::new(),
        })
    }

    /// Create an executor over an existing client (shared with auth).
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            providers: ProviderRegistry::new(),
        }
    }

    /// Attach the channel provider registry.
    #[must_use]
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// The underlying HTTP client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Issue a buffered HTTP call and read the full response up to the
    /// logging cap.
    pub async fn execute_buffered(
        &self,
        method: HttpMethod,
        url: &str,
        headers: HeaderMap,
        payload: Option<&Value>,
        timeout: Duration,
    ) -> Result<BufferedResponse> {
        let start = Instant::now();
        let mut request = self
            .request_builder(method, url)
            .headers(headers)
            .timeout(timeout);

        if let Some(body) = payload {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_request_error(&e, timeout))?;

        let status = response.status().as_u16();
        let header_map = headers_to_json(response.headers());

        let body = response
            .text()
            .await
            .map_err(|e| map_request_error(&e, timeout))?
            .chars()
            .take(RESPONSE_BODY_CAP)
            .collect::<String>();

        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(
            url = %url,
            status = status,
            latency_ms = latency_ms,
            "Buffered delivery call completed"
        );

        Ok(BufferedResponse {
            status,
            headers: header_map,
            body,
            latency_ms,
        })
    }

    /// Open a streaming HTTP call: the timeout guards the response head;
    /// the body is piped to the caller without buffering.
    pub async fn execute_streaming(
        &self,
        method: HttpMethod,
        url: &str,
        headers: HeaderMap,
        payload: Option<&Value>,
        timeout: Duration,
    ) -> Result<StreamingStart> {
        let mut request = self.request_builder(method, url).headers(headers);
        if let Some(body) = payload {
            request = request.json(body);
        }

        let response = tokio::time::timeout(timeout, request.send())
            .await
            .map_err(|_| GatewayError::UpstreamTimeout {
                timeout_secs: timeout.as_secs(),
            })?
            .map_err(|e| map_request_error(&e, timeout))?;

        let status = response.status().as_u16();
        let filtered = strip_hop_by_hop(response.headers());

        debug!(url = %url, status = status, "Streaming delivery headers received");

        Ok(StreamingStart {
            status,
            headers: filtered,
            response,
        })
    }

    /// Dispatch a communication-channel send through the provider registry.
    pub async fn execute_channel(
        &self,
        channel: &str,
        provider: &str,
        payload: &Value,
    ) -> Result<String> {
        let adapter = self.providers.get(channel, provider).ok_or_else(|| {
            GatewayError::validation(format!(
                "no provider registered for channel '{channel}' / provider '{provider}'"
            ))
        })?;

        let message_id = adapter.send(payload).await?;
        debug!(
            channel = %channel,
            provider = %provider,
            message_id = %message_id,
            "Channel send accepted"
        );
        Ok(message_id)
    }

    fn request_builder(&self, method: HttpMethod, url: &str) -> reqwest::RequestBuilder {
        match method {
            HttpMethod::Get => self.client.get(url),
            HttpMethod::Post => self.client.post(url),
            HttpMethod::Put => self.client.put(url),
            HttpMethod::Patch => self.client.patch(url),
            HttpMethod::Delete => self.client.delete(url),
        }
    }
}

/// Map a reqwest error onto the taxonomy: timeouts are distinct from
/// connection-level failures.
fn map_request_error(error: &reqwest::Error, timeout: Duration) -> GatewayError {
    if error.is_timeout() {
        GatewayError::UpstreamTimeout {
            timeout_secs: timeout.as_secs(),
        }
    } else if error.is_connect() {
        GatewayError::network(format!("connection failed: {error}"))
    } else {
        GatewayError::network(format!("request error: {error}"))
    }
}

/// Remove hop-by-hop headers before forwarding a streamed response.
fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if !HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
            filtered.insert(name.clone(), value.clone());
        }
    }
    filtered
}

/// Convert response headers to a JSON-serializable map.
fn headers_to_json(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Ok(v) = value.to_str() {
            map.insert(name.to_string(), Value::String(v.to_string()));
        }
    }
    Value::Object(map)
}
