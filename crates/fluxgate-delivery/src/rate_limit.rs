//! Per-integration fixed-window rate limiting.
//!
//! Each check atomically increments the counter for the current window,
//! keyed by `(integration_id, window_start)`. The counter store is the only
//! piece of mutable shared state touched per attempt, and the increment is a
//! single read-modify-write so concurrent callers for the same key cannot
//! race. Disabled integrations are always allowed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use fluxgate_core::IntegrationId;

use crate::config::RateLimitSettings;

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is admitted.
    pub allowed: bool,
    /// Requests left in the current window. `None` when limiting is
    /// disabled for the integration.
    pub remaining: Option<u32>,
    /// Instant at which the current window rolls over.
    pub reset_at: Option<DateTime<Utc>>,
    /// How long a denied caller should wait before retrying.
    pub retry_after: Option<Duration>,
}

impl RateLimitDecision {
    /// The decision returned for integrations with limiting disabled.
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: None,
            reset_at: None,
            retry_after: None,
        }
    }
}

/// Atomic upsert-and-read counter primitive backing the rate limiter.
///
/// Implementations must make `increment` a single atomic read-modify-write
/// for a given key; windows expire naturally via the supplied TTL.
#[async_trait]
pub trait RateLimitCounterStore: Send + Sync {
    /// Increment-or-create the counter for `(integration_id, window_start)`
    /// and return the post-increment count.
    async fn increment(
        &self,
        integration_id: IntegrationId,
        window_start: i64,
        ttl_secs: u64,
    ) -> u64;
}

/// In-memory counter store used by the gateway runtime and tests.
///
/// A single mutex guards the map, making each increment atomic under
/// concurrent callers. Expired windows are purged opportunistically on
/// access.
#[derive(Default)]
pub struct InMemoryCounterStore {
    windows: Mutex<HashMap<(IntegrationId, i64), u64>>,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitCounterStore for InMemoryCounterStore {
    async fn increment(
        &self,
        integration_id: IntegrationId,
        window_start: i64,
        ttl_secs: u64,
    ) -> u64 {
        let mut guard = self.windows.lock().await;

        let expiry_cutoff = window_start.saturating_sub(ttl_secs as i64);
        guard.retain(|(_, start), _| *start > expiry_cutoff);

        let count = guard.entry((integration_id, window_start)).or_insert(0);
        *count += 1;
        *count
    }
}

/// Fixed-window rate limiter shared by all concurrent delivery attempts.
pub struct RateLimiter {
    store: Arc<dyn RateLimitCounterStore>,
}

impl RateLimiter {
    /// Create a limiter over the given counter store.
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitCounterStore>) -> Self {
        Self { store }
    }

    /// Check and consume one slot for an integration.
    pub async fn check(
        &self,
        integration_id: IntegrationId,
        settings: &RateLimitSettings,
    ) -> RateLimitDecision {
        self.check_at(integration_id, settings, Utc::now()).await
    }

    /// Check against an explicit clock. Used by tests to pin windows.
    pub async fn check_at(
        &self,
        integration_id: IntegrationId,
        settings: &RateLimitSettings,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        if !settings.enabled {
            return RateLimitDecision::unlimited();
        }

        let window_secs = settings.window_secs.max(1) as i64;
        let now_secs = now.timestamp();
        let window_start = (now_secs / window_secs) * window_secs;
        let reset_secs = window_start + window_secs;
        let reset_at = Utc
            .timestamp_opt(reset_secs, 0)
            .single()
            .unwrap_or_else(Utc::now);

        // Two windows of TTL keeps the previous window around for observers.
        let count = self
            .store
            .increment(integration_id, window_start, settings.window_secs * 2)
            .await;

        if count > u64::from(settings.max_requests) {
            let retry_after_secs = (reset_secs - now_secs).max(1) as u64;
            debug!(
                integration_id = %integration_id,
                count = count,
                max_requests = settings.max_requests,
                retry_after_secs = retry_after_secs,
                "Rate limit window exhausted"
            );
            return RateLimitDecision {
                allowed: false,
                remaining: Some(0),
                reset_at: Some(reset_at),
                retry_after: Some(Duration::from_secs(retry_after_secs)),
            };
        }

        RateLimitDecision {
            allowed: true,
            remaining: Some(settings.max_requests - count as u32),
            reset_at: Some(reset_at),
            retry_after: None,
        }
    }
}
