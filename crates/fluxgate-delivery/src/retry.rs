//! Intra-request retry and backoff policy.
//!
//! Decides, per outcome, whether the delivery executor retries the same
//! already-transformed request within the current attempt. Long-horizon
//! retries (DLQ replay, periodic sweeps) live elsewhere; the two horizons
//! are never conflated.

use std::time::Duration;

use crate::config::RetrySettings;

/// HTTP status codes that drive the intra-request retry loop.
const RETRYABLE_STATUS_CODES: [u16; 2] = [408, 429];

/// Retry policy derived from an integration's [`RetrySettings`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    jitter_ms: u64,
}

impl RetryPolicy {
    /// Build a policy from integration settings.
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            initial_backoff_ms: settings.initial_backoff_ms.max(1),
            max_backoff_ms: settings.max_backoff_ms.max(settings.initial_backoff_ms.max(1)),
            jitter_ms: settings.jitter_ms,
        }
    }

    /// Total attempts allowed, including the initial call.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// The configured jitter bound in milliseconds.
    #[must_use]
    pub fn jitter_max_ms(&self) -> u64 {
        self.jitter_ms
    }

    /// Check if a status code should trigger a retry.
    #[must_use]
    pub fn should_retry_status(&self, status_code: u16) -> bool {
        RETRYABLE_STATUS_CODES.contains(&status_code) || status_code >= 500
    }

    /// Deterministic backoff for a given attempt (1-based), without jitter.
    ///
    /// `min(initial * 2^(attempt-1), cap)`.
    #[must_use]
    pub fn backoff_without_jitter(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::from_millis(0);
        }
        let pow = 2u64.saturating_pow(attempt.saturating_sub(1));
        let exp = self.initial_backoff_ms.saturating_mul(pow);
        Duration::from_millis(exp.min(self.max_backoff_ms))
    }

    /// Backoff for a given attempt with additive random jitter in
    /// `0..=jitter_ms`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_without_jitter(attempt) + jitter_delay(self.jitter_ms)
    }
}

/// Additive random jitter in `0..=jitter_ms`.
fn jitter_delay(jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return Duration::from_millis(0);
    }
    let jitter = (rand_simple() * (jitter_ms + 1) as f64) as u64;
    Duration::from_millis(jitter.min(jitter_ms))
}

/// Simple pseudo-random number generator for jitter.
/// Returns a value between 0.0 and 1.0.
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (f64::from(nanos) / f64::from(u32::MAX)).fract()
}

/// Parse a Retry-After header value.
///
/// Supports the delay-seconds format (e.g., "120"). HTTP-date values are
/// not honored; callers fall back to computed backoff.
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.parse::<u64>().map(Duration::from_secs).ok()
}
