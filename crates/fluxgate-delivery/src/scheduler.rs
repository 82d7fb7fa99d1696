//! Delivery scheduling for non-immediate integrations.
//!
//! Runs the tenant's scheduling script in the sandbox against sample or
//! real event data and validates the result's shape: DELAYED scripts return
//! a Unix millisecond timestamp (a past timestamp is immediately due, not an
//! error); RECURRING scripts return a recurrence description with a bounded
//! interval and at least one termination bound. Malformed results are
//! rejected with a descriptive error rather than silently defaulted.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

use fluxgate_core::{GatewayError, Result};
use fluxgate_script::{ScriptGlobals, ScriptSandbox};

use crate::config::DeliveryMode;
use crate::transform::{sandbox_to_gateway, TransformContext};

/// Minimum recurrence interval.
pub const MIN_INTERVAL_MS: i64 = 60_000;

/// Bounds for `maxOccurrences`.
pub const MIN_OCCURRENCES: i64 = 2;
pub const MAX_OCCURRENCES: i64 = 365;

/// How many occurrences a dry-run preview computes.
const PREVIEW_OCCURRENCES: usize = 3;

/// Recurrence description returned by a RECURRING scheduling script.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecurringConfig {
    /// Unix millisecond timestamp of the first occurrence.
    pub first_occurrence: i64,
    /// Interval between occurrences in milliseconds.
    pub interval_ms: i64,
    /// Total number of occurrences, 2..=365.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_occurrences: Option<i64>,
    /// Unix millisecond timestamp after which no occurrence fires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
}

impl RecurringConfig {
    /// Enforce the recurrence invariants.
    pub fn validate(&self) -> Result<()> {
        if self.first_occurrence <= 0 {
            return Err(GatewayError::validation(
                "firstOccurrence must be a positive Unix millisecond timestamp",
            ));
        }
        if self.interval_ms < MIN_INTERVAL_MS {
            return Err(GatewayError::validation(format!(
                "intervalMs must be at least {MIN_INTERVAL_MS} (got {})",
                self.interval_ms
            )));
        }
        if let Some(occurrences) = self.max_occurrences {
            if !(MIN_OCCURRENCES..=MAX_OCCURRENCES).contains(&occurrences) {
                return Err(GatewayError::validation(format!(
                    "maxOccurrences must be between {MIN_OCCURRENCES} and {MAX_OCCURRENCES} (got {occurrences})"
                )));
            }
        }
        if self.max_occurrences.is_none() && self.end_date.is_none() {
            return Err(GatewayError::validation(
                "recurring schedules require maxOccurrences or endDate",
            ));
        }
        if let Some(end) = self.end_date {
            if end <= self.first_occurrence {
                return Err(GatewayError::validation(
                    "endDate must be after firstOccurrence",
                ));
            }
        }
        Ok(())
    }
}

/// Validated result of running a scheduling script.
#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    /// One future (or immediately due) delivery.
    Delayed {
        scheduled_for: DateTime<Utc>,
        /// True when the script returned a past timestamp; the delivery is
        /// due immediately.
        is_overdue: bool,
    },
    /// A bounded series of deliveries.
    Recurring {
        first_occurrence: DateTime<Utc>,
        config: RecurringConfig,
    },
}

/// Human-readable dry-run preview returned by the test endpoint. Nothing is
/// persisted.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SchedulePreview {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Delay from now to the first delivery; negative when overdue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_overdue: Option<bool>,
    /// First few computed occurrences, for RECURRING schedules.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub occurrences: Vec<DateTime<Utc>>,
    pub duration_ms: u64,
}

/// Computes delayed/recurring delivery times via tenant-supplied scripts.
pub struct Scheduler {
    sandbox: Arc<ScriptSandbox>,
}

impl Scheduler {
    /// Create a scheduler over the shared sandbox.
    #[must_use]
    pub fn new(sandbox: Arc<ScriptSandbox>) -> Self {
        Self { sandbox }
    }

    /// Run the scheduling script for a deferred integration.
    pub fn compute_schedule(
        &self,
        mode: &DeliveryMode,
        payload: &Value,
        ctx: &TransformContext,
    ) -> Result<ScheduleOutcome> {
        self.compute_at(mode, payload, ctx, Utc::now())
    }

    /// Run the scheduling script against an explicit clock.
    pub fn compute_at(
        &self,
        mode: &DeliveryMode,
        payload: &Value,
        ctx: &TransformContext,
        now: DateTime<Utc>,
    ) -> Result<ScheduleOutcome> {
        match mode {
            DeliveryMode::Immediate => Err(GatewayError::validation(
                "immediate integrations are not scheduled",
            )),
            DeliveryMode::Delayed { script } => {
                let value = self.run_script(script, payload, ctx)?;
                let timestamp_ms = as_millis(&value).ok_or_else(|| {
                    GatewayError::validation(format!(
                        "DELAYED scheduling script must return a Unix millisecond timestamp, got {value}"
                    ))
                })?;

                let scheduled_for = millis_to_datetime(timestamp_ms)?;
                Ok(ScheduleOutcome::Delayed {
                    scheduled_for,
                    is_overdue: scheduled_for <= now,
                })
            }
            DeliveryMode::Recurring { script } => {
                let value = self.run_script(script, payload, ctx)?;
                let config: RecurringConfig =
                    serde_json::from_value(value.clone()).map_err(|e| {
                        GatewayError::validation(format!(
                            "RECURRING scheduling script returned a malformed config: {e}"
                        ))
                    })?;
                config.validate()?;

                let first_occurrence = millis_to_datetime(config.first_occurrence)?;
                Ok(ScheduleOutcome::Recurring {
                    first_occurrence,
                    config,
                })
            }
        }
    }

    /// Dry-run a scheduling script against representative sample data.
    ///
    /// Always returns a preview; failures surface in the body rather than as
    /// errors so operator test endpoints can report *why* the script failed.
    pub fn test_schedule(
        &self,
        mode: &DeliveryMode,
        sample_payload: &Value,
        ctx: &TransformContext,
    ) -> SchedulePreview {
        let started = Instant::now();
        let now = Utc::now();

        match self.compute_at(mode, sample_payload, ctx, now) {
            Ok(ScheduleOutcome::Delayed {
                scheduled_for,
                is_overdue,
            }) => {
                let delay_ms = (scheduled_for - now).num_milliseconds();
                let description = if is_overdue {
                    format!("delivery is overdue (was due {scheduled_for})")
                } else {
                    format!(
                        "delivery scheduled for {scheduled_for} ({}s from now)",
                        delay_ms / 1000
                    )
                };
                SchedulePreview {
                    success: true,
                    code: None,
                    error: None,
                    description: Some(description),
                    scheduled_for: Some(scheduled_for),
                    delay_ms: Some(delay_ms),
                    is_overdue: Some(is_overdue),
                    occurrences: Vec::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Ok(ScheduleOutcome::Recurring {
                first_occurrence,
                config,
            }) => {
                let occurrences = preview_occurrences(&config, PREVIEW_OCCURRENCES);
                let delay_ms = (first_occurrence - now).num_milliseconds();
                let bound = match (config.max_occurrences, config.end_date) {
                    (Some(n), _) => format!("{n} occurrences"),
                    (None, Some(end)) => format!(
                        "until {}",
                        millis_to_datetime(end)
                            .map(|d| d.to_string())
                            .unwrap_or_else(|_| end.to_string())
                    ),
                    (None, None) => "unbounded".to_string(),
                };
                SchedulePreview {
                    success: true,
                    code: None,
                    error: None,
                    description: Some(format!(
                        "first delivery at {first_occurrence}, every {}s, {bound}",
                        config.interval_ms / 1000
                    )),
                    scheduled_for: Some(first_occurrence),
                    delay_ms: Some(delay_ms),
                    is_overdue: Some(first_occurrence <= now),
                    occurrences,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(e) => SchedulePreview {
                success: false,
                code: Some(e.error_code().to_string()),
                error: Some(e.to_string()),
                description: None,
                scheduled_for: None,
                delay_ms: None,
                is_overdue: None,
                occurrences: Vec::new(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        }
    }

    fn run_script(&self, script: &str, payload: &Value, ctx: &TransformContext) -> Result<Value> {
        let globals = ScriptGlobals::new()
            .with_var("payload", payload.clone())
            .with_var("context", ctx.to_json());
        self.sandbox
            .run(script, &globals)
            .map_err(sandbox_to_gateway)
    }
}

/// Compute the first few occurrences of a recurrence, honoring its bounds.
#[must_use]
pub fn preview_occurrences(config: &RecurringConfig, limit: usize) -> Vec<DateTime<Utc>> {
    let mut occurrences = Vec::new();
    let max = config
        .max_occurrences
        .map(|n| n as usize)
        .unwrap_or(usize::MAX)
        .min(limit);

    for i in 0..max {
        let at_ms = config.first_occurrence + config.interval_ms * i as i64;
        if let Some(end) = config.end_date {
            if at_ms > end {
                break;
            }
        }
        match millis_to_datetime(at_ms) {
            Ok(at) => occurrences.push(at),
            Err(_) => break,
        }
    }

    occurrences
}

fn as_millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .filter(|ms| *ms > 0)
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| GatewayError::validation(format!("timestamp {ms} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxgate_core::OrgId;

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(ScriptSandbox::new()))
    }

    fn ctx() -> TransformContext {
        TransformContext::new("report.requested", OrgId::new())
    }

    #[test]
    fn test_delayed_future_timestamp() {
        let now = Utc::now();
        let future_ms = (now + chrono::Duration::hours(2)).timestamp_millis();
        let mode = DeliveryMode::Delayed {
            script: format!("{future_ms}"),
        };

        let outcome = scheduler()
            .compute_at(&mode, &serde_json::json!({}), &ctx(), now)
            .unwrap();

        match outcome {
            ScheduleOutcome::Delayed {
                scheduled_for,
                is_overdue,
            } => {
                assert_eq!(scheduled_for.timestamp_millis(), future_ms);
                assert!(!is_overdue);
            }
            other => panic!("expected delayed outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_delayed_past_timestamp_is_overdue_not_error() {
        let now = Utc::now();
        let past_ms = (now - chrono::Duration::hours(1)).timestamp_millis();
        let mode = DeliveryMode::Delayed {
            script: format!("{past_ms}"),
        };

        let outcome = scheduler()
            .compute_at(&mode, &serde_json::json!({}), &ctx(), now)
            .unwrap();

        match outcome {
            ScheduleOutcome::Delayed { is_overdue, .. } => assert!(is_overdue),
            other => panic!("expected delayed outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_delayed_non_numeric_rejected() {
        let mode = DeliveryMode::Delayed {
            script: r#""tomorrow""#.to_string(),
        };

        let err = scheduler()
            .compute_schedule(&mode, &serde_json::json!({}), &ctx())
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_CONFIG");
    }

    #[test]
    fn test_delayed_script_reads_payload() {
        let mode = DeliveryMode::Delayed {
            script: "payload.send_at".to_string(),
        };
        let now = Utc::now();
        let at_ms = (now + chrono::Duration::minutes(30)).timestamp_millis();

        let outcome = scheduler()
            .compute_at(
                &mode,
                &serde_json::json!({"send_at": at_ms}),
                &ctx(),
                now,
            )
            .unwrap();

        match outcome {
            ScheduleOutcome::Delayed { scheduled_for, .. } => {
                assert_eq!(scheduled_for.timestamp_millis(), at_ms);
            }
            other => panic!("expected delayed outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_recurring_missing_bounds_rejected() {
        let now = Utc::now();
        let first_ms = (now + chrono::Duration::hours(1)).timestamp_millis();
        let mode = DeliveryMode::Recurring {
            script: format!(
                r#"#{{ firstOccurrence: {first_ms}, intervalMs: 3600000 }}"#
            ),
        };

        let err = scheduler()
            .compute_at(&mode, &serde_json::json!({}), &ctx(), now)
            .unwrap_err();

        assert_eq!(err.error_code(), "INVALID_CONFIG");
        assert!(err.to_string().contains("maxOccurrences or endDate"));
    }

    #[test]
    fn test_recurring_interval_floor() {
        let now = Utc::now();
        let first_ms = (now + chrono::Duration::hours(1)).timestamp_millis();
        let mode = DeliveryMode::Recurring {
            script: format!(
                r#"#{{ firstOccurrence: {first_ms}, intervalMs: 1000, maxOccurrences: 5 }}"#
            ),
        };

        let err = scheduler()
            .compute_at(&mode, &serde_json::json!({}), &ctx(), now)
            .unwrap_err();
        assert!(err.to_string().contains("intervalMs"));
    }

    #[test]
    fn test_recurring_occurrence_bounds() {
        let config = RecurringConfig {
            first_occurrence: Utc::now().timestamp_millis(),
            interval_ms: 60_000,
            max_occurrences: Some(1),
            end_date: None,
        };
        assert!(config.validate().is_err());

        let config = RecurringConfig {
            max_occurrences: Some(366),
            ..config
        };
        assert!(config.validate().is_err());

        let config = RecurringConfig {
            max_occurrences: Some(12),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_recurring_valid_config() {
        let now = Utc::now();
        let first_ms = (now + chrono::Duration::hours(1)).timestamp_millis();
        let mode = DeliveryMode::Recurring {
            script: format!(
                r#"#{{ firstOccurrence: {first_ms}, intervalMs: 86400000, maxOccurrences: 7 }}"#
            ),
        };

        let outcome = scheduler()
            .compute_at(&mode, &serde_json::json!({}), &ctx(), now)
            .unwrap();

        match outcome {
            ScheduleOutcome::Recurring {
                first_occurrence,
                config,
            } => {
                assert_eq!(first_occurrence.timestamp_millis(), first_ms);
                assert_eq!(config.max_occurrences, Some(7));
            }
            other => panic!("expected recurring outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_preview_occurrences_honors_end_date() {
        let first = Utc::now().timestamp_millis();
        let config = RecurringConfig {
            first_occurrence: first,
            interval_ms: 60_000,
            max_occurrences: None,
            end_date: Some(first + 90_000), // room for two occurrences
        };

        let occurrences = preview_occurrences(&config, 5);
        assert_eq!(occurrences.len(), 2);
        assert_eq!(
            occurrences[1].timestamp_millis() - occurrences[0].timestamp_millis(),
            60_000
        );
    }

    #[test]
    fn test_dry_run_reports_failure_in_body() {
        let mode = DeliveryMode::Recurring {
            script: r#"#{ firstOccurrence: 1, intervalMs: 10 }"#.to_string(),
        };

        let preview = scheduler().test_schedule(&mode, &serde_json::json!({}), &ctx());
        assert!(!preview.success);
        assert_eq!(preview.code.as_deref(), Some("INVALID_CONFIG"));
        assert!(preview.error.is_some());
    }

    #[test]
    fn test_dry_run_preview_for_recurring() {
        let now = Utc::now();
        let first_ms = (now + chrono::Duration::minutes(10)).timestamp_millis();
        let mode = DeliveryMode::Recurring {
            script: format!(
                r#"#{{ firstOccurrence: {first_ms}, intervalMs: 120000, maxOccurrences: 10 }}"#
            ),
        };

        let preview = scheduler().test_schedule(&mode, &serde_json::json!({}), &ctx());
        assert!(preview.success, "preview failed: {:?}", preview.error);
        assert_eq!(preview.occurrences.len(), 3);
        assert!(preview.description.unwrap().contains("every 120s"));
    }
}
