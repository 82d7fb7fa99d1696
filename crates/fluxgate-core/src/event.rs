//! Normalized inbound event handed to the delivery pipeline.
//!
//! Event source adapters (table pollers, broker consumers, HTTP push
//! receivers) all produce this shape; the pipeline never knows how an event
//! was produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::ids::{EventId, OrgId};

/// What caused an attempt to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// Operator-initiated (replay, DLQ retry, test endpoint).
    Manual,
    /// Fired by the scheduler for a delayed or recurring integration.
    Scheduled,
    /// Driven by an inbound event from a source adapter.
    Event,
}

/// A normalized event as handed to the pipeline by a source adapter.
///
/// Contains the routing metadata required for integration matching,
/// idempotence, and audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Unique identifier for this event instance.
    /// Used for replay dedupe checking.
    pub event_id: EventId,

    /// Organization the event belongs to.
    pub org_id: OrgId,

    /// Event type selector matched against integration configuration.
    /// E.g., "order.created"
    pub event_type: String,

    /// The actual event payload.
    pub payload: serde_json::Value,

    /// Identifier of the source adapter that produced the event.
    pub source_id: String,

    /// Timestamp when the adapter received the event.
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    /// Create a new event with a fresh id, received now.
    pub fn new(
        org_id: OrgId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            org_id,
            event_type: event_type.into(),
            payload,
            source_id: source_id.into(),
            received_at: Utc::now(),
        }
    }

    /// Create an event with a specific event ID.
    /// Useful for testing or replaying events.
    pub fn with_id(
        event_id: EventId,
        org_id: OrgId,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            org_id,
            event_type: event_type.into(),
            payload,
            source_id: source_id.into(),
            received_at: Utc::now(),
        }
    }

    /// Validate that required fields are present.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.event_type.is_empty() {
            return Err(GatewayError::validation("event_type is empty"));
        }
        if self.source_id.is_empty() {
            return Err(GatewayError::validation("source_id is empty"));
        }
        Ok(())
    }

    /// Serialize the event to JSON bytes.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, GatewayError> {
        serde_json::to_vec(self)
            .map_err(|e| GatewayError::internal(format!("event serialization failed: {e}")))
    }

    /// Deserialize an event from JSON bytes.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, GatewayError> {
        serde_json::from_slice(bytes)
            .map_err(|e| GatewayError::validation(format!("invalid event envelope: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let org_id = OrgId::new();
        let event = InboundEvent::new(
            org_id,
            "order.created",
            serde_json::json!({"order_id": 42}),
            "mysql-poller",
        );

        assert_eq!(event.org_id, org_id);
        assert_eq!(event.event_type, "order.created");
        assert_eq!(event.source_id, "mysql-poller");
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_event_serialization_roundtrip() {
        let event = InboundEvent::new(
            OrgId::new(),
            "user.updated",
            serde_json::json!({"user_id": "u-1"}),
            "http-push",
        );

        let bytes = event.to_json_bytes().unwrap();
        let restored = InboundEvent::from_json_bytes(&bytes).unwrap();

        assert_eq!(event.event_id, restored.event_id);
        assert_eq!(event.org_id, restored.org_id);
        assert_eq!(event.payload, restored.payload);
    }

    #[test]
    fn test_event_validation() {
        let mut event = InboundEvent::new(
            OrgId::new(),
            "order.created",
            serde_json::json!({}),
            "broker",
        );
        event.event_type = String::new();

        assert!(event.validate().is_err());
    }

    #[test]
    fn test_invalid_bytes_rejected() {
        let result = InboundEvent::from_json_bytes(b"not json");
        assert!(result.is_err());
    }

    #[test]
    fn test_trigger_type_serialization() {
        let json = serde_json::to_string(&TriggerType::Scheduled).unwrap();
        assert_eq!(json, "\"SCHEDULED\"");
    }
}
