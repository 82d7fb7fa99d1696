//! fluxgate Core Library
//!
//! Shared types and traits for the fluxgate event delivery gateway.
//!
//! # Modules
//!
//! - [`ids`] - Strongly typed identifiers (OrgId, IntegrationId, AttemptId, ...)
//! - [`event`] - The normalized inbound event envelope
//! - [`traits`] - Multi-tenant traits (OrgScoped)
//! - [`error`] - The delivery error taxonomy (GatewayError)
//!
//! # Example
//!
//! ```
//! use fluxgate_core::{GatewayError, IntegrationId, OrgId, OrgScoped, Result};
//!
//! // Create strongly typed IDs
//! let org_id = OrgId::new();
//! let integration_id = IntegrationId::new();
//!
//! // Use Result type alias
//! fn example() -> Result<()> {
//!     Err(GatewayError::validation("missing target url"))
//! }
//! ```

pub mod error;
pub mod event;
pub mod ids;
pub mod traits;

// Re-export main types for convenient access
pub use error::{GatewayError, Result, SandboxKind};
pub use event::{InboundEvent, TriggerType};
pub use ids::{
    ActionId, AttemptId, DlqEntryId, EventId, IntegrationId, OrgId, ParseIdError,
    PendingDeliveryId,
};
pub use traits::OrgScoped;
