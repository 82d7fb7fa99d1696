//! HTTP handlers for the operator API.

pub mod deliveries;
pub mod dlq;
pub mod events;
pub mod pending;
pub mod testing;

use serde::Deserialize;

use fluxgate_core::OrgId;

/// Org scope carried by every operator request.
///
/// Authorization itself lives in the management layer; the gateway only
/// enforces org isolation on its stores.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct OrgScope {
    pub org_id: OrgId,
}
