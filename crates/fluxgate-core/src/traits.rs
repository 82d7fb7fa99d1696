//! Multi-Tenant Traits
//!
//! This module provides traits for org-scoped entities in fluxgate.
//!
//! # Example
//!
//! ```
//! use fluxgate_core::{OrgId, OrgScoped};
//!
//! struct Integration {
//!     org_id: OrgId,
//!     name: String,
//! }
//!
//! impl OrgScoped for Integration {
//!     fn org_id(&self) -> OrgId {
//!         self.org_id
//!     }
//! }
//!
//! // Generic function that works with any OrgScoped entity
//! fn verify_org<T: OrgScoped>(entity: &T, expected: OrgId) -> bool {
//!     entity.org_id() == expected
//! }
//!
//! let org = OrgId::new();
//! let integration = Integration {
//!     org_id: org,
//!     name: "orders-webhook".to_string(),
//! };
//!
//! assert!(verify_org(&integration, org));
//! ```

use crate::ids::OrgId;

/// Trait for entities that belong to a specific organization.
///
/// Implementing this trait marks an entity as org-scoped, enabling
/// compile-time verification that tenant isolation is properly implemented.
///
/// # Object Safety
///
/// This trait is object-safe, meaning it can be used with trait objects:
/// `Box<dyn OrgScoped>` or `&dyn OrgScoped`.
pub trait OrgScoped {
    /// Returns the organization ID associated with this entity.
    ///
    /// This method returns an owned `OrgId` (which is `Copy`) for convenience,
    /// allowing callers to use the value without lifetime concerns.
    fn org_id(&self) -> OrgId;
}
