//! Data models shared across the crate.

pub mod request;
pub mod tenant;

pub use request::{AccessIntent, RequestContext, UnitOutcome, UnitState};
pub use tenant::{
    ConnectionIdentity, DriverKind, ResolvedTenant, TenantField, TenantParameters, TenantSummary,
    mask_url,
};
