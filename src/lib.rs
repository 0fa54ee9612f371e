//! Multi-tenant database router.
//!
//! Tenants are declared in a flat settings map (`mdb.url.<tenant>=...`). Each
//! request is mapped to a tenant key, bound to a session from that tenant's
//! connection pool, and finished with a commit or rollback when the request
//! completes. Tenants can be added, replaced and removed while the router
//! is serving.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod resolver;
pub mod runtime;
pub mod transport;

pub use config::Config;
pub use db::{TenantConfigStore, TenantRegistry, TransactionCoordinator, UnitOfWork};
pub use error::{TenantError, TenantResult};
pub use resolver::{DomainKeyResolver, HeaderKeyResolver, KeyResolver};
pub use runtime::{RuntimeOptions, TenantRuntime};
