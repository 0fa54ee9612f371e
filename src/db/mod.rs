//! Database layer of the tenant router.
//!
//! This module provides:
//! - Extraction of per-tenant settings from a flat key space
//! - Per-tenant connection pools with bounded checkout
//! - Sessions and transactions over a checked-out connection
//! - The tenant registry and its reconciliation against settings
//! - The transaction coordinator driving units of work
//! - Database dispatch macros for reducing code duplication

pub mod config_store;
pub mod coordinator;
pub mod macros;
pub mod pool;
pub mod registry;
pub mod session;

pub use config_store::TenantConfigStore;
pub use coordinator::{
    CoordinatorOptions, DatabaseMode, ExecutionContext, TransactionCoordinator, UnitOfWork,
};
pub use pool::{AcquirePolicy, CheckoutGuard, DbConnection, DbPool, TenantConnection, TenantPool};
pub use registry::{
    AddOutcome, AddedTenant, ChangeKind, ReconcileReport, TenantChange, TenantEntry, TenantHandle,
    TenantRegistry,
};
pub use session::{
    DbTransaction, OrmLayer, SessionFactory, SessionHandle, SessionOptions, StatementOrmLayer,
};
