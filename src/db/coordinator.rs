//! Unit-of-work transaction coordination.
//!
//! A [`UnitOfWork`] is the per-request slot holding at most one bound
//! [`ExecutionContext`]. The coordinator's four hooks move it through its
//! lifecycle:
//!
//! ```text
//! Idle --before--> Bound | Active --after--> Committed | RolledBack | Idle
//!                                 --on_error / finally--> RolledBack
//! ```
//!
//! Cleanup always releases the connection, whatever happened before it, and
//! is a no-op on a slot with nothing bound.

use crate::db::registry::TenantRegistry;
use crate::db::session::{SessionHandle, SessionOptions};
use crate::error::{TenantError, TenantResult};
use crate::models::{AccessIntent, RequestContext, UnitOutcome, UnitState};
use crate::resolver::KeyResolver;
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether the process may run without any tenant database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DatabaseMode {
    #[default]
    Required,
    /// Units of work are skipped while no tenant is registered
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Open a transaction per unit of work (otherwise a bare connection)
    pub auto_transactions: bool,
    pub database_mode: DatabaseMode,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            auto_transactions: true,
            database_mode: DatabaseMode::Required,
        }
    }
}

/// What is bound to a unit of work while it runs.
#[derive(Debug)]
pub struct ExecutionContext {
    tenant_key: String,
    handle: SessionHandle,
    read_only: bool,
    rollback_only: bool,
}

/// Per-request context slot.
#[derive(Debug)]
pub struct UnitOfWork {
    id: String,
    state: UnitState,
    outcome: Option<UnitOutcome>,
    context: Option<ExecutionContext>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self {
            id: generate_unit_id(),
            state: UnitState::Idle,
            outcome: None,
            context: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    /// How the unit of work ended; `None` until it has.
    pub fn outcome(&self) -> Option<UnitOutcome> {
        self.outcome
    }

    pub fn is_bound(&self) -> bool {
        self.context.is_some()
    }

    pub fn tenant_key(&self) -> Option<&str> {
        self.context.as_ref().map(|c| c.tenant_key.as_str())
    }

    pub fn is_read_only(&self) -> bool {
        self.context.as_ref().is_some_and(|c| c.read_only)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.context.as_ref().is_some_and(|c| c.rollback_only)
    }

    /// Make the unit of work end in rollback. Returns false when unbound.
    pub fn set_rollback_only(&mut self) -> bool {
        match &mut self.context {
            Some(ctx) => {
                ctx.rollback_only = true;
                true
            }
            None => false,
        }
    }

    /// The bound session.
    pub fn session(&mut self) -> TenantResult<&mut SessionHandle> {
        let id = &self.id;
        match &mut self.context {
            Some(ctx) => Ok(&mut ctx.handle),
            None => Err(TenantError::invalid_state(format!(
                "unit of work {} has no tenant bound",
                id
            ))),
        }
    }

    pub async fn execute(&mut self, sql: &str) -> TenantResult<u64> {
        self.session()?.execute(sql).await
    }

    pub async fn fetch_i64(&mut self, sql: &str) -> TenantResult<i64> {
        self.session()?.fetch_i64(sql).await
    }
}

impl Default for UnitOfWork {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Some(ctx) = &self.context {
            // The session's own drop rolls back and returns the connection
            warn!(
                unit_of_work = %self.id,
                tenant = %ctx.tenant_key,
                "Unit of work dropped while bound; rolling back"
            );
        }
    }
}

/// Generate a unique unit-of-work ID.
fn generate_unit_id() -> String {
    format!("uow_{}", uuid::Uuid::new_v4().simple())
}

/// Binds units of work to tenant sessions and finishes them.
pub struct TransactionCoordinator {
    registry: Arc<TenantRegistry>,
    resolver: Arc<dyn KeyResolver>,
    options: CoordinatorOptions,
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("resolver", &self.resolver.name())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TransactionCoordinator {
    pub fn new(
        registry: Arc<TenantRegistry>,
        resolver: Arc<dyn KeyResolver>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            registry,
            resolver,
            options,
        }
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<dyn KeyResolver> {
        &self.resolver
    }

    pub fn options(&self) -> CoordinatorOptions {
        self.options
    }

    /// Resolve the request's tenant and bind a session to `uow`.
    ///
    /// A request without a tenant key leaves `uow` idle. An unknown key fails
    /// with `UnknownTenant` and leaves nothing bound.
    pub async fn before_unit_of_work(
        &self,
        uow: &mut UnitOfWork,
        request: &RequestContext,
        intent: AccessIntent,
    ) -> TenantResult<()> {
        if let Some(ctx) = &uow.context {
            return Err(TenantError::invalid_state(format!(
                "unit of work {} is already bound to tenant '{}'",
                uow.id, ctx.tenant_key
            )));
        }
        uow.state = UnitState::Idle;
        uow.outcome = None;

        if self.options.database_mode == DatabaseMode::Optional && self.registry.is_empty().await
        {
            debug!(unit_of_work = %uow.id, "No tenant registered; skipping unit of work");
            return Ok(());
        }

        let Some(key) = self.resolver.extract_key(request) else {
            debug!(unit_of_work = %uow.id, resolver = %self.resolver.name(), "No tenant key in request");
            return Ok(());
        };

        let entry = self
            .registry
            .get(&key)
            .await
            .ok_or_else(|| TenantError::unknown_tenant(&key))?;

        let factory = entry.session_factory();
        if self.registry.orm_layer().is_some() && factory.is_none() {
            return Err(TenantError::unknown_tenant(&key));
        }

        let read_only = intent.is_read_only();
        let options = SessionOptions {
            transactional: self.options.auto_transactions,
            read_only,
        };
        let handle = SessionHandle::open(entry.pool(), options, factory.map(|f| f.as_ref())).await?;

        uow.state = if handle.in_transaction() {
            UnitState::Active
        } else {
            UnitState::Bound
        };
        uow.context = Some(ExecutionContext {
            tenant_key: key,
            handle,
            read_only,
            rollback_only: false,
        });

        debug!(
            unit_of_work = %uow.id,
            tenant = uow.tenant_key().unwrap_or_default(),
            state = %uow.state,
            "Unit of work bound"
        );
        Ok(())
    }

    /// Finish a unit of work that completed normally.
    ///
    /// Read-only and rollback-only units roll back, others commit. The
    /// connection is released whatever the outcome.
    pub async fn after_unit_of_work(&self, uow: &mut UnitOfWork) -> TenantResult<()> {
        let Some(mut ctx) = uow.context.take() else {
            uow.outcome = Some(UnitOutcome::Skipped);
            return Ok(());
        };

        let result = if !ctx.handle.in_transaction() {
            uow.state = UnitState::Idle;
            uow.outcome = Some(UnitOutcome::Released);
            Ok(())
        } else if ctx.read_only || ctx.rollback_only {
            uow.state = UnitState::RolledBack;
            uow.outcome = Some(UnitOutcome::RolledBack);
            ctx.handle
                .rollback()
                .await
                .map_err(|e| TenantError::transaction(&ctx.tenant_key, e.to_string()))
        } else {
            match ctx.handle.commit().await {
                Ok(()) => {
                    uow.state = UnitState::Committed;
                    uow.outcome = Some(UnitOutcome::Committed);
                    Ok(())
                }
                Err(e) => {
                    uow.state = UnitState::RolledBack;
                    uow.outcome = Some(UnitOutcome::RolledBack);
                    Err(TenantError::transaction_commit(&ctx.tenant_key, &e))
                }
            }
        };

        ctx.handle.release();

        match &result {
            Ok(()) => debug!(
                unit_of_work = %uow.id,
                tenant = %ctx.tenant_key,
                state = %uow.state,
                "Unit of work finished"
            ),
            Err(e) => warn!(
                unit_of_work = %uow.id,
                tenant = %ctx.tenant_key,
                error = %e,
                "Unit of work failed to finish"
            ),
        }
        result
    }

    /// The unit of work raised; roll back and release.
    pub async fn on_error(&self, uow: &mut UnitOfWork, cause: &(dyn fmt::Display + Sync)) {
        if let Some(tenant) = uow.tenant_key() {
            warn!(
                unit_of_work = %uow.id,
                tenant = %tenant,
                error = %cause,
                "Unit of work raised; rolling back"
            );
        }
        self.force_rollback(uow).await;
    }

    /// Last hook of every unit of work. Rolls back anything still bound.
    pub async fn finally_cleanup(&self, uow: &mut UnitOfWork) {
        self.force_rollback(uow).await;
    }

    async fn force_rollback(&self, uow: &mut UnitOfWork) {
        let Some(mut ctx) = uow.context.take() else {
            return;
        };

        let had_transaction = ctx.handle.in_transaction();
        if let Err(e) = ctx.handle.rollback().await {
            warn!(
                unit_of_work = %uow.id,
                tenant = %ctx.tenant_key,
                error = %e,
                "Rollback failed"
            );
        }
        ctx.handle.release();

        uow.state = UnitState::RolledBack;
        uow.outcome = Some(if had_transaction {
            UnitOutcome::RolledBack
        } else {
            UnitOutcome::Released
        });
        debug!(unit_of_work = %uow.id, tenant = %ctx.tenant_key, "Unit of work rolled back");
    }

    /// Run `work` inside a unit of work for `request`.
    ///
    /// Ok results are committed (or rolled back when read-only), errors roll
    /// back, and the connection is released in every case. A commit failure
    /// replaces the Ok result.
    pub async fn run<T, E, F>(
        &self,
        request: &RequestContext,
        intent: AccessIntent,
        work: F,
    ) -> Result<T, E>
    where
        F: for<'a> FnOnce(&'a mut UnitOfWork) -> BoxFuture<'a, Result<T, E>>,
        E: From<TenantError> + fmt::Display + Sync,
    {
        let mut uow = UnitOfWork::new();
        if let Err(e) = self.before_unit_of_work(&mut uow, request, intent).await {
            self.finally_cleanup(&mut uow).await;
            return Err(E::from(e));
        }

        let result = match work(&mut uow).await {
            Ok(value) => self
                .after_unit_of_work(&mut uow)
                .await
                .map(|()| value)
                .map_err(E::from),
            Err(e) => {
                self.on_error(&mut uow, &e).await;
                Err(e)
            }
        };

        self.finally_cleanup(&mut uow).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::DomainKeyResolver;

    fn coordinator(mode: DatabaseMode) -> TransactionCoordinator {
        TransactionCoordinator::new(
            Arc::new(TenantRegistry::new()),
            Arc::new(DomainKeyResolver),
            CoordinatorOptions {
                auto_transactions: true,
                database_mode: mode,
            },
        )
    }

    #[test]
    fn test_unit_id_format() {
        let uow = UnitOfWork::new();
        assert!(uow.id().starts_with("uow_"));
        assert_eq!(uow.id().len(), 4 + 32); // "uow_" + 32 hex chars
        assert_eq!(uow.state(), UnitState::Idle);
    }

    #[test]
    fn test_unbound_unit_rejects_session_access() {
        let mut uow = UnitOfWork::new();
        assert!(!uow.set_rollback_only());
        assert!(matches!(uow.session(), Err(TenantError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_unknown_tenant_leaves_unit_unbound() {
        let coordinator = coordinator(DatabaseMode::Required);
        let mut uow = UnitOfWork::new();
        let err = coordinator
            .before_unit_of_work(
                &mut uow,
                &RequestContext::for_domain("nobody.example.com"),
                AccessIntent::ReadWrite,
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!uow.is_bound());
        assert_eq!(uow.state(), UnitState::Idle);
    }

    #[tokio::test]
    async fn test_optional_mode_skips_without_tenants() {
        let coordinator = coordinator(DatabaseMode::Optional);
        let mut uow = UnitOfWork::new();
        coordinator
            .before_unit_of_work(
                &mut uow,
                &RequestContext::for_domain("nobody.example.com"),
                AccessIntent::ReadWrite,
            )
            .await
            .unwrap();
        assert!(!uow.is_bound());
        coordinator.after_unit_of_work(&mut uow).await.unwrap();
        assert_eq!(uow.outcome(), Some(UnitOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_cleanup_on_unbound_unit_is_noop() {
        let coordinator = coordinator(DatabaseMode::Required);
        let mut uow = UnitOfWork::new();
        coordinator.on_error(&mut uow, &"boom").await;
        coordinator.finally_cleanup(&mut uow).await;
        coordinator.finally_cleanup(&mut uow).await;
        assert_eq!(uow.state(), UnitState::Idle);
        assert_eq!(uow.outcome(), None);
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_hook_futures_are_send() {
        let coordinator = coordinator(DatabaseMode::Required);
        let mut uow = UnitOfWork::new();
        let cause = String::from("handler responded 500");
        let on_error = coordinator.on_error(&mut uow, &cause);
        assert_send(&on_error);
        drop(on_error);

        let request = RequestContext::for_domain("a.example.com");
        let before = coordinator.before_unit_of_work(&mut uow, &request, AccessIntent::ReadWrite);
        assert_send(&before);
        drop(before);
        assert_send(&coordinator.after_unit_of_work(&mut uow));
        assert_send(&coordinator.finally_cleanup(&mut uow));
    }

    #[tokio::test]
    async fn test_request_without_key_stays_idle() {
        let coordinator = coordinator(DatabaseMode::Required);
        let value: Result<u32, TenantError> = coordinator
            .run(&RequestContext::new(), AccessIntent::ReadWrite, |uow| {
                Box::pin(async move {
                    assert!(!uow.is_bound());
                    Ok(7)
                })
            })
            .await;
        assert_eq!(value.unwrap(), 7);
    }
}
