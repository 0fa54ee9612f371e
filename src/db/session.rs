//! Sessions bound to a unit of work.
//!
//! A session is either an open transaction or a bare checked-out connection.
//! An optional [`OrmLayer`] builds one [`SessionFactory`] per tenant; the
//! factory's initialisation statements run on every session it opens.

use crate::db::pool::{CheckoutGuard, TenantConnection, TenantPool};
use crate::error::{TenantError, TenantResult};
use crate::impl_db_dispatch;
use crate::models::DriverKind;
use sqlx::{MySql, Postgres, Sqlite, Transaction};
use tracing::debug;

/// Database-specific transaction wrapper.
///
/// Dropping an unfinished transaction rolls it back.
pub enum DbTransaction {
    /// MySQL transaction
    MySql(Transaction<'static, MySql>),
    /// PostgreSQL transaction
    Postgres(Transaction<'static, Postgres>),
    /// SQLite transaction
    SQLite(Transaction<'static, Sqlite>),
}

impl std::fmt::Debug for DbTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DbTransaction").field(&self.driver()).finish()
    }
}

impl DbTransaction {
    pub fn driver(&self) -> DriverKind {
        match self {
            DbTransaction::MySql(_) => DriverKind::MySQL,
            DbTransaction::Postgres(_) => DriverKind::PostgreSQL,
            DbTransaction::SQLite(_) => DriverKind::SQLite,
        }
    }

    /// Commit the transaction.
    ///
    /// The raw driver error is returned so callers can inspect its cause chain.
    pub async fn commit(self) -> Result<(), sqlx::Error> {
        impl_db_dispatch!(transaction self, {
            MySql(tx) => tx.commit().await,
            Postgres(tx) => tx.commit().await,
            SQLite(tx) => tx.commit().await,
        })
    }

    /// Rollback the transaction.
    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        impl_db_dispatch!(transaction self, {
            MySql(tx) => tx.rollback().await,
            Postgres(tx) => tx.rollback().await,
            SQLite(tx) => tx.rollback().await,
        })
    }

    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, sql: &str) -> TenantResult<u64> {
        let affected = impl_db_dispatch!(transaction self, {
            MySql(tx) => sqlx::query(sql).execute(&mut **tx).await?.rows_affected(),
            Postgres(tx) => sqlx::query(sql).execute(&mut **tx).await?.rows_affected(),
            SQLite(tx) => sqlx::query(sql).execute(&mut **tx).await?.rows_affected(),
        });
        Ok(affected)
    }

    /// Run a query returning a single integer.
    pub async fn fetch_i64(&mut self, sql: &str) -> TenantResult<i64> {
        let value = impl_db_dispatch!(transaction self, {
            MySql(tx) => sqlx::query_scalar::<_, i64>(sql).fetch_one(&mut **tx).await?,
            Postgres(tx) => sqlx::query_scalar::<_, i64>(sql).fetch_one(&mut **tx).await?,
            SQLite(tx) => sqlx::query_scalar::<_, i64>(sql).fetch_one(&mut **tx).await?,
        });
        Ok(value)
    }

    /// Ask the server to reject writes for the rest of the transaction.
    ///
    /// Only PostgreSQL supports this per transaction; other drivers rely on the
    /// final rollback.
    pub async fn set_read_only(&mut self) -> TenantResult<()> {
        if let DbTransaction::Postgres(tx) = self {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }
}

/// The resource bound to a unit of work.
#[derive(Debug)]
pub enum SessionHandle {
    Transaction {
        /// `None` once committed, rolled back or released
        tx: Option<DbTransaction>,
        guard: CheckoutGuard,
    },
    Connection(TenantConnection),
}

/// How a session should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Open a transaction rather than a bare connection
    pub transactional: bool,
    pub read_only: bool,
}

impl SessionHandle {
    /// Open a session on `pool`, then run the factory's init statements.
    ///
    /// On failure the connection is returned to the pool before the error is.
    pub async fn open(
        pool: &TenantPool,
        options: SessionOptions,
        factory: Option<&SessionFactory>,
    ) -> TenantResult<Self> {
        let mut handle = if options.transactional {
            let (tx, guard) = pool.begin().await?;
            SessionHandle::Transaction { tx: Some(tx), guard }
        } else {
            SessionHandle::Connection(pool.acquire().await?)
        };

        if let Err(e) = handle.prepare(pool.key(), options, factory).await {
            handle.release();
            return Err(e);
        }
        Ok(handle)
    }

    async fn prepare(
        &mut self,
        tenant: &str,
        options: SessionOptions,
        factory: Option<&SessionFactory>,
    ) -> TenantResult<()> {
        if options.read_only {
            if let SessionHandle::Transaction { tx: Some(tx), .. } = self {
                tx.set_read_only().await?;
            }
        }

        if let Some(factory) = factory {
            for statement in factory.init_statements() {
                debug!(tenant = %tenant, statement = %statement, "Running session init statement");
                self.execute(statement).await.map_err(|e| {
                    TenantError::transaction(
                        tenant,
                        format!("session init statement '{}' failed: {}", statement, e),
                    )
                })?;
            }
        }
        Ok(())
    }

    pub fn tenant(&self) -> &str {
        match self {
            SessionHandle::Transaction { guard, .. } => guard.tenant(),
            SessionHandle::Connection(conn) => conn.tenant(),
        }
    }

    /// True while a transaction is open on this session.
    pub fn in_transaction(&self) -> bool {
        matches!(self, SessionHandle::Transaction { tx: Some(_), .. })
    }

    pub fn is_released(&self) -> bool {
        match self {
            SessionHandle::Transaction { guard, .. } => guard.is_released(),
            SessionHandle::Connection(conn) => conn.is_released(),
        }
    }

    pub async fn execute(&mut self, sql: &str) -> TenantResult<u64> {
        match self {
            SessionHandle::Transaction { tx: Some(tx), .. } => tx.execute(sql).await,
            SessionHandle::Connection(conn) => conn.execute(sql).await,
            SessionHandle::Transaction { tx: None, guard } => Err(finished(guard.tenant())),
        }
    }

    pub async fn fetch_i64(&mut self, sql: &str) -> TenantResult<i64> {
        match self {
            SessionHandle::Transaction { tx: Some(tx), .. } => tx.fetch_i64(sql).await,
            SessionHandle::Connection(conn) => conn.fetch_i64(sql).await,
            SessionHandle::Transaction { tx: None, guard } => Err(finished(guard.tenant())),
        }
    }

    /// Commit the open transaction, if any.
    pub async fn commit(&mut self) -> Result<(), sqlx::Error> {
        match self {
            SessionHandle::Transaction { tx, .. } => match tx.take() {
                Some(tx) => tx.commit().await,
                None => Ok(()),
            },
            SessionHandle::Connection(_) => Ok(()),
        }
    }

    /// Roll back the open transaction, if any.
    pub async fn rollback(&mut self) -> Result<(), sqlx::Error> {
        match self {
            SessionHandle::Transaction { tx, .. } => match tx.take() {
                Some(tx) => tx.rollback().await,
                None => Ok(()),
            },
            SessionHandle::Connection(_) => Ok(()),
        }
    }

    /// Return the connection to its pool. Returns false when already released.
    ///
    /// A transaction still open at this point is rolled back by the driver.
    pub fn release(&mut self) -> bool {
        match self {
            SessionHandle::Transaction { tx, guard } => {
                drop(tx.take());
                guard.release()
            }
            SessionHandle::Connection(conn) => conn.release(),
        }
    }
}

fn finished(tenant: &str) -> TenantError {
    TenantError::invalid_state(format!(
        "session for tenant '{}' has already finished",
        tenant
    ))
}

/// Per-tenant session configuration produced by an [`OrmLayer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFactory {
    tenant_key: String,
    layer: String,
    init_statements: Vec<String>,
}

impl SessionFactory {
    pub fn new(
        tenant_key: impl Into<String>,
        layer: impl Into<String>,
        init_statements: Vec<String>,
    ) -> Self {
        Self {
            tenant_key: tenant_key.into(),
            layer: layer.into(),
            init_statements,
        }
    }

    pub fn tenant_key(&self) -> &str {
        &self.tenant_key
    }

    /// Name of the layer that built this factory.
    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn init_statements(&self) -> &[String] {
        &self.init_statements
    }
}

/// Builds a session factory for each tenant pool as it is registered.
pub trait OrmLayer: Send + Sync {
    fn name(&self) -> &str;

    fn build_session_factory(&self, pool: &TenantPool) -> TenantResult<SessionFactory>;
}

/// Runs a fixed list of statements at the start of every session.
#[derive(Debug, Clone, Default)]
pub struct StatementOrmLayer {
    statements: Vec<String>,
}

impl StatementOrmLayer {
    pub fn new(statements: Vec<String>) -> Self {
        Self { statements }
    }
}

impl OrmLayer for StatementOrmLayer {
    fn name(&self) -> &str {
        "statements"
    }

    fn build_session_factory(&self, pool: &TenantPool) -> TenantResult<SessionFactory> {
        if let Some(empty) = self.statements.iter().position(|s| s.trim().is_empty()) {
            return Err(TenantError::configuration(
                pool.key(),
                format!("session init statement #{} is empty", empty + 1),
            ));
        }
        Ok(SessionFactory::new(
            pool.key(),
            self.name(),
            self.statements.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResolvedTenant;
    use std::time::Duration;

    async fn memory_pool() -> TenantPool {
        TenantPool::create(&ResolvedTenant {
            key: "mem".to_string(),
            driver_name: "sqlite".to_string(),
            url: "sqlite::memory:".to_string(),
            user: None,
            pass: None,
            pool_min_size: 0,
            pool_max_size: 1,
            checkout_timeout: Duration::from_millis(500),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_transaction_session_lifecycle() {
        let pool = memory_pool().await;
        let options = SessionOptions {
            transactional: true,
            read_only: false,
        };
        let mut handle = SessionHandle::open(&pool, options, None).await.unwrap();
        assert!(handle.in_transaction());
        assert_eq!(handle.tenant(), "mem");
        assert_eq!(handle.fetch_i64("SELECT 41 + 1").await.unwrap(), 42);

        handle.commit().await.unwrap();
        assert!(!handle.in_transaction());
        assert!(handle.execute("SELECT 1").await.is_err());
        assert!(handle.release());
        assert!(!handle.release());
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_factory_statements_run_on_open() {
        let pool = memory_pool().await;
        let layer = StatementOrmLayer::new(vec![
            "CREATE TEMP TABLE IF NOT EXISTS session_marker (id INTEGER)".to_string(),
            "INSERT INTO session_marker VALUES (1)".to_string(),
        ]);
        let factory = layer.build_session_factory(&pool).unwrap();
        assert_eq!(factory.tenant_key(), "mem");
        assert_eq!(factory.layer(), "statements");

        let options = SessionOptions {
            transactional: false,
            read_only: false,
        };
        let mut handle = SessionHandle::open(&pool, options, Some(&factory))
            .await
            .unwrap();
        assert_eq!(
            handle.fetch_i64("SELECT COUNT(*) FROM session_marker").await.unwrap(),
            1
        );
        handle.release();
    }

    #[tokio::test]
    async fn test_failing_init_statement_releases_connection() {
        let pool = memory_pool().await;
        let factory = SessionFactory::new("mem", "test", vec!["NOT VALID SQL".to_string()]);
        let options = SessionOptions {
            transactional: true,
            read_only: false,
        };
        let err = SessionHandle::open(&pool, options, Some(&factory))
            .await
            .unwrap_err();
        assert!(matches!(err, TenantError::Transaction { .. }));
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_empty_statement_rejected() {
        let pool = memory_pool().await;
        let layer = StatementOrmLayer::new(vec!["  ".to_string()]);
        assert!(matches!(
            layer.build_session_factory(&pool),
            Err(TenantError::Configuration { .. })
        ));
    }
}
