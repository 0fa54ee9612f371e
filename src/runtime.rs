//! Process-level tenant orchestration.
//!
//! [`TenantRuntime::start`] reconciles configuration with an empty registry,
//! builds every tenant it can, and only then hands out the coordinator, so no
//! unit of work resolves a key against a half-built registry.

use crate::config::{ALL_TENANTS_KEY, Config, DEFAULT_PREFIX};
use crate::db::config_store::TenantConfigStore;
use crate::db::coordinator::{CoordinatorOptions, DatabaseMode, TransactionCoordinator};
use crate::db::registry::{AddedTenant, ReconcileReport, TenantRegistry};
use crate::db::session::{OrmLayer, StatementOrmLayer};
use crate::error::{TenantError, TenantResult};
use crate::models::{TenantParameters, TenantSummary};
use crate::resolver::{KeyResolver, ResolverChoice, select_resolver};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const STATUS_RULE: &str = "=================================================";
const STATUS_SUBRULE: &str = "~~~~~~~~~~~";
const NOT_CONNECTED: &str = "(not yet connected)";

/// Everything `start` needs besides the raw settings.
#[derive(Clone)]
pub struct RuntimeOptions {
    pub prefix: String,
    pub coordinator: CoordinatorOptions,
    /// Registered resolver candidates; at most one may be given
    pub resolvers: Vec<Arc<dyn KeyResolver>>,
    pub orm_layer: Option<Arc<dyn OrmLayer>>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            coordinator: CoordinatorOptions::default(),
            resolvers: Vec::new(),
            orm_layer: None,
        }
    }
}

impl RuntimeOptions {
    pub fn from_config(config: &Config) -> TenantResult<Self> {
        let resolver = ResolverChoice::parse(&config.key_resolver)?.build();
        let orm_layer: Option<Arc<dyn OrmLayer>> = if config.session_init.is_empty() {
            None
        } else {
            Some(Arc::new(StatementOrmLayer::new(config.session_init.clone())))
        };

        Ok(Self {
            prefix: config.prefix.clone(),
            coordinator: CoordinatorOptions {
                auto_transactions: !config.no_auto_transactions,
                database_mode: if config.allow_no_database {
                    DatabaseMode::Optional
                } else {
                    DatabaseMode::Required
                },
            },
            resolvers: vec![resolver],
            orm_layer,
        })
    }
}

/// What a reconcile-and-build pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadSummary {
    pub report: ReconcileReport,
    pub built: Vec<AddedTenant>,
    /// Tenants that could not be built, with the reason
    pub failed: Vec<FailedTenant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedTenant {
    pub key: String,
    pub error: String,
}

/// Serializable status of the runtime.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub resolver: String,
    pub auto_transactions: bool,
    pub database_required: bool,
    pub tenants: Vec<TenantSummary>,
    /// Configured tenants without a live pool
    pub pending: Vec<String>,
}

pub struct TenantRuntime {
    store: TenantConfigStore,
    registry: Arc<TenantRegistry>,
    coordinator: Arc<TransactionCoordinator>,
    settings: RwLock<BTreeMap<String, TenantParameters>>,
}

impl TenantRuntime {
    /// Build every configured tenant and return a runtime ready for units of
    /// work.
    ///
    /// A tenant that fails to build is logged and skipped. Fails with
    /// `NoDatabaseConfigured` when no tenant could be built and a database is
    /// required.
    pub async fn start(options: RuntimeOptions, raw: &BTreeMap<String, String>) -> TenantResult<Self> {
        let resolver = select_resolver(options.resolvers)?;
        let store = TenantConfigStore::new(options.prefix);
        let registry = Arc::new(match options.orm_layer {
            Some(layer) => TenantRegistry::with_orm_layer(layer),
            None => TenantRegistry::new(),
        });

        let tenants = store.extract(raw);
        let summary = build_changed(&registry, &tenants).await;

        if registry.is_empty().await {
            match options.coordinator.database_mode {
                DatabaseMode::Required => {
                    error!(
                        failed = summary.failed.len(),
                        "Cannot start without a properly configured database"
                    );
                    return Err(TenantError::NoDatabaseConfigured);
                }
                DatabaseMode::Optional => {
                    warn!("No tenant database configured; units of work will be skipped");
                }
            }
        }

        info!(
            tenants = registry.len().await,
            failed = summary.failed.len(),
            resolver = %resolver.name(),
            "Tenant runtime started"
        );

        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&registry),
            resolver,
            options.coordinator,
        ));

        Ok(Self {
            store,
            registry,
            coordinator,
            settings: RwLock::new(tenants),
        })
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// Re-read settings and rebuild tenants that are missing, drifted or broken.
    pub async fn reload(&self, raw: &BTreeMap<String, String>) -> ReloadSummary {
        let tenants = self.store.extract(raw);
        let summary = build_changed(&self.registry, &tenants).await;
        *self.settings.write().await = tenants;

        info!(
            changed = summary.report.changes.len(),
            built = summary.built.len(),
            failed = summary.failed.len(),
            "Tenant configuration reloaded"
        );
        summary
    }

    /// Add or update one tenant at runtime.
    ///
    /// `fields` uses field names without a tenant suffix (`driver`, `url`,
    /// `pool.maxSize`, ...). Unset fields inherit the configured `all` record.
    pub async fn add_tenant(
        &self,
        key: &str,
        fields: &BTreeMap<String, String>,
    ) -> TenantResult<AddedTenant> {
        let key = key.trim();
        if key.is_empty() || key == ALL_TENANTS_KEY {
            return Err(TenantError::configuration(
                key,
                "tenant key must be non-empty and not 'all'",
            ));
        }

        let mut params = TenantParameters::from_fields(fields);
        let all = self
            .settings
            .read()
            .await
            .get(ALL_TENANTS_KEY)
            .cloned()
            .unwrap_or_default();
        params.apply_inheritance(&all);

        let tenant = params.resolve(key)?;
        let added = self.registry.add_tenant(tenant).await.inspect_err(|e| {
            error!(tenant = %key, error = %e, "Cannot add tenant");
        })?;
        Ok(added)
    }

    pub async fn remove_tenant(&self, key: &str) -> bool {
        self.registry.remove_tenant(key).await
    }

    /// Registry keys of every configured (non-`all`) tenant.
    async fn configured_keys(&self) -> BTreeSet<String> {
        let settings = self.settings.read().await;
        settings
            .iter()
            .filter(|(key, _)| key.as_str() != ALL_TENANTS_KEY)
            .map(|(key, params)| params.registry_key(key).to_string())
            .collect()
    }

    pub async fn status(&self) -> RuntimeStatus {
        let tenants = self.registry.summaries().await;
        let live: BTreeSet<&str> = tenants.iter().map(|t| t.key.as_str()).collect();
        let pending = self
            .configured_keys()
            .await
            .into_iter()
            .filter(|key| !live.contains(key.as_str()))
            .collect();
        let options = self.coordinator.options();

        RuntimeStatus {
            resolver: self.coordinator.resolver().name(),
            auto_transactions: options.auto_transactions,
            database_required: options.database_mode == DatabaseMode::Required,
            tenants,
            pending,
        }
    }

    /// Human-readable dump of every configured or registered tenant.
    pub async fn status_text(&self) -> String {
        let status = self.status().await;
        let mut out = String::new();
        let _ = writeln!(out, "         Multiple DB sources:");
        let _ = writeln!(out, "{}", STATUS_RULE);

        if status.tenants.is_empty() && status.pending.is_empty() {
            let _ = writeln!(out, "Datasources:");
            let _ = writeln!(out, "{}", STATUS_SUBRULE);
            let _ = writeln!(out, "{}", NOT_CONNECTED);
            return out;
        }

        let mut rows: BTreeMap<&str, Option<&TenantSummary>> = BTreeMap::new();
        for key in &status.pending {
            rows.insert(key.as_str(), None);
        }
        for tenant in &status.tenants {
            rows.insert(tenant.key.as_str(), Some(tenant));
        }

        for (key, tenant) in rows {
            let _ = writeln!(out, "Datasource [{}]:", key);
            let _ = writeln!(out, "{}", STATUS_SUBRULE);
            match tenant {
                None => {
                    let _ = writeln!(out, "{}", NOT_CONNECTED);
                }
                Some(t) => {
                    let _ = writeln!(out, "Url: {}", t.url);
                    let _ = writeln!(out, "Driver: {}", t.driver);
                    let _ = writeln!(out, "User: {}", t.user.as_deref().unwrap_or(""));
                    let _ = writeln!(out, "Min pool size: {}", t.pool_min_size);
                    let _ = writeln!(out, "Max pool size: {}", t.pool_max_size);
                    let _ = writeln!(out, "Checkout timeout: {} ms", t.checkout_timeout_ms);
                    let _ = writeln!(out, "Connections: {} open, {} in use", t.size, t.in_use);
                    if t.broken {
                        let _ = writeln!(out, "Pool is broken");
                    }
                    let _ = writeln!(out);
                }
            }
        }
        let _ = writeln!(out, "{}", STATUS_RULE);
        out
    }

    /// Close every tenant pool.
    pub async fn shutdown(&self) {
        self.registry.close_all().await;
    }
}

/// Reconcile `tenants` against the registry and build what changed.
///
/// Failures are contained per tenant.
async fn build_changed(
    registry: &TenantRegistry,
    tenants: &BTreeMap<String, TenantParameters>,
) -> ReloadSummary {
    let report = registry.reconcile(tenants).await;
    let changed = report.changed_keys();
    // Never built, but reported so the clash shows up in every summary
    let conflicts = TenantConfigStore::conflicting_keys(tenants);

    let builds = TenantConfigStore::desired(tenants)
        .into_iter()
        .filter(|(key, _)| changed.contains(key.as_str()) || conflicts.contains(key))
        .map(|(key, resolved)| async move {
            let result = match resolved {
                Ok(tenant) => registry.add_tenant(tenant).await,
                Err(e) => Err(e),
            };
            (key, result)
        });

    let mut summary = ReloadSummary::default();
    for (key, result) in join_all(builds).await {
        match result {
            Ok(added) => summary.built.push(added),
            Err(e) => {
                error!(tenant = %key, error = %e, "Cannot connect to the database");
                summary.failed.push(FailedTenant {
                    key,
                    error: e.to_string(),
                });
            }
        }
    }
    summary.report = report;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{DomainKeyResolver, HeaderKeyResolver};

    fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn options(mode: DatabaseMode) -> RuntimeOptions {
        RuntimeOptions {
            prefix: "mdb".to_string(),
            coordinator: CoordinatorOptions {
                auto_transactions: true,
                database_mode: mode,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_requires_database() {
        let result = TenantRuntime::start(options(DatabaseMode::Required), &BTreeMap::new()).await;
        assert!(matches!(result, Err(TenantError::NoDatabaseConfigured)));
    }

    #[tokio::test]
    async fn test_start_tolerates_no_database_when_optional() {
        let runtime = TenantRuntime::start(options(DatabaseMode::Optional), &BTreeMap::new())
            .await
            .unwrap();
        assert!(runtime.registry().is_empty().await);
        let text = runtime.status_text().await;
        assert!(text.contains("Multiple DB sources"));
        assert!(text.contains(NOT_CONNECTED));
    }

    #[tokio::test]
    async fn test_start_rejects_two_resolvers() {
        let mut opts = options(DatabaseMode::Optional);
        opts.resolvers = vec![
            Arc::new(DomainKeyResolver),
            Arc::new(HeaderKeyResolver::default()),
        ];
        let result = TenantRuntime::start(opts, &BTreeMap::new()).await;
        assert!(matches!(result, Err(TenantError::ResolverConflict { .. })));
    }

    #[tokio::test]
    async fn test_failed_tenant_is_contained_and_pending() {
        let runtime = TenantRuntime::start(
            options(DatabaseMode::Required),
            &settings(&[
                ("mdb.driver.all", "sqlite"),
                ("mdb.url.good", "sqlite::memory:"),
                ("mdb.url.bad", "sqlite::memory:"),
                ("mdb.driver.bad", "oracle"),
            ]),
        )
        .await
        .unwrap();

        assert_eq!(runtime.registry().keys().await, vec!["good".to_string()]);
        let status = runtime.status().await;
        assert_eq!(status.pending, vec!["bad".to_string()]);
        assert_eq!(status.resolver, "domain");

        let text = runtime.status_text().await;
        assert!(text.contains("Datasource [bad]:"));
        assert!(text.contains("Datasource [good]:"));
        assert!(text.contains("Driver: sqlite"));
        runtime.shutdown().await;
        assert!(runtime.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_hot_add_inherits_all_defaults() {
        let runtime = TenantRuntime::start(
            options(DatabaseMode::Required),
            &settings(&[
                ("mdb.driver.all", "sqlite"),
                ("mdb.pool.maxSize.all", "3"),
                ("mdb.url.a", "sqlite::memory:"),
            ]),
        )
        .await
        .unwrap();

        let added = runtime
            .add_tenant("c", &settings(&[("url", "sqlite::memory:")]))
            .await
            .unwrap();
        assert_eq!(added.key, "c");

        let entry = runtime.registry().get("c").await.unwrap();
        assert_eq!(entry.pool().tenant().pool_max_size, 3);
        assert_eq!(entry.pool().tenant().driver_name, "sqlite");

        assert!(runtime.add_tenant("all", &BTreeMap::new()).await.is_err());
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default_config();
        config.allow_no_database = true;
        config.no_auto_transactions = true;
        config.key_resolver = "header:X-Org".to_string();
        config.session_init = vec!["SELECT 1".to_string()];

        let opts = RuntimeOptions::from_config(&config).unwrap();
        assert_eq!(opts.coordinator.database_mode, DatabaseMode::Optional);
        assert!(!opts.coordinator.auto_transactions);
        assert_eq!(opts.resolvers[0].name(), "header:X-Org");
        assert!(opts.orm_layer.is_some());

        config.key_resolver = "cookie".to_string();
        assert!(RuntimeOptions::from_config(&config).is_err());
    }
}
