//! Registry of live tenant pools.
//!
//! The registry is shared by every unit of work. Readers clone an entry under
//! a brief read lock; structural changes build everything outside the lock and
//! publish the finished entry in one write, so a reader sees either the old
//! state or the complete new entry.

use crate::config::ALL_TENANTS_KEY;
use crate::db::config_store::TenantConfigStore;
use crate::db::pool::TenantPool;
use crate::db::session::{OrmLayer, SessionFactory};
use crate::error::TenantResult;
use crate::models::{ResolvedTenant, TenantParameters, TenantSummary};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// A published tenant: its pool and, when an ORM layer is attached, its
/// session factory.
#[derive(Debug)]
pub struct TenantEntry {
    pool: Arc<TenantPool>,
    session_factory: Option<Arc<SessionFactory>>,
}

impl TenantEntry {
    pub fn key(&self) -> &str {
        self.pool.key()
    }

    pub fn pool(&self) -> &Arc<TenantPool> {
        &self.pool
    }

    pub fn session_factory(&self) -> Option<&Arc<SessionFactory>> {
        self.session_factory.as_ref()
    }

    pub fn summary(&self) -> TenantSummary {
        let mut summary = self.pool.summary();
        summary.has_session_factory = self.session_factory.is_some();
        summary
    }
}

/// Shared reference to a published entry. Stays valid after replacement.
pub type TenantHandle = Arc<TenantEntry>;

/// Why a configured tenant needs (re)building.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    /// Configured but not registered
    Missing,
    /// Registered with different connection settings
    Drifted { fields: Vec<&'static str> },
    /// Registered but its pool stopped handing out connections
    Broken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantChange {
    pub key: String,
    #[serde(flatten)]
    pub kind: ChangeKind,
}

/// Result of comparing configuration with the live registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub changes: Vec<TenantChange>,
    /// Registered tenants absent from configuration (hot-added or removed)
    pub orphaned: Vec<String>,
}

impl ReconcileReport {
    /// True when at least one configured tenant needs building.
    pub fn changed(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn changed_keys(&self) -> BTreeSet<&str> {
        self.changes.iter().map(|c| c.key.as_str()).collect()
    }
}

/// How `add_tenant` changed the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOutcome {
    Created,
    Replaced,
    /// Same settings and a healthy pool; nothing was built
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddedTenant {
    pub key: String,
    pub outcome: AddOutcome,
}

#[derive(Default)]
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, TenantHandle>>,
    orm_layer: Option<Arc<dyn OrmLayer>>,
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("orm_layer", &self.orm_layer.as_ref().map(|l| l.name().to_string()))
            .finish_non_exhaustive()
    }
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose entries each get a session factory from `layer`.
    pub fn with_orm_layer(layer: Arc<dyn OrmLayer>) -> Self {
        Self {
            tenants: RwLock::new(HashMap::new()),
            orm_layer: Some(layer),
        }
    }

    pub fn orm_layer(&self) -> Option<&Arc<dyn OrmLayer>> {
        self.orm_layer.as_ref()
    }

    /// Compare configured tenants with the registry without changing it.
    ///
    /// `tenants` is the output of the config store, `all` record included.
    /// Tenants still missing a driver or url after inheritance are skipped, as
    /// are tenants sharing a registry key with another tenant.
    pub async fn reconcile(
        &self,
        tenants: &BTreeMap<String, TenantParameters>,
    ) -> ReconcileReport {
        let all = tenants.get(ALL_TENANTS_KEY).cloned().unwrap_or_default();
        let conflicts = TenantConfigStore::conflicting_keys(tenants);
        let live = self.tenants.read().await.clone();

        let mut report = ReconcileReport::default();
        let mut configured = BTreeSet::new();

        for (map_key, params) in tenants {
            if map_key == ALL_TENANTS_KEY {
                continue;
            }
            let mut params = params.clone();
            params.apply_inheritance(&all);
            let key = params.registry_key(map_key).to_string();
            if conflicts.contains(&key) {
                continue;
            }

            let Some(desired) = params.identity() else {
                warn!(tenant = %key, "Skipping tenant without driver and url");
                continue;
            };
            configured.insert(key.clone());

            let kind = match live.get(&key) {
                None => Some(ChangeKind::Missing),
                Some(entry) if entry.pool.is_broken() => Some(ChangeKind::Broken),
                Some(entry) => {
                    let fields = entry.pool.identity().drift(&desired);
                    (!fields.is_empty()).then_some(ChangeKind::Drifted { fields })
                }
            };

            if let Some(kind) = kind {
                debug!(tenant = %key, change = ?kind, "Tenant needs building");
                report.changes.push(TenantChange { key, kind });
            }
        }

        let mut orphaned: Vec<String> = live
            .keys()
            .filter(|key| !configured.contains(key.as_str()))
            .cloned()
            .collect();
        orphaned.sort();
        report.orphaned = orphaned;

        report
    }

    /// Build and publish a tenant.
    ///
    /// The pool and session factory are built before the registry is locked.
    /// A replaced pool is closed after the swap; units of work still holding
    /// its connections finish normally.
    pub async fn add_tenant(&self, tenant: ResolvedTenant) -> TenantResult<AddedTenant> {
        let key = tenant.key.clone();

        // Early check for an identical, healthy entry
        if let Some(existing) = self.get(&key).await {
            if existing.pool.tenant() == &tenant && !existing.pool.is_broken() {
                debug!(tenant = %key, "Tenant unchanged");
                return Ok(AddedTenant {
                    key,
                    outcome: AddOutcome::Unchanged,
                });
            }
        }

        let pool = Arc::new(TenantPool::create(&tenant).await?);
        let session_factory = match &self.orm_layer {
            Some(layer) => match layer.build_session_factory(&pool) {
                Ok(factory) => Some(Arc::new(factory)),
                Err(e) => {
                    pool.close().await;
                    return Err(e);
                }
            },
            None => None,
        };

        let entry = Arc::new(TenantEntry {
            pool,
            session_factory,
        });

        let previous = {
            let mut tenants = self.tenants.write().await;
            tenants.insert(key.clone(), entry)
        }; // Lock released here

        let outcome = match previous {
            Some(old) => {
                info!(tenant = %key, "Tenant pool replaced");
                retire(old);
                AddOutcome::Replaced
            }
            None => {
                info!(tenant = %key, "Tenant pool registered");
                AddOutcome::Created
            }
        };

        Ok(AddedTenant { key, outcome })
    }

    /// Unregister a tenant and close its pool.
    pub async fn remove_tenant(&self, key: &str) -> bool {
        let removed = {
            let mut tenants = self.tenants.write().await;
            tenants.remove(key)
        };
        match removed {
            Some(entry) => {
                info!(tenant = %key, "Tenant removed");
                retire(entry);
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, key: &str) -> Option<TenantHandle> {
        let tenants = self.tenants.read().await;
        tenants.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        let tenants = self.tenants.read().await;
        tenants.contains_key(key)
    }

    /// Registered keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let tenants = self.tenants.read().await;
        let mut keys: Vec<String> = tenants.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        let tenants = self.tenants.read().await;
        tenants.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Summaries of every registered tenant, sorted by key.
    pub async fn summaries(&self) -> Vec<TenantSummary> {
        let entries: Vec<TenantHandle> = {
            let tenants = self.tenants.read().await;
            tenants.values().cloned().collect()
        };
        let mut summaries: Vec<TenantSummary> = entries.iter().map(|e| e.summary()).collect();
        summaries.sort_by(|a, b| a.key.cmp(&b.key));
        summaries
    }

    /// Unregister every tenant and close all pools.
    pub async fn close_all(&self) {
        let drained: Vec<(String, TenantHandle)> = {
            let mut tenants = self.tenants.write().await;
            tenants.drain().collect()
        };
        for (key, entry) in drained {
            info!(tenant = %key, "Closing tenant");
            entry.pool.close().await;
        }
        info!("All tenant pools closed");
    }
}

/// Close a superseded entry's pool in the background.
///
/// sqlx's close waits for checked-out connections to come back, so awaiting it
/// here would stall the caller until in-flight units of work finish.
fn retire(entry: TenantHandle) {
    tokio::spawn(async move {
        entry.pool.close().await;
        debug!(tenant = %entry.key(), "Superseded pool closed");
    });
}
