//! Tenant configuration extraction.
//!
//! Reads `prefix.<field>.<tenant>` entries out of a flat settings mapping and
//! groups them into one [`TenantParameters`] record per tenant.

use crate::config::{ALL_TENANTS_KEY, DEFAULT_PREFIX};
use crate::error::{TenantError, TenantResult};
use crate::models::{ResolvedTenant, TenantField, TenantParameters};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TenantConfigStore {
    prefix: String,
}

impl TenantConfigStore {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('.').to_string();
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Group the prefixed settings by tenant key.
    ///
    /// The tenant key is the segment after the last `.`, so tenant keys never
    /// contain dots (use the `key` field to register a dotted key). The reserved
    /// `all` record is included. Keys without the prefix are ignored; prefixed
    /// keys with an unknown field or no tenant segment are skipped with a warning.
    pub fn extract(&self, raw: &BTreeMap<String, String>) -> BTreeMap<String, TenantParameters> {
        let head = format!("{}.", self.prefix);
        let mut tenants: BTreeMap<String, TenantParameters> = BTreeMap::new();

        for (name, value) in raw {
            let Some(rest) = name.strip_prefix(&head) else {
                continue;
            };

            let Some((field_name, tenant)) = rest.rsplit_once('.') else {
                warn!(setting = %name, "Skipping tenant setting without a tenant key");
                continue;
            };
            if tenant.is_empty() {
                warn!(setting = %name, "Skipping tenant setting with an empty tenant key");
                continue;
            }

            let Some(field) = TenantField::parse(field_name) else {
                warn!(setting = %name, field = %field_name, "Skipping unrecognised tenant field");
                continue;
            };

            let params = tenants.entry(tenant.to_string()).or_default();
            if params.get(field).is_some() {
                // Aliases iterate in key order, so `pool.maxSize` wins over `pool-max-size`
                warn!(
                    setting = %name,
                    tenant = %tenant,
                    field = field.name(),
                    "Tenant field set more than once; the later setting wins"
                );
            }
            params.set(field, value.as_str());
        }

        debug!(
            prefix = %self.prefix,
            tenants = tenants.len(),
            "Extracted tenant configuration"
        );
        tenants
    }

    /// Resolve every non-`all` tenant after inheriting the `all` defaults.
    ///
    /// Returns `(registry key, result)` pairs. A failed resolution affects only
    /// that tenant. Tenants whose registry key is claimed by another tenant
    /// fail with a configuration error.
    pub fn desired(
        tenants: &BTreeMap<String, TenantParameters>,
    ) -> Vec<(String, TenantResult<ResolvedTenant>)> {
        let all = tenants.get(ALL_TENANTS_KEY).cloned().unwrap_or_default();
        let conflicts = Self::conflicting_keys(tenants);
        tenants
            .iter()
            .filter(|(key, _)| key.as_str() != ALL_TENANTS_KEY)
            .map(|(key, params)| {
                let mut params = params.clone();
                params.apply_inheritance(&all);
                let registry_key = params.registry_key(key).to_string();
                let resolved = if conflicts.contains(&registry_key) {
                    Err(TenantError::configuration(
                        key.as_str(),
                        format!(
                            "registry key '{}' is claimed by more than one tenant",
                            registry_key
                        ),
                    ))
                } else {
                    params.resolve(key)
                };
                (registry_key, resolved)
            })
            .collect()
    }

    /// Registry keys claimed by more than one configured tenant.
    ///
    /// The key override is never inherited, so the `all` record plays no part.
    pub fn conflicting_keys(tenants: &BTreeMap<String, TenantParameters>) -> BTreeSet<String> {
        let mut claims: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (key, params) in tenants {
            if key.as_str() != ALL_TENANTS_KEY {
                claims.entry(params.registry_key(key)).or_default().push(key.as_str());
            }
        }

        claims
            .into_iter()
            .filter(|(_, owners)| owners.len() > 1)
            .map(|(registry_key, owners)| {
                warn!(
                    registry_key = %registry_key,
                    tenants = %owners.join(", "),
                    "Registry key is claimed by more than one tenant; skipping them"
                );
                registry_key.to_string()
            })
            .collect()
    }
}

impl Default for TenantConfigStore {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl TenantParameters {
    /// Build parameters from field names without a tenant suffix, as accepted
    /// by the hot-add surface. Unknown field names are skipped with a warning.
    pub fn from_fields<'a, I>(fields: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut params = TenantParameters::default();
        for (name, value) in fields {
            match TenantField::parse(name) {
                Some(field) => params.set(field, value.as_str()),
                None => warn!(field = %name, "Skipping unrecognised tenant field"),
            }
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_extract_groups_by_last_segment() {
        let store = TenantConfigStore::default();
        let tenants = store.extract(&settings(&[
            ("mdb.driver.all", "sqlite"),
            ("mdb.url.a", "sqlite:a.db"),
            ("mdb.pool.maxSize.a", "4"),
            ("mdb.pool-timeout.a", "250"),
            ("other.url.a", "ignored"),
        ]));

        assert_eq!(tenants.len(), 2);
        let a = &tenants["a"];
        assert_eq!(a.url.as_deref(), Some("sqlite:a.db"));
        assert_eq!(a.pool_max_size.as_deref(), Some("4"));
        assert_eq!(a.pool_timeout.as_deref(), Some("250"));
        assert_eq!(tenants["all"].driver.as_deref(), Some("sqlite"));
    }

    #[test]
    fn test_extract_skips_malformed_keys() {
        let store = TenantConfigStore::new("mdb.");
        let tenants = store.extract(&settings(&[
            ("mdb.url", "no tenant segment"),
            ("mdb.colour.a", "blue"),
            ("mdb.url.", "empty tenant"),
            ("mdb.url.b", "sqlite:b.db"),
        ]));
        assert_eq!(tenants.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_desired_inherits_and_resolves() {
        let store = TenantConfigStore::default();
        let tenants = store.extract(&settings(&[
            ("mdb.driver.all", "X"),
            ("mdb.url.tenantA", "jdbc:a"),
            ("mdb.driver.tenantB", "Y"),
            ("mdb.url.tenantB", "jdbc:b"),
        ]));
        let desired = TenantConfigStore::desired(&tenants);
        assert_eq!(desired.len(), 2);

        let a = desired[0].1.as_ref().unwrap();
        assert_eq!((a.driver_name.as_str(), a.url.as_str()), ("X", "jdbc:a"));
        let b = desired[1].1.as_ref().unwrap();
        assert_eq!((b.driver_name.as_str(), b.url.as_str()), ("Y", "jdbc:b"));
    }

    #[test]
    fn test_desired_reports_incomplete_tenant() {
        let store = TenantConfigStore::default();
        let tenants = store.extract(&settings(&[("mdb.user.lonely", "bob")]));
        let desired = TenantConfigStore::desired(&tenants);
        assert_eq!(desired.len(), 1);
        assert!(desired[0].1.is_err());
    }

    #[test]
    fn test_desired_uses_key_override() {
        let store = TenantConfigStore::default();
        let tenants = store.extract(&settings(&[
            ("mdb.driver.a", "sqlite"),
            ("mdb.url.a", "sqlite:a.db"),
            ("mdb.key.a", "a.example.com"),
            ("mdb.key.all", "never-inherited"),
        ]));
        let desired = TenantConfigStore::desired(&tenants);
        assert_eq!(desired[0].0, "a.example.com");
        assert_eq!(desired[0].1.as_ref().unwrap().key, "a.example.com");
    }

    #[test]
    fn test_duplicate_alias_is_settled_by_key_order() {
        let store = TenantConfigStore::default();
        let tenants = store.extract(&settings(&[
            ("mdb.pool-max-size.a", "3"),
            ("mdb.pool.maxSize.a", "7"),
            ("mdb.url.a", "sqlite:a.db"),
        ]));
        assert_eq!(tenants["a"].get(TenantField::PoolMaxSize), Some("7"));
        assert_eq!(tenants["a"].get(TenantField::Url), Some("sqlite:a.db"));
        assert_eq!(tenants["a"].get(TenantField::User), None);
    }

    #[test]
    fn test_shared_key_override_rejects_both_tenants() {
        let store = TenantConfigStore::default();
        let tenants = store.extract(&settings(&[
            ("mdb.driver.all", "sqlite"),
            ("mdb.url.a", "sqlite:a.db"),
            ("mdb.key.a", "shop.example.com"),
            ("mdb.url.b", "sqlite:b.db"),
            ("mdb.key.b", "shop.example.com"),
            ("mdb.url.c", "sqlite:c.db"),
        ]));

        let conflicts = TenantConfigStore::conflicting_keys(&tenants);
        assert_eq!(conflicts.into_iter().collect::<Vec<_>>(), vec!["shop.example.com"]);

        let desired = TenantConfigStore::desired(&tenants);
        assert_eq!(desired.len(), 3);
        for (key, resolved) in &desired[..2] {
            assert_eq!(key, "shop.example.com");
            let err = resolved.as_ref().unwrap_err();
            assert!(matches!(err, TenantError::Configuration { .. }), "{:?}", err);
        }
        assert_eq!(desired[2].0, "c");
        assert!(desired[2].1.is_ok());
    }

    #[test]
    fn test_key_override_may_reuse_own_map_key() {
        let store = TenantConfigStore::default();
        let tenants = store.extract(&settings(&[
            ("mdb.driver.all", "sqlite"),
            ("mdb.url.a", "sqlite:a.db"),
            ("mdb.key.a", "a"),
        ]));
        assert!(TenantConfigStore::conflicting_keys(&tenants).is_empty());
    }

    #[test]
    fn test_from_fields() {
        let fields = settings(&[
            ("driver", "sqlite"),
            ("url", "sqlite:c.db"),
            ("pool.minSize", "0"),
            ("bogus", "x"),
        ]);
        let params = TenantParameters::from_fields(&fields);
        assert_eq!(params.driver.as_deref(), Some("sqlite"));
        assert_eq!(params.pool_min_size.as_deref(), Some("0"));
        assert!(params.is_complete());
    }
}
