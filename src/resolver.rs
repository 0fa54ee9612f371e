//! Tenant key resolution.
//!
//! A [`KeyResolver`] maps an incoming request to the registry key of the
//! tenant it belongs to. Exactly one resolver is active per process.

use crate::error::{TenantError, TenantResult};
use crate::models::RequestContext;
use std::sync::Arc;

/// Header used by [`HeaderKeyResolver::default`].
pub const TENANT_ID_HEADER: &str = "X-Tenant-ID";

/// Extracts a tenant key from a request.
pub trait KeyResolver: Send + Sync {
    /// `None` means the request is not bound to any tenant.
    fn extract_key(&self, request: &RequestContext) -> Option<String>;

    fn name(&self) -> String;
}

/// Uses the request's host name (without port) as the tenant key.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainKeyResolver;

impl KeyResolver for DomainKeyResolver {
    fn extract_key(&self, request: &RequestContext) -> Option<String> {
        request.domain.clone()
    }

    fn name(&self) -> String {
        "domain".to_string()
    }
}

/// Uses a request header's trimmed value as the tenant key.
#[derive(Debug, Clone)]
pub struct HeaderKeyResolver {
    header: String,
}

impl HeaderKeyResolver {
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            header: header.into(),
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }
}

impl Default for HeaderKeyResolver {
    fn default() -> Self {
        Self::new(TENANT_ID_HEADER)
    }
}

impl KeyResolver for HeaderKeyResolver {
    fn extract_key(&self, request: &RequestContext) -> Option<String> {
        request
            .header(&self.header)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
    }

    fn name(&self) -> String {
        format!("header:{}", self.header)
    }
}

/// A named built-in resolver, as written in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolverChoice {
    Domain,
    Header(String),
}

impl ResolverChoice {
    /// Parse `domain` or `header:<Name>`.
    pub fn parse(s: &str) -> TenantResult<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("domain") {
            return Ok(Self::Domain);
        }
        if let Some((kind, name)) = s.split_once(':') {
            if kind.eq_ignore_ascii_case("header") && !name.trim().is_empty() {
                return Ok(Self::Header(name.trim().to_string()));
            }
        }
        Err(TenantError::configuration(
            "*",
            format!(
                "unknown key resolver '{}': expected 'domain' or 'header:<Name>'",
                s
            ),
        ))
    }

    pub fn build(&self) -> Arc<dyn KeyResolver> {
        match self {
            Self::Domain => Arc::new(DomainKeyResolver),
            Self::Header(name) => Arc::new(HeaderKeyResolver::new(name.clone())),
        }
    }
}

/// Pick the single active resolver from the registered candidates.
///
/// No candidates selects [`DomainKeyResolver`]; more than one is an error
/// naming all of them.
pub fn select_resolver(
    candidates: Vec<Arc<dyn KeyResolver>>,
) -> TenantResult<Arc<dyn KeyResolver>> {
    let mut candidates = candidates;
    match candidates.len() {
        0 => Ok(Arc::new(DomainKeyResolver)),
        1 => Ok(candidates.remove(0)),
        _ => Err(TenantError::resolver_conflict(
            candidates.iter().map(|r| r.name()).collect(),
        )),
    }
}
