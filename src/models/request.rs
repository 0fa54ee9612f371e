//! Request and unit-of-work models.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, header, request::Parts};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The parts of an incoming request a key resolver may look at.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// Host name without port, lowercased
    pub domain: Option<String>,
    pub path: String,
    pub headers: HeaderMap,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A request addressed to the given host.
    pub fn for_domain(domain: impl AsRef<str>) -> Self {
        Self {
            domain: normalize_host(domain.as_ref()),
            path: "/".to_string(),
            headers: HeaderMap::new(),
        }
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Build from the head of an HTTP request.
    ///
    /// The domain comes from the request target when it is absolute, otherwise
    /// from the `Host` header.
    pub fn from_parts(parts: &Parts) -> Self {
        let domain = parts
            .uri
            .host()
            .map(String::from)
            .or_else(|| {
                parts
                    .headers
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
            .and_then(|host| normalize_host(&host));

        Self {
            domain,
            path: parts.uri.path().to_string(),
            headers: parts.headers.clone(),
        }
    }

    /// Header value as text, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Strip the port and lowercase a host. Empty hosts become `None`.
fn normalize_host(host: &str) -> Option<String> {
    let host = host.trim();
    let without_port = if host.starts_with('[') {
        // IPv6 literal
        match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        }
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
            _ => host,
        }
    };

    if without_port.is_empty() {
        None
    } else {
        Some(without_port.to_ascii_lowercase())
    }
}

/// Whether a unit of work intends to modify data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessIntent {
    ReadWrite,
    /// Always ends in rollback
    ReadOnly,
}

impl AccessIntent {
    /// Safe methods are read-only; everything else may write.
    pub fn from_method(method: &Method) -> Self {
        if *method == Method::GET || *method == Method::HEAD || *method == Method::OPTIONS {
            Self::ReadOnly
        } else {
            Self::ReadWrite
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// Lifecycle state of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    /// Nothing bound
    Idle,
    /// Connection checked out, no transaction
    Bound,
    /// Transaction open
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Idle => "idle",
            UnitState::Bound => "bound",
            UnitState::Active => "active",
            UnitState::Committed => "committed",
            UnitState::RolledBack => "rolled_back",
        };
        write!(f, "{}", s)
    }
}

/// How the last completed unit of work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitOutcome {
    /// No tenant was bound
    Skipped,
    Committed,
    RolledBack,
    /// Bare connection returned to the pool
    Released,
}
