//! Error types for tenant routing, pooling and unit-of-work transactions.
//!
//! Every variant carries enough context to tell which tenant failed and what the
//! caller can do about it. Failures are contained per tenant during startup and
//! surfaced to the unit-of-work caller at request time.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::error::Error as StdError;
use thiserror::Error;

/// Maximum number of `source()` hops followed when looking for a root cause.
pub const MAX_CAUSE_DEPTH: usize = 10;

#[derive(Error, Debug)]
pub enum TenantError {
    #[error("Configuration error for tenant '{tenant}': {message}")]
    Configuration { tenant: String, message: String },

    #[error("Driver not found ({driver}) for tenant '{tenant}'")]
    DriverNotFound { tenant: String, driver: String },

    #[error("Cannot connect to tenant '{tenant}': {message}")]
    ConnectionValidation { tenant: String, message: String },

    #[error("Connection pool for tenant '{tenant}' exhausted after {timeout_ms}ms")]
    PoolExhausted { tenant: String, timeout_ms: u64 },

    #[error("Connection pool for tenant '{tenant}' is broken: {message}")]
    PoolBroken { tenant: String, message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("No database found under key '{key}'")]
    UnknownTenant { key: String },

    #[error("Cannot commit transaction for tenant '{tenant}': {cause}")]
    TransactionCommit { tenant: String, cause: String },

    #[error("Transaction error for tenant '{tenant}': {message}")]
    Transaction { tenant: String, message: String },

    #[error("Invalid unit-of-work state: {message}")]
    InvalidState { message: String },

    #[error(
        "Too many tenant key resolvers registered ({}); exactly one may be active",
        candidates.join(", ")
    )]
    ResolverConflict { candidates: Vec<String> },

    #[error("Cannot start without a properly configured database")]
    NoDatabaseConfigured,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TenantError {
    /// Create a configuration error for one tenant.
    pub fn configuration(tenant: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            tenant: tenant.into(),
            message: message.into(),
        }
    }

    pub fn driver_not_found(tenant: impl Into<String>, driver: impl Into<String>) -> Self {
        Self::DriverNotFound {
            tenant: tenant.into(),
            driver: driver.into(),
        }
    }

    pub fn connection_validation(tenant: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConnectionValidation {
            tenant: tenant.into(),
            message: message.into(),
        }
    }

    pub fn pool_exhausted(tenant: impl Into<String>, timeout_ms: u64) -> Self {
        Self::PoolExhausted {
            tenant: tenant.into(),
            timeout_ms,
        }
    }

    pub fn pool_broken(tenant: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PoolBroken {
            tenant: tenant.into(),
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn unknown_tenant(key: impl Into<String>) -> Self {
        Self::UnknownTenant { key: key.into() }
    }

    /// Create a commit error from the failure, reporting its innermost cause.
    pub fn transaction_commit(
        tenant: impl Into<String>,
        err: &(dyn StdError + 'static),
    ) -> Self {
        Self::TransactionCommit {
            tenant: tenant.into(),
            cause: root_cause(err, MAX_CAUSE_DEPTH).to_string(),
        }
    }

    pub fn transaction(tenant: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transaction {
            tenant: tenant.into(),
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn resolver_conflict(candidates: Vec<String>) -> Self {
        Self::ResolverConflict { candidates }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { .. } => {
                Some("Check the tenant's driver, url and pool settings")
            }
            Self::DriverNotFound { .. } => {
                Some("Use one of: postgres, mysql, mariadb, sqlite")
            }
            Self::ConnectionValidation { .. } => {
                Some("Check that the database is reachable and the credentials are correct")
            }
            Self::PoolExhausted { .. } => {
                Some("Retry later or raise the tenant's pool.maxSize / pool.timeout")
            }
            Self::PoolBroken { .. } => Some("Reload the configuration to rebuild the pool"),
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::UnknownTenant { .. } => {
                Some("Check the configuration of your application")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Connection { .. })
    }

    /// Check if this error maps to a "not found" outcome at the boundary.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::UnknownTenant { .. })
    }

    /// Short machine-readable code used in response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::DriverNotFound { .. } => "driver_not_found",
            Self::ConnectionValidation { .. } => "connection_validation_failed",
            Self::PoolExhausted { .. } => "pool_exhausted",
            Self::PoolBroken { .. } => "pool_broken",
            Self::Connection { .. } => "connection_failed",
            Self::UnknownTenant { .. } => "unknown_tenant",
            Self::TransactionCommit { .. } => "transaction_commit_failed",
            Self::Transaction { .. } => "transaction_failed",
            Self::InvalidState { .. } => "invalid_state",
            Self::ResolverConflict { .. } => "resolver_conflict",
            Self::NoDatabaseConfigured => "no_database_configured",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status used when this error ends a request.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnknownTenant { .. } => StatusCode::NOT_FOUND,
            Self::PoolExhausted { .. } | Self::PoolBroken { .. } | Self::Connection { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Configuration { .. } | Self::DriverNotFound { .. } => StatusCode::BAD_REQUEST,
            Self::ConnectionValidation { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Follow `source()` to the innermost cause, at most `max_depth` hops.
///
/// Returns `err` itself when the chain is deeper than the bound, so a
/// pathological chain is reported whole rather than at an arbitrary link.
pub fn root_cause<'a>(
    err: &'a (dyn StdError + 'static),
    max_depth: usize,
) -> &'a (dyn StdError + 'static) {
    let mut current = err;
    for _ in 0..max_depth {
        match current.source() {
            Some(next) => current = next,
            None => return current,
        }
    }
    if current.source().is_some() {
        err
    } else {
        current
    }
}

/// Convert sqlx errors to TenantError.
impl From<sqlx::Error> for TenantError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => TenantError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::PoolTimedOut => TenantError::connection(
                "Timed out waiting for a pooled connection",
                "Retry later or raise the pool size",
            ),
            sqlx::Error::PoolClosed => {
                TenantError::connection("Connection pool is closed", "Reload the tenant")
            }
            sqlx::Error::Io(io_err) => TenantError::connection(
                format!("I/O error: {}", io_err),
                "Check network connectivity and database server status",
            ),
            sqlx::Error::Tls(tls_err) => TenantError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => TenantError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::Database(db_err) => {
                TenantError::internal(format!("Database error: {}", db_err.message()))
            }
            _ => TenantError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for tenant operations.
pub type TenantResult<T> = Result<T, TenantError>;

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<String>,
    retryable: bool,
}

impl IntoResponse for TenantError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.to_string(),
                suggestion: self.suggestion().map(String::from),
                retryable: self.is_retryable(),
            },
        };
        let json = serde_json::to_string(&body).unwrap_or_else(|_| {
            r#"{"error":{"code":"internal_error","message":"Request failed"}}"#.to_string()
        });

        let mut response =
            (status, [(header::CONTENT_TYPE, "application/json")], json).into_response();
        if let Self::PoolExhausted { timeout_ms, .. } = self {
            let secs = timeout_ms.div_ceil(1000).max(1);
            if let Ok(value) = secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
