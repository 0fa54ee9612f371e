//! HTTP transport for the tenant router.
//!
//! Serves introspection, tenant administration and a tenant-scoped route that
//! runs inside a unit of work.

use crate::auth::{AdminAuth, require_admin_token};
use crate::config::Config;
use crate::error::{TenantError, TenantResult};
use crate::models::UnitState;
use crate::db::registry::AddOutcome;
use crate::runtime::{ReloadSummary, RuntimeStatus, TenantRuntime};
use crate::transport::middleware::{CurrentUnit, unit_of_work};
use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    runtime: Arc<TenantRuntime>,
    /// Where `/admin/reload` re-reads settings from when no body is sent
    config: Option<Arc<Config>>,
}

impl AppState {
    pub fn new(runtime: Arc<TenantRuntime>, config: Option<Arc<Config>>) -> Self {
        Self { runtime, config }
    }
}

/// Build the router.
///
/// `/tenant` runs inside a unit of work; `/admin/*` requires an admin token
/// when tokens are configured.
pub fn router(state: AppState, auth: Arc<AdminAuth>) -> Router {
    let coordinator = Arc::clone(state.runtime.coordinator());

    let tenant_routes = Router::new()
        .route("/tenant", get(current_tenant).post(current_tenant))
        .layer(middleware::from_fn_with_state(coordinator, unit_of_work));

    let admin_routes = Router::new()
        .route("/admin/tenants", post(add_tenant))
        .route("/admin/tenants/{key}", delete(remove_tenant))
        .route("/admin/reload", post(reload))
        .layer(middleware::from_fn_with_state(auth, require_admin_token));

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status_text))
        .route("/status.json", get(status_json))
        .merge(tenant_routes)
        .merge(admin_routes)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    tenants: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        tenants: state.runtime.registry().len().await,
    })
}

async fn status_text(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.runtime.status_text().await,
    )
}

async fn status_json(State(state): State<AppState>) -> Json<RuntimeStatus> {
    Json(state.runtime.status().await)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CurrentTenantResponse {
    pub unit_of_work: String,
    pub tenant: Option<String>,
    pub state: UnitState,
    pub read_only: bool,
    pub in_transaction: bool,
    /// Result of a round trip through the bound session
    pub ping: Option<i64>,
}

/// BIGINT on every supported driver.
const PING_SQL: &str = "SELECT COUNT(*) FROM (SELECT 1) AS ping";

/// Report the tenant and session bound to this request.
async fn current_tenant(
    Extension(unit): Extension<CurrentUnit>,
) -> TenantResult<Json<CurrentTenantResponse>> {
    let mut uow = unit.lock().await;
    let ping = if uow.is_bound() {
        Some(uow.fetch_i64(PING_SQL).await?)
    } else {
        None
    };
    let in_transaction = match uow.session() {
        Ok(session) => session.in_transaction(),
        Err(_) => false,
    };

    Ok(Json(CurrentTenantResponse {
        unit_of_work: uow.id().to_string(),
        tenant: uow.tenant_key().map(String::from),
        state: uow.state(),
        read_only: uow.is_read_only(),
        in_transaction,
        ping,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddTenantRequest {
    pub key: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

async fn add_tenant(
    State(state): State<AppState>,
    Json(request): Json<AddTenantRequest>,
) -> TenantResult<impl IntoResponse> {
    let added = state.runtime.add_tenant(&request.key, &request.fields).await?;
    let status = match added.outcome {
        AddOutcome::Created | AddOutcome::Replaced => StatusCode::CREATED,
        AddOutcome::Unchanged => StatusCode::OK,
    };
    Ok((status, Json(added)))
}

async fn remove_tenant(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> TenantResult<StatusCode> {
    if state.runtime.remove_tenant(&key).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(TenantError::unknown_tenant(key))
    }
}

#[derive(Debug, Deserialize)]
struct ReloadRequest {
    settings: BTreeMap<String, String>,
}

/// Reconcile against settings sent in the body, or re-read the configured
/// sources when the body is empty.
async fn reload(State(state): State<AppState>, body: Bytes) -> TenantResult<Json<ReloadSummary>> {
    let settings = if !body.is_empty() {
        let request: ReloadRequest = serde_json::from_slice(&body).map_err(|e| {
            TenantError::configuration("*", format!("invalid reload request: {}", e))
        })?;
        request.settings
    } else {
        let config = state.config.as_ref().ok_or_else(|| {
            TenantError::configuration("*", "no settings sent and no settings source configured")
        })?;
        config
            .load_settings()
            .map_err(|e| TenantError::configuration("*", e))?
    };

    Ok(Json(state.runtime.reload(&settings).await))
}

/// HTTP server owning the tenant runtime.
pub struct HttpTransport {
    state: AppState,
    auth: Arc<AdminAuth>,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl HttpTransport {
    pub fn new(
        runtime: Arc<TenantRuntime>,
        config: Option<Arc<Config>>,
        auth: AdminAuth,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            state: AppState::new(runtime, config),
            auth: Arc::new(auth),
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Serve until SIGINT or SIGTERM, then close every tenant pool.
    pub async fn run(&self) -> TenantResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting tenant router on {}", bind_addr);

        let app = router(self.state.clone(), Arc::clone(&self.auth));

        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            TenantError::connection(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;

        // In-flight units of work get this long to finish after a signal
        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();

        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal);

        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        return Err(TenantError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for requests to finish (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        info!("Closing tenant pools");
        self.state.runtime.shutdown().await;

        Ok(())
    }
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
