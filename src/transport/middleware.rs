//! Unit-of-work middleware.
//!
//! Wraps each request in a unit of work: the tenant is resolved and a session
//! bound before the handler runs, and the session is finished and released
//! after it returns. Handlers reach the session through the [`CurrentUnit`]
//! request extension.

use crate::db::coordinator::{TransactionCoordinator, UnitOfWork};
use crate::models::{AccessIntent, RequestContext};
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

/// The unit of work of the current request.
#[derive(Debug, Clone)]
pub struct CurrentUnit(Arc<Mutex<UnitOfWork>>);

impl CurrentUnit {
    fn new(uow: UnitOfWork) -> Self {
        Self(Arc::new(Mutex::new(uow)))
    }

    pub async fn lock(&self) -> MutexGuard<'_, UnitOfWork> {
        self.0.lock().await
    }
}

/// Run the request inside a unit of work.
///
/// GET, HEAD and OPTIONS requests are read-only. A 5xx response rolls back;
/// any other response commits, and a failed commit replaces the response.
pub async fn unit_of_work(
    State(coordinator): State<Arc<TransactionCoordinator>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let context = RequestContext::from_parts(&parts);
    let intent = AccessIntent::from_method(&parts.method);
    let mut request = Request::from_parts(parts, body);

    let mut uow = UnitOfWork::new();
    if let Err(e) = coordinator
        .before_unit_of_work(&mut uow, &context, intent)
        .await
    {
        coordinator.finally_cleanup(&mut uow).await;
        return e.into_response();
    }

    let unit = CurrentUnit::new(uow);
    request.extensions_mut().insert(unit.clone());
    let response = next.run(request).await;

    let mut uow = unit.lock().await;
    let response = if response.status().is_server_error() {
        let cause = format!("handler responded {}", response.status());
        coordinator.on_error(&mut uow, &cause).await;
        response
    } else {
        match coordinator.after_unit_of_work(&mut uow).await {
            Ok(()) => response,
            Err(e) => e.into_response(),
        }
    };
    coordinator.finally_cleanup(&mut uow).await;
    response
}
