//! Integration tests for the HTTP surface, driven through `tower::ServiceExt`.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tenantdb::auth::AdminAuth;
use tenantdb::resolver::DomainKeyResolver;
use tenantdb::runtime::{RuntimeOptions, TenantRuntime};
use tenantdb::transport::{AppState, router};
use tempfile::TempDir;
use tower::ServiceExt;

const TOKEN: &str = "admin-token-1";

fn sqlite_url(dir: &TempDir, name: &str) -> String {
    format!("sqlite:{}?mode=rwc", dir.path().join(name).display())
}

async fn app(dir: &TempDir) -> (Router, Arc<TenantRuntime>) {
    let mut raw = BTreeMap::new();
    raw.insert("mdb.driver.all".to_string(), "sqlite".to_string());
    raw.insert("mdb.pool.timeout.all".to_string(), "500".to_string());
    raw.insert("mdb.url.a".to_string(), sqlite_url(dir, "a.db"));
    raw.insert("mdb.key.a".to_string(), "a.example.com".to_string());

    let options = RuntimeOptions {
        resolvers: vec![Arc::new(DomainKeyResolver)],
        ..RuntimeOptions::default()
    };
    let runtime = Arc::new(TenantRuntime::start(options, &raw).await.unwrap());
    let auth = AdminAuth::from_tokens(vec![TOKEN.to_string()]).unwrap();
    let app = router(AppState::new(Arc::clone(&runtime), None), Arc::new(auth));
    (app, runtime)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str, host: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::HOST, host)
        .body(Body::empty())
        .unwrap()
}

fn admin(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN));
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

#[tokio::test]
async fn test_health() {
    let dir = TempDir::new().unwrap();
    let (app, _runtime) = app(&dir).await;

    let response = app.oneshot(get("/health", "localhost")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tenants"], 1);
}

#[tokio::test]
async fn test_tenant_route_binds_by_host() {
    let dir = TempDir::new().unwrap();
    let (app, runtime) = app(&dir).await;

    let response = app
        .oneshot(get("/tenant", "A.example.com:8080"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["tenant"], "a.example.com");
    assert_eq!(body["state"], "active");
    assert_eq!(body["read_only"], true);
    assert_eq!(body["in_transaction"], true);
    assert_eq!(body["ping"], 1);
    assert!(body["unit_of_work"].as_str().unwrap().starts_with("uow_"));

    let entry = runtime.registry().get("a.example.com").await.unwrap();
    assert_eq!(entry.pool().in_use(), 0);
}

#[tokio::test]
async fn test_unknown_host_is_not_found() {
    let dir = TempDir::new().unwrap();
    let (app, _runtime) = app(&dir).await;

    let response = app
        .oneshot(get("/tenant", "b.example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "unknown_tenant");
    assert_eq!(
        body["error"]["message"],
        "No database found under key 'b.example.com'"
    );
}

#[tokio::test]
async fn test_status_text_lists_tenants_without_passwords() {
    let dir = TempDir::new().unwrap();
    let (app, _runtime) = app(&dir).await;

    let response = app.oneshot(get("/status", "localhost")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("Multiple DB sources:"));
    assert!(text.contains("Datasource [a.example.com]:"));
    assert!(text.contains("Checkout timeout: 500 ms"));
}

#[tokio::test]
async fn test_admin_requires_token() {
    let dir = TempDir::new().unwrap();
    let (app, _runtime) = app(&dir).await;

    let request = Request::builder()
        .method("POST")
        .uri("/admin/reload")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "unauthorized");

    let request = Request::builder()
        .method("DELETE")
        .uri("/admin/tenants/a.example.com")
        .header(header::AUTHORIZATION, "Bearer wrong")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_hot_add_and_remove() {
    let dir = TempDir::new().unwrap();
    let (app, runtime) = app(&dir).await;

    let add = json!({
        "key": "c.example.com",
        "fields": { "url": sqlite_url(&dir, "c.db"), "pool.maxSize": "3" }
    });
    let response = app
        .clone()
        .oneshot(admin("POST", "/admin/tenants", Some(add.clone())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["outcome"], "created");

    // Driver and timeout were inherited from the `all` record
    let entry = runtime.registry().get("c.example.com").await.unwrap();
    assert_eq!(entry.pool().tenant().driver_name, "sqlite");
    assert_eq!(entry.pool().tenant().pool_max_size, 3);
    assert_eq!(entry.pool().tenant().checkout_timeout_ms(), 500);
    drop(entry);

    let response = app
        .clone()
        .oneshot(admin("POST", "/admin/tenants", Some(add)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/tenant", "c.example.com"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(admin("DELETE", "/admin/tenants/c.example.com", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(admin("DELETE", "/admin/tenants/c.example.com", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reload_builds_new_tenants() {
    let dir = TempDir::new().unwrap();
    let (app, runtime) = app(&dir).await;

    let reload = json!({
        "settings": {
            "mdb.driver.all": "sqlite",
            "mdb.url.a": sqlite_url(&dir, "a.db"),
            "mdb.key.a": "a.example.com",
            "mdb.url.b": sqlite_url(&dir, "b.db"),
            "mdb.pool.timeout.b": "250"
        }
    });
    let response = app
        .clone()
        .oneshot(admin("POST", "/admin/reload", Some(reload)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let built: Vec<&str> = body["built"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["key"].as_str().unwrap())
        .collect();
    assert_eq!(built, vec!["b"]);
    assert_eq!(body["report"]["changes"][0]["kind"], "missing");
    assert!(body["failed"].as_array().unwrap().is_empty());

    assert_eq!(
        runtime.registry().keys().await,
        vec!["a.example.com".to_string(), "b".to_string()]
    );

    // Without a body there is no configured source to re-read
    let response = app
        .oneshot(admin("POST", "/admin/reload", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
