//! Bearer-token guard for the admin endpoints.
//!
//! Tenant administration (hot-add, removal, reload) is only reachable with one
//! of the configured tokens. With no tokens configured the guard lets every
//! request through.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct AdminAuth {
    tokens: HashSet<String>,
}

impl AdminAuth {
    /// Build from configured tokens. Blank tokens are rejected.
    pub fn from_tokens(tokens: Vec<String>) -> Result<Self, String> {
        let mut accepted = HashSet::new();
        for token in tokens {
            let trimmed = token.trim();
            if trimmed.is_empty() {
                return Err("Empty admin token in configuration".to_string());
            }
            accepted.insert(trimmed.to_string());
        }
        Ok(Self { tokens: accepted })
    }

    pub fn is_enabled(&self) -> bool {
        !self.tokens.is_empty()
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Check a presented token against every configured one in constant time.
    fn accepts(&self, provided: &str) -> bool {
        self.tokens
            .iter()
            .fold(false, |found, expected| {
                found | constant_time_eq(provided.as_bytes(), expected.as_bytes())
            })
    }
}

/// Middleware rejecting admin requests without a valid bearer token.
pub async fn require_admin_token(
    State(auth): State<Arc<AdminAuth>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !auth.is_enabled() {
        return next.run(request).await;
    }

    let token = match bearer_token(&request) {
        Ok(Some(token)) => token,
        Ok(None) => {
            warn!(path = %request.uri().path(), "Admin request without Authorization header");
            return unauthorized(
                "Missing Bearer token in Authorization header",
                "Include a valid token: 'Authorization: Bearer <token>'",
            );
        }
        Err(msg) => {
            warn!(path = %request.uri().path(), "Admin request with malformed Authorization header");
            return unauthorized(msg, "Use the format: 'Authorization: Bearer <token>'");
        }
    };

    if auth.accepts(token) {
        next.run(request).await
    } else {
        warn!(token_prefix = %mask_token(token), "Admin request with invalid token");
        unauthorized(
            "Invalid Bearer token",
            "Use one of the tokens configured with --auth-token",
        )
    }
}

fn bearer_token(request: &Request<Body>) -> Result<Option<&str>, &'static str> {
    let Some(value) = request.headers().get(header::AUTHORIZATION) else {
        return Ok(None);
    };

    let value = value
        .to_str()
        .map_err(|_| "Authorization header contains invalid characters")?;

    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err("Invalid Authorization header format. Expected 'Bearer <token>'");
    };
    if token.is_empty() {
        return Err("Bearer token is empty");
    }

    Ok(Some(token))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

fn mask_token(token: &str) -> String {
    if token.chars().count() <= 3 {
        "***".to_string()
    } else {
        let prefix: String = token.chars().take(3).collect();
        format!("{}***", prefix)
    }
}

fn unauthorized(message: impl Into<String>, suggestion: impl Into<String>) -> Response {
    #[derive(Serialize)]
    struct ErrorResponse {
        error: ErrorDetail,
    }
    #[derive(Serialize)]
    struct ErrorDetail {
        code: &'static str,
        message: String,
        suggestion: String,
    }

    let body = ErrorResponse {
        error: ErrorDetail {
            code: "unauthorized",
            message: message.into(),
            suggestion: suggestion.into(),
        },
    };
    let json = serde_json::to_string(&body).unwrap_or_else(|_| {
        r#"{"error":{"code":"unauthorized","message":"Authentication failed"}}"#.to_string()
    });

    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "application/json")],
        json,
    )
        .into_response()
}
