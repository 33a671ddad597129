//! Bearer token authentication.
//!
//! Every `/attribution/*` request must carry `Authorization: Bearer <token>`.
//! Tokens are configured as `token:tenant_id` pairs and resolve to the tenant
//! the request acts for. Operational and documentation routes are open.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use viewthrough_core::types::TenantId;

use crate::rest::ErrorResponse;

/// Tenant resolved from the bearer token, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTenant(pub TenantId);

/// Token to tenant lookup.
#[derive(Debug, Clone, Default)]
pub struct TenantAuth {
    tokens: Arc<HashMap<String, TenantId>>,
}

impl TenantAuth {
    /// Build from `token:tenant_id` entries. Malformed entries are skipped
    /// with a warning.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tokens = HashMap::new();
        for entry in entries {
            match entry.as_ref().trim().split_once(':') {
                Some((token, tenant)) if !token.is_empty() && !tenant.is_empty() => {
                    tokens.insert(token.to_string(), tenant.to_string());
                }
                _ => warn!("Ignoring malformed API token entry (expected token:tenant)"),
            }
        }
        Self {
            tokens: Arc::new(tokens),
        }
    }

    pub fn tenant_for(&self, token: &str) -> Option<&TenantId> {
        self.tokens.get(token)
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

/// Axum middleware that resolves the bearer token to a tenant.
/// Only `/attribution/` routes are checked.
pub async fn auth_middleware(
    State(auth): State<TenantAuth>,
    mut req: Request,
    next: Next,
) -> Response {
    if !req.uri().path().starts_with("/attribution") {
        return next.run(req).await;
    }

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    let Some(token) = token else {
        return unauthorized("missing_token", "Missing Authorization: Bearer header");
    };

    match auth.tenant_for(token) {
        Some(tenant) => {
            let tenant = AuthTenant(tenant.clone());
            req.extensions_mut().insert(tenant);
            next.run(req).await
        }
        None => {
            metrics::counter!("api.auth_failures").increment(1);
            unauthorized("invalid_token", "Invalid bearer token")
        }
    }
}

fn unauthorized(error: &str, message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}
