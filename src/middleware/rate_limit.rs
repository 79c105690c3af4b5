//! Rate limiting middleware, backed by [`crate::rate_limit::RateLimitRegistry`]
//! (spec §4.C, §6).

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rate_limit::{RateLimitRegistry, RateLimitScope};
use crate::state::AppState;

/// Header a caller may set to identify themselves for user/tenant-scoped
/// rules; requests without it fall back to an IP-scoped bucket.
pub const TENANT_ID_HEADER: &str = "x-tenant-id";
pub const USER_ID_HEADER: &str = "x-user-id";

/// Resolves the scope a request's rate-limit bucket is keyed by: user if
/// `X-User-Id` is present, else tenant if `X-Tenant-Id` is present, else the
/// caller's IP.
fn resolve_scope(request: &Request<Body>) -> RateLimitScope {
    let headers = request.headers();
    if let Some(user_id) = headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok()) {
        return RateLimitScope::User(user_id.to_string());
    }
    if let Some(tenant_id) = headers.get(TENANT_ID_HEADER).and_then(|v| v.to_str().ok()) {
        return RateLimitScope::Tenant(tenant_id.to_string());
    }
    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    RateLimitScope::Ip(ip)
}

/// Matches the request against the registry's rules and, on a hit, enforces
/// the decision: allowed requests proceed with `X-RateLimit-*` headers
/// attached to the response, denied requests short-circuit with
/// [`Error::RateLimited`] (429 + `Retry-After`). Unmatched requests pass
/// through untouched.
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response> {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();

    let Some(rule) = state.rate_limiter().match_rule(&method, &path).cloned() else {
        return Ok(next.run(request).await);
    };

    let scope = resolve_scope(&request);
    let cancel = CancellationToken::new();
    let decision = state.rate_limiter().check(&rule, &scope, chrono::Utc::now(), &cancel).await?;

    if !decision.allowed {
        return Err(Error::RateLimited {
            retry_after_ms: decision.retry_after_ms,
            limit: decision.limit,
            reset_at: decision.reset_at,
        });
    }

    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    if let Ok(v) = decision.limit.to_string().parse() {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = decision.remaining.to_string().parse() {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = decision.reset_at.to_string().parse() {
        headers.insert("X-RateLimit-Reset", v);
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderValue, Method};

    #[test]
    fn resolve_scope_prefers_user_then_tenant_then_ip() {
        let mut request = Request::builder().method(Method::GET).uri("/x").body(Body::empty()).unwrap();
        request.headers_mut().insert(USER_ID_HEADER, HeaderValue::from_static("u1"));
        request.headers_mut().insert(TENANT_ID_HEADER, HeaderValue::from_static("t1"));
        assert!(matches!(resolve_scope(&request), RateLimitScope::User(id) if id == "u1"));

        let mut request = Request::builder().method(Method::GET).uri("/x").body(Body::empty()).unwrap();
        request.headers_mut().insert(TENANT_ID_HEADER, HeaderValue::from_static("t1"));
        assert!(matches!(resolve_scope(&request), RateLimitScope::Tenant(id) if id == "t1"));

        let request = Request::builder().method(Method::GET).uri("/x").body(Body::empty()).unwrap();
        assert!(matches!(resolve_scope(&request), RateLimitScope::Ip(id) if id == "unknown"));
    }
}
