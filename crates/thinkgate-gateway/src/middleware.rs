use crate::error::ApiError;
use crate::server::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use thinkgate_security::audit::AuditOutcome;
use thinkgate_security::{ApiKeyRecord, Scope};
use tracing::{debug, warn};

/// Auth middleware: validates the `Authorization: Bearer <secret>` header.
///
/// On success the key's [`ApiKeyRecord`] is inserted into the request
/// extensions for the rate limiter and handlers. Every failure is the same
/// generic 401; the key store logs the specific reason.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(secret) = bearer_token(&headers) else {
        warn!(path = %request.uri().path(), "Rejected request: missing bearer credential");
        return ApiError::Unauthorized.into_response();
    };

    match state.keys.validate(secret) {
        Ok(record) => {
            debug!(key_id = %record.key_id, "Request authenticated");
            request.extensions_mut().insert(record);
            next.run(request).await
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// Rate limiting middleware: one token bucket per API key id.
///
/// Must run after [`auth_middleware`]; a request without a key record is
/// rejected as unauthenticated.
pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(key_id) = request
        .extensions()
        .get::<ApiKeyRecord>()
        .map(|r| r.key_id.clone())
    else {
        return ApiError::Unauthorized.into_response();
    };

    if !state.limiter.check(&key_id).await {
        warn!(key_id = %key_id, "Rate limited request");
        state.audit.log_action(
            Some(key_id.as_str()),
            "rate_limited",
            serde_json::json!({ "path": request.uri().path() }),
            AuditOutcome::Denied,
        );
        return ApiError::RateLimited.into_response();
    }

    next.run(request).await
}

/// Checks that an authenticated key carries `scope`.
pub fn require_scope(
    state: &AppState,
    record: &ApiKeyRecord,
    scope: Scope,
) -> Result<(), ApiError> {
    if record.has_scope(scope) {
        return Ok(());
    }
    warn!(key_id = %record.key_id, scope = %scope, "Rejected request: missing scope");
    state.audit.log_action(
        Some(record.key_id.as_str()),
        "scope_denied",
        serde_json::json!({ "scope": scope }),
        AuditOutcome::Denied,
    );
    Err(ApiError::Forbidden(scope.as_str()))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_scheme_is_case_insensitive() {
        assert_eq!(bearer_token(&headers("Bearer tg_abc")), Some("tg_abc"));
        assert_eq!(bearer_token(&headers("bearer tg_abc")), Some("tg_abc"));
    }

    #[test]
    fn other_schemes_and_blank_tokens_are_ignored() {
        assert_eq!(bearer_token(&headers("Basic dXNlcg==")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
