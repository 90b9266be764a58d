use crate::error::ApiError;
use crate::middleware::require_scope;
use crate::server::AppState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use thinkgate_agent::{FeatureFlags, ProviderStatus};
use thinkgate_security::{ApiKeyRecord, Scope};

/// Liveness. Always 200 and needs no key.
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "thinkgate",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 200 while at least one provider circuit accepts calls, 503 otherwise.
pub async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let available = state
        .dispatcher
        .status()
        .iter()
        .filter(|p| !state.dispatcher.breaker().is_blocking(&p.id))
        .count();
    let (status, label) = if available > 0 {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    (
        status,
        Json(serde_json::json!({
            "status": label,
            "available_providers": available,
        })),
    )
}

/// The router only exists once startup (keystore load, provider setup) is
/// done, so answering at all means started.
pub async fn startup_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "started",
        "started_at": state.started_at,
    }))
}

/// Read-only operational snapshot.
#[derive(Debug, Serialize)]
pub struct MetricsReport {
    /// Seconds since the gateway started.
    pub uptime_secs: u64,
    /// Breaker state and call stats, in current dispatch order.
    pub providers: Vec<ProviderStatus>,
    /// Bumped every time the provider order changes.
    pub snapshot_version: u64,
    /// Keys neither revoked nor expired.
    pub active_keys: usize,
    /// Keys that currently have a rate limit bucket.
    pub rate_limited_keys: usize,
    /// Feature flags in effect.
    pub features: FeatureFlags,
}

/// `GET /api/v1/metrics`. Needs `status` or `admin`.
pub async fn metrics_handler(
    State(state): State<Arc<AppState>>,
    Extension(record): Extension<ApiKeyRecord>,
) -> Result<Json<MetricsReport>, ApiError> {
    if !record.has_scope(Scope::Admin) {
        require_scope(&state, &record, Scope::Status)?;
    }
    Ok(Json(MetricsReport {
        uptime_secs: state.started.elapsed().as_secs(),
        providers: state.dispatcher.status(),
        snapshot_version: state.dispatcher.snapshot().version,
        active_keys: state.keys.active_count(),
        rate_limited_keys: state.limiter.tracked_keys().await,
        features: state.dispatcher.flags(),
    }))
}
