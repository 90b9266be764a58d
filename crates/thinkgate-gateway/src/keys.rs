//! Key administration endpoints. All of them need the `admin` scope.

use crate::error::ApiError;
use crate::middleware::require_scope;
use crate::server::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thinkgate_security::{ApiKeyRecord, Scope};
use tracing::info;

/// Longest TTL accepted from a client.
const MAX_TTL_DAYS: u32 = 3650;

/// Body of `POST /api/v1/keys`.
#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    /// Human-readable label. Must not be blank.
    pub name: String,
    /// At least one.
    pub scopes: Vec<Scope>,
    /// Lifetime in days. Capped at ten years; omit for no expiry.
    #[serde(default)]
    pub ttl_days: Option<u32>,
}

/// A key record as shown to administrators. The secret hash stays server-side.
#[derive(Debug, Serialize, Deserialize)]
pub struct KeyView {
    /// Public identifier.
    pub key_id: String,
    /// Human-readable label.
    pub name: String,
    /// Granted scopes.
    pub scopes: BTreeSet<Scope>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Absent for keys that never expire.
    pub expires_at: Option<DateTime<Utc>>,
    /// Absent unless revoked.
    pub revoked_at: Option<DateTime<Utc>>,
    /// Neither revoked nor expired at the time of the response.
    pub active: bool,
}

impl From<ApiKeyRecord> for KeyView {
    fn from(record: ApiKeyRecord) -> Self {
        let active = record.is_active();
        Self {
            key_id: record.key_id,
            name: record.name,
            scopes: record.scopes,
            created_at: record.created_at,
            expires_at: record.expires_at,
            revoked_at: record.revoked_at,
            active,
        }
    }
}

/// Returned once, at creation; the secret cannot be fetched again.
#[derive(Debug, Serialize)]
pub struct CreatedKey {
    /// The new key's record.
    pub key: KeyView,
    /// The raw secret to send as the bearer token.
    pub secret: String,
}

/// `POST /api/v1/keys`. Admin only.
pub async fn create_key_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiKeyRecord>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreatedKey>), ApiError> {
    require_scope(&state, &caller, Scope::Admin)?;

    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("key name is empty".into()));
    }
    if body.scopes.is_empty() {
        return Err(ApiError::BadRequest("at least one scope is required".into()));
    }
    let ttl = match body.ttl_days {
        Some(0) => return Err(ApiError::BadRequest("ttl_days must be positive".into())),
        Some(days) => Some(Duration::days(i64::from(days.min(MAX_TTL_DAYS)))),
        None => None,
    };

    let issued = state.keys.create(name, body.scopes, ttl)?;
    info!(key_id = %issued.record.key_id, created_by = %caller.key_id, "Key issued over API");
    Ok((
        StatusCode::CREATED,
        Json(CreatedKey {
            key: issued.record.into(),
            secret: issued.secret,
        }),
    ))
}

/// `GET /api/v1/keys`. Admin only.
pub async fn list_keys_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiKeyRecord>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_scope(&state, &caller, Scope::Admin)?;
    let keys: Vec<KeyView> = state.keys.list().into_iter().map(KeyView::from).collect();
    Ok(Json(serde_json::json!({ "keys": keys })))
}

/// `DELETE /api/v1/keys/{key_id}`. Admin only.
///
/// Also drops the key's rate limit bucket.
pub async fn revoke_key_handler(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<ApiKeyRecord>,
    Path(key_id): Path<String>,
) -> Result<Json<KeyView>, ApiError> {
    require_scope(&state, &caller, Scope::Admin)?;
    let record = state.keys.revoke(&key_id)?;
    state.limiter.forget(&key_id).await;
    info!(key_id = %key_id, revoked_by = %caller.key_id, "Key revoked over API");
    Ok(Json(record.into()))
}
