use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use common_auth::{ensure_role, AuthContext, Role};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::identity::{generate_api_key, ApiKeyRecord};
use crate::responses::success;
use crate::AppState;

const DEFAULT_PERMISSIONS: &[&str] = &["transform", "analyze"];

pub async fn list(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<serde_json::Value>> {
    ensure_role(&auth, Role::Manager)?;
    let keys = state
        .persistence
        .list_api_keys(auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(success(json!({ "items": keys })))
}

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The plaintext token appears in this response and nowhere else.
pub async fn create(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateKeyRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_role(&auth, Role::Manager)?;

    let permissions: Vec<String> = if req.permissions.is_empty() {
        DEFAULT_PERMISSIONS.iter().map(|s| s.to_string()).collect()
    } else {
        let cleaned: Vec<String> = req
            .permissions
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if cleaned.is_empty() {
            return Err(ApiError::validation(json!({
                "fields": [{ "field": "permissions", "reason": "must not be empty" }]
            })));
        }
        cleaned
    };
    if req.expires_at.is_some_and(|expiry| expiry <= Utc::now()) {
        return Err(ApiError::validation(json!({
            "fields": [{ "field": "expires_at", "reason": "must be in the future" }]
        })));
    }

    let generated = generate_api_key();
    let record = ApiKeyRecord {
        id: generated.id,
        user_id: auth.user_id,
        tenant_id: auth.tenant_id,
        key_salt: generated.salt,
        key_hash: generated.hash,
        key_suffix: generated.suffix.clone(),
        permissions,
        expires_at: req.expires_at,
        role: auth.role,
        plan: auth.plan,
        email: auth.email.clone(),
    };
    state
        .persistence
        .insert_api_key(&record)
        .await
        .map_err(ApiError::internal)?;
    // Usable immediately on this instance; peers pick it up on refresh.
    state.key_cache.insert(record.clone()).await;

    Ok(success(json!({
        "id": generated.id,
        "api_key": generated.token,
        "key_suffix": generated.suffix,
        "permissions": record.permissions,
        "expires_at": record.expires_at,
    })))
}

/// Revocation is immediate on this instance; the refresh interval bounds
/// propagation to the rest of the fleet.
pub async fn revoke(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_role(&auth, Role::Manager)?;
    let revoked = state
        .persistence
        .revoke_api_key(id, auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    if !revoked {
        return Err(ApiError::NotFound);
    }
    state.key_cache.remove(&id).await;
    Ok(success(json!({ "revoked": true })))
}
