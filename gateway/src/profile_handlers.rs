use axum::extract::State;
use axum::Json;
use common_auth::AuthContext;
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::Value;

use crate::responses::success;
use crate::AppState;

pub async fn get_profile(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<Value>> {
    let profile = state
        .persistence
        .read_profile(auth.user_id)
        .await
        .map_err(ApiError::internal)?
        .ok_or(ApiError::NotFound)?;
    Ok(success(profile))
}

#[derive(Deserialize)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub preferences: Option<Value>,
}

pub async fn update_profile(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<Json<Value>> {
    if let Some(name) = req.name.as_deref() {
        if name.trim().is_empty() {
            return Err(ApiError::validation(serde_json::json!({
                "fields": [{ "field": "name", "reason": "must not be empty" }]
            })));
        }
    }
    if let Some(preferences) = &req.preferences {
        if !preferences.is_object() {
            return Err(ApiError::validation(serde_json::json!({
                "fields": [{ "field": "preferences", "reason": "must be an object" }]
            })));
        }
    }

    let profile = state
        .persistence
        .update_profile(auth.user_id, req.name.as_deref().map(str::trim), req.preferences.as_ref())
        .await
        .map_err(ApiError::internal)?
        .ok_or(ApiError::NotFound)?;
    Ok(success(profile))
}
