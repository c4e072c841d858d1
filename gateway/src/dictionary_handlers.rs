use axum::extract::{Path, Query, State};
use axum::Json;
use common_auth::{ensure_role, AuthContext, Role};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::persistence::is_unique_violation;
use crate::responses::success;
use crate::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateEntry {
    pub technical_term: String,
    pub business_term: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub examples: Vec<String>,
}

#[derive(Deserialize)]
pub struct UpdateEntry {
    #[serde(default)]
    pub business_term: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub examples: Option<Vec<String>>,
}

pub async fn list(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let entries = state
        .persistence
        .read_dictionaries(auth.tenant_id, query.category.as_deref())
        .await
        .map_err(ApiError::internal)?;
    Ok(success(json!({ "items": entries })))
}

pub async fn create(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<CreateEntry>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_role(&auth, Role::Manager)?;
    let technical_term = req.technical_term.trim();
    let business_term = req.business_term.trim();
    if technical_term.is_empty() || business_term.is_empty() {
        return Err(ApiError::validation(json!({
            "fields": [{ "field": "technical_term", "reason": "terms must not be empty" }]
        })));
    }

    let entry = state
        .persistence
        .insert_dictionary(
            auth.tenant_id,
            technical_term,
            business_term,
            req.category.as_deref(),
            &req.examples,
        )
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ApiError::conflict("A dictionary entry for this term already exists")
            } else {
                ApiError::internal(err)
            }
        })?;
    Ok(success(entry))
}

pub async fn update(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateEntry>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_role(&auth, Role::Manager)?;
    let entry = state
        .persistence
        .update_dictionary(
            id,
            auth.tenant_id,
            req.business_term.as_deref(),
            req.category.as_deref(),
            req.examples.as_deref(),
        )
        .await
        .map_err(ApiError::internal)?
        .ok_or(ApiError::NotFound)?;
    Ok(success(entry))
}

pub async fn delete(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_role(&auth, Role::Manager)?;
    let deleted = state
        .persistence
        .delete_dictionary(id, auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    if !deleted {
        return Err(ApiError::NotFound);
    }
    Ok(success(json!({ "deleted": true })))
}
