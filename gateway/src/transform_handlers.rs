use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use common_auth::AuthContext;
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::json;

use crate::responses::{success, with_rate_headers};
use crate::validation::{validate_analyze, validate_transform, AnalyzePayload, TransformPayload};
use crate::worker::TransformationKind;
use crate::AppState;

pub const CLIENT_TIMEOUT_HEADER: &str = "X-Request-Timeout-Ms";

pub fn client_timeout(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CLIENT_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

pub async fn transform(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(payload): Json<TransformPayload>,
) -> ApiResult<Response> {
    let mut valid = validate_transform(payload, state.config.max_text_len, false)?;
    if valid.kind == TransformationKind::Terminology {
        attach_terminology(&state, &auth, &mut valid).await;
    }
    let deadline = state.orchestrator.request_deadline(client_timeout(&headers));
    let (data, decision) = state
        .orchestrator
        .authed_transform(&auth, valid, deadline, "transform", None, None)
        .await?;
    Ok(with_rate_headers(success(data), &decision))
}

/// Terminology transforms carry the tenant's dictionary to the worker. The
/// entries become part of the request options, so cache keys change when the
/// dictionary does. Best-effort: a read failure leaves the options alone.
async fn attach_terminology(state: &AppState, auth: &AuthContext, valid: &mut crate::validation::ValidTransform) {
    match state.persistence.read_dictionaries(auth.tenant_id, None).await {
        Ok(entries) if !entries.is_empty() => {
            let mapping: serde_json::Map<String, serde_json::Value> = entries
                .iter()
                .map(|e| (e.technical_term.clone(), json!(e.business_term)))
                .collect();
            let options = valid.options.get_or_insert_with(|| json!({}));
            if let Some(object) = options.as_object_mut() {
                object.insert("terminology".to_string(), serde_json::Value::Object(mapping));
            }
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(%err, tenant_id = %auth.tenant_id, "dictionary read failed; transforming without terminology"),
    }
}

pub async fn analyze(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(payload): Json<AnalyzePayload>,
) -> ApiResult<Response> {
    let valid = validate_analyze(payload, state.config.max_text_len)?;
    let deadline = state.orchestrator.request_deadline(client_timeout(&headers));
    let (data, decision) = state.orchestrator.authed_analyze(&auth, valid, deadline).await?;
    Ok(with_rate_headers(success(data), &decision))
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn history(
    State(state): State<AppState>,
    auth: AuthContext,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let rows = state
        .persistence
        .read_history(auth.user_id, query.limit, query.offset)
        .await
        .map_err(ApiError::internal)?;
    Ok(success(json!({
        "items": rows,
        "limit": query.limit.clamp(1, 200),
        "offset": query.offset.max(0),
    })))
}

pub async fn usage(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<serde_json::Value>> {
    let used = state
        .persistence
        .month_request_count(auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let subscription = state
        .persistence
        .read_subscription(auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let limits = state.config.plan_limits(auth.plan);

    Ok(success(json!({
        "month_requests_used": used,
        "plan": auth.plan.as_str(),
        "limits": {
            "per_minute": limits.per_minute,
            "per_day": limits.per_day,
            "per_month": limits.per_month,
        },
        "subscription": subscription,
    })))
}
