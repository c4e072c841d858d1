use std::net::SocketAddr;

use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde_json::json;

use crate::responses::{success, with_rate_headers};
use crate::transform_handlers::client_timeout;
use crate::validation::{validate_analyze, validate_transform, AnalyzePayload, TransformPayload};
use crate::worker::TransformationKind;
use crate::AppState;

/// Prefers the proxy-provided client address; the socket peer is the
/// fallback for direct connections.
fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn ensure_enabled(state: &AppState) -> Result<(), ApiError> {
    if state.config.preview_enabled {
        Ok(())
    } else {
        Err(ApiError::NotFound)
    }
}

pub async fn preview_transform(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<TransformPayload>,
) -> ApiResult<Response> {
    ensure_enabled(&state)?;
    let valid = validate_transform(payload, state.config.preview_max_text_len, true)?;
    let ip = client_ip(&headers, &addr);
    let deadline = state.orchestrator.request_deadline(client_timeout(&headers));
    let (data, decision) = state.orchestrator.preview_transform(&ip, valid, deadline).await?;
    Ok(with_rate_headers(success(data), &decision))
}

pub async fn preview_analyze(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<AnalyzePayload>,
) -> ApiResult<Response> {
    ensure_enabled(&state)?;
    let valid = validate_analyze(payload, state.config.preview_max_text_len)?;
    let ip = client_ip(&headers, &addr);
    let deadline = state.orchestrator.request_deadline(client_timeout(&headers));
    let (data, decision) = state.orchestrator.preview_analyze(&ip, valid, deadline).await?;
    Ok(with_rate_headers(success(data), &decision))
}

/// Capability advertisement for the demo surface.
pub async fn preview_info(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    ensure_enabled(&state)?;
    let operations: Vec<&str> = [
        TransformationKind::Soften,
        TransformationKind::Clarify,
        TransformationKind::Summarize,
    ]
    .iter()
    .map(|k| k.as_str())
    .collect();

    Ok(success(json!({
        "operations": operations,
        "max_text_length": state.config.preview_max_text_len,
        "limits": {
            "per_minute": state.config.preview_per_minute,
            "per_day": state.config.preview_per_day,
        },
    })))
}
