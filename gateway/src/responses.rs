use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::rate_limit::RateDecision;

/// Success envelope shared by every endpoint.
pub fn success<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "data": data }))
}

/// Attaches the rate-limit pacing headers to a successful response.
pub fn with_rate_headers(body: Json<serde_json::Value>, decision: &RateDecision) -> Response {
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(decision.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(decision.remaining()));
    headers.insert("X-RateLimit-Reset", HeaderValue::from(decision.reset_epoch));
    response
}
