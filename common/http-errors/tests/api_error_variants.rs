use axum::http::StatusCode;
use axum::response::IntoResponse;
use common_http_errors::{ApiError, RateLimitInfo};
use serde_json::json;

fn info() -> RateLimitInfo {
    RateLimitInfo { limit: 10, remaining: 0, reset_epoch: 1_700_000_060, retry_after_ms: 900 }
}

#[test]
fn every_code_maps_to_its_status() {
    let cases: Vec<(ApiError, StatusCode, &str)> = vec![
        (ApiError::invalid("bad"), StatusCode::BAD_REQUEST, "invalid_request"),
        (ApiError::Unauthenticated, StatusCode::UNAUTHORIZED, "unauthenticated"),
        (ApiError::Forbidden, StatusCode::FORBIDDEN, "forbidden"),
        (ApiError::CredentialExpired, StatusCode::UNAUTHORIZED, "credential_expired"),
        (ApiError::NotFound, StatusCode::NOT_FOUND, "not_found"),
        (ApiError::conflict("dup"), StatusCode::CONFLICT, "conflict"),
        (ApiError::validation(json!({})), StatusCode::UNPROCESSABLE_ENTITY, "validation_failed"),
        (ApiError::RateLimited { info: info() }, StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        (ApiError::QuotaExceeded { info: info() }, StatusCode::TOO_MANY_REQUESTS, "quota_exceeded"),
        (ApiError::UpstreamTimeout, StatusCode::GATEWAY_TIMEOUT, "upstream_timeout"),
        (ApiError::UpstreamUnavailable, StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable"),
        (ApiError::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    ];

    for (err, status, code) in cases {
        assert_eq!(err.code(), code);
        let resp = err.into_response();
        assert_eq!(resp.status(), status, "status for {code}");
        assert_eq!(resp.headers().get("X-Error-Code").unwrap(), code);
    }
}

#[test]
fn quota_exceeded_carries_pacing_headers() {
    let resp = ApiError::QuotaExceeded { info: info() }.into_response();
    assert_eq!(resp.headers().get("X-RateLimit-Limit").unwrap(), "10");
    assert_eq!(resp.headers().get("Retry-After").unwrap(), "1");
}
