use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use once_cell::sync::{Lazy, OnceCell};
use prometheus::{IntCounterVec, Opts, Registry};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Pacing information attached to 429 responses.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch: i64,
    pub retry_after_ms: u64,
}

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<Uuid>,
}

#[derive(Serialize, Debug)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

#[derive(Debug)]
pub enum ApiError {
    InvalidRequest { message: String },
    Unauthenticated,
    Forbidden,
    CredentialExpired,
    NotFound,
    Conflict { message: String },
    ValidationFailed { details: Value },
    RateLimited { info: RateLimitInfo },
    QuotaExceeded { info: RateLimitInfo },
    UpstreamTimeout,
    UpstreamUnavailable,
    Internal { trace_id: Uuid },
}

impl ApiError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest { message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    pub fn validation(details: Value) -> Self {
        Self::ValidationFailed { details }
    }

    /// Logs full detail under a fresh trace id; the client only sees the id.
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        let trace_id = Uuid::new_v4();
        tracing::error!(%trace_id, detail = %err, "internal error");
        Self::Internal { trace_id }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::CredentialExpired => "credential_expired",
            Self::NotFound => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::RateLimited { .. } => "rate_limited",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::UpstreamTimeout => "upstream_timeout",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::Internal { .. } => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated | Self::CredentialExpired => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::RateLimited { .. } | Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::InvalidRequest { message } | Self::Conflict { message } => message.clone(),
            Self::Unauthenticated => "Authentication required".into(),
            Self::Forbidden => "Insufficient permissions for this operation".into(),
            Self::CredentialExpired => "Credential has expired".into(),
            Self::NotFound => "Resource not found".into(),
            Self::ValidationFailed { .. } => "Request validation failed".into(),
            Self::RateLimited { .. } => "Rate limit exceeded".into(),
            Self::QuotaExceeded { .. } => "Usage quota exceeded".into(),
            Self::UpstreamTimeout => "Upstream request timed out".into(),
            Self::UpstreamUnavailable => "Upstream service is unavailable".into(),
            Self::Internal { trace_id } => format!("Internal error (trace {trace_id})"),
        }
    }

    fn rate_info(&self) -> Option<RateLimitInfo> {
        match self {
            Self::RateLimited { info } | Self::QuotaExceeded { info } => Some(*info),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        record_http_error(code, status.as_u16());

        let rate_info = self.rate_info();
        let (details, trace_id) = match &self {
            ApiError::ValidationFailed { details } => (Some(details.clone()), None),
            ApiError::Internal { trace_id } => (None, Some(*trace_id)),
            _ => (None, None),
        };
        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: code.into(),
                message: self.message(),
                details,
                trace_id,
            },
        };

        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        if let Some(info) = rate_info {
            let headers = resp.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(info.limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(info.remaining));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(info.reset_epoch));
            let retry_secs = info.retry_after_ms.div_ceil(1000);
            headers.insert("Retry-After", HeaderValue::from(retry_secs));
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ---------------- Error metrics ----------------

static SERVICE_NAME: OnceCell<&'static str> = OnceCell::new();

static HTTP_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "http_errors_total",
            "Count of HTTP error responses emitted (status >= 400)",
        ),
        &["service", "code", "status"],
    )
    .expect("valid metric definition")
});

/// Call once at startup; later calls are ignored.
pub fn init_error_metrics(service: &'static str, registry: &Registry) {
    let _ = SERVICE_NAME.set(service);
    let _ = registry.register(Box::new(HTTP_ERRORS.clone()));
}

pub fn record_http_error(code: &str, status: u16) {
    if status < 400 {
        return;
    }
    let service = SERVICE_NAME.get().copied().unwrap_or("unknown");
    HTTP_ERRORS
        .with_label_values(&[service, code, &status.to_string()])
        .inc();
}

/// Counts error responses that did not pass through `ApiError` (extractor
/// rejections and the like). Mapped errors carry `X-Error-Code` and were
/// already counted by `IntoResponse`.
pub async fn http_error_metrics_layer(req: Request, next: Next) -> Response {
    let resp = next.run(req).await;
    let status = resp.status();
    if (status.is_client_error() || status.is_server_error())
        && !resp.headers().contains_key("X-Error-Code")
    {
        record_http_error("unmapped", status.as_u16());
    }
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn rate_limited_shape() {
        let err = ApiError::RateLimited {
            info: RateLimitInfo { limit: 60, remaining: 0, reset_epoch: 1_700_000_000, retry_after_ms: 1500 },
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "rate_limited");
        assert_eq!(resp.headers().get("Retry-After").unwrap(), "2");
        assert_eq!(resp.headers().get("X-RateLimit-Remaining").unwrap(), "0");
        let bytes = to_bytes(resp.into_body(), 2048).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "rate_limited");
    }

    #[tokio::test]
    async fn validation_failed_carries_details() {
        let err = ApiError::validation(serde_json::json!({"field": "text", "reason": "empty"}));
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let bytes = to_bytes(resp.into_body(), 2048).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["details"]["field"], "text");
    }

    #[tokio::test]
    async fn internal_is_opaque() {
        let err = ApiError::internal("connection pool exhausted");
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = to_bytes(resp.into_body(), 2048).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(body["error"]["trace_id"].is_string());
        assert!(!body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("connection pool"));
    }
}
