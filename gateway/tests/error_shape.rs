use axum::body::to_bytes;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use transform_gateway::validation::{validate_transform, TransformPayload};

fn preview_payload(len: usize) -> TransformPayload {
    TransformPayload {
        text: "a".repeat(len),
        transformation_type: "soften".to_string(),
        intensity_level: 1,
        target_tone: None,
        options: None,
    }
}

/// Preview boundary: 500 characters pass, 501 produce the envelope with
/// structured field details.
#[tokio::test]
async fn preview_length_boundary_shape() {
    assert!(validate_transform(preview_payload(500), 500, true).is_ok());

    let err = validate_transform(preview_payload(501), 500, true).unwrap_err();
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "validation_failed");

    let bytes = to_bytes(resp.into_body(), 4096).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "validation_failed");
    assert_eq!(body["error"]["details"]["fields"][0]["field"], "text");
}

/// Multiple invalid fields are reported together.
#[tokio::test]
async fn validation_aggregates_field_errors() {
    let payload = TransformPayload {
        text: String::new(),
        transformation_type: "shorten".to_string(),
        intensity_level: 9,
        target_tone: Some("sarcastic".to_string()),
        options: None,
    };
    let err = validate_transform(payload, 100, false).unwrap_err();
    let resp = err.into_response();
    let bytes = to_bytes(resp.into_body(), 4096).await.unwrap();
    let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    let fields = body["error"]["details"]["fields"].as_array().unwrap();
    assert_eq!(fields.len(), 4);
}
