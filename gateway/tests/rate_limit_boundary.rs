mod support;

use support::{harness, member_auth, StubWorker};
use transform_gateway::validation::{validate_transform, TransformPayload};
use uuid::Uuid;

fn payload(text: &str) -> TransformPayload {
    TransformPayload {
        text: text.to_string(),
        transformation_type: "soften".to_string(),
        intensity_level: 1,
        target_tone: None,
        options: None,
    }
}

/// Free plan is pinned at 60/minute in the test environment: all 60 requests
/// inside the window pass, the 61st is rejected with a positive, bounded
/// Retry-After.
#[tokio::test]
async fn sixty_first_request_in_window_is_rejected() {
    let h = harness(StubWorker::new());
    let tenant = Uuid::new_v4();
    let auth = member_auth(tenant);

    for i in 0..60 {
        // Unique text per request keeps the cache out of the picture.
        let valid = validate_transform(payload(&format!("message {i}")), 10_000, false).unwrap();
        let deadline = h.orchestrator.request_deadline(Some(2_000));
        let (_, decision) = h
            .orchestrator
            .authed_transform(&auth, valid, deadline, "transform", None, None)
            .await
            .unwrap_or_else(|err| panic!("request {i} rejected: {}", err.code()));
        assert_eq!(decision.limit, 60);
    }

    let valid = validate_transform(payload("one too many"), 10_000, false).unwrap();
    let deadline = h.orchestrator.request_deadline(Some(2_000));
    let err = h
        .orchestrator
        .authed_transform(&auth, valid, deadline, "transform", None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "rate_limited");

    let response = axum::response::IntoResponse::into_response(err);
    let retry_after: u64 = response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .expect("Retry-After header");
    assert!(retry_after > 0);
    assert!(retry_after <= 60);

    // The rejected request consumed no backend resources.
    assert_eq!(h.worker.transform_count(), 60);
}

/// Limits are tenant-scoped; a second tenant is unaffected by the first
/// tenant exhausting its window.
#[tokio::test]
async fn tenants_have_independent_windows() {
    let h = harness(StubWorker::new());
    let first = member_auth(Uuid::new_v4());
    for i in 0..60 {
        let valid = validate_transform(payload(&format!("t1 {i}")), 10_000, false).unwrap();
        let deadline = h.orchestrator.request_deadline(Some(2_000));
        h.orchestrator
            .authed_transform(&first, valid, deadline, "transform", None, None)
            .await
            .unwrap();
    }

    let second = member_auth(Uuid::new_v4());
    let valid = validate_transform(payload("other tenant"), 10_000, false).unwrap();
    let deadline = h.orchestrator.request_deadline(Some(2_000));
    assert!(h
        .orchestrator
        .authed_transform(&second, valid, deadline, "transform", None, None)
        .await
        .is_ok());
}

/// Preview admission is keyed by IP with its own tight limits (3/minute in
/// config defaults).
#[tokio::test]
async fn preview_ip_limits_are_tight() {
    let h = harness(StubWorker::new());
    for i in 0..3 {
        let valid = validate_transform(payload(&format!("preview {i}")), 500, true).unwrap();
        let deadline = h.orchestrator.request_deadline(Some(2_000));
        h.orchestrator
            .preview_transform("198.51.100.4", valid, deadline)
            .await
            .unwrap_or_else(|err| panic!("preview {i} rejected: {}", err.code()));
    }

    let valid = validate_transform(payload("preview 4"), 500, true).unwrap();
    let deadline = h.orchestrator.request_deadline(Some(2_000));
    let err = h
        .orchestrator
        .preview_transform("198.51.100.4", valid, deadline)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "rate_limited");

    // A different address still has budget.
    let valid = validate_transform(payload("other ip"), 500, true).unwrap();
    let deadline = h.orchestrator.request_deadline(Some(2_000));
    assert!(h
        .orchestrator
        .preview_transform("198.51.100.5", valid, deadline)
        .await
        .is_ok());
}
