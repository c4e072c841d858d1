use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use tokio::time::Instant;
use uuid::Uuid;

use transform_gateway::breaker::{BreakerConfig, BreakerRegistry};
use transform_gateway::metrics::GatewayMetrics;
use transform_gateway::worker::{
    ProxyError, TransformationKind, WorkerApi, WorkerClient, WorkerTransformRequest,
};

fn request(text: &str) -> WorkerTransformRequest {
    WorkerTransformRequest {
        text: text.to_string(),
        transformation_type: TransformationKind::Soften,
        intensity_level: 1,
        target_tone: None,
        options: None,
    }
}

fn client(base_url: String, cooldown: Duration) -> WorkerClient {
    let metrics = Arc::new(GatewayMetrics::new().unwrap());
    let breakers = Arc::new(BreakerRegistry::new(
        BreakerConfig { cooldown, max_cooldown: cooldown * 10, ..Default::default() },
        metrics.clone(),
    ));
    WorkerClient::new(
        reqwest::Client::new(),
        base_url,
        breakers,
        0, // no retries so call counts stay exact
        1 << 20,
        metrics,
    )
}

/// Twenty consecutive 500s trip the circuit; the next request fails fast
/// without touching the network.
#[tokio::test]
async fn twenty_server_errors_open_the_circuit() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/transform");
            then.status(500).body("worker exploded");
        })
        .await;

    let client = client(server.base_url(), Duration::from_secs(30));

    for _ in 0..20 {
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = client.transform(&request("boom"), deadline, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Server(500)));
    }
    assert_eq!(mock.hits_async().await, 20);

    // Request 21: open circuit, no network I/O.
    let deadline = Instant::now() + Duration::from_secs(2);
    let err = client.transform(&request("boom"), deadline, Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, ProxyError::CircuitOpen(_)));
    assert_eq!(mock.hits_async().await, 20);
}

/// After the cooldown a trial request goes through; success starts closing
/// the circuit again.
#[tokio::test]
async fn cooldown_permits_a_trial_request() {
    let server = MockServer::start_async().await;
    let failing = server
        .mock_async(|when, then| {
            when.method(POST).path("/transform");
            then.status(500);
        })
        .await;

    let client = client(server.base_url(), Duration::from_millis(50));

    for _ in 0..20 {
        let deadline = Instant::now() + Duration::from_secs(2);
        let _ = client.transform(&request("boom"), deadline, Uuid::new_v4()).await;
    }
    failing.delete_async().await;
    let healthy = server
        .mock_async(|when, then| {
            when.method(POST).path("/transform");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({
                    "transformed_text": "all better",
                    "model": "worker-1",
                    "tokens_used": 7,
                    "metadata": {}
                }));
        })
        .await;

    tokio::time::sleep(Duration::from_millis(80)).await;

    let deadline = Instant::now() + Duration::from_secs(2);
    let response = client
        .transform(&request("trial"), deadline, Uuid::new_v4())
        .await
        .expect("trial request should reach the recovered worker");
    assert_eq!(response.transformed_text, "all better");
    assert_eq!(healthy.hits_async().await, 1);
}

/// A 4xx from the worker surfaces as a client error and never trips the
/// circuit, no matter how many arrive.
#[tokio::test]
async fn client_errors_do_not_trip_the_circuit() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/transform");
            then.status(422).body("bad payload");
        })
        .await;

    let client = client(server.base_url(), Duration::from_secs(30));

    for _ in 0..30 {
        let deadline = Instant::now() + Duration::from_secs(2);
        let err = client.transform(&request("nope"), deadline, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ProxyError::Client { status: 422, .. }));
    }
}

/// The trace id propagates to the worker in the well-known header.
#[tokio::test]
async fn trace_id_reaches_the_worker() {
    let server = MockServer::start_async().await;
    let trace_id = Uuid::new_v4();
    let mock = server
        .mock_async(move |when, then| {
            when.method(POST)
                .path("/transform")
                .header("X-Trace-ID", trace_id.to_string());
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({
                    "transformed_text": "traced",
                    "model": "worker-1",
                    "tokens_used": 1,
                    "metadata": {}
                }));
        })
        .await;

    let client = client(server.base_url(), Duration::from_secs(30));
    let deadline = Instant::now() + Duration::from_secs(2);
    client.transform(&request("trace me"), deadline, trace_id).await.unwrap();
    assert_eq!(mock.hits_async().await, 1);
}
