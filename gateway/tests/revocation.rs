mod support;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue};
use chrono::Utc;
use common_auth::{JwtConfig, JwtVerifier, Plan, Role, SecretStore};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;
use support::{harness, test_config, StubWorker};
use uuid::Uuid;

use transform_gateway::app_state::AppState;
use transform_gateway::identity::{
    generate_api_key, resolve_identity, ApiKeyRecord, InMemoryRevocationStore, KeyCache,
    RevocationStore,
};
use transform_gateway::tokens::TokenSigner;

const SECRET: &str = "integration-test-secret";

fn state() -> AppState {
    let config = test_config();
    let h = harness(StubWorker::new());
    let persistence = support::lazy_persistence(&config);
    let secrets = SecretStore::from_spec(&format!("k1:{SECRET}")).unwrap();
    let jwt_config = JwtConfig::new();
    AppState {
        config,
        metrics: h.metrics.clone(),
        persistence: persistence.clone(),
        verifier: Arc::new(JwtVerifier::new(jwt_config.clone(), secrets.clone())),
        signer: Arc::new(TokenSigner::new(persistence.pool().clone(), jwt_config, secrets)),
        revocations: Arc::new(InMemoryRevocationStore::new()),
        key_cache: Arc::new(KeyCache::new()),
        rules: h.rules.clone(),
        orchestrator: h.orchestrator.clone(),
        redis: None,
    }
}

fn signed_token(jti: Uuid) -> String {
    let now = Utc::now().timestamp();
    let claims = json!({
        "sub": Uuid::new_v4().to_string(),
        "email": "pat@example.com",
        "tenant_id": Uuid::new_v4().to_string(),
        "role": "member",
        "plan": "free",
        "iat": now,
        "exp": now + 600,
        "jti": jti.to_string(),
    });
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("k1".to_string());
    encode(&header, &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
}

fn bearer_headers(token: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    headers
}

/// A valid token resolves; once its jti enters the revocation set, the same
/// token is rejected as unauthenticated.
#[tokio::test]
async fn revoked_jti_is_rejected() {
    let state = state();
    let jti = Uuid::new_v4();
    let token = signed_token(jti);

    let auth = resolve_identity(&state, &bearer_headers(&token)).await.unwrap();
    assert_eq!(auth.role, Role::Member);
    assert_eq!(auth.jti, Some(jti));

    state.revocations.revoke(jti, Duration::from_secs(600)).await.unwrap();

    let err = resolve_identity(&state, &bearer_headers(&token)).await.unwrap_err();
    assert_eq!(err.code(), "unauthenticated");
}

#[tokio::test]
async fn expired_token_maps_to_credential_expired() {
    let state = state();
    let now = Utc::now().timestamp();
    let claims = json!({
        "sub": Uuid::new_v4().to_string(),
        "email": "pat@example.com",
        "tenant_id": Uuid::new_v4().to_string(),
        "role": "member",
        "plan": "free",
        "iat": now - 7200,
        "exp": now - 3600,
        "jti": Uuid::new_v4().to_string(),
    });
    let mut header = Header::new(Algorithm::HS256);
    header.kid = Some("k1".to_string());
    let token = encode(&header, &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();

    let err = resolve_identity(&state, &bearer_headers(&token)).await.unwrap_err();
    assert_eq!(err.code(), "credential_expired");
}

#[tokio::test]
async fn missing_and_malformed_credentials_are_unauthenticated() {
    let state = state();
    let err = resolve_identity(&state, &HeaderMap::new()).await.unwrap_err();
    assert_eq!(err.code(), "unauthenticated");

    let err = resolve_identity(&state, &bearer_headers("not-a-jwt")).await.unwrap_err();
    assert_eq!(err.code(), "unauthenticated");

    let mut headers = HeaderMap::new();
    headers.insert("X-API-Key", HeaderValue::from_static("tg_garbage"));
    let err = resolve_identity(&state, &headers).await.unwrap_err();
    assert_eq!(err.code(), "unauthenticated");
}

/// API keys resolve through the cache and stop working the moment the cache
/// entry goes away (revocation propagation bound is the refresh interval).
#[tokio::test]
async fn api_key_resolution_and_revocation() {
    let state = state();
    let generated = generate_api_key();
    let record = ApiKeyRecord {
        id: generated.id,
        user_id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        key_salt: generated.salt.clone(),
        key_hash: generated.hash.clone(),
        key_suffix: generated.suffix.clone(),
        permissions: vec!["transform".to_string()],
        expires_at: None,
        role: Role::Member,
        plan: Plan::Pro,
        email: "robot@example.com".to_string(),
    };
    state.key_cache.insert(record.clone()).await;

    let mut headers = HeaderMap::new();
    headers.insert("X-API-Key", HeaderValue::from_str(&generated.token).unwrap());

    let auth = resolve_identity(&state, &headers).await.unwrap();
    assert_eq!(auth.tenant_id, record.tenant_id);
    assert_eq!(auth.plan, Plan::Pro);
    assert!(auth.has_permission("transform"));
    assert!(!auth.has_permission("rules:write"));

    state.key_cache.remove(&record.id).await;
    let err = resolve_identity(&state, &headers).await.unwrap_err();
    assert_eq!(err.code(), "unauthenticated");
}

/// A presented key whose secret does not match the stored digest is
/// rejected even though the key id exists.
#[tokio::test]
async fn api_key_with_wrong_secret_is_rejected() {
    let state = state();
    let generated = generate_api_key();
    let record = ApiKeyRecord {
        id: generated.id,
        user_id: Uuid::new_v4(),
        tenant_id: Uuid::new_v4(),
        key_salt: generated.salt.clone(),
        key_hash: generated.hash.clone(),
        key_suffix: generated.suffix.clone(),
        permissions: vec![],
        expires_at: None,
        role: Role::Member,
        plan: Plan::Free,
        email: "robot@example.com".to_string(),
    };
    state.key_cache.insert(record).await;

    let forged = format!("tg_{}.{}", generated.id.simple(), "A".repeat(43));
    let mut headers = HeaderMap::new();
    headers.insert("X-API-Key", HeaderValue::from_str(&forged).unwrap());
    let err = resolve_identity(&state, &headers).await.unwrap_err();
    assert_eq!(err.code(), "unauthenticated");
}
