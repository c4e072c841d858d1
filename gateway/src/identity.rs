use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use common_auth::{AuthContext, Plan, Role};
use common_http_errors::ApiError;
use rand_core::{OsRng, RngCore};
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::persistence::Persistence;

pub const API_KEY_HEADER: &str = "X-API-Key";
const API_KEY_PREFIX: &str = "tg_";

/// Machine credential as held in the key cache: hash material plus the
/// context the resolver attaches on a match.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub key_salt: String,
    pub key_hash: String,
    pub key_suffix: String,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub role: Role,
    pub plan: Plan,
    pub email: String,
}

pub struct GeneratedKey {
    pub id: Uuid,
    /// Shown to the caller exactly once; never stored.
    pub token: String,
    pub salt: String,
    pub hash: String,
    pub suffix: String,
}

/// Issues `tg_<id>.<secret>` with 256 bits of secret entropy; only the
/// salted digest is stored.
pub fn generate_api_key() -> GeneratedKey {
    let id = Uuid::new_v4();
    let mut secret_bytes = [0u8; 32];
    OsRng.fill_bytes(&mut secret_bytes);
    let secret = URL_SAFE_NO_PAD.encode(secret_bytes);

    let mut salt_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut salt_bytes);
    let salt = hex::encode(salt_bytes);

    let token = format!("{API_KEY_PREFIX}{}.{secret}", id.simple());
    let hash = hash_api_secret(&salt, &secret);
    let suffix = secret[secret.len() - 4..].to_string();
    GeneratedKey { id, token, salt, hash, suffix }
}

pub fn hash_api_secret(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

fn parse_api_key(raw: &str) -> Option<(Uuid, &str)> {
    let rest = raw.strip_prefix(API_KEY_PREFIX)?;
    let (id, secret) = rest.split_once('.')?;
    let id = Uuid::try_parse(id).ok()?;
    if secret.is_empty() {
        return None;
    }
    Some((id, secret))
}

/// Digest comparison that does not leak a mismatch position.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// A syntactically valid digest compared when the key id is unknown, keeping
// the lookup path's timing flat.
const DUMMY_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ---------------- key cache ----------------

/// In-process snapshot of active API keys, refreshed on an interval that
/// bounds revocation propagation.
pub struct KeyCache {
    inner: RwLock<HashMap<Uuid, ApiKeyRecord>>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self { inner: RwLock::new(HashMap::new()) }
    }

    pub async fn replace_all(&self, records: Vec<ApiKeyRecord>) {
        let map = records.into_iter().map(|r| (r.id, r)).collect();
        let mut guard = self.inner.write().await;
        *guard = map;
    }

    pub async fn get(&self, id: &Uuid) -> Option<ApiKeyRecord> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn insert(&self, record: ApiKeyRecord) {
        self.inner.write().await.insert(record.id, record);
    }

    pub async fn remove(&self, id: &Uuid) {
        self.inner.write().await.remove(id);
    }
}

impl Default for KeyCache {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn load_key_cache(persistence: &Persistence, cache: &KeyCache) -> Result<usize, sqlx::Error> {
    let records = persistence.load_active_api_keys().await?;
    let count = records.len();
    cache.replace_all(records).await;
    Ok(count)
}

pub fn spawn_key_cache_refresh(persistence: Persistence, cache: Arc<KeyCache>, refresh_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(refresh_secs.max(5)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match load_key_cache(&persistence, &cache).await {
                Ok(count) => debug!(count, "refreshed api key cache"),
                Err(err) => warn!(%err, "failed to refresh api key cache"),
            }
        }
    });
}

// ---------------- revocation set ----------------

#[async_trait]
pub trait RevocationStore: Send + Sync {
    async fn is_revoked(&self, jti: Uuid) -> Result<bool, anyhow::Error>;
    async fn revoke(&self, jti: Uuid, ttl: Duration) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisRevocationStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisRevocationStore {
    pub fn new(manager: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self { manager, prefix: prefix.into() }
    }

    fn key(&self, jti: Uuid) -> String {
        format!("{}:{}", self.prefix, jti)
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn is_revoked(&self, jti: Uuid) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(self.key(jti))
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn revoke(&self, jti: Uuid, ttl: Duration) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.key(jti))
            .arg(1)
            .arg("PX")
            .arg(ttl.as_millis().max(1000) as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Test double with the same semantics.
#[derive(Default)]
pub struct InMemoryRevocationStore {
    inner: std::sync::Mutex<HashMap<Uuid, std::time::Instant>>,
}

impl InMemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RevocationStore for InMemoryRevocationStore {
    async fn is_revoked(&self, jti: Uuid) -> Result<bool, anyhow::Error> {
        let guard = self.inner.lock().expect("revocation lock poisoned");
        Ok(guard.get(&jti).is_some_and(|expiry| *expiry > std::time::Instant::now()))
    }

    async fn revoke(&self, jti: Uuid, ttl: Duration) -> Result<(), anyhow::Error> {
        let mut guard = self.inner.lock().expect("revocation lock poisoned");
        guard.insert(jti, std::time::Instant::now() + ttl);
        Ok(())
    }
}

// ---------------- resolver ----------------

/// Binds the request to `(user, tenant, role, plan, permissions)` or
/// rejects it. JWT and API-key failures are deliberately indistinguishable in
/// the response.
pub async fn resolve_identity(state: &AppState, headers: &HeaderMap) -> Result<AuthContext, ApiError> {
    let tenant_hint = headers
        .get("X-Tenant-ID")
        .and_then(|value| value.to_str().ok())
        .map(|raw| Uuid::parse_str(raw).map_err(|_| ApiError::invalid("Invalid tenant header")))
        .transpose()?;

    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer ").map(str::trim))
        .filter(|token| !token.is_empty());

    if let Some(token) = bearer {
        let claims = state.verifier.verify(token).map_err(|err| {
            debug!(%err, "JWT verification failed");
            ApiError::from(err)
        })?;
        if tenant_hint.is_some_and(|hint| hint != claims.tenant_id) {
            return Err(ApiError::Forbidden);
        }

        match state.revocations.is_revoked(claims.jti).await {
            Ok(true) => return Err(ApiError::Unauthenticated),
            Ok(false) => {}
            Err(err) => {
                // Degraded revocation lookups fail open inside the staleness
                // bound rather than taking down all authenticated traffic.
                warn!(%err, "revocation check failed");
                state.metrics.record_revocation_check_failure();
            }
        }
        return Ok(AuthContext::from_claims(&claims));
    }

    if let Some(raw_key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        let Some((key_id, secret)) = parse_api_key(raw_key) else {
            return Err(ApiError::Unauthenticated);
        };

        let record = state.key_cache.get(&key_id).await;
        let stored_hash = record.as_ref().map(|r| r.key_hash.clone());
        let salt = record.as_ref().map(|r| r.key_salt.clone()).unwrap_or_default();

        let presented = hash_api_secret(&salt, secret);
        let matches = constant_time_eq(
            presented.as_bytes(),
            stored_hash.as_deref().unwrap_or(DUMMY_HASH).as_bytes(),
        );
        let Some(record) = record else {
            return Err(ApiError::Unauthenticated);
        };
        if !matches {
            return Err(ApiError::Unauthenticated);
        }
        if record.expires_at.is_some_and(|expiry| expiry <= Utc::now()) {
            return Err(ApiError::CredentialExpired);
        }
        if tenant_hint.is_some_and(|hint| hint != record.tenant_id) {
            return Err(ApiError::Forbidden);
        }

        return Ok(AuthContext {
            user_id: record.user_id,
            tenant_id: record.tenant_id,
            email: record.email,
            role: record.role,
            plan: record.plan,
            permissions: record.permissions,
            jti: None,
        });
    }

    Err(ApiError::Unauthenticated)
}

/// Layer guarding every authenticated route; attaches `AuthContext` for the
/// handler extractors.
pub async fn identity_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let auth = resolve_identity(&state, request.headers()).await?;
    request.extensions_mut().insert(auth);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_parse_and_verify() {
        let generated = generate_api_key();
        let (parsed_id, secret) = parse_api_key(&generated.token).unwrap();
        assert_eq!(parsed_id, generated.id);
        assert_eq!(hash_api_secret(&generated.salt, secret), generated.hash);
        assert_eq!(generated.suffix.len(), 4);
    }

    #[test]
    fn malformed_keys_are_rejected() {
        assert!(parse_api_key("not-a-key").is_none());
        assert!(parse_api_key("tg_missing-dot").is_none());
        assert!(parse_api_key("tg_81a1b2c3d4e5f60718293a4b5c6d7e8f.").is_none());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[tokio::test]
    async fn in_memory_revocation_honors_ttl() {
        let store = InMemoryRevocationStore::new();
        let jti = Uuid::new_v4();
        assert!(!store.is_revoked(jti).await.unwrap());
        store.revoke(jti, Duration::from_secs(60)).await.unwrap();
        assert!(store.is_revoked(jti).await.unwrap());
    }

    #[tokio::test]
    async fn key_cache_replace_and_remove() {
        let cache = KeyCache::new();
        let generated = generate_api_key();
        let id = generated.id;
        cache
            .replace_all(vec![ApiKeyRecord {
                id,
                user_id: Uuid::new_v4(),
                tenant_id: Uuid::new_v4(),
                key_salt: generated.salt,
                key_hash: generated.hash,
                key_suffix: generated.suffix,
                permissions: vec!["transform".into()],
                expires_at: None,
                role: Role::Member,
                plan: Plan::Standard,
                email: "robot@example.com".into(),
            }])
            .await;
        assert!(cache.get(&id).await.is_some());
        cache.remove(&id).await;
        assert!(cache.get(&id).await.is_none());
    }
}
