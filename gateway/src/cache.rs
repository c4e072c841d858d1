use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::metrics::GatewayMetrics;
use crate::worker::ProxyError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("kv store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(value: redis::RedisError) -> Self {
        Self::Store(value.to_string())
    }
}

/// Serialized backend response plus the metadata needed to honor TTLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Value,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(payload: Value, model: Option<String>, ttl: Duration) -> Self {
        Self { payload, model, created_at: Utc::now(), ttl_secs: ttl.as_secs().max(1) }
    }

    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.created_at);
        age.num_seconds() >= self.ttl_secs as i64
    }

    fn remaining_wall(&self) -> Duration {
        let expires = self.created_at + chrono::Duration::seconds(self.ttl_secs as i64);
        let left = expires.signed_duration_since(Utc::now()).num_milliseconds();
        Duration::from_millis(left.max(0) as u64)
    }
}

// ---------------- L2: shared KV store ----------------

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisStore {
    pub fn new(manager: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self { manager, prefix: prefix.into() }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// In-process stand-in used by tests and L2-less deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner.lock().expect("store lock poisoned").values().filter(|(_, exp)| *exp > now).count()
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut guard = self.inner.lock().expect("store lock poisoned");
        match guard.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                guard.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut guard = self.inner.lock().expect("store lock poisoned");
        guard.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }
}

// ---------------- L1: bounded in-process map ----------------

struct L1Entry {
    entry: CacheEntry,
    expires_at: Instant,
}

/// Mutex-sharded LRU. Shard choice comes from the fingerprint's leading hex
/// byte so lock contention spreads across shards.
pub struct L1Cache {
    shards: Vec<Mutex<LruCache<String, L1Entry>>>,
    ttl: Duration,
}

const L1_SHARDS: usize = 16;

impl L1Cache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let per_shard = (capacity / L1_SHARDS).max(1);
        let shards = (0..L1_SHARDS)
            .map(|_| Mutex::new(LruCache::new(NonZeroUsize::new(per_shard).expect("nonzero"))))
            .collect();
        Self { shards, ttl }
    }

    fn shard(&self, key: &str) -> &Mutex<LruCache<String, L1Entry>> {
        let idx = usize::from_str_radix(&key[..2.min(key.len())], 16).unwrap_or(0) % L1_SHARDS;
        &self.shards[idx]
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut shard = self.shard(key).lock().expect("l1 lock poisoned");
        match shard.get(key) {
            Some(held) if held.expires_at > Instant::now() && !held.entry.is_expired() => {
                Some(held.entry.clone())
            }
            Some(_) => {
                shard.pop(key);
                None
            }
            None => None,
        }
    }

    /// Recency refresh happens on read; the expiry never moves past the
    /// entry's creation-time TTL.
    pub fn insert(&self, key: &str, entry: CacheEntry) {
        let local_ttl = self.ttl.min(entry.remaining_wall());
        if local_ttl.is_zero() {
            return;
        }
        let held = L1Entry { entry, expires_at: Instant::now() + local_ttl };
        let mut shard = self.shard(key).lock().expect("l1 lock poisoned");
        shard.put(key.to_string(), held);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().expect("l1 lock poisoned").len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------- Tiered facade with single-flight ----------------

#[derive(Debug)]
pub struct CacheLookup {
    pub entry: CacheEntry,
    pub cache_hit: bool,
}

type FlightResult = Result<CacheEntry, ProxyError>;

/// L1 over L2 with per-fingerprint request coalescing. Concurrent misses for
/// one fingerprint produce exactly one backend call on this instance; the
/// leader's result (or error) fans out to every waiter. Failures are never
/// cached.
pub struct TieredCache {
    l1: L1Cache,
    l2: Arc<dyn CacheStore>,
    flights: Mutex<HashMap<String, broadcast::Sender<FlightResult>>>,
    /// In-flight tokens are bounded by L1 capacity; at the cap new misses
    /// shed instead of queueing without bound.
    max_flights: usize,
    l2_ttl: Duration,
    metrics: Arc<GatewayMetrics>,
}

impl TieredCache {
    pub fn new(
        l1: L1Cache,
        l2: Arc<dyn CacheStore>,
        l2_ttl: Duration,
        max_flights: usize,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            l1,
            l2,
            flights: Mutex::new(HashMap::new()),
            max_flights: max_flights.max(1),
            l2_ttl,
            metrics,
        }
    }

    pub fn l1_len(&self) -> usize {
        self.l1.len()
    }

    async fn lookup(&self, fp: &str) -> Option<CacheEntry> {
        if let Some(entry) = self.l1.get(fp) {
            self.metrics.record_cache_event("l1", "hit");
            return Some(entry);
        }
        self.metrics.record_cache_event("l1", "miss");

        match self.l2.get(fp).await {
            Ok(Some(raw)) => match serde_json::from_str::<CacheEntry>(&raw) {
                Ok(entry) if !entry.is_expired() => {
                    self.metrics.record_cache_event("l2", "hit");
                    self.l1.insert(fp, entry.clone());
                    self.metrics.set_l1_entries(self.l1.len() as i64);
                    Some(entry)
                }
                Ok(_) => {
                    self.metrics.record_cache_event("l2", "expired");
                    None
                }
                Err(err) => {
                    warn!(%err, "discarding undecodable L2 entry");
                    self.metrics.record_cache_event("l2", "corrupt");
                    None
                }
            },
            Ok(None) => {
                self.metrics.record_cache_event("l2", "miss");
                None
            }
            Err(err) => {
                // A degraded L2 is a miss, never a request failure.
                warn!(%err, "L2 lookup failed; treating as miss");
                self.metrics.record_l2_error();
                None
            }
        }
    }

    async fn fill(&self, fp: &str, entry: &CacheEntry) {
        match serde_json::to_string(entry) {
            Ok(raw) => {
                if let Err(err) = self.l2.put(fp, &raw, self.l2_ttl).await {
                    warn!(%err, "L2 fill failed");
                    self.metrics.record_l2_error();
                } else {
                    self.metrics.record_cache_event("l2", "fill");
                }
            }
            Err(err) => warn!(%err, "failed to serialize cache entry"),
        }
        self.l1.insert(fp, entry.clone());
        self.metrics.record_cache_event("l1", "fill");
        self.metrics.set_l1_entries(self.l1.len() as i64);
    }

    /// Returns the cached entry, or coalesces concurrent misses into one
    /// execution of `load`. The leader runs detached so a cancelled caller
    /// does not strand the waiters; every caller waits at most until
    /// `deadline` and gets `ProxyError::Timeout` past it.
    pub async fn get_or_load<F>(
        self: &Arc<Self>,
        fp: &str,
        deadline: Instant,
        load: F,
    ) -> Result<CacheLookup, ProxyError>
    where
        F: std::future::Future<Output = FlightResult> + Send + 'static,
    {
        if let Some(entry) = self.lookup(fp).await {
            return Ok(CacheLookup { entry, cache_hit: true });
        }

        let mut rx = {
            let mut flights = self.flights.lock().expect("flight lock poisoned");
            if let Some(tx) = flights.get(fp) {
                self.metrics.record_singleflight("waiter");
                tx.subscribe()
            } else {
                if flights.len() >= self.max_flights {
                    self.metrics.record_singleflight("shed");
                    return Err(ProxyError::Connection("in-flight request cap reached".into()));
                }
                let (tx, rx) = broadcast::channel(1);
                flights.insert(fp.to_string(), tx);
                self.metrics.record_singleflight("leader");

                let cache = self.clone();
                let key = fp.to_string();
                tokio::spawn(async move {
                    let result = load.await;
                    if let Ok(entry) = &result {
                        cache.fill(&key, entry).await;
                    }
                    let tx = {
                        let mut flights = cache.flights.lock().expect("flight lock poisoned");
                        flights.remove(&key)
                    };
                    if let Some(tx) = tx {
                        // Waiters may all have gone; a send error is fine.
                        let _ = tx.send(result);
                    }
                });
                rx
            }
        };

        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(Ok(entry))) => Ok(CacheLookup { entry, cache_hit: false }),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(recv_err)) => {
                debug!(%recv_err, "single-flight channel closed without a result");
                Err(ProxyError::Connection("coalesced call abandoned".into()))
            }
            Err(_) => Err(ProxyError::Timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metrics() -> Arc<GatewayMetrics> {
        Arc::new(GatewayMetrics::new().unwrap())
    }

    fn tiered(l1_ttl: Duration, l2_ttl: Duration) -> Arc<TieredCache> {
        Arc::new(TieredCache::new(
            L1Cache::new(64, l1_ttl),
            Arc::new(MemoryStore::new()),
            l2_ttl,
            64,
            metrics(),
        ))
    }

    fn entry(text: &str) -> CacheEntry {
        CacheEntry::new(json!({ "transformed_text": text }), Some("test-model".into()), Duration::from_secs(60))
    }

    #[test]
    fn l1_never_returns_entries_past_creation_ttl() {
        let l1 = L1Cache::new(8, Duration::from_secs(300));
        let mut stale = entry("old");
        stale.created_at = Utc::now() - chrono::Duration::seconds(120);
        stale.ttl_secs = 60;
        l1.insert("ab12", stale);
        assert!(l1.get("ab12").is_none());
    }

    #[test]
    fn l1_evicts_least_recently_used() {
        let l1 = L1Cache::new(16, Duration::from_secs(60));
        // One shard holds a single slot at this capacity; same-shard keys contend.
        l1.insert("00aa", entry("first"));
        l1.insert("00bb", entry("second"));
        assert!(l1.get("00bb").is_some());
    }

    #[tokio::test]
    async fn miss_then_hit_through_both_tiers() {
        let cache = tiered(Duration::from_secs(60), Duration::from_secs(60));
        let fp = "cafe0001";
        let loaded = cache
            .get_or_load(fp, Instant::now() + Duration::from_secs(1), async { Ok(entry("fresh")) })
            .await
            .unwrap();
        assert!(!loaded.cache_hit);

        let again = cache
            .get_or_load(fp, Instant::now() + Duration::from_secs(1), async {
                panic!("loader must not run on a hit")
            })
            .await
            .unwrap();
        assert!(again.cache_hit);
        assert_eq!(again.entry.payload["transformed_text"], "fresh");
    }

    #[tokio::test]
    async fn failures_propagate_and_are_not_cached() {
        let cache = tiered(Duration::from_secs(60), Duration::from_secs(60));
        let fp = "dead0001";
        let err = cache
            .get_or_load(fp, Instant::now() + Duration::from_secs(1), async {
                Err(ProxyError::Server(500))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Server(500)));

        // The failure left no entry behind; the next call runs the loader.
        let ok = cache
            .get_or_load(fp, Instant::now() + Duration::from_secs(1), async { Ok(entry("retry")) })
            .await
            .unwrap();
        assert!(!ok.cache_hit);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_load() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let cache = tiered(Duration::from_secs(60), Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = "beef0001";

        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_load(fp, Instant::now() + Duration::from_secs(5), async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(entry("shared"))
                    })
                    .await
            }));
        }

        for handle in handles {
            let lookup = handle.await.unwrap().unwrap();
            assert_eq!(lookup.entry.payload["transformed_text"], "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiter_deadline_expiry_is_a_timeout() {
        let cache = tiered(Duration::from_secs(60), Duration::from_secs(60));
        let err = cache
            .get_or_load("f00d0001", Instant::now() + Duration::from_millis(20), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(entry("slow"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout));
    }
}
