use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use common_auth::Plan;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::config::{GatewayConfig, PlanLimits};
use crate::persistence::Persistence;

/// Admission scopes checked on every authenticated request. Minute is the
/// short-window rate; day and month are billing quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateScope {
    Minute,
    Day,
    Month,
}

impl RateScope {
    pub fn window(&self) -> Duration {
        match self {
            RateScope::Minute => Duration::from_secs(60),
            RateScope::Day => Duration::from_secs(24 * 3600),
            RateScope::Month => Duration::from_secs(30 * 24 * 3600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateScope::Minute => "minute",
            RateScope::Day => "day",
            RateScope::Month => "month",
        }
    }

    pub fn limit(&self, limits: PlanLimits) -> u32 {
        match self {
            RateScope::Minute => limits.per_minute,
            RateScope::Day => limits.per_day,
            RateScope::Month => limits.per_month,
        }
    }

    /// Quota scopes surface as `quota_exceeded`; the short window as
    /// `rate_limited`.
    pub fn is_quota(&self) -> bool {
        !matches!(self, RateScope::Minute)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub count: u32,
    pub retry_after_ms: u64,
    pub reset_epoch: i64,
}

impl RateDecision {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }
}

#[async_trait]
pub trait RateLimiterEngine: Send + Sync {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> Result<RateDecision>;
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

fn decision(allowed: bool, limit: u32, count: u64, oldest_ms: u64, now_ms: u64, window_ms: u64) -> RateDecision {
    let reset_ms = if oldest_ms == 0 { now_ms + window_ms } else { oldest_ms + window_ms };
    RateDecision {
        allowed,
        limit,
        count: count.min(u32::MAX as u64) as u32,
        retry_after_ms: reset_ms.saturating_sub(now_ms),
        reset_epoch: (reset_ms / 1000) as i64,
    }
}

// ---------------- Redis implementation ----------------

/// Sliding-window log, evaluated atomically server-side: prune the window,
/// count, and only insert when under the limit. Two concurrent callers can
/// never both observe `count < limit` and both insert.
const WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
local count = redis.call('ZCARD', KEYS[1])
local allowed = 0
if count < limit then
  redis.call('ZADD', KEYS[1], now, ARGV[4])
  redis.call('PEXPIRE', KEYS[1], window)
  allowed = 1
  count = count + 1
end
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
local oldest_score = 0
if oldest[2] then
  oldest_score = tonumber(oldest[2])
end
return {allowed, count, oldest_score}
"#;

#[derive(Clone)]
pub struct RedisRateLimiter {
    manager: ConnectionManager,
    prefix: String,
    script: Script,
}

impl RedisRateLimiter {
    pub async fn new(redis_url: &str, prefix: String) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self::with_manager(manager, prefix))
    }

    pub fn with_manager(manager: ConnectionManager, prefix: String) -> Self {
        Self { manager, prefix, script: Script::new(WINDOW_SCRIPT) }
    }
}

#[async_trait]
impl RateLimiterEngine for RedisRateLimiter {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> Result<RateDecision> {
        let redis_key = format!("{}:{}", self.prefix, key);
        let now_ms = now_epoch_ms();
        let window_ms = window.as_millis() as u64;
        let member = Uuid::new_v4().to_string();
        let mut conn = self.manager.clone();

        let (allowed, count, oldest): (i64, i64, i64) = self
            .script
            .key(redis_key)
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .context("rate limit script failed")?;

        Ok(decision(allowed == 1, limit, count.max(0) as u64, oldest.max(0) as u64, now_ms, window_ms))
    }
}

// ---------------- In-memory implementation (tests) ----------------

#[derive(Default)]
pub struct InMemoryRateLimiter {
    inner: Mutex<HashMap<String, VecDeque<u64>>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiterEngine for InMemoryRateLimiter {
    async fn check(&self, key: &str, limit: u32, window: Duration) -> Result<RateDecision> {
        let now_ms = now_epoch_ms();
        let window_ms = window.as_millis() as u64;
        let mut guard = self.inner.lock().await;
        let log = guard.entry(key.to_string()).or_default();
        while log.front().is_some_and(|t| *t <= now_ms.saturating_sub(window_ms)) {
            log.pop_front();
        }
        let allowed = (log.len() as u64) < limit as u64;
        if allowed {
            log.push_back(now_ms);
        }
        let oldest = log.front().copied().unwrap_or(0);
        Ok(decision(allowed, limit, log.len() as u64, oldest, now_ms, window_ms))
    }
}

// ---------------- Limit resolution ----------------

/// Per-tenant overrides layered over the plan defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct LimitOverrides {
    pub per_minute: Option<u32>,
    pub per_day: Option<u32>,
    pub per_month: Option<u32>,
}

impl LimitOverrides {
    fn apply(&self, base: PlanLimits) -> PlanLimits {
        PlanLimits {
            per_minute: self.per_minute.unwrap_or(base.per_minute),
            per_day: self.per_day.unwrap_or(base.per_day),
            per_month: self.per_month.unwrap_or(base.per_month),
        }
    }
}

/// Resolves effective limits at request time, caching the override lookup
/// under a staleness bound so the hot path does not hit the database.
pub struct LimitsResolver {
    config: Arc<GatewayConfig>,
    persistence: Persistence,
    cache: RwLock<HashMap<Uuid, (PlanLimits, Instant)>>,
    staleness: Duration,
}

impl LimitsResolver {
    pub fn new(config: Arc<GatewayConfig>, persistence: Persistence) -> Self {
        let staleness = Duration::from_secs(config.rule_cache_staleness_secs);
        Self { config, persistence, cache: RwLock::new(HashMap::new()), staleness }
    }

    pub async fn for_tenant(&self, tenant_id: Uuid, plan: Plan) -> PlanLimits {
        {
            let guard = self.cache.read().await;
            if let Some((limits, loaded_at)) = guard.get(&tenant_id) {
                if loaded_at.elapsed() < self.staleness {
                    return *limits;
                }
            }
        }

        let base = self.config.plan_limits(plan);
        let limits = match self.persistence.read_custom_limits(tenant_id).await {
            Ok(overrides) => overrides.apply(base),
            Err(err) => {
                warn!(%tenant_id, %err, "failed to read limit overrides; using plan defaults");
                base
            }
        };

        let mut guard = self.cache.write().await;
        guard.insert(tenant_id, (limits, Instant::now()));
        limits
    }
}
