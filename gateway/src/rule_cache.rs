use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common_http_errors::ApiError;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::persistence::Persistence;
use crate::rule_engine::CompiledRule;
use crate::rules::AutoTransformConfig;

/// Redis pub/sub channel fanning rule and config mutations out to every
/// gateway instance.
pub const INVALIDATION_CHANNEL: &str = "autotransform:invalidate";

/// Immutable snapshot handed to the engine; replaced wholesale on refresh so
/// readers never observe a partially loaded rule set.
pub struct TenantRules {
    pub config: AutoTransformConfig,
    pub rules: Arc<Vec<CompiledRule>>,
}

pub struct RuleSetCache {
    persistence: Persistence,
    staleness: Duration,
    inner: RwLock<HashMap<Uuid, (Arc<TenantRules>, Instant)>>,
}

impl RuleSetCache {
    pub fn new(persistence: Persistence, staleness: Duration) -> Self {
        Self { persistence, staleness, inner: RwLock::new(HashMap::new()) }
    }

    pub async fn get(&self, tenant_id: Uuid) -> Result<Arc<TenantRules>, ApiError> {
        {
            let guard = self.inner.read().await;
            if let Some((rules, loaded_at)) = guard.get(&tenant_id) {
                if loaded_at.elapsed() < self.staleness {
                    return Ok(rules.clone());
                }
            }
        }
        self.refresh(tenant_id).await
    }

    pub async fn invalidate(&self, tenant_id: Uuid) {
        let mut guard = self.inner.write().await;
        guard.remove(&tenant_id);
    }

    async fn refresh(&self, tenant_id: Uuid) -> Result<Arc<TenantRules>, ApiError> {
        let config = self
            .persistence
            .read_auto_transform_config(tenant_id)
            .await
            .map_err(ApiError::internal)?
            .unwrap_or_default();

        let raw = self
            .persistence
            .read_rules(tenant_id)
            .await
            .map_err(ApiError::internal)?;

        let mut rules = Vec::with_capacity(raw.len());
        for rule in raw.into_iter().filter(|r| r.enabled) {
            let rule_id = rule.id;
            match CompiledRule::compile(rule) {
                Ok(compiled) => rules.push(compiled),
                // Validated on ingest; a row failing here predates a rule
                // format change and is skipped rather than wedging the tenant.
                Err(err) => warn!(%tenant_id, %rule_id, %err, "skipping uncompilable rule"),
            }
        }
        rules.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then(a.rule.id.cmp(&b.rule.id))
        });

        let snapshot = Arc::new(TenantRules { config, rules: Arc::new(rules) });
        let mut guard = self.inner.write().await;
        guard.insert(tenant_id, (snapshot.clone(), Instant::now()));
        Ok(snapshot)
    }
}

/// Publishes a tenant's id on the invalidation channel after a mutation.
pub async fn publish_invalidation(manager: &ConnectionManager, tenant_id: Uuid) {
    let mut conn = manager.clone();
    let result: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
        .arg(INVALIDATION_CHANNEL)
        .arg(tenant_id.to_string())
        .query_async(&mut conn)
        .await;
    if let Err(err) = result {
        // Staleness bound still caps how long the old rule set survives.
        warn!(%tenant_id, %err, "failed to publish rule invalidation");
    }
}

/// Listens for invalidations from other instances. Reconnects with a pause
/// on any subscription failure.
pub fn spawn_invalidation_listener(cache: Arc<RuleSetCache>, redis_url: String) {
    tokio::spawn(async move {
        loop {
            match subscribe_once(&cache, &redis_url).await {
                Ok(()) => warn!("rule invalidation subscription ended; reconnecting"),
                Err(err) => warn!(%err, "rule invalidation subscription failed; reconnecting"),
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    });
}

async fn subscribe_once(cache: &RuleSetCache, redis_url: &str) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(redis_url)?;
    let connection = client.get_async_connection().await?;
    let mut pubsub = connection.into_pubsub();
    pubsub.subscribe(INVALIDATION_CHANNEL).await?;
    let mut stream = pubsub.on_message();
    while let Some(message) = stream.next().await {
        let payload: String = match message.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "undecodable invalidation payload");
                continue;
            }
        };
        match Uuid::parse_str(&payload) {
            Ok(tenant_id) => {
                debug!(%tenant_id, "invalidating cached rule set");
                cache.invalidate(tenant_id).await;
            }
            Err(_) => warn!(payload, "invalidation payload is not a tenant id"),
        }
    }
    Ok(())
}
