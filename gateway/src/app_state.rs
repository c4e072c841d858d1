use std::sync::Arc;

use common_auth::JwtVerifier;
use redis::aio::ConnectionManager;

use crate::config::GatewayConfig;
use crate::identity::{KeyCache, RevocationStore};
use crate::metrics::GatewayMetrics;
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::rule_cache::RuleSetCache;
use crate::tokens::TokenSigner;

/// Cloneable bundle handed to every handler. All process-wide mutable state
/// (caches, breakers, pools) lives behind these `Arc`s and is injected at
/// startup, never reached through globals.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    pub metrics: Arc<GatewayMetrics>,
    pub persistence: Persistence,
    pub verifier: Arc<JwtVerifier>,
    pub signer: Arc<TokenSigner>,
    pub revocations: Arc<dyn RevocationStore>,
    pub key_cache: Arc<KeyCache>,
    pub rules: Arc<RuleSetCache>,
    pub orchestrator: Arc<Orchestrator>,
    /// Used for cross-instance invalidation publishes; absent in tests.
    pub redis: Option<ConnectionManager>,
}

impl AppState {
    pub async fn publish_rule_invalidation(&self, tenant_id: uuid::Uuid) {
        self.rules.invalidate(tenant_id).await;
        if let Some(manager) = &self.redis {
            crate::rule_cache::publish_invalidation(manager, tenant_id).await;
        }
    }
}
