#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use common_auth::{AuthContext, Plan, Role};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio::time::Instant;
use uuid::Uuid;

use transform_gateway::cache::{L1Cache, MemoryStore, TieredCache};
use transform_gateway::config::GatewayConfig;
use transform_gateway::logwriter::LogWriter;
use transform_gateway::metrics::GatewayMetrics;
use transform_gateway::orchestrator::Orchestrator;
use transform_gateway::persistence::Persistence;
use transform_gateway::rate_limit::{InMemoryRateLimiter, LimitsResolver};
use transform_gateway::rule_cache::RuleSetCache;
use transform_gateway::worker::{
    ProxyError, WorkerAnalyzeRequest, WorkerAnalyzeResponse, WorkerApi, SentimentScore,
    WorkerTransformRequest, WorkerTransformResponse,
};

static ENV_INIT: Once = Once::new();

/// Environment-backed config shared by every test in a binary. Values favor
/// fast tests: free plan gets 60/minute and roomy day/month quotas.
pub fn test_config() -> Arc<GatewayConfig> {
    ENV_INIT.call_once(|| {
        std::env::set_var("WORKER_BASE_URL", "http://127.0.0.1:9");
        std::env::set_var("REDIS_URL", "redis://127.0.0.1:6379");
        std::env::set_var("DATABASE_URL", "postgres://postgres@127.0.0.1:5432/unused");
        std::env::set_var("JWT_SECRETS", "k1:integration-test-secret");
        std::env::set_var("PLAN_LIMITS_FREE", "60,100000,1000000");
    });
    Arc::new(GatewayConfig::from_env().expect("test config"))
}

/// Pool that never connects; paths that would reach the database fall back
/// to defaults or surface errors the tests assert around.
pub fn lazy_persistence(config: &GatewayConfig) -> Persistence {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_millis(250))
        .connect_lazy(&config.database_url)
        .expect("lazy pool");
    Persistence::new(pool)
}

pub struct StubWorker {
    pub transform_calls: AtomicUsize,
    pub analyze_calls: AtomicUsize,
    pub delay: Duration,
    pub fail_transform: Option<ProxyError>,
}

impl StubWorker {
    pub fn new() -> Self {
        Self {
            transform_calls: AtomicUsize::new(0),
            analyze_calls: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
            fail_transform: None,
        }
    }

    pub fn transform_count(&self) -> usize {
        self.transform_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerApi for StubWorker {
    async fn transform(
        &self,
        req: &WorkerTransformRequest,
        _deadline: Instant,
        _trace_id: Uuid,
    ) -> Result<WorkerTransformResponse, ProxyError> {
        self.transform_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if let Some(err) = &self.fail_transform {
            return Err(err.clone());
        }
        Ok(WorkerTransformResponse {
            transformed_text: format!("{} (rewritten)", req.text),
            model: "stub-model".to_string(),
            tokens_used: 42,
            metadata: json!({}),
        })
    }

    async fn analyze(
        &self,
        req: &WorkerAnalyzeRequest,
        _deadline: Instant,
        _trace_id: Uuid,
    ) -> Result<WorkerAnalyzeResponse, ProxyError> {
        self.analyze_calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let _ = req;
        Ok(WorkerAnalyzeResponse {
            tone: "neutral".to_string(),
            clarity_score: 0.8,
            priority: "normal".to_string(),
            sentiment: SentimentScore { polarity: -0.4, subjectivity: 0.5 },
            suggestions: vec![],
        })
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub worker: Arc<StubWorker>,
    pub cache: Arc<TieredCache>,
    pub l2: Arc<MemoryStore>,
    pub rules: Arc<RuleSetCache>,
    pub log_writer: LogWriter,
    pub metrics: Arc<GatewayMetrics>,
}

pub fn harness(worker: StubWorker) -> Harness {
    let config = test_config();
    let metrics = Arc::new(GatewayMetrics::new().expect("metrics"));
    let persistence = lazy_persistence(&config);

    let l2 = Arc::new(MemoryStore::new());
    let cache = Arc::new(TieredCache::new(
        L1Cache::new(config.l1_capacity, Duration::from_secs(config.l1_ttl_secs)),
        l2.clone(),
        Duration::from_secs(config.l2_ttl_secs),
        config.l1_capacity,
        metrics.clone(),
    ));
    let worker = Arc::new(worker);
    let log_writer = LogWriter::new(config.log_queue_capacity, metrics.clone());
    let rules = Arc::new(RuleSetCache::new(persistence.clone(), Duration::from_secs(30)));

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        metrics.clone(),
        Arc::new(InMemoryRateLimiter::new()),
        Arc::new(LimitsResolver::new(config.clone(), persistence)),
        cache.clone(),
        worker.clone(),
        rules.clone(),
        log_writer.clone(),
    ));

    Harness { orchestrator, worker, cache, l2, rules, log_writer, metrics }
}

pub fn member_auth(tenant_id: Uuid) -> AuthContext {
    AuthContext {
        user_id: Uuid::new_v4(),
        tenant_id,
        email: "member@example.com".to_string(),
        role: Role::Member,
        plan: Plan::Free,
        permissions: Vec::new(),
        jti: Some(Uuid::new_v4()),
    }
}
