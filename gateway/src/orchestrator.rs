use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common_auth::AuthContext;
use common_http_errors::{ApiError, RateLimitInfo};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::cache::{CacheEntry, TieredCache};
use crate::config::GatewayConfig;
use crate::fingerprint::{fingerprint, params_from_options, PREVIEW_NAMESPACE};
use crate::logwriter::LogWriter;
use crate::metrics::GatewayMetrics;
use crate::persistence::LogRow;
use crate::rate_limit::{LimitsResolver, RateDecision, RateLimiterEngine, RateScope};
use crate::rule_cache::RuleSetCache;
use crate::rule_engine::{self, SentimentSource};
use crate::rules::{EngineOutcome, MessageContext, TransformationIntent};
use crate::validation::{ValidAnalyze, ValidTransform};
use crate::worker::{
    ProxyError, WorkerAnalyzeRequest, WorkerAnalyzeResponse, WorkerApi, WorkerTransformRequest,
    WorkerTransformResponse,
};

pub const PERMISSION_TRANSFORM: &str = "transform";
pub const PERMISSION_ANALYZE: &str = "analyze";

#[derive(Debug, Clone, Serialize)]
pub struct TransformData {
    pub transformed_text: String,
    pub model: String,
    pub tokens_used: i64,
    pub cached: bool,
    pub trace_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeData {
    #[serde(flatten)]
    pub analysis: WorkerAnalyzeResponse,
    pub cached: bool,
    pub trace_id: Uuid,
}

/// Outcome of the evaluate-then-transform path.
pub enum ApplyResult {
    NoAction { reason: &'static str },
    Applied { intent: TransformationIntent, data: TransformData, decision: RateDecision },
}

/// Wires identity → admission → cache → backend for the synchronous
/// endpoints. Handlers own HTTP concerns; everything behind them goes
/// through here.
pub struct Orchestrator {
    config: Arc<GatewayConfig>,
    metrics: Arc<GatewayMetrics>,
    rate_limiter: Arc<dyn RateLimiterEngine>,
    limits: Arc<LimitsResolver>,
    cache: Arc<TieredCache>,
    worker: Arc<dyn WorkerApi>,
    rules: Arc<RuleSetCache>,
    log_writer: LogWriter,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<GatewayConfig>,
        metrics: Arc<GatewayMetrics>,
        rate_limiter: Arc<dyn RateLimiterEngine>,
        limits: Arc<LimitsResolver>,
        cache: Arc<TieredCache>,
        worker: Arc<dyn WorkerApi>,
        rules: Arc<RuleSetCache>,
        log_writer: LogWriter,
    ) -> Self {
        Self { config, metrics, rate_limiter, limits, cache, worker, rules, log_writer }
    }

    pub fn rules_cache(&self) -> &RuleSetCache {
        &self.rules
    }

    /// Absolute deadline: the client's budget capped by the server-side max.
    pub fn request_deadline(&self, client_timeout_ms: Option<u64>) -> Instant {
        let server_max = self.config.worker_timeout_ms;
        let budget = client_timeout_ms.map(|c| c.min(server_max)).unwrap_or(server_max).max(50);
        Instant::now() + Duration::from_millis(budget)
    }

    // ---------------- admission ----------------

    async fn check_scope(&self, key: String, scope: RateScope, limit: u32) -> Result<RateDecision, ApiError> {
        let start = Instant::now();
        let decision = self
            .rate_limiter
            .check(&key, limit, scope.window())
            .await
            .map_err(ApiError::internal)?;
        self.metrics.observe_rate_limiter_latency(start.elapsed().as_secs_f64());
        self.metrics.record_rate_check(scope.as_str(), decision.allowed);

        if !decision.allowed {
            let info = RateLimitInfo {
                limit: decision.limit,
                remaining: decision.remaining(),
                reset_epoch: decision.reset_epoch,
                retry_after_ms: decision.retry_after_ms,
            };
            return Err(if scope.is_quota() {
                ApiError::QuotaExceeded { info }
            } else {
                ApiError::RateLimited { info }
            });
        }
        Ok(decision)
    }

    /// All three scopes, short window first. Returns the minute decision so
    /// handlers can surface the pacing headers.
    async fn enforce_tenant_limits(&self, auth: &AuthContext) -> Result<RateDecision, ApiError> {
        let limits = self.limits.for_tenant(auth.tenant_id, auth.plan).await;
        let tenant = auth.tenant_id;
        let minute = self
            .check_scope(format!("rate:{tenant}:minute"), RateScope::Minute, limits.per_minute)
            .await?;
        self.check_scope(format!("rate:{tenant}:day"), RateScope::Day, limits.per_day)
            .await?;
        self.check_scope(format!("rate:{tenant}:month"), RateScope::Month, limits.per_month)
            .await?;
        Ok(minute)
    }

    async fn enforce_preview_limits(&self, client_ip: &str) -> Result<RateDecision, ApiError> {
        let minute = self
            .check_scope(
                format!("preview:{client_ip}:minute"),
                RateScope::Minute,
                self.config.preview_per_minute,
            )
            .await?;
        self.check_scope(
            format!("preview:{client_ip}:day"),
            RateScope::Day,
            self.config.preview_per_day,
        )
        .await?;
        Ok(minute)
    }

    // ---------------- fingerprints ----------------

    fn transform_fingerprint(tenant_component: &str, valid: &ValidTransform) -> String {
        let mut params = BTreeMap::new();
        params.insert("kind".to_string(), valid.kind.as_str().to_string());
        params.insert("intensity".to_string(), valid.intensity.to_string());
        if let Some(tone) = &valid.target_tone {
            params.insert("tone".to_string(), tone.clone());
        }
        params_from_options(&mut params, valid.options.as_ref());
        fingerprint("transform", tenant_component, &params, &valid.text)
    }

    fn analyze_fingerprint(tenant_component: &str, valid: &ValidAnalyze) -> String {
        let mut params = BTreeMap::new();
        params.insert("types".to_string(), valid.analysis_types.join(","));
        fingerprint("analyze", tenant_component, &params, &valid.text)
    }

    // ---------------- core flows ----------------

    async fn run_transform(
        &self,
        tenant_component: &str,
        valid: &ValidTransform,
        deadline: Instant,
    ) -> Result<TransformData, ApiError> {
        let fp = Self::transform_fingerprint(tenant_component, valid);
        let trace_id = Uuid::new_v4();
        let request = WorkerTransformRequest {
            text: valid.text.clone(),
            transformation_type: valid.kind,
            intensity_level: valid.intensity,
            target_tone: valid.target_tone.clone(),
            options: valid.options.clone(),
        };
        let worker = self.worker.clone();
        let l2_ttl = Duration::from_secs(self.config.l2_ttl_secs);

        let lookup = self
            .cache
            .get_or_load(&fp, deadline, async move {
                let response = worker.transform(&request, deadline, trace_id).await?;
                let payload = serde_json::to_value(&response)
                    .map_err(|err| ProxyError::Malformed(err.to_string()))?;
                Ok(CacheEntry::new(payload, Some(response.model), l2_ttl))
            })
            .await
            .map_err(map_proxy_error)?;

        let response: WorkerTransformResponse =
            serde_json::from_value(lookup.entry.payload.clone()).map_err(ApiError::internal)?;
        Ok(TransformData {
            transformed_text: response.transformed_text,
            model: response.model,
            tokens_used: response.tokens_used,
            cached: lookup.cache_hit,
            trace_id,
        })
    }

    async fn run_analyze(
        &self,
        tenant_component: &str,
        valid: &ValidAnalyze,
        deadline: Instant,
    ) -> Result<AnalyzeData, ApiError> {
        let fp = Self::analyze_fingerprint(tenant_component, valid);
        let trace_id = Uuid::new_v4();
        let request = WorkerAnalyzeRequest {
            text: valid.text.clone(),
            analysis_types: valid.analysis_types.clone(),
        };
        let worker = self.worker.clone();
        let l2_ttl = Duration::from_secs(self.config.l2_ttl_secs);

        let lookup = self
            .cache
            .get_or_load(&fp, deadline, async move {
                let response = worker.analyze(&request, deadline, trace_id).await?;
                let payload = serde_json::to_value(&response)
                    .map_err(|err| ProxyError::Malformed(err.to_string()))?;
                Ok(CacheEntry::new(payload, None, l2_ttl))
            })
            .await
            .map_err(map_proxy_error)?;

        let analysis: WorkerAnalyzeResponse =
            serde_json::from_value(lookup.entry.payload.clone()).map_err(ApiError::internal)?;
        Ok(AnalyzeData { analysis, cached: lookup.cache_hit, trace_id })
    }

    // ---------------- authenticated entry points ----------------

    pub async fn authed_transform(
        &self,
        auth: &AuthContext,
        valid: ValidTransform,
        deadline: Instant,
        feature: &str,
        platform: Option<String>,
        auto_rule: Option<Uuid>,
    ) -> Result<(TransformData, RateDecision), ApiError> {
        if !auth.has_permission(PERMISSION_TRANSFORM) {
            return Err(ApiError::Forbidden);
        }
        let decision = self.enforce_tenant_limits(auth).await?;

        let started = Instant::now();
        let tenant_component = auth.tenant_id.to_string();
        let result = self.run_transform(&tenant_component, &valid, deadline).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        match &result {
            Ok(data) => self.log_writer.enqueue(LogRow {
                id: Uuid::new_v4(),
                tenant_id: auth.tenant_id,
                user_id: Some(auth.user_id),
                feature: feature.to_string(),
                platform,
                input_length: valid.text.chars().count() as i32,
                output_length: data.transformed_text.chars().count() as i32,
                intensity: valid.intensity as i16,
                response_time_ms: elapsed_ms,
                tokens_used: data.tokens_used,
                cache_hit: data.cached,
                success: true,
                error_code: None,
                auto_rule,
                created_at: Utc::now(),
            }),
            Err(err) => self.log_writer.enqueue(LogRow {
                id: Uuid::new_v4(),
                tenant_id: auth.tenant_id,
                user_id: Some(auth.user_id),
                feature: feature.to_string(),
                platform,
                input_length: valid.text.chars().count() as i32,
                output_length: 0,
                intensity: valid.intensity as i16,
                response_time_ms: elapsed_ms,
                tokens_used: 0,
                cache_hit: false,
                success: false,
                error_code: Some(err.code().to_string()),
                auto_rule,
                created_at: Utc::now(),
            }),
        }

        result.map(|data| (data, decision))
    }

    pub async fn authed_analyze(
        &self,
        auth: &AuthContext,
        valid: ValidAnalyze,
        deadline: Instant,
    ) -> Result<(AnalyzeData, RateDecision), ApiError> {
        if !auth.has_permission(PERMISSION_ANALYZE) {
            return Err(ApiError::Forbidden);
        }
        let decision = self.enforce_tenant_limits(auth).await?;

        let started = Instant::now();
        let tenant_component = auth.tenant_id.to_string();
        let result = self.run_analyze(&tenant_component, &valid, deadline).await;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        let (success, cache_hit, error_code) = match &result {
            Ok(data) => (true, data.cached, None),
            Err(err) => (false, false, Some(err.code().to_string())),
        };
        self.log_writer.enqueue(LogRow {
            id: Uuid::new_v4(),
            tenant_id: auth.tenant_id,
            user_id: Some(auth.user_id),
            feature: "analyze".to_string(),
            platform: None,
            input_length: valid.text.chars().count() as i32,
            output_length: 0,
            intensity: 0,
            response_time_ms: elapsed_ms,
            tokens_used: 0,
            cache_hit,
            success,
            error_code,
            auto_rule: None,
            created_at: Utc::now(),
        });

        result.map(|data| (data, decision))
    }

    // ---------------- preview entry points ----------------

    /// IP-keyed admission, preview fingerprint namespace, and no
    /// persistence of any kind.
    pub async fn preview_transform(
        &self,
        client_ip: &str,
        valid: ValidTransform,
        deadline: Instant,
    ) -> Result<(TransformData, RateDecision), ApiError> {
        let decision = self.enforce_preview_limits(client_ip).await?;
        let data = self.run_transform(PREVIEW_NAMESPACE, &valid, deadline).await?;
        Ok((data, decision))
    }

    pub async fn preview_analyze(
        &self,
        client_ip: &str,
        valid: ValidAnalyze,
        deadline: Instant,
    ) -> Result<(AnalyzeData, RateDecision), ApiError> {
        let decision = self.enforce_preview_limits(client_ip).await?;
        let data = self.run_analyze(PREVIEW_NAMESPACE, &valid, deadline).await?;
        Ok((data, decision))
    }

    // ---------------- auto-transform ----------------

    pub async fn evaluate_auto_transform(
        &self,
        auth: &AuthContext,
        ctx: &MessageContext,
    ) -> Result<EngineOutcome, ApiError> {
        let snapshot = self.rules.get(auth.tenant_id).await?;
        rule_engine::evaluate(ctx, &snapshot.config, &snapshot.rules, self).await
    }

    pub async fn apply_auto_transform(
        &self,
        auth: &AuthContext,
        ctx: MessageContext,
        deadline: Instant,
    ) -> Result<ApplyResult, ApiError> {
        match self.evaluate_auto_transform(auth, &ctx).await? {
            EngineOutcome::NoAction { reason } => Ok(ApplyResult::NoAction { reason }),
            EngineOutcome::Transform { intent } => {
                let valid = ValidTransform {
                    text: ctx.text,
                    kind: intent.transformation_kind,
                    intensity: intent.intensity,
                    target_tone: None,
                    options: intent.options.as_object().is_some().then(|| intent.options.clone()),
                };
                let platform = (!ctx.platform.is_empty()).then(|| ctx.platform.clone());
                let (data, decision) = self
                    .authed_transform(auth, valid, deadline, "auto_transform", platform, Some(intent.rule_id))
                    .await?;
                Ok(ApplyResult::Applied { intent, data, decision })
            }
        }
    }
}

/// Sentiment triggers resolve through the analyze path, so scores are cached
/// under the tenant's analyze fingerprints and repeated evaluations are
/// deterministic within the cache TTL.
#[async_trait]
impl SentimentSource for Orchestrator {
    async fn polarity(&self, tenant_id: Uuid, text: &str) -> Result<f64, ApiError> {
        let deadline = Instant::now() + Duration::from_millis(self.config.worker_timeout_ms);
        let valid = ValidAnalyze { text: text.to_string(), analysis_types: vec!["sentiment".to_string()] };
        let data = self.run_analyze(&tenant_id.to_string(), &valid, deadline).await?;
        Ok(data.analysis.sentiment.polarity)
    }
}

fn map_proxy_error(err: ProxyError) -> ApiError {
    match err {
        ProxyError::Timeout => ApiError::UpstreamTimeout,
        ProxyError::CircuitOpen(_)
        | ProxyError::Connection(_)
        | ProxyError::Server(_)
        | ProxyError::Malformed(_) => ApiError::UpstreamUnavailable,
        ProxyError::Client { .. } => ApiError::invalid("upstream rejected the request"),
    }
}
