use anyhow::Result;
use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    rate_checks: IntCounterVec,
    cache_events: IntCounterVec,
    singleflight: IntCounterVec,
    breaker_transitions: IntCounterVec,
    breaker_fast_fails: IntCounterVec,
    worker_calls: IntCounterVec,
    worker_latency: Histogram,
    rate_limit_latency: Histogram,
    log_queue_dropped: IntCounter,
    l2_degraded: IntCounter,
    revocation_check_failures: IntCounter,
    l1_entries: IntGauge,
}

impl GatewayMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let rate_checks = IntCounterVec::new(
            Opts::new("gateway_rate_limit_checks_total", "Rate limit decisions by scope"),
            &["scope", "outcome"],
        )?;
        let cache_events = IntCounterVec::new(
            Opts::new("gateway_cache_events_total", "Cache lookups and fills by tier"),
            &["tier", "event"],
        )?;
        let singleflight = IntCounterVec::new(
            Opts::new("gateway_singleflight_total", "Single-flight outcomes per request"),
            &["role"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            Opts::new("gateway_breaker_transitions_total", "Circuit state transitions"),
            &["target", "to"],
        )?;
        let breaker_fast_fails = IntCounterVec::new(
            Opts::new("gateway_breaker_fast_fails_total", "Requests rejected by an open circuit"),
            &["target"],
        )?;
        let worker_calls = IntCounterVec::new(
            Opts::new("gateway_worker_calls_total", "Backend worker calls by outcome"),
            &["operation", "outcome"],
        )?;
        let worker_latency = Histogram::with_opts(
            HistogramOpts::new("gateway_worker_latency_seconds", "Backend worker call latency")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let rate_limit_latency = Histogram::with_opts(HistogramOpts::new(
            "gateway_rate_limiter_decision_seconds",
            "Time spent performing a rate limiter decision",
        ))?;
        let log_queue_dropped = IntCounter::new(
            "gateway_log_queue_dropped_total",
            "Transformation log rows dropped on queue overflow",
        )?;
        let l2_degraded = IntCounter::new(
            "gateway_cache_l2_errors_total",
            "L2 cache errors recovered by treating the lookup as a miss",
        )?;
        let revocation_check_failures = IntCounter::new(
            "gateway_revocation_check_failures_total",
            "Revocation set lookups that failed and fell back to not-revoked",
        )?;
        let l1_entries = IntGauge::new("gateway_cache_l1_entries", "Entries currently held in L1")?;

        registry.register(Box::new(rate_checks.clone()))?;
        registry.register(Box::new(cache_events.clone()))?;
        registry.register(Box::new(singleflight.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;
        registry.register(Box::new(breaker_fast_fails.clone()))?;
        registry.register(Box::new(worker_calls.clone()))?;
        registry.register(Box::new(worker_latency.clone()))?;
        registry.register(Box::new(rate_limit_latency.clone()))?;
        registry.register(Box::new(log_queue_dropped.clone()))?;
        registry.register(Box::new(l2_degraded.clone()))?;
        registry.register(Box::new(revocation_check_failures.clone()))?;
        registry.register(Box::new(l1_entries.clone()))?;

        Ok(Self {
            registry,
            rate_checks,
            cache_events,
            singleflight,
            breaker_transitions,
            breaker_fast_fails,
            worker_calls,
            worker_latency,
            rate_limit_latency,
            log_queue_dropped,
            l2_degraded,
            revocation_check_failures,
            l1_entries,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_rate_check(&self, scope: &str, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "rejected" };
        self.rate_checks.with_label_values(&[scope, outcome]).inc();
    }

    pub fn observe_rate_limiter_latency(&self, seconds: f64) {
        self.rate_limit_latency.observe(seconds);
    }

    pub fn record_cache_event(&self, tier: &str, event: &str) {
        self.cache_events.with_label_values(&[tier, event]).inc();
    }

    pub fn record_singleflight(&self, role: &str) {
        self.singleflight.with_label_values(&[role]).inc();
    }

    pub fn record_breaker_transition(&self, target: &str, to: &str) {
        self.breaker_transitions.with_label_values(&[target, to]).inc();
    }

    pub fn record_breaker_fast_fail(&self, target: &str) {
        self.breaker_fast_fails.with_label_values(&[target]).inc();
    }

    pub fn record_worker_call(&self, operation: &str, outcome: &str) {
        self.worker_calls.with_label_values(&[operation, outcome]).inc();
    }

    pub fn observe_worker_latency(&self, seconds: f64) {
        self.worker_latency.observe(seconds);
    }

    pub fn record_log_queue_drop(&self) {
        self.log_queue_dropped.inc();
    }

    pub fn record_l2_error(&self) {
        self.l2_degraded.inc();
    }

    pub fn record_revocation_check_failure(&self) {
        self.revocation_check_failures.inc();
    }

    pub fn set_l1_entries(&self, count: i64) {
        self.l1_entries.set(count);
    }

    pub fn render(&self) -> Result<Response> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        let response = Response::builder()
            .status(StatusCode::OK)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_str(encoder.format_type())?,
            )
            .body(Body::from(buffer))?;
        Ok(response)
    }
}
