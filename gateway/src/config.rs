use anyhow::{Context, Result};
use common_auth::Plan;
use std::env;

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name).ok().and_then(|v| v.parse::<u64>().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name).ok().and_then(|v| v.parse::<u32>().ok()).unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name).ok().and_then(|v| v.parse::<usize>().ok()).unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env::var(name).ok().and_then(|v| v.parse::<f64>().ok()).unwrap_or(default)
}

/// Per-plan admission limits. `per_minute` is the short-window rate; day and
/// month are billing quotas.
#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub per_minute: u32,
    pub per_day: u32,
    pub per_month: u32,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub worker_base_url: String,
    pub redis_url: String,
    pub database_url: String,
    pub jwt_secrets: String,
    pub allowed_origins: Vec<String>,
    pub log_level: String,
    pub environment: String,
    pub preview_enabled: bool,

    pub jwt_leeway_seconds: u32,
    pub access_ttl_seconds: i64,
    pub refresh_ttl_seconds: i64,
    pub auth_cache_refresh_secs: u64,

    pub max_text_len: usize,
    pub preview_max_text_len: usize,
    pub preview_per_minute: u32,
    pub preview_per_day: u32,

    pub l1_capacity: usize,
    pub l1_ttl_secs: u64,
    pub l2_ttl_secs: u64,

    pub breaker_window_secs: u64,
    pub breaker_min_samples: usize,
    pub breaker_failure_ratio: f64,
    pub breaker_cooldown_secs: u64,
    pub breaker_half_open_trials: u32,

    pub worker_timeout_ms: u64,
    pub worker_retries: u32,
    pub worker_max_response_bytes: usize,
    pub worker_max_concurrency: usize,
    pub db_max_connections: u32,

    pub rule_cache_staleness_secs: u64,
    pub log_queue_capacity: usize,
    pub log_flush_secs: u64,

    plan_free: PlanLimits,
    plan_standard: PlanLimits,
    plan_pro: PlanLimits,
    plan_enterprise: PlanLimits,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let worker_base_url = env::var("WORKER_BASE_URL").context("WORKER_BASE_URL must be set")?;
        let redis_url = env::var("REDIS_URL").context("REDIS_URL must be set")?;
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let jwt_secrets = env::var("JWT_SECRETS").context("JWT_SECRETS must be set")?;

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            worker_base_url: worker_base_url.trim_end_matches('/').to_string(),
            redis_url,
            database_url,
            jwt_secrets,
            allowed_origins,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            preview_enabled: env::var("PREVIEW_ENABLED")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),

            jwt_leeway_seconds: env_u32("JWT_LEEWAY_SECONDS", 30),
            access_ttl_seconds: env_u64("ACCESS_TOKEN_TTL_SECONDS", 3600) as i64,
            refresh_ttl_seconds: env_u64("REFRESH_TOKEN_TTL_SECONDS", 7 * 24 * 3600) as i64,
            auth_cache_refresh_secs: env_u64("AUTH_CACHE_REFRESH_SECONDS", 30).max(5),

            max_text_len: env_usize("MAX_TEXT_LENGTH", 10_000),
            preview_max_text_len: env_usize("PREVIEW_MAX_TEXT_LENGTH", 500),
            preview_per_minute: env_u32("PREVIEW_RATE_PER_MINUTE", 3),
            preview_per_day: env_u32("PREVIEW_RATE_PER_DAY", 10),

            l1_capacity: env_usize("CACHE_L1_CAPACITY", 10_000).max(16),
            l1_ttl_secs: env_u64("CACHE_L1_TTL_SECONDS", 300).max(1),
            l2_ttl_secs: env_u64("CACHE_L2_TTL_SECONDS", 24 * 3600).max(1),

            breaker_window_secs: env_u64("BREAKER_WINDOW_SECONDS", 60).max(1),
            breaker_min_samples: env_usize("BREAKER_MIN_SAMPLES", 20).max(1),
            breaker_failure_ratio: env_f64("BREAKER_FAILURE_RATIO", 0.5).clamp(0.01, 1.0),
            breaker_cooldown_secs: env_u64("BREAKER_COOLDOWN_SECONDS", 30).max(1),
            breaker_half_open_trials: env_u32("BREAKER_HALF_OPEN_TRIALS", 3).max(1),

            worker_timeout_ms: env_u64("WORKER_TIMEOUT_MS", 30_000).max(100),
            worker_retries: env_u32("WORKER_RETRIES", 2).min(2),
            worker_max_response_bytes: env_usize("WORKER_MAX_RESPONSE_BYTES", 1 << 20),
            worker_max_concurrency: env_usize("WORKER_MAX_CONCURRENCY", 64).max(1),
            db_max_connections: env_u32("DATABASE_MAX_CONNECTIONS", 20).max(1),

            rule_cache_staleness_secs: env_u64("RULE_CACHE_STALENESS_SECONDS", 30).max(1),
            log_queue_capacity: env_usize("LOG_QUEUE_CAPACITY", 1000).max(16),
            log_flush_secs: env_u64("LOG_FLUSH_SECONDS", 2).max(1),

            plan_free: plan_from_env("PLAN_LIMITS_FREE", PlanLimits { per_minute: 10, per_day: 100, per_month: 1_000 }),
            plan_standard: plan_from_env("PLAN_LIMITS_STANDARD", PlanLimits { per_minute: 60, per_day: 2_000, per_month: 30_000 }),
            plan_pro: plan_from_env("PLAN_LIMITS_PRO", PlanLimits { per_minute: 300, per_day: 20_000, per_month: 300_000 }),
            plan_enterprise: plan_from_env("PLAN_LIMITS_ENTERPRISE", PlanLimits { per_minute: 1_000, per_day: 100_000, per_month: 2_000_000 }),
        })
    }

    pub fn plan_limits(&self, plan: Plan) -> PlanLimits {
        match plan {
            Plan::Free => self.plan_free,
            Plan::Standard => self.plan_standard,
            Plan::Pro => self.plan_pro,
            Plan::Enterprise => self.plan_enterprise,
        }
    }
}

/// Accepts `per_minute,per_day,per_month` CSV overrides.
fn plan_from_env(name: &str, default: PlanLimits) -> PlanLimits {
    let Ok(raw) = env::var(name) else {
        return default;
    };
    let parts: Vec<u32> = raw.split(',').filter_map(|p| p.trim().parse().ok()).collect();
    match parts.as_slice() {
        [minute, day, month] => PlanLimits {
            per_minute: (*minute).max(1),
            per_day: (*day).max(1),
            per_month: (*month).max(1),
        },
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_override_parses_csv() {
        let limits = plan_from_env("PLAN_LIMITS_DOES_NOT_EXIST", PlanLimits { per_minute: 5, per_day: 6, per_month: 7 });
        assert_eq!(limits.per_minute, 5);
        std::env::set_var("PLAN_LIMITS_TEST_CSV", "1,2,3");
        let limits = plan_from_env("PLAN_LIMITS_TEST_CSV", PlanLimits { per_minute: 5, per_day: 6, per_month: 7 });
        assert_eq!((limits.per_minute, limits.per_day, limits.per_month), (1, 2, 3));
        std::env::remove_var("PLAN_LIMITS_TEST_CSV");
    }
}
