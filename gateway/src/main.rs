use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method, StatusCode,
};
use axum::middleware;
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{extract::State, Router};
use common_auth::{JwtConfig, JwtVerifier, SecretStore};
use redis::aio::ConnectionManager;
use reqwest::Client;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use transform_gateway::app_state::AppState;
use transform_gateway::breaker::{BreakerConfig, BreakerRegistry};
use transform_gateway::cache::{L1Cache, RedisStore, TieredCache};
use transform_gateway::config::GatewayConfig;
use transform_gateway::identity::{
    identity_middleware, load_key_cache, spawn_key_cache_refresh, KeyCache, RedisRevocationStore,
};
use transform_gateway::logwriter::LogWriter;
use transform_gateway::metrics::GatewayMetrics;
use transform_gateway::orchestrator::Orchestrator;
use transform_gateway::persistence::Persistence;
use transform_gateway::rate_limit::{LimitsResolver, RedisRateLimiter};
use transform_gateway::rule_cache::{spawn_invalidation_listener, RuleSetCache};
use transform_gateway::tokens::TokenSigner;
use transform_gateway::worker::WorkerClient;
use transform_gateway::{
    apikey_handlers, auth_handlers, dictionary_handlers, preview_handlers, profile_handlers,
    rule_handlers, transform_handlers,
};

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    if let Err(err) = sqlx::query("SELECT 1").execute(state.persistence.pool()).await {
        warn!(%err, "readiness: database unreachable");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    if let Some(redis) = &state.redis {
        let mut conn = redis.clone();
        if let Err(err) = redis::cmd("PING").query_async::<_, String>(&mut conn).await {
            warn!(%err, "readiness: redis unreachable");
            return Err(StatusCode::SERVICE_UNAVAILABLE);
        }
    }
    Ok("ready")
}

async fn metrics_endpoint(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(resp) => resp,
        Err(err) => {
            warn!(?err, "Failed to render metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(axum::body::Body::from("metrics unavailable"))
                .expect("failed to build metrics error response")
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(GatewayConfig::from_env()?);
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .init();

    let db_pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    let persistence = Persistence::new(db_pool.clone());
    info!("database pool initialised");

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("Failed to create Redis client")?;
    let redis_manager = ConnectionManager::new(redis_client)
        .await
        .context("Failed to create Redis connection manager")?;
    info!("redis connection manager initialised");

    let metrics = Arc::new(GatewayMetrics::new()?);
    common_http_errors::init_error_metrics("transform-gateway", metrics.registry());

    let secrets = SecretStore::from_spec(&config.jwt_secrets)
        .context("JWT_SECRETS must contain kid:secret pairs")?;
    let jwt_config = JwtConfig::new()
        .with_leeway(config.jwt_leeway_seconds)
        .with_access_ttl(config.access_ttl_seconds)
        .with_refresh_ttl(config.refresh_ttl_seconds);
    let verifier = Arc::new(JwtVerifier::new(jwt_config.clone(), secrets.clone()));
    let signer = Arc::new(TokenSigner::new(db_pool.clone(), jwt_config, secrets));
    let revocations = Arc::new(RedisRevocationStore::new(redis_manager.clone(), "revoked-jti"));

    let key_cache = Arc::new(KeyCache::new());
    match load_key_cache(&persistence, &key_cache).await {
        Ok(count) => info!(count, "loaded api keys into cache"),
        Err(err) => warn!(%err, "initial api key load failed; starting empty"),
    }
    spawn_key_cache_refresh(persistence.clone(), key_cache.clone(), config.auth_cache_refresh_secs);

    let rate_limiter = Arc::new(RedisRateLimiter::with_manager(
        redis_manager.clone(),
        "transform-gateway:rate".to_string(),
    ));
    let limits = Arc::new(LimitsResolver::new(config.clone(), persistence.clone()));

    let l1 = L1Cache::new(config.l1_capacity, Duration::from_secs(config.l1_ttl_secs));
    let l2 = Arc::new(RedisStore::new(redis_manager.clone(), "transform-gateway:cache"));
    let cache = Arc::new(TieredCache::new(
        l1,
        l2,
        Duration::from_secs(config.l2_ttl_secs),
        config.l1_capacity,
        metrics.clone(),
    ));

    let breakers = Arc::new(BreakerRegistry::new(
        BreakerConfig {
            window: Duration::from_secs(config.breaker_window_secs),
            min_samples: config.breaker_min_samples,
            failure_ratio: config.breaker_failure_ratio,
            cooldown: Duration::from_secs(config.breaker_cooldown_secs),
            max_cooldown: Duration::from_secs(config.breaker_cooldown_secs * 10),
            half_open_trials: config.breaker_half_open_trials,
        },
        metrics.clone(),
    ));
    let http_client = Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .build()
        .context("Failed to build HTTP client")?;
    let worker = Arc::new(WorkerClient::with_concurrency(
        http_client,
        config.worker_base_url.clone(),
        breakers,
        config.worker_retries,
        config.worker_max_response_bytes,
        config.worker_max_concurrency,
        metrics.clone(),
    ));

    let rules = Arc::new(RuleSetCache::new(
        persistence.clone(),
        Duration::from_secs(config.rule_cache_staleness_secs),
    ));
    spawn_invalidation_listener(rules.clone(), config.redis_url.clone());

    let log_writer = LogWriter::new(config.log_queue_capacity, metrics.clone());
    log_writer.spawn_flush_task(persistence.clone(), config.log_flush_secs);

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        metrics.clone(),
        rate_limiter,
        limits,
        cache,
        worker,
        rules.clone(),
        log_writer,
    ));

    let state = AppState {
        config: config.clone(),
        metrics,
        persistence,
        verifier,
        signer,
        revocations,
        key_cache,
        rules,
        orchestrator,
        redis: Some(redis_manager),
    };

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("authorization"),
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-tenant-id"),
            HeaderName::from_static("x-request-timeout-ms"),
        ]);

    let protected = Router::new()
        .route("/api/v1/transform", post(transform_handlers::transform))
        .route("/api/v1/analyze", post(transform_handlers::analyze))
        .route("/api/v1/history", get(transform_handlers::history))
        .route("/api/v1/usage", get(transform_handlers::usage))
        .route("/api/v1/auth/logout", post(auth_handlers::logout))
        .route(
            "/api/v1/dictionaries",
            get(dictionary_handlers::list).post(dictionary_handlers::create),
        )
        .route(
            "/api/v1/dictionaries/:id",
            put(dictionary_handlers::update).delete(dictionary_handlers::delete),
        )
        .route(
            "/api/v1/auto-transform/config",
            get(rule_handlers::get_config).put(rule_handlers::put_config),
        )
        .route(
            "/api/v1/auto-transform/rules",
            get(rule_handlers::list_rules).post(rule_handlers::create_rule),
        )
        .route("/api/v1/auto-transform/rules/export", get(rule_handlers::export_rules))
        .route("/api/v1/auto-transform/rules/import", post(rule_handlers::import_rules))
        .route("/api/v1/auto-transform/rules/test", post(rule_handlers::test_rule_endpoint))
        .route(
            "/api/v1/auto-transform/rules/:id",
            put(rule_handlers::update_rule).delete(rule_handlers::delete_rule),
        )
        .route("/api/v1/auto-transform/rules/:id/enable", post(rule_handlers::enable_rule))
        .route("/api/v1/auto-transform/rules/:id/disable", post(rule_handlers::disable_rule))
        .route("/api/v1/auto-transform/evaluate", post(rule_handlers::evaluate))
        .route("/api/v1/auto-transform/apply", post(rule_handlers::apply))
        .route(
            "/api/v1/profile",
            get(profile_handlers::get_profile).put(profile_handlers::update_profile),
        )
        .route("/api/v1/apikeys", get(apikey_handlers::list).post(apikey_handlers::create))
        .route("/api/v1/apikeys/:id", delete(apikey_handlers::revoke))
        .layer(middleware::from_fn_with_state(state.clone(), identity_middleware));

    let app = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/auth/register", post(auth_handlers::register))
        .route("/api/v1/auth/login", post(auth_handlers::login))
        .route("/api/v1/auth/refresh", post(auth_handlers::refresh))
        .route("/api/v1/preview/transform", post(preview_handlers::preview_transform))
        .route("/api/v1/preview/analyze", post(preview_handlers::preview_analyze))
        .route("/api/v1/preview/info", get(preview_handlers::preview_info))
        .merge(protected)
        .with_state(state)
        .layer(middleware::from_fn(common_http_errors::http_error_metrics_layer))
        .layer(cors);

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));
    info!(%addr, environment = %config.environment, "starting transform-gateway");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
