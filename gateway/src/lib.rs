pub mod app_state;
pub mod apikey_handlers;
pub mod auth_handlers;
pub mod breaker;
pub mod cache;
pub mod config;
pub mod dictionary_handlers;
pub mod fingerprint;
pub mod identity;
pub mod logwriter;
pub mod metrics;
pub mod orchestrator;
pub mod persistence;
pub mod preview_handlers;
pub mod profile_handlers;
pub mod rate_limit;
pub mod responses;
pub mod rule_cache;
pub mod rule_engine;
pub mod rule_handlers;
pub mod rules;
pub mod tokens;
pub mod transform_handlers;
pub mod validation;
pub mod worker;

pub use app_state::AppState;
