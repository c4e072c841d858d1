use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use common_auth::{ensure_role, AuthContext, Role};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::orchestrator::ApplyResult;
use crate::responses::{success, with_rate_headers};
use crate::rule_engine::test_rule;
use crate::rules::{validate_intensity, AutoTransformConfig, AutoTransformRule, MessageContext, Trigger};
use crate::transform_handlers::client_timeout;
use crate::worker::TransformationKind;
use crate::AppState;

// ---------------- config ----------------

pub async fn get_config(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let config = state
        .persistence
        .read_auto_transform_config(auth.tenant_id)
        .await
        .map_err(ApiError::internal)?
        .unwrap_or_default();
    Ok(success(config))
}

#[derive(Deserialize)]
pub struct ConfigPayload {
    pub enabled: bool,
    pub default_transformation: String,
    #[serde(default = "default_one")]
    pub default_intensity: i64,
    #[serde(default = "default_min_len")]
    pub min_message_length: usize,
    #[serde(default = "default_delay")]
    pub max_processing_delay_ms: u64,
    #[serde(default = "default_true")]
    pub require_confirmation: bool,
    #[serde(default = "default_true")]
    pub show_preview: bool,
    #[serde(default = "default_true")]
    pub preserve_original: bool,
}

fn default_one() -> i64 {
    1
}
fn default_min_len() -> usize {
    10
}
fn default_delay() -> u64 {
    3000
}
fn default_true() -> bool {
    true
}

pub async fn put_config(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<ConfigPayload>,
) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let default_transformation = payload
        .default_transformation
        .parse::<TransformationKind>()
        .map_err(|_| field_error("default_transformation", "unrecognized transformation"))?;
    let default_intensity = validate_intensity(payload.default_intensity)
        .map_err(|_| field_error("default_intensity", "must be between 0 and 3"))?;

    let config = AutoTransformConfig {
        enabled: payload.enabled,
        default_transformation,
        default_intensity,
        min_message_length: payload.min_message_length,
        max_processing_delay_ms: payload.max_processing_delay_ms,
        require_confirmation: payload.require_confirmation,
        show_preview: payload.show_preview,
        preserve_original: payload.preserve_original,
    };
    state
        .persistence
        .write_auto_transform_config(auth.tenant_id, &config)
        .await
        .map_err(ApiError::internal)?;
    state.publish_rule_invalidation(auth.tenant_id).await;
    Ok(success(config))
}

// ---------------- rules CRUD ----------------

#[derive(Deserialize)]
pub struct RulePayload {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: i32,
    pub trigger_kind: String,
    #[serde(default)]
    pub trigger_payload: Value,
    pub transformation_kind: String,
    #[serde(default = "default_one")]
    pub intensity: i64,
    #[serde(default = "empty_object")]
    pub options: Value,
    #[serde(default)]
    pub scope_platforms: Vec<String>,
    #[serde(default)]
    pub scope_channels: Vec<String>,
    #[serde(default)]
    pub scope_roles: Vec<String>,
}

fn empty_object() -> Value {
    json!({})
}

fn field_error(field: &str, reason: &str) -> ApiError {
    ApiError::validation(json!({ "fields": [{ "field": field, "reason": reason }] }))
}

fn rule_from_payload(tenant_id: Uuid, id: Uuid, payload: RulePayload) -> Result<AutoTransformRule, ApiError> {
    if payload.name.trim().is_empty() {
        return Err(field_error("name", "must not be empty"));
    }
    let trigger = Trigger::from_parts(&payload.trigger_kind, &payload.trigger_payload)
        .map_err(|err| field_error("trigger_payload", &err.to_string()))?;
    let transformation_kind = payload
        .transformation_kind
        .parse::<TransformationKind>()
        .map_err(|_| field_error("transformation_kind", "unrecognized transformation"))?;
    let intensity = validate_intensity(payload.intensity)
        .map_err(|_| field_error("intensity", "must be between 0 and 3"))?;

    Ok(AutoTransformRule {
        id,
        tenant_id,
        name: payload.name.trim().to_string(),
        enabled: payload.enabled,
        priority: payload.priority,
        trigger,
        transformation_kind,
        intensity,
        options: payload.options,
        scope_platforms: payload.scope_platforms,
        scope_channels: payload.scope_channels,
        scope_roles: payload.scope_roles,
    })
}

fn rule_to_json(rule: &AutoTransformRule) -> Value {
    json!({
        "id": rule.id,
        "name": rule.name,
        "enabled": rule.enabled,
        "priority": rule.priority,
        "trigger_kind": rule.trigger.kind(),
        "trigger_payload": rule.trigger.payload(),
        "transformation_kind": rule.transformation_kind.as_str(),
        "intensity": rule.intensity,
        "options": rule.options,
        "scope_platforms": rule.scope_platforms,
        "scope_channels": rule.scope_channels,
        "scope_roles": rule.scope_roles,
    })
}

pub async fn list_rules(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let rules = state
        .persistence
        .read_rules(auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    Ok(success(json!({ "items": rules.iter().map(rule_to_json).collect::<Vec<_>>() })))
}

pub async fn create_rule(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(payload): Json<RulePayload>,
) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let rule = rule_from_payload(auth.tenant_id, Uuid::new_v4(), payload)?;
    state.persistence.write_rule(&rule).await.map_err(ApiError::internal)?;
    state.publish_rule_invalidation(auth.tenant_id).await;
    Ok(success(rule_to_json(&rule)))
}

pub async fn update_rule(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
    Json(payload): Json<RulePayload>,
) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let existing = state
        .persistence
        .read_rules(auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    if !existing.iter().any(|r| r.id == id) {
        return Err(ApiError::NotFound);
    }
    let rule = rule_from_payload(auth.tenant_id, id, payload)?;
    state.persistence.write_rule(&rule).await.map_err(ApiError::internal)?;
    state.publish_rule_invalidation(auth.tenant_id).await;
    Ok(success(rule_to_json(&rule)))
}

pub async fn enable_rule(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    set_enabled(state, auth, id, true).await
}

pub async fn disable_rule(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    set_enabled(state, auth, id, false).await
}

async fn set_enabled(state: AppState, auth: AuthContext, id: Uuid, enabled: bool) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let updated = state
        .persistence
        .set_rule_enabled(id, auth.tenant_id, enabled)
        .await
        .map_err(ApiError::internal)?;
    if !updated {
        return Err(ApiError::NotFound);
    }
    state.publish_rule_invalidation(auth.tenant_id).await;
    Ok(success(json!({ "id": id, "enabled": enabled })))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    auth: AuthContext,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let deleted = state
        .persistence
        .delete_rule(id, auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    if !deleted {
        return Err(ApiError::NotFound);
    }
    state.publish_rule_invalidation(auth.tenant_id).await;
    Ok(success(json!({ "deleted": true })))
}

// ---------------- export / import ----------------

/// Generated ids stay out of the export so an import into any tenant yields
/// a semantically identical rule set under fresh ids.
pub async fn export_rules(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let rules = state
        .persistence
        .read_rules(auth.tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let exported: Vec<Value> = rules
        .iter()
        .map(|rule| {
            json!({
                "name": rule.name,
                "enabled": rule.enabled,
                "priority": rule.priority,
                "trigger_kind": rule.trigger.kind(),
                "trigger_payload": rule.trigger.payload(),
                "transformation_kind": rule.transformation_kind.as_str(),
                "intensity": rule.intensity,
                "options": rule.options,
                "scope_platforms": rule.scope_platforms,
                "scope_channels": rule.scope_channels,
                "scope_roles": rule.scope_roles,
            })
        })
        .collect();
    Ok(success(json!({ "rules": exported })))
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub rules: Vec<RulePayload>,
}

pub async fn import_rules(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<ImportRequest>,
) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let mut rules = Vec::with_capacity(req.rules.len());
    for payload in req.rules {
        rules.push(rule_from_payload(auth.tenant_id, Uuid::new_v4(), payload)?);
    }
    state
        .persistence
        .import_rules(auth.tenant_id, &rules)
        .await
        .map_err(ApiError::internal)?;
    state.publish_rule_invalidation(auth.tenant_id).await;
    Ok(success(json!({ "imported": rules.len() })))
}

// ---------------- dry run / apply ----------------

#[derive(Deserialize)]
pub struct TestRuleRequest {
    pub rule: RulePayload,
    pub sample_text: String,
}

pub async fn test_rule_endpoint(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(req): Json<TestRuleRequest>,
) -> ApiResult<Json<Value>> {
    ensure_role(&auth, Role::Admin)?;
    let rule = rule_from_payload(auth.tenant_id, Uuid::new_v4(), req.rule)?;
    let result = test_rule(rule, &req.sample_text, state.orchestrator.as_ref()).await?;
    Ok(success(result))
}

pub async fn evaluate(
    State(state): State<AppState>,
    auth: AuthContext,
    Json(mut ctx): Json<MessageContext>,
) -> ApiResult<Json<Value>> {
    ctx.tenant_id = auth.tenant_id;
    let outcome = state.orchestrator.evaluate_auto_transform(&auth, &ctx).await?;
    Ok(success(outcome))
}

pub async fn apply(
    State(state): State<AppState>,
    auth: AuthContext,
    headers: HeaderMap,
    Json(mut ctx): Json<MessageContext>,
) -> ApiResult<Response> {
    ctx.tenant_id = auth.tenant_id;
    let deadline = state.orchestrator.request_deadline(client_timeout(&headers));
    match state.orchestrator.apply_auto_transform(&auth, ctx, deadline).await? {
        ApplyResult::NoAction { reason } => {
            Ok(success(json!({ "action": "no_action", "reason": reason })).into_response())
        }
        ApplyResult::Applied { intent, data, decision } => Ok(with_rate_headers(
            success(json!({ "action": "transformed", "intent": intent, "result": data })),
            &decision,
        )),
    }
}
