use chrono::{DateTime, Utc};
use common_auth::{Plan, Role};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::warn;
use uuid::Uuid;

use crate::identity::ApiKeyRecord;
use crate::rate_limit::LimitOverrides;
use crate::rules::{AutoTransformConfig, AutoTransformRule, Trigger};
use crate::worker::TransformationKind;

const SERIALIZATION_FAILURE: &str = "40001";
const MAX_TXN_ATTEMPTS: u32 = 3;

pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == "23505")
        .unwrap_or(false)
}

fn is_serialization_failure(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map(|code| code == SERIALIZATION_FAILURE)
        .unwrap_or(false)
}

#[derive(Debug, Clone)]
pub struct UserAuthRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub name: String,
    pub password_hash: String,
    pub role: Role,
    pub plan: Plan,
    pub is_active: bool,
    pub failed_attempts: i16,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProfileRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub preferences: Value,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DictionaryEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub technical_term: String,
    pub business_term: String,
    pub category: Option<String>,
    pub examples: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One append-only audit row per gateway operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LogRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    pub feature: String,
    pub platform: Option<String>,
    pub input_length: i32,
    pub output_length: i32,
    pub intensity: i16,
    pub response_time_ms: i64,
    pub tokens_used: i64,
    pub cache_hit: bool,
    pub success: bool,
    pub error_code: Option<String>,
    pub auto_rule: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SubscriptionRow {
    pub plan: Plan,
    pub max_users: i32,
    pub max_requests_per_month: i32,
    pub max_custom_dictionaries: i32,
    pub max_platforms: i32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiKeyInfo {
    pub id: Uuid,
    pub key_suffix: String,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

/// Transactional store behind the gateway. All SQL lives here; callers see
/// typed rows and `sqlx::Error`.
#[derive(Clone)]
pub struct Persistence {
    pool: PgPool,
}

impl Persistence {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ---------------- tenants / users ----------------

    /// Registration creates the tenant, its admin user and the initial
    /// subscription in one transaction; a unique-violation on email maps to
    /// `conflict` at the handler.
    pub async fn create_tenant_with_admin(
        &self,
        tenant_name: &str,
        email: &str,
        user_name: &str,
        password_hash: &str,
        plan: Plan,
    ) -> Result<(Uuid, Uuid), sqlx::Error> {
        let tenant_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO tenants (id, name, plan, settings) VALUES ($1, $2, $3, '{}'::jsonb)")
            .bind(tenant_id)
            .bind(tenant_name)
            .bind(plan.as_str())
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO users (id, tenant_id, email, name, password_hash, role, preferences, is_active)
             VALUES ($1, $2, $3, $4, $5, $6, '{}'::jsonb, TRUE)",
        )
        .bind(user_id)
        .bind(tenant_id)
        .bind(email)
        .bind(user_name)
        .bind(password_hash)
        .bind(Role::Admin.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO subscriptions (id, tenant_id, plan, max_users, max_requests_per_month, max_custom_dictionaries, max_platforms, active)
             VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE)",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(plan.as_str())
        .bind(default_max_users(plan))
        .bind(default_month_quota(plan))
        .bind(default_max_dictionaries(plan))
        .bind(default_max_platforms(plan))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO billing_history (id, tenant_id, event, details) VALUES ($1, $2, 'subscription_created', $3)",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(serde_json::json!({ "plan": plan.as_str() }))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((tenant_id, user_id))
    }

    pub async fn find_user_for_login(&self, email: &str) -> Result<Option<UserAuthRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT u.id, u.tenant_id, u.email, u.name, u.password_hash, u.role,
                    u.is_active, u.failed_attempts, u.locked_until, t.plan
             FROM users u
             JOIN tenants t ON t.id = u.tenant_id
             WHERE u.email = $1 AND t.deleted_at IS NULL",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        row.map(user_auth_from_row).transpose()
    }

    pub async fn record_login_failure(
        &self,
        user_id: Uuid,
        failed_attempts: i16,
        locked_until: Option<DateTime<Utc>>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET failed_attempts = $2, locked_until = $3, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(failed_attempts)
            .bind(locked_until)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn record_login_success(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET failed_attempts = 0, locked_until = NULL, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn read_profile(&self, user_id: Uuid) -> Result<Option<ProfileRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT id, tenant_id, email, name, role, preferences FROM users WHERE id = $1 AND is_active",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(profile_from_row).transpose()
    }

    pub async fn update_profile(
        &self,
        user_id: Uuid,
        name: Option<&str>,
        preferences: Option<&Value>,
    ) -> Result<Option<ProfileRow>, sqlx::Error> {
        let row = sqlx::query(
            "UPDATE users
             SET name = COALESCE($2, name),
                 preferences = COALESCE($3, preferences),
                 updated_at = NOW()
             WHERE id = $1 AND is_active
             RETURNING id, tenant_id, email, name, role, preferences",
        )
        .bind(user_id)
        .bind(name)
        .bind(preferences)
        .fetch_optional(&self.pool)
        .await?;
        row.map(profile_from_row).transpose()
    }

    // ---------------- plans / limits ----------------

    pub async fn read_tenant_plan(&self, tenant_id: Uuid) -> Result<Option<Plan>, sqlx::Error> {
        let row = sqlx::query("SELECT plan FROM tenants WHERE id = $1 AND deleted_at IS NULL")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| {
            let raw: String = r.try_get("plan").ok()?;
            raw.parse::<Plan>().ok()
        }))
    }

    pub async fn read_subscription(&self, tenant_id: Uuid) -> Result<Option<SubscriptionRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT plan, max_users, max_requests_per_month, max_custom_dictionaries, max_platforms
             FROM subscriptions WHERE tenant_id = $1 AND active LIMIT 1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            let raw: String = r.try_get("plan")?;
            Ok(SubscriptionRow {
                plan: raw.parse().unwrap_or(Plan::Free),
                max_users: r.try_get("max_users")?,
                max_requests_per_month: r.try_get("max_requests_per_month")?,
                max_custom_dictionaries: r.try_get("max_custom_dictionaries")?,
                max_platforms: r.try_get("max_platforms")?,
            })
        })
        .transpose()
    }

    pub async fn read_custom_limits(&self, tenant_id: Uuid) -> Result<LimitOverrides, sqlx::Error> {
        let row = sqlx::query(
            "SELECT per_minute, per_day, per_month FROM feature_usage_limits WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(r) => Ok(LimitOverrides {
                per_minute: r.try_get::<Option<i32>, _>("per_minute")?.map(|v| v.max(0) as u32),
                per_day: r.try_get::<Option<i32>, _>("per_day")?.map(|v| v.max(0) as u32),
                per_month: r.try_get::<Option<i32>, _>("per_month")?.map(|v| v.max(0) as u32),
            }),
            None => Ok(LimitOverrides::default()),
        }
    }

    pub async fn month_request_count(&self, tenant_id: Uuid) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM transformation_logs
             WHERE tenant_id = $1 AND created_at >= date_trunc('month', NOW())",
        )
        .bind(tenant_id)
        .fetch_one(&self.pool)
        .await?;
        row.try_get("count")
    }

    // ---------------- api keys ----------------

    pub async fn load_active_api_keys(&self) -> Result<Vec<ApiKeyRecord>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT k.id, k.user_id, k.tenant_id, k.key_salt, k.key_hash, k.key_suffix,
                    k.permissions, k.expires_at, u.role, t.plan, u.email
             FROM api_keys k
             JOIN users u ON u.id = k.user_id
             JOIN tenants t ON t.id = k.tenant_id
             WHERE k.revoked_at IS NULL AND u.is_active AND t.deleted_at IS NULL",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match api_key_from_row(row) {
                Ok(record) => records.push(record),
                Err(err) => warn!(%err, "skipping undecodable api key row"),
            }
        }
        Ok(records)
    }

    pub async fn list_api_keys(&self, tenant_id: Uuid) -> Result<Vec<ApiKeyInfo>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, key_suffix, permissions, expires_at, revoked_at, created_at
             FROM api_keys WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                Ok(ApiKeyInfo {
                    id: r.try_get("id")?,
                    key_suffix: r.try_get("key_suffix")?,
                    permissions: r.try_get("permissions")?,
                    expires_at: r.try_get("expires_at")?,
                    revoked: r.try_get::<Option<DateTime<Utc>>, _>("revoked_at")?.is_some(),
                    created_at: r.try_get("created_at")?,
                })
            })
            .collect()
    }

    pub async fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO api_keys (id, user_id, tenant_id, key_salt, key_hash, key_suffix, permissions, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(record.user_id)
        .bind(record.tenant_id)
        .bind(&record.key_salt)
        .bind(&record.key_hash)
        .bind(&record.key_suffix)
        .bind(&record.permissions)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_api_key(&self, id: Uuid, tenant_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked_at = NOW() WHERE id = $1 AND tenant_id = $2 AND revoked_at IS NULL",
        )
        .bind(id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---------------- auto-transform rules / config ----------------

    pub async fn read_rules(&self, tenant_id: Uuid) -> Result<Vec<AutoTransformRule>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, name, enabled, priority, trigger_kind, trigger_payload,
                    transformation_kind, intensity, options, scope_platforms, scope_channels, scope_roles
             FROM auto_transform_rules WHERE tenant_id = $1
             ORDER BY priority DESC, id ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;
        let mut rules = Vec::with_capacity(rows.len());
        for row in rows {
            match rule_from_row(row) {
                Ok(rule) => rules.push(rule),
                Err(err) => warn!(%tenant_id, %err, "skipping undecodable rule row"),
            }
        }
        Ok(rules)
    }

    pub async fn write_rule(&self, rule: &AutoTransformRule) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO auto_transform_rules
                (id, tenant_id, name, enabled, priority, trigger_kind, trigger_payload,
                 transformation_kind, intensity, options, scope_platforms, scope_channels, scope_roles)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                enabled = EXCLUDED.enabled,
                priority = EXCLUDED.priority,
                trigger_kind = EXCLUDED.trigger_kind,
                trigger_payload = EXCLUDED.trigger_payload,
                transformation_kind = EXCLUDED.transformation_kind,
                intensity = EXCLUDED.intensity,
                options = EXCLUDED.options,
                scope_platforms = EXCLUDED.scope_platforms,
                scope_channels = EXCLUDED.scope_channels,
                scope_roles = EXCLUDED.scope_roles,
                updated_at = NOW()",
        )
        .bind(rule.id)
        .bind(rule.tenant_id)
        .bind(&rule.name)
        .bind(rule.enabled)
        .bind(rule.priority)
        .bind(rule.trigger.kind())
        .bind(rule.trigger.payload())
        .bind(rule.transformation_kind.as_str())
        .bind(rule.intensity as i16)
        .bind(&rule.options)
        .bind(&rule.scope_platforms)
        .bind(&rule.scope_channels)
        .bind(&rule.scope_roles)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_rule(&self, id: Uuid, tenant_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM auto_transform_rules WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_rule_enabled(&self, id: Uuid, tenant_id: Uuid, enabled: bool) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE auto_transform_rules SET enabled = $3, updated_at = NOW() WHERE id = $1 AND tenant_id = $2",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(enabled)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Bulk import replaces the tenant's rule set atomically; retried on
    /// serialization failure up to a bounded count.
    pub async fn import_rules(&self, tenant_id: Uuid, rules: &[AutoTransformRule]) -> Result<(), sqlx::Error> {
        let mut attempt = 0;
        loop {
            match self.import_rules_once(tenant_id, rules).await {
                Ok(()) => return Ok(()),
                Err(err) if is_serialization_failure(&err) && attempt + 1 < MAX_TXN_ATTEMPTS => {
                    attempt += 1;
                    warn!(%tenant_id, attempt, "rule import serialization failure; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn import_rules_once(&self, tenant_id: Uuid, rules: &[AutoTransformRule]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM auto_transform_rules WHERE tenant_id = $1")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;
        for rule in rules {
            sqlx::query(
                "INSERT INTO auto_transform_rules
                    (id, tenant_id, name, enabled, priority, trigger_kind, trigger_payload,
                     transformation_kind, intensity, options, scope_platforms, scope_channels, scope_roles)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(rule.id)
            .bind(tenant_id)
            .bind(&rule.name)
            .bind(rule.enabled)
            .bind(rule.priority)
            .bind(rule.trigger.kind())
            .bind(rule.trigger.payload())
            .bind(rule.transformation_kind.as_str())
            .bind(rule.intensity as i16)
            .bind(&rule.options)
            .bind(&rule.scope_platforms)
            .bind(&rule.scope_channels)
            .bind(&rule.scope_roles)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    pub async fn read_auto_transform_config(
        &self,
        tenant_id: Uuid,
    ) -> Result<Option<AutoTransformConfig>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT enabled, default_transformation, default_intensity, min_message_length,
                    max_processing_delay_ms, require_confirmation, show_preview, preserve_original
             FROM auto_transform_configs WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(config_from_row).transpose()
    }

    pub async fn write_auto_transform_config(
        &self,
        tenant_id: Uuid,
        config: &AutoTransformConfig,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO auto_transform_configs
                (tenant_id, enabled, default_transformation, default_intensity, min_message_length,
                 max_processing_delay_ms, require_confirmation, show_preview, preserve_original)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (tenant_id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                default_transformation = EXCLUDED.default_transformation,
                default_intensity = EXCLUDED.default_intensity,
                min_message_length = EXCLUDED.min_message_length,
                max_processing_delay_ms = EXCLUDED.max_processing_delay_ms,
                require_confirmation = EXCLUDED.require_confirmation,
                show_preview = EXCLUDED.show_preview,
                preserve_original = EXCLUDED.preserve_original,
                updated_at = NOW()",
        )
        .bind(tenant_id)
        .bind(config.enabled)
        .bind(config.default_transformation.as_str())
        .bind(config.default_intensity as i16)
        .bind(config.min_message_length as i32)
        .bind(config.max_processing_delay_ms as i64)
        .bind(config.require_confirmation)
        .bind(config.show_preview)
        .bind(config.preserve_original)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---------------- dictionaries ----------------

    pub async fn read_dictionaries(
        &self,
        tenant_id: Uuid,
        category: Option<&str>,
    ) -> Result<Vec<DictionaryEntry>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, technical_term, business_term, category, examples, created_at, updated_at
             FROM dictionaries
             WHERE tenant_id = $1 AND ($2::text IS NULL OR category = $2)
             ORDER BY technical_term",
        )
        .bind(tenant_id)
        .bind(category)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(dictionary_from_row).collect()
    }

    pub async fn insert_dictionary(
        &self,
        tenant_id: Uuid,
        technical_term: &str,
        business_term: &str,
        category: Option<&str>,
        examples: &[String],
    ) -> Result<DictionaryEntry, sqlx::Error> {
        let row = sqlx::query(
            "INSERT INTO dictionaries (id, tenant_id, technical_term, business_term, category, examples)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id, tenant_id, technical_term, business_term, category, examples, created_at, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(technical_term)
        .bind(business_term)
        .bind(category)
        .bind(examples)
        .fetch_one(&self.pool)
        .await?;
        dictionary_from_row(row)
    }

    pub async fn update_dictionary(
        &self,
        id: Uuid,
        tenant_id: Uuid,
        business_term: Option<&str>,
        category: Option<&str>,
        examples: Option<&[String]>,
    ) -> Result<Option<DictionaryEntry>, sqlx::Error> {
        let row = sqlx::query(
            "UPDATE dictionaries
             SET business_term = COALESCE($3, business_term),
                 category = COALESCE($4, category),
                 examples = COALESCE($5, examples),
                 updated_at = NOW()
             WHERE id = $1 AND tenant_id = $2
             RETURNING id, tenant_id, technical_term, business_term, category, examples, created_at, updated_at",
        )
        .bind(id)
        .bind(tenant_id)
        .bind(business_term)
        .bind(category)
        .bind(examples)
        .fetch_optional(&self.pool)
        .await?;
        row.map(dictionary_from_row).transpose()
    }

    pub async fn delete_dictionary(&self, id: Uuid, tenant_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM dictionaries WHERE id = $1 AND tenant_id = $2")
            .bind(id)
            .bind(tenant_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---------------- transformation logs ----------------

    /// Idempotent on the client-generated id; replays are no-ops.
    pub async fn append_transformation_log(&self, row: &LogRow) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO transformation_logs
                (id, tenant_id, user_id, feature, platform, input_length, output_length, intensity,
                 response_time_ms, tokens_used, cache_hit, success, error_code, auto_rule, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(row.id)
        .bind(row.tenant_id)
        .bind(row.user_id)
        .bind(&row.feature)
        .bind(&row.platform)
        .bind(row.input_length)
        .bind(row.output_length)
        .bind(row.intensity)
        .bind(row.response_time_ms)
        .bind(row.tokens_used)
        .bind(row.cache_hit)
        .bind(row.success)
        .bind(&row.error_code)
        .bind(row.auto_rule)
        .bind(row.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LogRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, tenant_id, user_id, feature, platform, input_length, output_length, intensity,
                    response_time_ms, tokens_used, cache_hit, success, error_code, auto_rule, created_at
             FROM transformation_logs
             WHERE user_id = $1
             ORDER BY created_at DESC
             LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(limit.clamp(1, 200))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(log_from_row).collect()
    }
}

// ---------------- row mapping ----------------

fn parse_role(raw: &str) -> Result<Role, sqlx::Error> {
    raw.parse::<Role>()
        .map_err(|err| sqlx::Error::Decode(err.into()))
}

fn parse_plan(raw: &str) -> Result<Plan, sqlx::Error> {
    raw.parse::<Plan>()
        .map_err(|err| sqlx::Error::Decode(err.into()))
}

fn user_auth_from_row(row: PgRow) -> Result<UserAuthRow, sqlx::Error> {
    let role: String = row.try_get("role")?;
    let plan: String = row.try_get("plan")?;
    Ok(UserAuthRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        password_hash: row.try_get("password_hash")?,
        role: parse_role(&role)?,
        plan: parse_plan(&plan)?,
        is_active: row.try_get("is_active")?,
        failed_attempts: row.try_get("failed_attempts")?,
        locked_until: row.try_get("locked_until")?,
    })
}

fn profile_from_row(row: PgRow) -> Result<ProfileRow, sqlx::Error> {
    let role: String = row.try_get("role")?;
    Ok(ProfileRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        role: parse_role(&role)?,
        preferences: row.try_get("preferences")?,
    })
}

fn api_key_from_row(row: PgRow) -> Result<ApiKeyRecord, sqlx::Error> {
    let role: String = row.try_get("role")?;
    let plan: String = row.try_get("plan")?;
    Ok(ApiKeyRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tenant_id: row.try_get("tenant_id")?,
        key_salt: row.try_get("key_salt")?,
        key_hash: row.try_get("key_hash")?,
        key_suffix: row.try_get("key_suffix")?,
        permissions: row.try_get("permissions")?,
        expires_at: row.try_get("expires_at")?,
        role: parse_role(&role)?,
        plan: parse_plan(&plan)?,
        email: row.try_get("email")?,
    })
}

fn rule_from_row(row: PgRow) -> Result<AutoTransformRule, sqlx::Error> {
    let trigger_kind: String = row.try_get("trigger_kind")?;
    let trigger_payload: Value = row.try_get("trigger_payload")?;
    let trigger = Trigger::from_parts(&trigger_kind, &trigger_payload)
        .map_err(|err| sqlx::Error::Decode(err.to_string().into()))?;
    let kind: String = row.try_get("transformation_kind")?;
    let intensity: i16 = row.try_get("intensity")?;
    Ok(AutoTransformRule {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        enabled: row.try_get("enabled")?,
        priority: row.try_get("priority")?,
        trigger,
        transformation_kind: kind
            .parse::<TransformationKind>()
            .map_err(|err| sqlx::Error::Decode(err.into()))?,
        intensity: intensity.clamp(0, 3) as u8,
        options: row.try_get("options")?,
        scope_platforms: row.try_get("scope_platforms")?,
        scope_channels: row.try_get("scope_channels")?,
        scope_roles: row.try_get("scope_roles")?,
    })
}

fn config_from_row(row: PgRow) -> Result<AutoTransformConfig, sqlx::Error> {
    let kind: String = row.try_get("default_transformation")?;
    let intensity: i16 = row.try_get("default_intensity")?;
    let min_len: i32 = row.try_get("min_message_length")?;
    let delay: i64 = row.try_get("max_processing_delay_ms")?;
    Ok(AutoTransformConfig {
        enabled: row.try_get("enabled")?,
        default_transformation: kind
            .parse::<TransformationKind>()
            .map_err(|err| sqlx::Error::Decode(err.into()))?,
        default_intensity: intensity.clamp(0, 3) as u8,
        min_message_length: min_len.max(0) as usize,
        max_processing_delay_ms: delay.max(0) as u64,
        require_confirmation: row.try_get("require_confirmation")?,
        show_preview: row.try_get("show_preview")?,
        preserve_original: row.try_get("preserve_original")?,
    })
}

fn dictionary_from_row(row: PgRow) -> Result<DictionaryEntry, sqlx::Error> {
    Ok(DictionaryEntry {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        technical_term: row.try_get("technical_term")?,
        business_term: row.try_get("business_term")?,
        category: row.try_get("category")?,
        examples: row.try_get("examples")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn log_from_row(row: PgRow) -> Result<LogRow, sqlx::Error> {
    Ok(LogRow {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        user_id: row.try_get("user_id")?,
        feature: row.try_get("feature")?,
        platform: row.try_get("platform")?,
        input_length: row.try_get("input_length")?,
        output_length: row.try_get("output_length")?,
        intensity: row.try_get("intensity")?,
        response_time_ms: row.try_get("response_time_ms")?,
        tokens_used: row.try_get("tokens_used")?,
        cache_hit: row.try_get("cache_hit")?,
        success: row.try_get("success")?,
        error_code: row.try_get("error_code")?,
        auto_rule: row.try_get("auto_rule")?,
        created_at: row.try_get("created_at")?,
    })
}

fn default_max_users(plan: Plan) -> i32 {
    match plan {
        Plan::Free => 5,
        Plan::Standard => 25,
        Plan::Pro => 100,
        Plan::Enterprise => 1000,
    }
}

fn default_month_quota(plan: Plan) -> i32 {
    match plan {
        Plan::Free => 1_000,
        Plan::Standard => 30_000,
        Plan::Pro => 300_000,
        Plan::Enterprise => 2_000_000,
    }
}

fn default_max_dictionaries(plan: Plan) -> i32 {
    match plan {
        Plan::Free => 1,
        Plan::Standard => 5,
        Plan::Pro => 20,
        Plan::Enterprise => 100,
    }
}

fn default_max_platforms(plan: Plan) -> i32 {
    match plan {
        Plan::Free => 1,
        Plan::Standard => 2,
        Plan::Pro => 4,
        Plan::Enterprise => 8,
    }
}
