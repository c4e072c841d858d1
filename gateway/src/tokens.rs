use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use common_auth::{JwtConfig, Plan, Role, SecretStore};
use jsonwebtoken::{encode, Algorithm, Header};
use rand_core::{OsRng, RngCore};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct TokenSubject {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub role: Role,
    pub plan: Plan,
}

pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub access_jti: Uuid,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub access_expires_in: i64,
    pub refresh_expires_in: i64,
    pub token_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct RefreshTokenAccount {
    pub jti: Uuid,
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub name: String,
    pub role: Role,
    pub plan: Plan,
    pub is_active: bool,
}

/// Issues HS256 access tokens under the active kid and single-use opaque
/// refresh tokens persisted as SHA-256 digests.
pub struct TokenSigner {
    pool: PgPool,
    config: JwtConfig,
    store: SecretStore,
}

impl TokenSigner {
    pub fn new(pool: PgPool, config: JwtConfig, store: SecretStore) -> Self {
        Self { pool, config, store }
    }

    pub async fn issue_tokens(&self, subject: TokenSubject) -> Result<IssuedTokens> {
        let now = Utc::now();
        let access_exp = now + Duration::seconds(self.config.access_ttl_seconds);
        let refresh_exp = now + Duration::seconds(self.config.refresh_ttl_seconds);
        let access_jti = Uuid::new_v4();

        let access_claims = AccessClaims {
            sub: subject.user_id.to_string(),
            email: &subject.email,
            tenant_id: subject.tenant_id.to_string(),
            role: subject.role.as_str(),
            plan: subject.plan.as_str(),
            iat: now.timestamp(),
            exp: access_exp.timestamp(),
            jti: access_jti.to_string(),
        };

        let (kid, encoding_key) = self
            .store
            .signing_key()
            .map_err(|err| anyhow!("No signing secret available: {err}"))?;
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid);

        let access_token = encode(&header, &access_claims, &encoding_key)
            .map_err(|err| anyhow!("Failed to sign access token: {err}"))?;

        let refresh_token = Self::generate_refresh_token();
        let refresh_hash = Self::hash_refresh_token(&refresh_token);
        let refresh_jti = Uuid::new_v4();
        self.persist_refresh_token(refresh_jti, &subject, &refresh_hash, now, refresh_exp)
            .await?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            access_jti,
            access_expires_at: access_exp,
            refresh_expires_at: refresh_exp,
            access_expires_in: self.config.access_ttl_seconds,
            refresh_expires_in: self.config.refresh_ttl_seconds,
            token_type: "Bearer",
        })
    }

    fn generate_refresh_token() -> String {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let random = URL_SAFE_NO_PAD.encode(bytes);
        format!("{}.{}", Uuid::new_v4(), random)
    }

    fn hash_refresh_token(token: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hasher.finalize().to_vec()
    }

    async fn persist_refresh_token(
        &self,
        jti: Uuid,
        subject: &TokenSubject,
        token_hash: &[u8],
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO auth_refresh_tokens (jti, user_id, tenant_id, token_hash, issued_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(jti)
        .bind(subject.user_id)
        .bind(subject.tenant_id)
        .bind(token_hash)
        .bind(issued_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|err| anyhow!("Failed to persist refresh token: {err}"))
    }

    /// One-time semantics: the token row is deleted inside the same
    /// transaction that reads it, so a replay finds nothing.
    pub async fn consume_refresh_token(&self, token: &str) -> Result<Option<RefreshTokenAccount>> {
        if token.trim().is_empty() {
            return Ok(None);
        }

        let hash = Self::hash_refresh_token(token);
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT r.jti, r.user_id, r.tenant_id, r.expires_at,
                    u.email, u.name, u.role, u.is_active, t.plan
             FROM auth_refresh_tokens r
             JOIN users u ON u.id = r.user_id
             JOIN tenants t ON t.id = r.tenant_id
             WHERE r.token_hash = $1
             FOR UPDATE",
        )
        .bind(hash.as_slice())
        .fetch_optional(&mut *tx)
        .await?;

        let account = if let Some(row) = row {
            let jti: Uuid = row.try_get("jti")?;
            sqlx::query("DELETE FROM auth_refresh_tokens WHERE jti = $1")
                .bind(jti)
                .execute(&mut *tx)
                .await?;
            let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
            if expires_at <= Utc::now() {
                None
            } else {
                let role: String = row.try_get("role")?;
                let plan: String = row.try_get("plan")?;
                Some(RefreshTokenAccount {
                    jti,
                    user_id: row.try_get("user_id")?,
                    tenant_id: row.try_get("tenant_id")?,
                    email: row.try_get("email")?,
                    name: row.try_get("name")?,
                    role: role.parse().map_err(|err: String| anyhow!(err))?,
                    plan: plan.parse().map_err(|err: String| anyhow!(err))?,
                    is_active: row.try_get("is_active")?,
                })
            }
        } else {
            None
        };

        tx.commit().await?;
        Ok(account)
    }

    pub async fn revoke_refresh_tokens_for_user(&self, user_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM auth_refresh_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Serialize)]
struct AccessClaims<'a> {
    sub: String,
    email: &'a str,
    tenant_id: String,
    role: &'a str,
    plan: &'a str,
    iat: i64,
    exp: i64,
    jti: String,
}
