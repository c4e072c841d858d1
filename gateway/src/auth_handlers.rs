use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::extract::State;
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use common_auth::{AuthContext, Plan};
use common_http_errors::{ApiError, ApiResult};
use rand_core::OsRng;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};

use crate::persistence::is_unique_violation;
use crate::tokens::{IssuedTokens, TokenSubject};
use crate::AppState;

const MAX_FAILED_ATTEMPTS: i16 = 5;
const LOCKOUT_MINUTES: i64 = 15;
const MIN_PASSWORD_LENGTH: usize = 8;

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub tenant_name: String,
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub plan: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

fn token_response(tokens: &IssuedTokens) -> serde_json::Value {
    json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "token_type": tokens.token_type,
        "expires_in": tokens.access_expires_in,
        "refresh_expires_in": tokens.refresh_expires_in,
    })
}

fn hash_password(password: &str) -> Result<String, ApiError> {
    let trimmed = password.trim();
    if trimmed.len() < MIN_PASSWORD_LENGTH {
        return Err(ApiError::validation(json!({
            "fields": [{ "field": "password", "reason": "must be at least 8 characters" }]
        })));
    }
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(trimmed.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(ApiError::internal)
}

fn verify_password(stored_hash: &str, password: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.trim().as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// Compared against when the email is unknown so the missing-user path costs
// the same as a wrong-password path.
const DUMMY_PASSWORD_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$bm90LWEtcmVhbC1zYWx0$V3Fh2DlUJxtFn1Fs7LlU0+6Y5mCTGVVuEgsmcYnmsbk";

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let email = req.email.trim().to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(ApiError::validation(json!({
            "fields": [{ "field": "email", "reason": "must be a valid email address" }]
        })));
    }
    let tenant_name = req.tenant_name.trim();
    if tenant_name.is_empty() {
        return Err(ApiError::validation(json!({
            "fields": [{ "field": "tenant_name", "reason": "must not be empty" }]
        })));
    }
    let plan = match req.plan.as_deref() {
        None => Plan::Free,
        Some(raw) => raw.parse::<Plan>().map_err(|_| {
            ApiError::validation(json!({
                "fields": [{ "field": "plan", "reason": "unknown plan" }]
            }))
        })?,
    };

    let password_hash = hash_password(&req.password)?;
    let (tenant_id, user_id) = state
        .persistence
        .create_tenant_with_admin(tenant_name, &email, req.name.trim(), &password_hash, plan)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ApiError::conflict("An account with this email already exists")
            } else {
                ApiError::internal(err)
            }
        })?;

    let tokens = state
        .signer
        .issue_tokens(TokenSubject {
            user_id,
            tenant_id,
            email: email.clone(),
            role: common_auth::Role::Admin,
            plan,
        })
        .await
        .map_err(ApiError::internal)?;

    info!(%tenant_id, %user_id, "registered tenant");
    let mut body = token_response(&tokens);
    body["user"] = json!({ "id": user_id, "email": email, "tenant_id": tenant_id, "role": "admin", "plan": plan.as_str() });
    Ok(crate::responses::success(body))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let email = req.email.trim().to_lowercase();
    let user = state
        .persistence
        .find_user_for_login(&email)
        .await
        .map_err(ApiError::internal)?;

    let Some(user) = user else {
        // Burn the same hashing work before rejecting.
        let _ = verify_password(DUMMY_PASSWORD_HASH, &req.password);
        return Err(ApiError::Unauthenticated);
    };

    if let Some(locked_until) = user.locked_until {
        if locked_until > Utc::now() {
            warn!(user_id = %user.id, "login attempt on locked account");
            return Err(ApiError::Forbidden);
        }
    }
    if !user.is_active {
        return Err(ApiError::Forbidden);
    }

    if !verify_password(&user.password_hash, &req.password) {
        let attempts = user.failed_attempts.saturating_add(1);
        let locked_until = (attempts >= MAX_FAILED_ATTEMPTS)
            .then(|| Utc::now() + ChronoDuration::minutes(LOCKOUT_MINUTES));
        if let Err(err) = state
            .persistence
            .record_login_failure(user.id, attempts, locked_until)
            .await
        {
            warn!(%err, user_id = %user.id, "failed to record login failure");
        }
        return Err(ApiError::Unauthenticated);
    }

    state
        .persistence
        .record_login_success(user.id)
        .await
        .map_err(ApiError::internal)?;

    let tokens = state
        .signer
        .issue_tokens(TokenSubject {
            user_id: user.id,
            tenant_id: user.tenant_id,
            email: user.email.clone(),
            role: user.role,
            plan: user.plan,
        })
        .await
        .map_err(ApiError::internal)?;

    let mut body = token_response(&tokens);
    body["user"] = json!({
        "id": user.id,
        "email": user.email,
        "name": user.name,
        "tenant_id": user.tenant_id,
        "role": user.role.as_str(),
        "plan": user.plan.as_str(),
    });
    Ok(crate::responses::success(body))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let account = state
        .signer
        .consume_refresh_token(&req.refresh_token)
        .await
        .map_err(ApiError::internal)?;

    let Some(account) = account else {
        return Err(ApiError::Unauthenticated);
    };
    if !account.is_active {
        return Err(ApiError::Forbidden);
    }

    let tokens = state
        .signer
        .issue_tokens(TokenSubject {
            user_id: account.user_id,
            tenant_id: account.tenant_id,
            email: account.email,
            role: account.role,
            plan: account.plan,
        })
        .await
        .map_err(ApiError::internal)?;

    Ok(crate::responses::success(token_response(&tokens)))
}

/// Adds the access token's `jti` to the shared revocation set and drops the
/// user's refresh tokens; the revocation outlives the token itself.
pub async fn logout(State(state): State<AppState>, auth: AuthContext) -> ApiResult<Json<serde_json::Value>> {
    if let Some(jti) = auth.jti {
        let ttl = Duration::from_secs(state.config.access_ttl_seconds.max(60) as u64);
        state
            .revocations
            .revoke(jti, ttl)
            .await
            .map_err(ApiError::internal)?;
    }
    if let Err(err) = state.signer.revoke_refresh_tokens_for_user(auth.user_id).await {
        warn!(%err, user_id = %auth.user_id, "failed to drop refresh tokens on logout");
    }
    Ok(crate::responses::success(json!({ "logged_out": true })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_password_rejects_short_passwords() {
        assert!(hash_password("short").is_err());
    }

    #[test]
    fn hash_password_generates_verifiable_hash() {
        let hashed = hash_password("correct horse battery").unwrap();
        assert!(verify_password(&hashed, "correct horse battery"));
        assert!(!verify_password(&hashed, "wrong password"));
    }

    #[test]
    fn dummy_hash_parses() {
        assert!(PasswordHash::new(DUMMY_PASSWORD_HASH).is_ok());
    }
}
