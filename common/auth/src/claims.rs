use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AuthError, AuthResult};
use crate::roles::{Plan, Role};

/// Application-focused representation of verified JWT claims.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
    pub subject: Uuid,
    pub email: String,
    pub tenant_id: Uuid,
    pub role: Role,
    pub plan: Plan,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub jti: Uuid,
}

#[derive(Debug, Deserialize)]
struct ClaimsRepr {
    sub: String,
    email: String,
    tenant_id: String,
    role: String,
    plan: String,
    #[serde(default)]
    iat: Option<i64>,
    exp: i64,
    jti: String,
}

impl TryFrom<ClaimsRepr> for Claims {
    type Error = AuthError;

    fn try_from(value: ClaimsRepr) -> AuthResult<Self> {
        let subject = Uuid::parse_str(&value.sub)
            .map_err(|_| AuthError::InvalidClaim("sub", value.sub.clone()))?;
        let tenant_id = Uuid::parse_str(&value.tenant_id)
            .map_err(|_| AuthError::InvalidClaim("tenant_id", value.tenant_id.clone()))?;
        let jti = Uuid::parse_str(&value.jti)
            .map_err(|_| AuthError::InvalidClaim("jti", value.jti.clone()))?;
        let role = value
            .role
            .parse::<Role>()
            .map_err(|_| AuthError::InvalidClaim("role", value.role.clone()))?;
        let plan = value
            .plan
            .parse::<Plan>()
            .map_err(|_| AuthError::InvalidClaim("plan", value.plan.clone()))?;

        let expires_at = Utc
            .timestamp_opt(value.exp, 0)
            .single()
            .ok_or_else(|| AuthError::InvalidClaim("exp", value.exp.to_string()))?;

        let issued_at = match value.iat {
            Some(iat) => Some(
                Utc.timestamp_opt(iat, 0)
                    .single()
                    .ok_or_else(|| AuthError::InvalidClaim("iat", iat.to_string()))?,
            ),
            None => None,
        };

        Ok(Self {
            subject,
            email: value.email,
            tenant_id,
            role,
            plan,
            issued_at,
            expires_at,
            jti,
        })
    }
}

impl TryFrom<serde_json::Value> for Claims {
    type Error = AuthError;

    fn try_from(value: serde_json::Value) -> AuthResult<Self> {
        let repr: ClaimsRepr =
            serde_json::from_value(value).map_err(|err| AuthError::InvalidJson(err.to_string()))?;
        Claims::try_from(repr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> serde_json::Value {
        json!({
            "sub": "7f7c4640-3b53-4b57-a079-80a10c2c279e",
            "email": "pat@example.com",
            "tenant_id": "7a0bb7a8-95ae-45a5-b2a9-3a2f4d9e9b10",
            "role": "manager",
            "plan": "pro",
            "iat": 1_700_000_000,
            "exp": 1_700_003_600,
            "jti": "e58eaed9-2b7e-4f2c-9b3c-1ab55b0c1d0f"
        })
    }

    #[test]
    fn parses_full_payload() {
        let claims = Claims::try_from(payload()).unwrap();
        assert_eq!(claims.role, Role::Manager);
        assert_eq!(claims.plan, Plan::Pro);
        assert_eq!(claims.expires_at.timestamp(), 1_700_003_600);
    }

    #[test]
    fn rejects_unknown_role() {
        let mut value = payload();
        value["role"] = json!("superuser");
        let err = Claims::try_from(value).unwrap_err();
        assert!(matches!(err, AuthError::InvalidClaim("role", _)));
    }

    #[test]
    fn rejects_non_uuid_subject() {
        let mut value = payload();
        value["sub"] = json!("42");
        assert!(Claims::try_from(value).is_err());
    }
}
