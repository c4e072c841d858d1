use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use serde_json::Value;
use tracing::debug;

use crate::claims::Claims;
use crate::config::JwtConfig;
use crate::error::{AuthError, AuthResult};
use crate::keys::SecretStore;

#[derive(Clone)]
pub struct JwtVerifier {
    config: JwtConfig,
    store: SecretStore,
}

impl JwtVerifier {
    pub fn new(config: JwtConfig, store: SecretStore) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &JwtConfig {
        &self.config
    }

    pub fn store(&self) -> &SecretStore {
        &self.store
    }

    /// Verifies signature, `exp`, `iat` sanity and `nbf` against the secret
    /// selected by the token's `kid`. Revocation is the caller's concern; the
    /// verifier has no view of the shared revocation set.
    pub fn verify(&self, token: &str) -> AuthResult<Claims> {
        let header = decode_header(token).map_err(|_| AuthError::MalformedCredential)?;
        if header.alg != Algorithm::HS256 {
            return Err(AuthError::Verification(format!(
                "unexpected algorithm {:?}",
                header.alg
            )));
        }
        let kid = header.kid.ok_or(AuthError::MissingKeyId)?;
        let key = self
            .store
            .decoding_key(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.config.leeway_seconds.into();
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp"]);

        let token_data = decode::<Value>(token, &key, &validation)?;
        let claims = Claims::try_from(token_data.claims)?;
        debug!(kid, subject = %claims.subject, "verified JWT");
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{Plan, Role};
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use uuid::Uuid;

    fn sign(kid: &str, secret: &str, exp_offset: i64) -> String {
        let now = Utc::now();
        let claims = json!({
            "sub": Uuid::new_v4().to_string(),
            "email": "pat@example.com",
            "tenant_id": Uuid::new_v4().to_string(),
            "role": "member",
            "plan": "free",
            "iat": now.timestamp(),
            "exp": (now + Duration::seconds(exp_offset)).timestamp(),
            "jti": Uuid::new_v4().to_string(),
        });
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(kid.to_string());
        encode(&header, &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    fn verifier(spec: &str) -> JwtVerifier {
        JwtVerifier::new(JwtConfig::new(), SecretStore::from_spec(spec).unwrap())
    }

    #[test]
    fn accepts_token_signed_by_retired_kid() {
        let v = verifier("k2:next,k1:prev");
        let token = sign("k1", "prev", 600);
        let claims = v.verify(&token).unwrap();
        assert_eq!(claims.role, Role::Member);
        assert_eq!(claims.plan, Plan::Free);
    }

    #[test]
    fn rejects_unknown_kid() {
        let v = verifier("k1:secret");
        let token = sign("k9", "secret", 600);
        assert!(matches!(v.verify(&token), Err(AuthError::UnknownKeyId(_))));
    }

    #[test]
    fn rejects_expired_token() {
        let v = verifier("k1:secret");
        let token = sign("k1", "secret", -120);
        assert!(matches!(v.verify(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn rejects_wrong_secret() {
        let v = verifier("k1:right");
        let token = sign("k1", "wrong", 600);
        assert!(matches!(v.verify(&token), Err(AuthError::Verification(_))));
    }
}
