use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jsonwebtoken::{DecodingKey, EncodingKey};

use crate::error::{AuthError, AuthResult};

/// Thread-safe store for the rotated symmetric secret set. The active entry
/// signs new tokens; every entry remains valid for verification so tokens
/// issued under a retired kid survive a rotation.
#[derive(Clone, Default)]
pub struct SecretStore {
    inner: Arc<RwLock<SecretsInner>>,
}

#[derive(Default)]
struct SecretsInner {
    secrets: HashMap<String, Vec<u8>>,
    active_kid: Option<String>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a `kid:secret,kid2:secret2` specification; the first entry
    /// becomes the signing key.
    pub fn from_spec(spec: &str) -> AuthResult<Self> {
        let store = Self::new();
        for (idx, part) in spec.split(',').map(str::trim).filter(|p| !p.is_empty()).enumerate() {
            let (kid, secret) = part
                .split_once(':')
                .ok_or_else(|| AuthError::KeySpec(format!("entry {idx} missing ':' separator")))?;
            if kid.is_empty() || secret.is_empty() {
                return Err(AuthError::KeySpec(format!("entry {idx} has empty kid or secret")));
            }
            store.insert_secret(kid, secret.as_bytes(), idx == 0);
        }
        if store.active_kid().is_none() {
            return Err(AuthError::KeySpec("no secrets configured".into()));
        }
        Ok(store)
    }

    pub fn insert_secret(&self, kid: impl Into<String>, secret: &[u8], active: bool) {
        let kid = kid.into();
        let mut guard = self.inner.write().expect("rwlock poisoned");
        guard.secrets.insert(kid.clone(), secret.to_vec());
        if active || guard.active_kid.is_none() {
            guard.active_kid = Some(kid);
        }
    }

    pub fn decoding_key(&self, kid: &str) -> Option<DecodingKey> {
        let guard = self.inner.read().expect("rwlock poisoned");
        guard.secrets.get(kid).map(|s| DecodingKey::from_secret(s))
    }

    pub fn active_kid(&self) -> Option<String> {
        let guard = self.inner.read().expect("rwlock poisoned");
        guard.active_kid.clone()
    }

    /// Signing material for token issuance.
    pub fn signing_key(&self) -> AuthResult<(String, EncodingKey)> {
        let guard = self.inner.read().expect("rwlock poisoned");
        let kid = guard
            .active_kid
            .clone()
            .ok_or_else(|| AuthError::KeySpec("no active signing secret".into()))?;
        let secret = guard
            .secrets
            .get(&kid)
            .ok_or_else(|| AuthError::UnknownKeyId(kid.clone()))?;
        Ok((kid, EncodingKey::from_secret(secret)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_first_entry_signs() {
        let store = SecretStore::from_spec("k2:new-secret,k1:old-secret").unwrap();
        assert_eq!(store.active_kid().as_deref(), Some("k2"));
        assert!(store.decoding_key("k1").is_some());
        assert!(store.decoding_key("k0").is_none());
    }

    #[test]
    fn spec_rejects_malformed_entries() {
        assert!(SecretStore::from_spec("").is_err());
        assert!(SecretStore::from_spec("missing-separator").is_err());
        assert!(SecretStore::from_spec(":empty-kid").is_err());
    }
}
