use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Namespace used in place of a tenant id for unauthenticated preview
/// traffic, keeping preview fills out of every tenant's key space.
pub const PREVIEW_NAMESPACE: &str = "preview";

/// Canonical cache key for a backend call: lower-cased operation tag, tenant
/// id, parameters in sorted key order, then the payload text. User identity
/// never participates so hits are shared across a tenant.
pub fn fingerprint(operation: &str, tenant: &str, params: &BTreeMap<String, String>, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.to_ascii_lowercase().as_bytes());
    hasher.update([0x1f]);
    hasher.update(tenant.as_bytes());
    hasher.update([0x1f]);
    for (key, value) in params {
        hasher.update(key.as_bytes());
        hasher.update([0x1e]);
        hasher.update(value.as_bytes());
        hasher.update([0x1e]);
    }
    hasher.update([0x1f]);
    hasher.update(text.trim().as_bytes());
    hex::encode(hasher.finalize())
}

pub fn tenant_component(tenant_id: Option<Uuid>) -> String {
    match tenant_id {
        Some(id) => id.to_string(),
        None => PREVIEW_NAMESPACE.to_string(),
    }
}

/// Flattens option objects into sorted `key=value` parameter entries so that
/// `{"a":1,"b":2}` and `{"b":2,"a":1}` canonicalize identically.
pub fn params_from_options(params: &mut BTreeMap<String, String>, options: Option<&Value>) {
    let Some(Value::Object(map)) = options else {
        return;
    };
    for (key, value) in map {
        params.insert(format!("opt.{key}"), value.to_string());
    }
}
