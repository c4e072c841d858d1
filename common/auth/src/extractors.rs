use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use common_http_errors::ApiError;
use uuid::Uuid;

use crate::claims::Claims;
use crate::roles::{Plan, Role};

/// Identity attached to the request by the gateway's resolver middleware.
/// Handlers extract it instead of re-verifying credentials.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub role: Role,
    pub plan: Plan,
    pub permissions: Vec<String>,
    /// Set for JWT credentials; API keys have no jti.
    pub jti: Option<Uuid>,
}

impl AuthContext {
    pub fn from_claims(claims: &Claims) -> Self {
        Self {
            user_id: claims.subject,
            tenant_id: claims.tenant_id,
            email: claims.email.clone(),
            role: claims.role,
            plan: claims.plan,
            permissions: Vec::new(),
            jti: Some(claims.jti),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        // JWT identities carry no explicit permission set; role gates them.
        self.permissions.is_empty() || self.permissions.iter().any(|p| p == permission)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or(ApiError::Unauthenticated)
    }
}
