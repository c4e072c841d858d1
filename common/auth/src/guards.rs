use common_http_errors::ApiError;
use tracing::warn;

use crate::extractors::AuthContext;
use crate::roles::Role;

/// Role floor check for handler entry points.
pub fn ensure_role(auth: &AuthContext, required: Role) -> Result<(), ApiError> {
    if auth.role.at_least(required) {
        return Ok(());
    }
    warn!(
        tenant_id = %auth.tenant_id,
        user_id = %auth.user_id,
        role = %auth.role,
        required = %required,
        "role check failed"
    );
    Err(ApiError::Forbidden)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::Plan;
    use uuid::Uuid;

    fn ctx(role: Role) -> AuthContext {
        AuthContext {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            email: "pat@example.com".into(),
            role,
            plan: Plan::Standard,
            permissions: Vec::new(),
            jti: None,
        }
    }

    #[test]
    fn admin_clears_manager_floor() {
        assert!(ensure_role(&ctx(Role::Admin), Role::Manager).is_ok());
    }

    #[test]
    fn member_fails_manager_floor() {
        assert!(ensure_role(&ctx(Role::Member), Role::Manager).is_err());
    }
}
