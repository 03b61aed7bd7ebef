//! Request context for control plane operations
//!
//! The request context carries who is making a request and the role every
//! authorization decision for it is made against.

use crate::error::{ControlError, Result};
use phenix_rbac::builtin::GLOBAL_ADMIN;
use phenix_rbac::{PolicySpec, Role, RoleSpec};
use tracing::warn;
use uuid::Uuid;

/// Context for a control plane request
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique request ID for tracing
    pub request_id: Uuid,
    /// Authenticated username
    pub user: String,
    /// Role of the user, already specialised
    pub role: Role,
    /// Request timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl RequestContext {
    pub fn new(user: impl Into<String>, role: Role) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            user: user.into(),
            role,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Context for unauthenticated deployments: an unrestricted global admin
    pub fn anonymous_admin() -> Self {
        let spec = RoleSpec::new(
            GLOBAL_ADMIN,
            vec![PolicySpec::new(["*"], ["*"], ["*"], ["*"])],
        );

        Self::new("admin", Role::new(spec))
    }

    /// Fail unless the role allows `verb` on `resource` in `scope`
    pub fn authorize(&self, resource: &str, scope: &str, verb: &str, names: &[&str]) -> Result<()> {
        if let Some(err) = self.role.config_error() {
            return Err(ControlError::PolicyConfigInvalid(err.to_string()));
        }

        if self.role.allowed(resource, scope, verb, names) {
            return Ok(());
        }

        warn!(
            user = %self.user,
            role = %self.role.name(),
            resource,
            scope,
            verb,
            "Request not allowed"
        );

        Err(ControlError::forbidden(resource, scope, verb))
    }

    /// Boolean form of [`authorize`](Self::authorize) for filtering listings
    pub fn can(&self, resource: &str, scope: &str, verb: &str, names: &[&str]) -> bool {
        self.role.allowed(resource, scope, verb, names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_admin_allows_everything() {
        let ctx = RequestContext::anonymous_admin();
        assert!(ctx.authorize("experiments/start", "exp1", "update", &[]).is_ok());
        assert!(ctx.authorize("users", "", "delete", &["bob"]).is_ok());
    }

    #[test]
    fn test_anonymous_admin_role_is_fully_configured() {
        let ctx = RequestContext::anonymous_admin();
        assert_eq!(ctx.role.name(), GLOBAL_ADMIN);
        assert!(ctx.role.config_error().is_none());

        let policies = &ctx.role.spec().policies;
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].scopes, vec!["*".to_string()]);
        assert_eq!(policies[0].resource_names, vec!["*".to_string()]);
        assert!(ctx.can("vms/screenshot", "any", "get", &["web"]));
    }

    #[test]
    fn test_authorize_denies() {
        let role = Role::new(RoleSpec::new(
            "viewer",
            vec![PolicySpec::new(["experiments"], ["*"], ["get"], ["*"])],
        ));
        let ctx = RequestContext::new("bob", role);

        assert!(ctx.authorize("experiments", "exp1", "get", &[]).is_ok());
        assert!(matches!(
            ctx.authorize("experiments", "exp1", "delete", &[]),
            Err(ControlError::Forbidden { .. })
        ));
    }

    #[test]
    fn test_invalid_role_reported() {
        let role = Role::new(RoleSpec::new(
            "broken",
            vec![PolicySpec::new(["vms["], ["*"], ["*"], ["*"])],
        ));
        let ctx = RequestContext::new("bob", role);

        assert!(matches!(
            ctx.authorize("vms", "exp1", "get", &[]),
            Err(ControlError::PolicyConfigInvalid(_))
        ));
    }
}
