//! Config store seam
//!
//! Persists experiments, topologies, scenarios, roles and users. Credentials
//! are issued elsewhere; the store only maps existing tokens to users.

use crate::error::Result;
use async_trait::async_trait;
use phenix_rbac::{kind, verb, PolicySpec, RoleSpec};
use phenix_types::{ExperimentRecord, Scenario, Topology, UserSpec};
use serde::{Deserialize, Serialize};

/// A stored user with its specialised role and issued tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub role: RoleSpec,
    #[serde(default, skip_serializing)]
    pub tokens: Vec<String>,
}

impl UserRecord {
    /// Create a user whose role is `role` restricted to the given experiment
    /// and resource name patterns
    pub fn new(
        username: impl Into<String>,
        first_name: impl Into<String>,
        last_name: impl Into<String>,
        role: RoleSpec,
        experiments: &[String],
        resource_names: &[String],
    ) -> phenix_rbac::Result<Self> {
        let username = username.into();
        let role = specialise_role(role, &username, experiments, resource_names)?;

        Ok(Self {
            username,
            first_name: first_name.into(),
            last_name: last_name.into(),
            role,
            tokens: Vec::new(),
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.tokens.push(token.into());
        self
    }

    /// The operator view, without credentials
    pub fn spec(&self) -> UserSpec {
        UserSpec {
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            role_name: Some(self.role.name.clone()),
        }
    }
}

/// Restrict a stored role to one user.
///
/// Scopes and names default to `*` when none are given. The user is always
/// allowed to read their own record.
pub fn specialise_role(
    mut role: RoleSpec,
    username: &str,
    experiments: &[String],
    resource_names: &[String],
) -> phenix_rbac::Result<RoleSpec> {
    role.set_scopes(experiments)?;
    role.set_resource_names(resource_names)?;
    role.add_policy(PolicySpec::new(
        [kind::USERS],
        Vec::<String>::new(),
        [verb::GET],
        [username],
    ));

    Ok(role)
}

/// Persistence consumed by the control plane
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn experiments(&self) -> Result<Vec<ExperimentRecord>>;

    async fn experiment(&self, name: &str) -> Result<Option<ExperimentRecord>>;

    /// Insert or replace an experiment
    async fn save_experiment(&self, experiment: ExperimentRecord) -> Result<()>;

    /// Returns whether the experiment existed
    async fn delete_experiment(&self, name: &str) -> Result<bool>;

    async fn topologies(&self) -> Result<Vec<Topology>>;

    async fn topology(&self, name: &str) -> Result<Option<Topology>>;

    async fn scenarios(&self) -> Result<Vec<Scenario>>;

    async fn role(&self, name: &str) -> Result<Option<RoleSpec>>;

    async fn users(&self) -> Result<Vec<UserRecord>>;

    async fn user(&self, username: &str) -> Result<Option<UserRecord>>;

    /// Insert or replace a user, keeping existing tokens when the new record
    /// carries none
    async fn save_user(&self, user: UserRecord) -> Result<()>;

    /// Returns whether the user existed
    async fn delete_user(&self, username: &str) -> Result<bool>;

    async fn user_by_token(&self, token: &str) -> Result<Option<UserRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use phenix_rbac::{default_role, Role};

    #[test]
    fn test_specialised_user_reads_only_self() {
        let role = default_role("VM Viewer").unwrap();
        let user = UserRecord::new("alice", "Alice", "A", role, &["team-*".to_string()], &[])
            .unwrap();
        let role = Role::new(user.role.clone());

        assert!(role.allowed(kind::USERS, "", verb::GET, &["alice"]));
        assert!(!role.allowed(kind::USERS, "", verb::GET, &["bob"]));
        assert!(role.allowed(kind::VMS, "team-1", verb::GET, &["any"]));
        assert!(!role.allowed(kind::VMS, "other", verb::GET, &["any"]));
    }

    #[test]
    fn test_spec_hides_tokens() {
        let user = UserRecord::new(
            "bob",
            "",
            "",
            default_role("global-viewer").unwrap(),
            &[],
            &[],
        )
        .unwrap()
        .with_token("secret");

        assert_eq!(user.spec().role_name.as_deref(), Some("global-viewer"));
        let json = serde_json::to_string(&user).unwrap();
        assert!(!json.contains("secret"));
    }
}
