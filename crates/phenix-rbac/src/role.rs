//! Roles
//!
//! A role is a named, ordered list of policies. Access is granted if any of
//! its policies grants it.
//!
//! [`RoleSpec`] is the mutable, stored form used while a role is being
//! specialised for a user. [`Role`] is built from a spec once and is
//! immutable afterwards: the resource-pattern index is computed eagerly at
//! construction, so authorization never mutates shared state.

use crate::error::{RbacError, Result};
use crate::pattern::Pattern;
use crate::policy::{Policy, PolicySpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Stored role definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSpec {
    #[serde(rename = "roleName")]
    pub name: String,

    #[serde(default)]
    pub policies: Vec<PolicySpec>,
}

impl RoleSpec {
    pub fn new(name: impl Into<String>, policies: Vec<PolicySpec>) -> Self {
        Self {
            name: name.into(),
            policies,
        }
    }

    /// Restrict every policy of this role to the given experiment patterns.
    ///
    /// Fails without modifying anything if any policy already has scopes.
    pub fn set_scopes(&mut self, patterns: &[String]) -> Result<()> {
        if self.policies.iter().any(|p| !p.scopes.is_empty()) {
            return Err(RbacError::AlreadyConfigured { field: "experiments" });
        }

        for policy in &mut self.policies {
            policy.set_scopes(patterns)?;
        }

        Ok(())
    }

    /// Restrict every policy of this role to the given name patterns.
    ///
    /// Fails without modifying anything if any policy already has names.
    pub fn set_resource_names(&mut self, patterns: &[String]) -> Result<()> {
        if self.policies.iter().any(|p| !p.resource_names.is_empty()) {
            return Err(RbacError::AlreadyConfigured {
                field: "resource names",
            });
        }

        for policy in &mut self.policies {
            policy.set_resource_names(patterns)?;
        }

        Ok(())
    }

    /// Append a policy
    pub fn add_policy(&mut self, policy: PolicySpec) {
        self.policies.push(policy);
    }
}

/// Resource pattern and the policies declaring it, in declaration order
#[derive(Debug, Clone)]
struct IndexEntry {
    resource: Pattern,
    policies: Vec<usize>,
}

#[derive(Debug)]
struct RoleInner {
    spec: RoleSpec,
    policies: Vec<Policy>,
    index: Vec<IndexEntry>,
    config_error: Option<RbacError>,
}

/// Compiled, immutable role
///
/// Cheap to clone; clones share the compiled index.
#[derive(Debug, Clone)]
pub struct Role {
    inner: Arc<RoleInner>,
}

impl Role {
    /// Build a role, failing closed on invalid patterns.
    ///
    /// A role whose spec contains any pattern that does not compile denies
    /// every request. The problem is logged once here.
    pub fn new(spec: RoleSpec) -> Self {
        match Self::build(&spec) {
            Ok((policies, index)) => Self {
                inner: Arc::new(RoleInner {
                    spec,
                    policies,
                    index,
                    config_error: None,
                }),
            },
            Err(err) => {
                warn!(role = %spec.name, error = %err, "Role configuration invalid, denying all access");
                Self {
                    inner: Arc::new(RoleInner {
                        spec,
                        policies: Vec::new(),
                        index: Vec::new(),
                        config_error: Some(err),
                    }),
                }
            }
        }
    }

    /// Build a role, returning an error on invalid patterns.
    pub fn try_new(spec: RoleSpec) -> Result<Self> {
        let (policies, index) = Self::build(&spec)?;

        Ok(Self {
            inner: Arc::new(RoleInner {
                spec,
                policies,
                index,
                config_error: None,
            }),
        })
    }

    fn build(spec: &RoleSpec) -> Result<(Vec<Policy>, Vec<IndexEntry>)> {
        let mut invalid = Vec::new();
        let mut policies = Vec::with_capacity(spec.policies.len());
        let mut index: Vec<IndexEntry> = Vec::new();

        for (i, policy_spec) in spec.policies.iter().enumerate() {
            match Policy::compile(policy_spec) {
                Ok(policy) => policies.push(policy),
                Err(bad) => invalid.extend(bad),
            }

            for resource in &policy_spec.resources {
                if let Some(entry) = index.iter_mut().find(|e| e.resource.as_str() == resource) {
                    if !entry.policies.contains(&i) {
                        entry.policies.push(i);
                    }
                    continue;
                }

                match Pattern::glob(resource) {
                    Ok(pattern) => index.push(IndexEntry {
                        resource: pattern,
                        policies: vec![i],
                    }),
                    Err(_) => invalid.push(resource.clone()),
                }
            }
        }

        if !invalid.is_empty() {
            return Err(RbacError::PolicyConfigInvalid { patterns: invalid });
        }

        debug!(role = %spec.name, policies = policies.len(), resources = index.len(), "Role compiled");

        Ok((policies, index))
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    /// The definition this role was built from
    pub fn spec(&self) -> &RoleSpec {
        &self.inner.spec
    }

    /// Why this role denies everything, if it does
    pub fn config_error(&self) -> Option<&RbacError> {
        self.inner.config_error.as_ref()
    }

    /// Is `verb` on `resource`, scoped to experiment `scope` and optionally
    /// naming instances `names`, allowed?
    ///
    /// An empty `scope` is an unscoped request. With no `names`, any policy
    /// passing the scope and verb checks grants access; otherwise at least
    /// one of the names must also be allowed by that same policy.
    pub fn allowed(&self, resource: &str, scope: &str, verb: &str, names: &[&str]) -> bool {
        if self.inner.config_error.is_some() {
            return false;
        }

        self.inner
            .index
            .iter()
            .filter(|entry| entry.resource.matches(resource))
            .flat_map(|entry| entry.policies.iter())
            .any(|&i| self.inner.policies[i].grants(scope, verb, names))
    }
}

impl From<RoleSpec> for Role {
    fn from(spec: RoleSpec) -> Self {
        Self::new(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strings(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn role(policies: Vec<PolicySpec>) -> Role {
        Role::try_new(RoleSpec::new("test", policies)).unwrap()
    }

    fn wildcard_role() -> Role {
        role(vec![PolicySpec::new(["*"], ["*"], ["*"], ["*"])])
    }

    #[test]
    fn test_wildcard_role_allows_everything() {
        let r = wildcard_role();
        assert!(r.allowed("experiments", "exp1", "get", &[]));
        assert!(r.allowed("vms/start", "exp1", "update", &["host-1"]));
        assert!(r.allowed("users", "", "delete", &["alice"]));
    }

    #[test]
    fn test_negated_scope_overrides_positive() {
        let r = role(vec![PolicySpec::new(
            ["experiments"],
            ["*", "!prod-*"],
            ["get"],
            Vec::<String>::new(),
        )]);

        assert!(!r.allowed("experiments", "prod-test", "get", &[]));
        assert!(r.allowed("experiments", "exp-dev", "get", &[]));
    }

    #[test]
    fn test_empty_scope_bypasses_scoping() {
        let r = role(vec![PolicySpec::new(
            ["hosts"],
            Vec::<String>::new(),
            ["list"],
            Vec::<String>::new(),
        )]);

        assert!(r.allowed("hosts", "", "list", &[]));
        assert!(!r.allowed("hosts", "exp1", "list", &[]));
    }

    #[test]
    fn test_or_across_policies() {
        let r = role(vec![
            PolicySpec::new(["vms"], ["exp1"], ["get"], ["*"]),
            PolicySpec::new(["vms"], ["exp2"], ["delete"], ["*"]),
        ]);

        assert!(r.allowed("vms", "exp1", "get", &[]));
        assert!(r.allowed("vms", "exp2", "delete", &[]));
        assert!(!r.allowed("vms", "exp1", "delete", &[]));
    }

    #[test]
    fn test_resource_glob_on_policy_side() {
        let r = role(vec![PolicySpec::new(["vms/*"], ["*"], ["update"], ["*"])]);

        assert!(r.allowed("vms/start", "exp1", "update", &[]));
        assert!(r.allowed("vms/redeploy", "exp1", "update", &[]));
        assert!(!r.allowed("vms", "exp1", "update", &[]));
        assert!(!r.allowed("experiments/start", "exp1", "update", &[]));
    }

    #[test]
    fn test_names_any_allowed() {
        let r = role(vec![PolicySpec::new(["vms"], ["*"], ["get"], ["web-*"])]);

        assert!(r.allowed("vms", "exp1", "get", &["db", "web-1"]));
        assert!(!r.allowed("vms", "exp1", "get", &["db"]));
    }

    #[test]
    fn test_invalid_resource_fails_closed() {
        let spec = RoleSpec::new(
            "broken",
            vec![
                PolicySpec::new(["experiments"], ["*"], ["*"], ["*"]),
                PolicySpec::new(["vms["], ["*"], ["*"], ["*"]),
            ],
        );

        let err = Role::try_new(spec.clone()).unwrap_err();
        assert_eq!(
            err,
            RbacError::PolicyConfigInvalid {
                patterns: strings(&["vms["])
            }
        );

        let r = Role::new(spec);
        assert!(r.config_error().is_some());
        assert!(!r.allowed("experiments", "exp1", "get", &[]));
    }

    #[test]
    fn test_invalid_scope_fails_closed() {
        let r = Role::new(RoleSpec::new(
            "broken",
            vec![PolicySpec::new(["experiments"], ["exp-["], ["*"], ["*"])],
        ));

        assert!(!r.allowed("experiments", "", "get", &[]));
    }

    #[test]
    fn test_set_resource_names_defaults_to_wildcard() {
        let mut spec = RoleSpec::new(
            "viewer",
            vec![PolicySpec::new(
                ["vms"],
                Vec::<String>::new(),
                ["get"],
                Vec::<String>::new(),
            )],
        );

        spec.set_resource_names(&[]).unwrap();
        assert_eq!(spec.policies[0].resource_names, strings(&["*"]));
    }

    #[test]
    fn test_setters_are_atomic() {
        let mut spec = RoleSpec::new(
            "mixed",
            vec![
                PolicySpec::new(["vms"], Vec::<String>::new(), ["get"], Vec::<String>::new()),
                PolicySpec::new(["users"], ["exp1"], ["get"], Vec::<String>::new()),
            ],
        );

        let err = spec.set_scopes(&strings(&["exp2"])).unwrap_err();
        assert_eq!(err, RbacError::AlreadyConfigured { field: "experiments" });
        assert!(spec.policies[0].scopes.is_empty());
    }

    #[test]
    fn test_user_specialisation() {
        let mut spec = RoleSpec::new(
            "experiment-user",
            vec![
                PolicySpec::new(["experiments"], Vec::<String>::new(), ["list", "get"], Vec::<String>::new()),
                PolicySpec::new(["vms", "vms/*"], Vec::<String>::new(), ["*"], Vec::<String>::new()),
            ],
        );

        spec.set_scopes(&strings(&["team-*"])).unwrap();
        spec.set_resource_names(&strings(&["vms/web-*", "experiments/*"])).unwrap();
        spec.add_policy(PolicySpec::new(["users"], Vec::<String>::new(), ["get"], ["alice"]));

        let r = Role::new(spec);

        assert!(r.allowed("experiments", "team-a", "get", &[]));
        assert!(!r.allowed("experiments", "other", "get", &[]));
        assert!(r.allowed("vms/start", "team-a", "update", &["web-1"]));
        assert!(!r.allowed("vms/start", "team-a", "update", &["db-1"]));
        assert!(r.allowed("users", "", "get", &["alice"]));
        assert!(!r.allowed("users", "", "get", &["bob"]));
    }

    #[test]
    fn test_yaml_role() {
        let yaml = r#"
roleName: vm-viewer
policies:
  - resources: [vms, vms/vnc]
    experiments: ["*"]
    resourceNames: ["*", "!secret-*"]
    verbs: [list, get]
"#;
        let spec: RoleSpec = serde_yaml::from_str(yaml).unwrap();
        let r = Role::try_new(spec).unwrap();

        assert_eq!(r.name(), "vm-viewer");
        assert!(r.allowed("vms/vnc", "exp1", "get", &["host-1"]));
        assert!(!r.allowed("vms/vnc", "exp1", "get", &["secret-1"]));
        assert!(!r.allowed("vms", "exp1", "delete", &[]));
    }

    proptest! {
        #[test]
        fn prop_wildcard_role_allows_any(
            resource in "[a-z/]{0,16}",
            scope in "[a-z0-9-]{0,12}",
            verb in "[a-z]{1,8}",
            name in "[a-z0-9-]{0,12}",
        ) {
            let r = wildcard_role();
            prop_assert!(r.allowed(&resource, &scope, &verb, &[]));
            prop_assert!(r.allowed(&resource, &scope, &verb, &[name.as_str()]));
        }

        #[test]
        fn prop_negated_scope_never_grants(suffix in "[a-z0-9-]{0,12}") {
            let r = role(vec![PolicySpec::new(
                ["experiments"],
                ["*", "prod-*", "!prod-*"],
                ["*"],
                ["*"],
            )]);
            let scope = format!("prod-{}", suffix);
            prop_assert!(!r.allowed("experiments", &scope, "get", &[]));
        }

        #[test]
        fn prop_empty_scope_always_accepted(scopes in proptest::collection::vec("!?[a-z*]{1,6}", 0..4)) {
            let r = role(vec![PolicySpec::new(["experiments"], scopes, ["get"], Vec::<String>::new())]);
            prop_assert!(r.allowed("experiments", "", "get", &[]));
        }
    }
}
