//! Built-in role definitions
//!
//! Built-in roles carry resources and verbs only. Scopes and resource names
//! are filled in per user with [`RoleSpec::set_scopes`] and
//! [`RoleSpec::set_resource_names`].

use crate::policy::PolicySpec;
use crate::role::RoleSpec;
use crate::vocabulary::{kind, verb};

pub const GLOBAL_ADMIN: &str = "global-admin";
pub const GLOBAL_VIEWER: &str = "global-viewer";
pub const EXPERIMENT_ADMIN: &str = "experiment-admin";
pub const EXPERIMENT_USER: &str = "experiment-user";
pub const EXPERIMENT_VIEWER: &str = "experiment-viewer";
pub const VM_VIEWER: &str = "vm-viewer";

const ALIASES: &[(&str, &str)] = &[
    ("Global Admin", GLOBAL_ADMIN),
    ("Global Viewer", GLOBAL_VIEWER),
    ("Experiment Admin", EXPERIMENT_ADMIN),
    ("Experiment User", EXPERIMENT_USER),
    ("Experiment Viewer", EXPERIMENT_VIEWER),
    ("VM Viewer", VM_VIEWER),
];

/// Map a display name ("Global Admin") to its stored role name. Names that
/// are not aliases are returned unchanged.
pub fn resolve_role_name(name: &str) -> &str {
    ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map(|(_, stored)| *stored)
        .unwrap_or(name)
}

fn policy(resources: &[&str], verbs: &[&str]) -> PolicySpec {
    PolicySpec::new(
        resources.iter().copied(),
        Vec::<String>::new(),
        verbs.iter().copied(),
        Vec::<String>::new(),
    )
}

const READ: &[&str] = &[verb::LIST, verb::GET];

/// Definitions of all built-in roles
pub fn default_roles() -> Vec<RoleSpec> {
    vec![
        RoleSpec::new(GLOBAL_ADMIN, vec![policy(&["*"], &["*"])]),
        RoleSpec::new(
            GLOBAL_VIEWER,
            vec![
                policy(&["*"], READ),
                policy(&[kind::VMS_VNC, kind::VMS_SCREENSHOT], &[verb::GET]),
            ],
        ),
        RoleSpec::new(
            EXPERIMENT_ADMIN,
            vec![
                policy(&[kind::EXPERIMENTS, "experiments/*"], &["*"]),
                policy(&[kind::VMS, "vms/*"], &["*"]),
                policy(
                    &[kind::TOPOLOGIES, kind::SCENARIOS, kind::DISKS, kind::HOSTS],
                    READ,
                ),
            ],
        ),
        RoleSpec::new(
            EXPERIMENT_USER,
            vec![
                policy(&[kind::EXPERIMENTS, kind::EXPERIMENTS_SCHEDULE], READ),
                policy(
                    &[kind::EXPERIMENTS_CAPTURES, kind::EXPERIMENTS_FILES],
                    READ,
                ),
                policy(&[kind::VMS], &[verb::LIST, verb::GET, verb::PATCH]),
                policy(
                    &[
                        kind::VMS_START,
                        kind::VMS_STOP,
                        kind::VMS_REDEPLOY,
                        kind::VMS_CAPTURES,
                        kind::VMS_SNAPSHOTS,
                    ],
                    &["*"],
                ),
                policy(&[kind::VMS_VNC, kind::VMS_SCREENSHOT], &[verb::GET]),
                policy(&[kind::TOPOLOGIES, kind::SCENARIOS, kind::DISKS], READ),
            ],
        ),
        RoleSpec::new(
            EXPERIMENT_VIEWER,
            vec![
                policy(&[kind::EXPERIMENTS, kind::EXPERIMENTS_SCHEDULE], READ),
                policy(&[kind::VMS, kind::VMS_CAPTURES, kind::VMS_SNAPSHOTS], READ),
                policy(&[kind::VMS_SCREENSHOT], &[verb::GET]),
            ],
        ),
        RoleSpec::new(
            VM_VIEWER,
            vec![
                policy(&[kind::VMS], READ),
                policy(&[kind::VMS_VNC, kind::VMS_SCREENSHOT], &[verb::GET]),
            ],
        ),
    ]
}

/// Definition of a single built-in role, by stored name or display alias
pub fn default_role(name: &str) -> Option<RoleSpec> {
    let name = resolve_role_name(name);
    default_roles().into_iter().find(|r| r.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::role::Role;

    fn specialised(name: &str) -> Role {
        let mut spec = default_role(name).unwrap();
        spec.set_scopes(&[]).unwrap();
        spec.set_resource_names(&[]).unwrap();
        Role::try_new(spec).unwrap()
    }

    #[test]
    fn test_resolve_aliases() {
        assert_eq!(resolve_role_name("Global Admin"), GLOBAL_ADMIN);
        assert_eq!(resolve_role_name("VM Viewer"), VM_VIEWER);
        assert_eq!(resolve_role_name("custom-role"), "custom-role");
    }

    #[test]
    fn test_default_roles_compile() {
        for spec in default_roles() {
            assert!(Role::try_new(spec).is_ok());
        }
        assert_eq!(default_roles().len(), ALIASES.len());
    }

    #[test]
    fn test_global_admin() {
        let r = specialised("Global Admin");
        for k in kind::ALL {
            for v in verb::ALL {
                assert!(r.allowed(k, "exp1", v, &["anything"]));
            }
        }
    }

    #[test]
    fn test_global_viewer_is_read_only() {
        let r = specialised(GLOBAL_VIEWER);
        assert!(r.allowed(kind::EXPERIMENTS, "exp1", verb::LIST, &[]));
        assert!(r.allowed(kind::VMS_VNC, "exp1", verb::GET, &["vm"]));
        assert!(!r.allowed(kind::EXPERIMENTS_START, "exp1", verb::UPDATE, &[]));
        assert!(!r.allowed(kind::USERS, "", verb::DELETE, &["bob"]));
    }

    #[test]
    fn test_experiment_user_cannot_start_experiments() {
        let r = specialised(EXPERIMENT_USER);
        assert!(r.allowed(kind::VMS_START, "exp1", verb::UPDATE, &["vm"]));
        assert!(!r.allowed(kind::EXPERIMENTS_START, "exp1", verb::UPDATE, &[]));
        assert!(!r.allowed(kind::VMS_COMMIT, "exp1", verb::CREATE, &["vm"]));
    }

    #[test]
    fn test_vm_viewer() {
        let r = specialised(VM_VIEWER);
        assert!(r.allowed(kind::VMS, "exp1", verb::GET, &["vm"]));
        assert!(!r.allowed(kind::EXPERIMENTS, "exp1", verb::GET, &[]));
    }
}
