//! # phenix RBAC
//!
//! Authorization engine for the experiment control plane.
//!
//! ## Overview
//!
//! Every request is reduced to a single question: is `verb` on `resource`,
//! scoped to an experiment and optionally naming resource instances,
//! allowed for the caller's [`Role`]?
//!
//! - A [`Role`] is an ordered list of policies. Access is granted if **any**
//!   policy grants it.
//! - Within a policy the scope, the verb and (when names are requested) one of
//!   the names must all be allowed.
//! - Scope and name patterns are globs. A `!` prefix negates, and a matching
//!   negation denies regardless of where it sits in the list.
//! - An empty scope is an unscoped request and always passes the scope check.
//! - A role with any invalid pattern denies everything.
//!
//! ## Example
//!
//! ```rust
//! use phenix_rbac::{PolicySpec, Role, RoleSpec};
//!
//! let mut spec = RoleSpec::new(
//!     "operator",
//!     vec![PolicySpec::new(
//!         ["experiments"],
//!         Vec::<String>::new(),
//!         ["list", "get"],
//!         Vec::<String>::new(),
//!     )],
//! );
//! spec.set_scopes(&["*".to_string(), "!prod-*".to_string()]).unwrap();
//!
//! let role = Role::new(spec);
//! assert!(role.allowed("experiments", "exp-dev", "get", &[]));
//! assert!(!role.allowed("experiments", "prod-test", "get", &[]));
//! ```

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod builtin;
pub mod error;
pub mod pattern;
pub mod policy;
pub mod role;
pub mod vocabulary;

pub use builtin::{default_role, default_roles, resolve_role_name};
pub use error::{RbacError, Result};
pub use pattern::Pattern;
pub use policy::{Policy, PolicySpec};
pub use role::{Role, RoleSpec};
pub use vocabulary::{kind, verb};
