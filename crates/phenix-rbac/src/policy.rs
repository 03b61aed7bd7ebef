//! Access policies
//!
//! A [`PolicySpec`] is the declarative, serializable form of a policy as it is
//! stored with a role. A [`Policy`] is its compiled form, used during
//! authorization.

use crate::error::{RbacError, Result};
use crate::pattern::{list_allows, Pattern};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Declarative access policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Glob patterns naming resource kinds (`vms`, `experiments/*`)
    #[serde(default)]
    pub resources: Vec<String>,

    /// Glob patterns over experiment names, `!` negates
    #[serde(default, alias = "experiments")]
    pub scopes: Vec<String>,

    /// Glob patterns over resource instance names, `!` negates
    #[serde(default, alias = "names")]
    pub resource_names: Vec<String>,

    /// Verbs, `*` matches any
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl PolicySpec {
    pub fn new<R, S, V, N>(resources: R, scopes: S, verbs: V, names: N) -> Self
    where
        R: IntoIterator,
        R::Item: Into<String>,
        S: IntoIterator,
        S::Item: Into<String>,
        V: IntoIterator,
        V::Item: Into<String>,
        N: IntoIterator,
        N::Item: Into<String>,
    {
        Self {
            resources: resources.into_iter().map(Into::into).collect(),
            scopes: scopes.into_iter().map(Into::into).collect(),
            resource_names: names.into_iter().map(Into::into).collect(),
            verbs: verbs.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether some resource pattern of this policy starts with `kind`
    pub(crate) fn declares_kind_prefix(&self, kind: &str) -> bool {
        self.resources.iter().any(|r| r.starts_with(kind))
    }

    /// Populate the scope patterns of an unconfigured policy.
    ///
    /// No patterns, or a single empty one, means `*`. Invalid patterns are skipped with a warning.
    pub fn set_scopes(&mut self, patterns: &[String]) -> Result<()> {
        if !self.scopes.is_empty() {
            return Err(RbacError::AlreadyConfigured { field: "experiments" });
        }

        self.scopes = valid_patterns(&or_wildcard(patterns), "scope");
        Ok(())
    }

    /// Populate the name patterns of an unconfigured policy.
    ///
    /// A `kind/pattern` entry applies only if this policy declares a resource
    /// starting with `kind`; other entries are skipped silently. Invalid
    /// patterns are skipped with a warning.
    pub fn set_resource_names(&mut self, patterns: &[String]) -> Result<()> {
        if !self.resource_names.is_empty() {
            return Err(RbacError::AlreadyConfigured {
                field: "resource names",
            });
        }

        let patterns = or_wildcard(patterns);
        let mut scoped = Vec::with_capacity(patterns.len());

        for raw in &patterns {
            let (negate, body) = match raw.strip_prefix('!') {
                Some(rest) => ("!", rest),
                None => ("", raw.as_str()),
            };

            match body.split_once('/') {
                Some((kind, name)) => {
                    if self.declares_kind_prefix(kind) {
                        scoped.push(format!("{}{}", negate, name));
                    }
                }
                None => scoped.push(raw.clone()),
            }
        }

        self.resource_names = valid_patterns(&scoped, "resource name");
        Ok(())
    }
}

/// Empty input, or a lone empty string, stands for "everything"
fn or_wildcard(patterns: &[String]) -> Vec<String> {
    match patterns {
        [] => vec!["*".to_string()],
        [only] if only.is_empty() => vec!["*".to_string()],
        _ => patterns.to_vec(),
    }
}

fn valid_patterns(patterns: &[String], what: &str) -> Vec<String> {
    patterns
        .iter()
        .filter(|p| {
            let valid = Pattern::is_valid(p);
            if !valid {
                warn!(pattern = %p, kind = what, "Skipping invalid pattern");
            }
            valid
        })
        .cloned()
        .collect()
}

/// Compiled access policy
#[derive(Debug, Clone)]
pub struct Policy {
    scopes: Vec<Pattern>,
    names: Vec<Pattern>,
    verbs: Vec<String>,
}

impl Policy {
    /// Compile a policy spec.
    ///
    /// On failure returns every pattern that could not be compiled.
    pub fn compile(spec: &PolicySpec) -> std::result::Result<Self, Vec<String>> {
        let mut invalid = Vec::new();

        let scopes = compile_list(&spec.scopes, &mut invalid);
        let names = compile_list(&spec.resource_names, &mut invalid);

        if !invalid.is_empty() {
            return Err(invalid);
        }

        Ok(Self {
            scopes,
            names,
            verbs: spec.verbs.clone(),
        })
    }

    /// Scope check. An empty scope names an unscoped resource and is always
    /// allowed.
    pub fn scope_allowed(&self, scope: &str) -> bool {
        if scope.is_empty() {
            return true;
        }

        list_allows(&self.scopes, scope)
    }

    /// Name check, same negation rules as the scope check
    pub fn name_allowed(&self, name: &str) -> bool {
        list_allows(&self.names, name)
    }

    /// Verb check, exact match or `*`
    pub fn verb_allowed(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == "*" || v == verb)
    }

    /// Full evaluation of this policy for one request
    pub fn grants(&self, scope: &str, verb: &str, names: &[&str]) -> bool {
        if !self.scope_allowed(scope) || !self.verb_allowed(verb) {
            return false;
        }

        names.is_empty() || names.iter().any(|n| self.name_allowed(n))
    }
}

fn compile_list(raw: &[String], invalid: &mut Vec<String>) -> Vec<Pattern> {
    raw.iter()
        .filter_map(|p| match Pattern::parse(p) {
            Ok(pattern) => Some(pattern),
            Err(_) => {
                invalid.push(p.clone());
                None
            }
        })
        .collect()
}
