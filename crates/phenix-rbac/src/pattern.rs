//! Glob patterns with an optional negation prefix
//!
//! `*` matches any sequence of characters (including `/`), `?` a single
//! character, `[...]` a character class and `{a,b}` an alternation. A leading
//! `!` marks the pattern as a negation.

use crate::error::{RbacError, Result};
use globset::{GlobBuilder, GlobMatcher};
use std::fmt;

/// Compiled glob pattern
#[derive(Clone)]
pub struct Pattern {
    raw: String,
    negated: bool,
    matcher: GlobMatcher,
}

impl Pattern {
    /// Compile a pattern, treating a leading `!` as negation.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.strip_prefix('!') {
            Some(body) => Self::compile(raw, body, true),
            None => Self::compile(raw, raw, false),
        }
    }

    /// Compile a pattern with no negation support (resource kinds).
    pub fn glob(raw: &str) -> Result<Self> {
        Self::compile(raw, raw, false)
    }

    fn compile(raw: &str, body: &str, negated: bool) -> Result<Self> {
        let glob = GlobBuilder::new(body)
            .literal_separator(false)
            .backslash_escape(true)
            .build()
            .map_err(|e| RbacError::InvalidPattern {
                pattern: raw.to_string(),
                reason: e.kind().to_string(),
            })?;

        Ok(Self {
            raw: raw.to_string(),
            negated,
            matcher: glob.compile_matcher(),
        })
    }

    /// Whether the pattern body (without the `!`) matches `candidate`
    pub fn matches(&self, candidate: &str) -> bool {
        self.matcher.is_match(candidate)
    }

    pub fn is_negated(&self) -> bool {
        self.negated
    }

    /// Pattern as written, including any `!` prefix
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether `raw` would compile, without keeping the result
    pub fn is_valid(raw: &str) -> bool {
        Self::parse(raw).is_ok()
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("raw", &self.raw)
            .field("negated", &self.negated)
            .finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Pattern {}

/// Evaluate a pattern list against a candidate.
///
/// Any matching negation rejects the candidate outright, wherever it sits in
/// the list. Otherwise the candidate is allowed if some positive pattern
/// matches. An empty list allows nothing.
pub fn list_allows(patterns: &[Pattern], candidate: &str) -> bool {
    let mut allowed = false;

    for pattern in patterns {
        if pattern.matches(candidate) {
            if pattern.is_negated() {
                return false;
            }

            allowed = true;
        }
    }

    allowed
}
