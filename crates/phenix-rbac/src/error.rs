//! Error types for role configuration

use thiserror::Error;

/// Role and policy configuration errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RbacError {
    /// One or more patterns of a role could not be compiled
    #[error("invalid pattern(s): {}", patterns.join(", "))]
    PolicyConfigInvalid { patterns: Vec<String> },

    /// A single pattern could not be compiled
    #[error("invalid pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// The target pattern list of a policy is already populated
    #[error("{field} already exist for policy")]
    AlreadyConfigured { field: &'static str },

    /// No role with the given name exists
    #[error("role not found: {0}")]
    RoleNotFound(String),
}

/// Result type for role configuration
pub type Result<T> = std::result::Result<T, RbacError>;
