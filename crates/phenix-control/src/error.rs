//! Error types for the control plane

use crate::fabric::FabricError;
use phenix_rbac::RbacError;
use phenix_types::{LockKey, LockStatus};
use thiserror::Error;

/// Control plane error type
#[derive(Debug, Error)]
pub enum ControlError {
    /// The caller's role does not allow the request
    #[error("forbidden: {verb} on {resource}")]
    Forbidden {
        resource: String,
        scope: String,
        verb: String,
    },

    /// The caller's role has invalid patterns and denies everything
    #[error("role configuration invalid: {0}")]
    PolicyConfigInvalid(String),

    /// Another lifecycle operation holds the resource
    #[error("{key} is locked with status {status}")]
    Locked { key: LockKey, status: LockStatus },

    /// The fabric reported an error mid-lifecycle
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// The operation did not complete within the configured timeout
    #[error("{operation} timed out after {after_secs}s")]
    TimedOut { operation: String, after_secs: u64 },

    /// Referenced resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Request is malformed or not valid in the current state
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, ControlError>;

impl ControlError {
    pub fn forbidden(resource: &str, scope: &str, verb: &str) -> Self {
        Self::Forbidden {
            resource: resource.to_string(),
            scope: scope.to_string(),
            verb: verb.to_string(),
        }
    }

    pub fn experiment_not_found(name: &str) -> Self {
        Self::NotFound(format!("experiment {}", name))
    }

    pub fn vm_not_found(exp: &str, name: &str) -> Self {
        Self::NotFound(format!("VM {} in experiment {}", name, exp))
    }

    pub fn user_not_found(username: &str) -> Self {
        Self::NotFound(format!("user {}", username))
    }
}

impl From<FabricError> for ControlError {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::NotFound(what) => Self::NotFound(what),
            other => Self::OperationFailed(other.to_string()),
        }
    }
}

impl From<RbacError> for ControlError {
    fn from(err: RbacError) -> Self {
        match err {
            RbacError::RoleNotFound(name) => Self::NotFound(format!("role {}", name)),
            RbacError::PolicyConfigInvalid { .. } => Self::PolicyConfigInvalid(err.to_string()),
            other => Self::InvalidRequest(other.to_string()),
        }
    }
}
