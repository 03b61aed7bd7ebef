//! Lock identities and in-progress status labels
//!
//! A lock key names the resource a lifecycle operation is mutating: either a
//! whole experiment (`exp`) or a single VM inside it (`exp/vm`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Composite identity of a guarded resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockKey(String);

impl LockKey {
    /// Key guarding an entire experiment
    pub fn experiment(exp: impl Into<String>) -> Self {
        Self(exp.into())
    }

    /// Key guarding a single VM of an experiment
    pub fn vm(exp: &str, vm: &str) -> Self {
        Self(format!("{}/{}", exp, vm))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key guards a VM rather than a whole experiment
    pub fn is_vm(&self) -> bool {
        self.0.contains('/')
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Label recorded while a mutation holds a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockStatus {
    Creating,
    Deleting,
    Starting,
    Stopping,
    Redeploying,
    Snapshotting,
    Restoring,
    Committing,
    Updating,
    Scheduling,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockStatus::Creating => "creating",
            LockStatus::Deleting => "deleting",
            LockStatus::Starting => "starting",
            LockStatus::Stopping => "stopping",
            LockStatus::Redeploying => "redeploying",
            LockStatus::Snapshotting => "snapshotting",
            LockStatus::Restoring => "restoring",
            LockStatus::Committing => "committing",
            LockStatus::Updating => "updating",
            LockStatus::Scheduling => "scheduling",
        }
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string is not a known lock status
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lock status: {0}")]
pub struct ParseLockStatusError(pub String);

impl FromStr for LockStatus {
    type Err = ParseLockStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(LockStatus::Creating),
            "deleting" => Ok(LockStatus::Deleting),
            "starting" => Ok(LockStatus::Starting),
            "stopping" => Ok(LockStatus::Stopping),
            "redeploying" => Ok(LockStatus::Redeploying),
            "snapshotting" => Ok(LockStatus::Snapshotting),
            "restoring" => Ok(LockStatus::Restoring),
            "committing" => Ok(LockStatus::Committing),
            "updating" => Ok(LockStatus::Updating),
            "scheduling" => Ok(LockStatus::Scheduling),
            other => Err(ParseLockStatusError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_and_vm_keys_differ() {
        let exp = LockKey::experiment("exp1");
        let vm = LockKey::vm("exp1", "host-01");

        assert_eq!(exp.as_str(), "exp1");
        assert_eq!(vm.as_str(), "exp1/host-01");
        assert_ne!(exp, vm);
        assert!(!exp.is_vm());
        assert!(vm.is_vm());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("redeploying".parse::<LockStatus>(), Ok(LockStatus::Redeploying));
        assert!("paused".parse::<LockStatus>().is_err());
        assert_eq!(LockStatus::Committing.to_string(), "committing");
        assert_eq!("scheduling".parse::<LockStatus>(), Ok(LockStatus::Scheduling));
        assert_eq!(LockStatus::Updating.to_string(), "updating");
    }

    #[test]
    fn test_status_serde() {
        let json = serde_json::to_string(&LockStatus::Snapshotting).unwrap();
        assert_eq!(json, "\"snapshotting\"");
    }
}
