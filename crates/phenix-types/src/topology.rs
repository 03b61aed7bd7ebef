//! Topology and scenario definitions held by the config store

use crate::vm::Vm;
use serde::{Deserialize, Serialize};

/// Named set of VM definitions experiments are created from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    pub name: String,
    #[serde(default)]
    pub vms: Vec<Vm>,
}

/// Named list of apps applied on top of a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    pub topology: String,
    #[serde(default)]
    pub apps: Vec<String>,
}
