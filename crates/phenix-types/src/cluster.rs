//! Compute cluster representations

use serde::{Deserialize, Serialize};

/// A compute host of the fabric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub name: String,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub load: Vec<f64>,
    #[serde(default)]
    pub mem_used: u64,
    #[serde(default)]
    pub mem_total: u64,
    #[serde(default)]
    pub vms: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub hosts: Vec<Host>,
}
