//! VM representations and request bodies

use serde::{Deserialize, Serialize};

/// A VM belonging to an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vm {
    pub name: String,
    /// Owning experiment, filled in for listings that span experiments
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub experiment: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub ipv4: Vec<String>,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub ram: u32,
    #[serde(default)]
    pub disk: String,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub running: bool,
    #[serde(default, rename = "dnb")]
    pub do_not_boot: bool,
    #[serde(default)]
    pub redeploying: bool,
    /// Seconds since boot
    #[serde(default)]
    pub uptime: f64,
}

impl Vm {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            experiment: String::new(),
            host: String::new(),
            ipv4: Vec::new(),
            cpus: 1,
            ram: 512,
            disk: String::new(),
            networks: Vec::new(),
            running: false,
            do_not_boot: false,
            redeploying: false,
            uptime: 0.0,
        }
    }
}

/// Paged VM listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmList {
    pub vms: Vec<Vm>,
    pub total: usize,
}

impl From<Vec<Vm>> for VmList {
    fn from(vms: Vec<Vm>) -> Self {
        let total = vms.len();
        Self { vms, total }
    }
}

/// Filtering, sorting and paging of a VM listing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmQuery {
    /// Include VMs flagged do-not-boot
    #[serde(default)]
    pub show_dnb: bool,
    /// One of `name`, `host`, `ipv4`, `cpus`, `ram`, `disk`, `uptime`
    #[serde(default)]
    pub sort_column: Option<String>,
    #[serde(default)]
    pub sort_desc: bool,
    /// 1-based page number; no paging when absent
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub size: Option<usize>,
}

impl VmQuery {
    /// Apply the query. `total` counts matching VMs before paging.
    pub fn apply(&self, vms: Vec<Vm>) -> VmList {
        let mut vms: Vec<Vm> = vms
            .into_iter()
            .filter(|vm| self.show_dnb || !vm.do_not_boot)
            .collect();

        if let Some(column) = self.sort_column.as_deref() {
            vms.sort_by(|a, b| {
                let ordering = match column {
                    "host" => a.host.cmp(&b.host),
                    "ipv4" => a.ipv4.first().cmp(&b.ipv4.first()),
                    "cpus" => a.cpus.cmp(&b.cpus),
                    "ram" => a.ram.cmp(&b.ram),
                    "disk" => a.disk.cmp(&b.disk),
                    "uptime" => a.uptime.total_cmp(&b.uptime),
                    _ => a.name.cmp(&b.name),
                };
                if self.sort_desc {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        let total = vms.len();
        let vms = match (self.page, self.size) {
            (Some(page), Some(size)) if page > 0 && size > 0 => vms
                .into_iter()
                .skip((page - 1) * size)
                .take(size)
                .collect(),
            _ => vms,
        };

        VmList { vms, total }
    }
}

/// Interface reassignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInterface {
    pub index: usize,
    pub vlan: String,
}

/// Partial VM update
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateVmRequest {
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub ram: Option<u32>,
    #[serde(default)]
    pub disk: Option<String>,
    #[serde(default, rename = "dnb")]
    pub do_not_boot: Option<bool>,
    #[serde(default)]
    pub interface: Option<VmInterface>,
    #[serde(default)]
    pub host: Option<String>,
}

/// Redeploy parameters; missing fields keep the VM's current values
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmRedeployRequest {
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub ram: Option<u32>,
    #[serde(default)]
    pub disk: Option<String>,
    #[serde(default)]
    pub injects: bool,
}

/// Packet capture on a VM interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    pub vm: String,
    pub interface: usize,
    pub filepath: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartCaptureRequest {
    pub interface: usize,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub filename: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackingImageRequest {
    #[serde(default)]
    pub filename: String,
}

/// Result of committing a VM's disk to a new backing image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackingImageResponse {
    pub disk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vm: Option<Vm>,
}
