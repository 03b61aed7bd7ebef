//! Experiment representations

use crate::lock::LockStatus;
use crate::vm::Vm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// What the fabric knows about an experiment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub name: String,
    pub topology: String,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub vlan_min: u32,
    #[serde(default)]
    pub vlan_max: u32,
    /// VLAN alias -> VLAN id
    #[serde(default)]
    pub vlans: BTreeMap<String, u32>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// VM name -> cluster host
    #[serde(default)]
    pub schedule: BTreeMap<String, String>,
    #[serde(default)]
    pub apps: Vec<String>,
    /// VM definitions, copied from the topology at creation
    #[serde(default)]
    pub vms: Vec<Vm>,
}

impl ExperimentRecord {
    pub fn new(name: impl Into<String>, topology: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            topology: topology.into(),
            scenario: None,
            vlan_min: 0,
            vlan_max: 0,
            vlans: BTreeMap::new(),
            running: false,
            start_time: None,
            schedule: BTreeMap::new(),
            apps: Vec::new(),
            vms: Vec::new(),
        }
    }

    /// VM definition by name
    pub fn vm(&self, name: &str) -> Option<&Vm> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    pub fn vm_mut(&mut self, name: &str) -> Option<&mut Vm> {
        self.vms.iter_mut().find(|vm| vm.name == name)
    }
}

/// Status reported for an experiment
///
/// While a lifecycle mutation holds the experiment lock the lock label is
/// reported instead of the settled state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperimentStatus {
    Started,
    Stopped,
    Busy(LockStatus),
}

impl ExperimentStatus {
    /// Settled status derived from the running flag
    pub fn settled(running: bool) -> Self {
        if running {
            ExperimentStatus::Started
        } else {
            ExperimentStatus::Stopped
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Started => "started",
            ExperimentStatus::Stopped => "stopped",
            ExperimentStatus::Busy(status) => status.as_str(),
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ExperimentStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ExperimentStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.as_str() {
            "started" => Ok(ExperimentStatus::Started),
            "stopped" => Ok(ExperimentStatus::Stopped),
            other => other
                .parse::<LockStatus>()
                .map(ExperimentStatus::Busy)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// VLAN alias assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vlan {
    pub vlan: u32,
    pub alias: String,
}

/// Experiment as returned to operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    pub topology: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    pub running: bool,
    pub status: ExperimentStatus,
    pub vlan_min: u32,
    pub vlan_max: u32,
    pub vlans: Vec<Vlan>,
    pub vms: Vec<Vm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<String>,
    pub vlan_count: usize,
    pub vm_count: usize,
}

impl Experiment {
    /// Build the operator view of an experiment.
    ///
    /// When the experiment is running the VLAN range is derived from the
    /// assigned VLAN ids rather than the configured bounds.
    pub fn new(record: &ExperimentRecord, status: ExperimentStatus, vms: Vec<Vm>) -> Self {
        let (vlan_min, vlan_max) = if record.running {
            let min = record.vlans.values().copied().min().unwrap_or(0);
            let max = record.vlans.values().copied().max().unwrap_or(0);
            (min, max)
        } else {
            (record.vlan_min, record.vlan_max)
        };

        let vlans: Vec<Vlan> = record
            .vlans
            .iter()
            .map(|(alias, vlan)| Vlan {
                vlan: *vlan,
                alias: alias.clone(),
            })
            .collect();

        Self {
            name: record.name.clone(),
            topology: record.topology.clone(),
            scenario: record.scenario.clone(),
            start_time: record.start_time,
            running: record.running,
            status,
            vlan_min,
            vlan_max,
            vlan_count: vlans.len(),
            vlans,
            vm_count: vms.len(),
            vms,
            apps: record.apps.clone(),
        }
    }
}

/// Request body for creating an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateExperimentRequest {
    pub name: String,
    pub topology: String,
    #[serde(default)]
    pub scenario: Option<String>,
    #[serde(default)]
    pub vlan_min: u32,
    #[serde(default)]
    pub vlan_max: u32,
}

/// Placement of a single VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub vm: String,
    pub host: String,
    #[serde(default)]
    pub auto_assigned: bool,
}

/// Placement of every scheduled VM of an experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentSchedule {
    pub schedule: Vec<Schedule>,
}

impl From<&ExperimentRecord> for ExperimentSchedule {
    fn from(record: &ExperimentRecord) -> Self {
        let schedule = record
            .schedule
            .iter()
            .map(|(vm, host)| Schedule {
                vm: vm.clone(),
                host: host.clone(),
                auto_assigned: false,
            })
            .collect();

        Self { schedule }
    }
}

/// Request body for (re)scheduling an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateExperimentScheduleRequest {
    pub algorithm: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ExperimentRecord {
        let mut record = ExperimentRecord::new("exp1", "topo");
        record.vlan_min = 100;
        record.vlan_max = 200;
        record.vlans.insert("EXP_1".into(), 101);
        record.vlans.insert("EXP_2".into(), 150);
        record
    }

    #[test]
    fn test_stopped_experiment_uses_configured_range() {
        let exp = Experiment::new(&record(), ExperimentStatus::Stopped, vec![]);
        assert_eq!(exp.vlan_min, 100);
        assert_eq!(exp.vlan_max, 200);
        assert_eq!(exp.vlan_count, 2);
        assert_eq!(exp.vm_count, 0);
    }

    #[test]
    fn test_running_experiment_uses_assigned_range() {
        let mut record = record();
        record.running = true;

        let exp = Experiment::new(&record, ExperimentStatus::Started, vec![]);
        assert_eq!(exp.vlan_min, 101);
        assert_eq!(exp.vlan_max, 150);
    }

    #[test]
    fn test_status_serializes_as_label() {
        let busy = ExperimentStatus::Busy(LockStatus::Starting);
        assert_eq!(serde_json::to_string(&busy).unwrap(), "\"starting\"");

        let parsed: ExperimentStatus = serde_json::from_str("\"stopped\"").unwrap();
        assert_eq!(parsed, ExperimentStatus::Stopped);

        let parsed: ExperimentStatus = serde_json::from_str("\"committing\"").unwrap();
        assert_eq!(parsed, ExperimentStatus::Busy(LockStatus::Committing));
    }

    #[test]
    fn test_schedule_from_record() {
        let mut record = record();
        record.schedule.insert("host-01".into(), "compute1".into());

        let schedule = ExperimentSchedule::from(&record);
        assert_eq!(schedule.schedule.len(), 1);
        assert_eq!(schedule.schedule[0].host, "compute1");
    }
}
