//! VM placement algorithms
//!
//! Schedulers fill in `ExperimentRecord::schedule`. VMs the operator has
//! already pinned to a host keep their placement.

use crate::error::{ControlError, Result};
use phenix_types::{ExperimentRecord, Host};
use tracing::debug;

pub const ROUND_ROBIN: &str = "round-robin";
pub const ISOLATE_EXPERIMENT: &str = "isolate-experiment";

/// Names accepted by [`schedule`]
pub const ALGORITHMS: &[&str] = &[ROUND_ROBIN, ISOLATE_EXPERIMENT];

/// Place every unpinned VM of `experiment` on one of `hosts`
pub fn schedule(algorithm: &str, experiment: &mut ExperimentRecord, hosts: &[Host]) -> Result<()> {
    if hosts.is_empty() {
        return Err(ControlError::InvalidRequest(
            "no cluster hosts available for scheduling".to_string(),
        ));
    }

    let unpinned: Vec<String> = experiment
        .vms
        .iter()
        .filter(|vm| !experiment.schedule.contains_key(&vm.name))
        .map(|vm| vm.name.clone())
        .collect();

    match algorithm {
        ROUND_ROBIN => round_robin(experiment, &unpinned, hosts),
        ISOLATE_EXPERIMENT => isolate(experiment, &unpinned, hosts),
        other => {
            return Err(ControlError::InvalidRequest(format!(
                "unknown scheduling algorithm {}",
                other
            )))
        }
    }

    debug!(
        experiment = %experiment.name,
        algorithm,
        placed = unpinned.len(),
        "Experiment scheduled"
    );

    Ok(())
}

// Least loaded hosts first so consecutive experiments spread out
fn by_load(hosts: &[Host]) -> Vec<&Host> {
    let mut sorted: Vec<&Host> = hosts.iter().collect();
    sorted.sort_by(|a, b| a.vms.cmp(&b.vms).then_with(|| a.name.cmp(&b.name)));
    sorted
}

fn round_robin(experiment: &mut ExperimentRecord, vms: &[String], hosts: &[Host]) {
    let hosts = by_load(hosts);
    for (i, vm) in vms.iter().enumerate() {
        let host = &hosts[i % hosts.len()];
        experiment.schedule.insert(vm.clone(), host.name.clone());
    }
}

fn isolate(experiment: &mut ExperimentRecord, vms: &[String], hosts: &[Host]) {
    let hosts = by_load(hosts);
    let host = &hosts[0].name;
    for vm in vms {
        experiment.schedule.insert(vm.clone(), host.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phenix_types::Vm;

    fn host(name: &str, vms: u32) -> Host {
        Host {
            name: name.into(),
            cpus: 8,
            load: vec![],
            mem_used: 0,
            mem_total: 0,
            vms,
        }
    }

    fn record(vms: &[&str]) -> ExperimentRecord {
        let mut record = ExperimentRecord::new("exp1", "lab");
        record.vms = vms.iter().map(|name| Vm::new(*name)).collect();
        record
    }

    #[test]
    fn test_round_robin_spreads() {
        let mut exp = record(&["a", "b", "c"]);
        schedule(ROUND_ROBIN, &mut exp, &[host("c1", 0), host("c2", 0)]).unwrap();

        assert_eq!(exp.schedule["a"], "c1");
        assert_eq!(exp.schedule["b"], "c2");
        assert_eq!(exp.schedule["c"], "c1");
    }

    #[test]
    fn test_isolate_uses_least_loaded_host() {
        let mut exp = record(&["a", "b"]);
        schedule(ISOLATE_EXPERIMENT, &mut exp, &[host("c1", 5), host("c2", 1)]).unwrap();

        assert!(exp.schedule.values().all(|h| h == "c2"));
    }

    #[test]
    fn test_pinned_vms_kept() {
        let mut exp = record(&["a", "b"]);
        exp.schedule.insert("a".into(), "c9".into());
        schedule(ISOLATE_EXPERIMENT, &mut exp, &[host("c1", 0)]).unwrap();

        assert_eq!(exp.schedule["a"], "c9");
        assert_eq!(exp.schedule["b"], "c1");
    }

    #[test]
    fn test_unknown_algorithm_and_no_hosts() {
        let mut exp = record(&["a"]);
        assert!(matches!(
            schedule("random", &mut exp, &[host("c1", 0)]),
            Err(ControlError::InvalidRequest(_))
        ));
        assert!(matches!(
            schedule(ROUND_ROBIN, &mut exp, &[]),
            Err(ControlError::InvalidRequest(_))
        ));
        assert!(exp.schedule.is_empty());
    }
}
