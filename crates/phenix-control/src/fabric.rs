//! Compute fabric seam
//!
//! The fabric actually launches experiments and drives VMs. The control plane
//! only decides whether an operation may run and who hears about it; every
//! fabric call is a fallible remote call.

use async_trait::async_trait;
use phenix_types::{Capture, ExperimentRecord, Host, Vm};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by the fabric
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FabricError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("fabric unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

pub type FabricResult<T> = std::result::Result<T, FabricError>;

/// Capacity of the progress queue handed to pushed-progress operations
pub const PROGRESS_BUFFER: usize = 64;

/// Sink for completion fractions pushed by a long-running fabric operation
///
/// Values are fractions in `0.0..=1.0`. Reports are dropped when the reader
/// falls behind; only the latest value matters.
#[derive(Debug, Clone)]
pub struct Progress {
    tx: Option<mpsc::Sender<f64>>,
}

impl Progress {
    /// Create a progress sink and the receiver reading it
    pub fn channel() -> (Self, mpsc::Receiver<f64>) {
        let (tx, rx) = mpsc::channel(PROGRESS_BUFFER);
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that discards every report
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, fraction: f64) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(fraction.clamp(0.0, 1.0));
        }
    }
}

/// Operations consumed from the compute fabric
#[async_trait]
pub trait Fabric: Send + Sync {
    /// Launch every bootable VM of an experiment. Returns once all are up.
    async fn launch(&self, experiment: &ExperimentRecord) -> FabricResult<()>;

    /// Fraction of an experiment's VMs launched so far
    async fn launch_progress(&self, experiment: &str, vm_count: usize) -> FabricResult<f64>;

    /// Tear down every VM of an experiment
    async fn teardown(&self, experiment: &str) -> FabricResult<()>;

    /// Runtime view of the VMs of a launched experiment
    async fn vms(&self, experiment: &str) -> FabricResult<Vec<Vm>>;

    async fn start_vm(&self, experiment: &str, vm: &str) -> FabricResult<()>;

    async fn stop_vm(&self, experiment: &str, vm: &str) -> FabricResult<()>;

    /// Destroy a running VM
    async fn kill_vm(&self, experiment: &str, vm: &str) -> FabricResult<()>;

    /// Tear a VM down and boot it again from `spec`
    async fn redeploy_vm(&self, experiment: &str, spec: &Vm, injects: bool) -> FabricResult<()>;

    async fn start_capture(
        &self,
        experiment: &str,
        vm: &str,
        interface: usize,
        filename: &str,
    ) -> FabricResult<()>;

    /// Stop every capture on a VM. Stopping with none running is not an error.
    async fn stop_captures(&self, experiment: &str, vm: &str) -> FabricResult<()>;

    async fn captures(&self, experiment: &str) -> FabricResult<Vec<Capture>>;

    /// Snapshot a VM's memory and disk, pushing completion fractions
    async fn snapshot_vm(
        &self,
        experiment: &str,
        vm: &str,
        filename: &str,
        progress: Progress,
    ) -> FabricResult<()>;

    async fn snapshots(&self, experiment: &str, vm: &str) -> FabricResult<Vec<String>>;

    async fn restore_vm(&self, experiment: &str, vm: &str, snapshot: &str) -> FabricResult<()>;

    /// Commit a VM's disk to a new backing image, returning its path
    async fn commit_vm(
        &self,
        experiment: &str,
        vm: &str,
        filename: &str,
        progress: Progress,
    ) -> FabricResult<String>;

    /// Names of the files an experiment has written, captures included
    async fn files(&self, experiment: &str) -> FabricResult<Vec<String>>;

    /// Contents of one experiment file
    async fn file(&self, experiment: &str, filename: &str) -> FabricResult<Vec<u8>>;

    /// PNG of a running VM's console, scaled so its longer side is `size` pixels
    async fn screenshot(&self, experiment: &str, vm: &str, size: u32) -> FabricResult<Vec<u8>>;

    async fn hosts(&self) -> FabricResult<Vec<Host>>;

    /// VM disk images available to topologies
    async fn disks(&self) -> FabricResult<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_clamps() {
        let (progress, mut rx) = Progress::channel();
        progress.report(1.5);
        progress.report(-0.2);
        progress.report(0.4);

        assert_eq!(rx.recv().await, Some(1.0));
        assert_eq!(rx.recv().await, Some(0.0));
        assert_eq!(rx.recv().await, Some(0.4));
    }

    #[tokio::test]
    async fn test_discard_never_panics() {
        Progress::discard().report(0.5);
    }

    #[tokio::test]
    async fn test_channel_closes_with_senders() {
        let (progress, mut rx) = Progress::channel();
        drop(progress);
        assert_eq!(rx.recv().await, None);
    }
}
