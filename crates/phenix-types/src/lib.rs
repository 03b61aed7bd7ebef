//! phenix Types - Wire contracts for the experiment control plane
//!
//! phenix orchestrates network-emulation experiments: named topologies whose
//! VMs run on a shared compute fabric. These types are shared by the
//! authorization engine, the control plane and the HTTP daemon.
//!
//! ## Key Concepts
//!
//! - **LockKey / LockStatus**: identity and label of an in-flight mutation
//! - **RequestPolicy**: the authorization shape a subscriber must satisfy to
//!   receive a broadcast
//! - **Resource / Publication**: the envelope pushed to live subscribers
//! - **Experiment / Vm**: the representations returned to operators

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod broadcast;
pub mod cluster;
pub mod experiment;
pub mod lock;
pub mod topology;
pub mod user;
pub mod vm;

pub use broadcast::{Publication, RequestPolicy, Resource};
pub use cluster::{Cluster, Host};
pub use experiment::{
    CreateExperimentRequest, Experiment, ExperimentRecord, ExperimentSchedule, ExperimentStatus,
    Schedule, UpdateExperimentScheduleRequest, Vlan,
};
pub use lock::{LockKey, LockStatus, ParseLockStatusError};
pub use topology::{Scenario, Topology};
pub use user::{CreateUserRequest, UpdateUserRequest, UserSpec};
pub use vm::{
    BackingImageRequest, BackingImageResponse, Capture, SnapshotRequest, StartCaptureRequest,
    UpdateVmRequest, Vm, VmInterface, VmList, VmQuery, VmRedeployRequest,
};
