//! Control plane facade
//!
//! [`ControlPlane`] is the entry point the daemon calls for every request.
//! Reads are authorized once for the listing and then filtered element by
//! element. Mutations that change lifecycle state go through the
//! [`LifecycleCoordinator`]; the remaining mutations authorize, act and
//! broadcast directly.

use crate::broker::{EventBroker, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
use crate::context::RequestContext;
use crate::error::{ControlError, Result};
use crate::fabric::{Fabric, FabricError};
use crate::lifecycle::{LifecycleConfig, LifecycleCoordinator, Operation};
use crate::lock::{LockGuard, LockTable};
use crate::scheduler;
use crate::store::{specialise_role, ConfigStore, UserRecord};
use phenix_rbac::{kind, resolve_role_name, verb, RbacError, Role, RoleSpec};
use phenix_types::{
    BackingImageRequest, BackingImageResponse, Capture, Cluster, CreateExperimentRequest,
    CreateUserRequest, Experiment, ExperimentRecord, ExperimentSchedule, ExperimentStatus,
    LockKey, LockStatus, RequestPolicy, Resource, Scenario, SnapshotRequest, StartCaptureRequest,
    UpdateUserRequest, UpdateVmRequest, UserSpec, Vm, VmList, VmQuery, VmRedeployRequest,
};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// First VLAN id handed out when an experiment has no configured minimum
pub const DEFAULT_VLAN_BASE: u32 = 100;

const DEFAULT_DISK_EXTENSION: &str = "qc2";

/// Control plane tuning
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    pub lifecycle: LifecycleConfig,
    /// Per-subscriber broadcast queue capacity
    pub subscriber_buffer: usize,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleConfig::default(),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

/// Unified entry point for experiment, VM, cluster and user operations
#[derive(Clone)]
pub struct ControlPlane {
    store: Arc<dyn ConfigStore>,
    fabric: Arc<dyn Fabric>,
    lifecycle: LifecycleCoordinator,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        fabric: Arc<dyn Fabric>,
        config: ControlPlaneConfig,
    ) -> Self {
        let lifecycle = LifecycleCoordinator::new(
            Arc::new(LockTable::new()),
            EventBroker::with_buffer(config.subscriber_buffer),
            config.lifecycle,
        );

        Self {
            store,
            fabric,
            lifecycle,
        }
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        self.lifecycle.locks()
    }

    pub fn broker(&self) -> &EventBroker {
        self.lifecycle.broker()
    }

    pub fn store(&self) -> &Arc<dyn ConfigStore> {
        &self.store
    }

    // ========== Sessions ==========

    /// Resolve a bearer token to a request context
    pub async fn authenticate(&self, token: &str) -> Result<Option<RequestContext>> {
        let user = self.store.user_by_token(token).await?;
        Ok(user.map(|user| RequestContext::new(user.username, Role::new(user.role))))
    }

    /// Register a live subscriber for the caller's role
    pub fn subscribe(&self, ctx: &RequestContext) -> Subscription {
        self.broker().subscribe(ctx.user.clone(), ctx.role.clone())
    }

    // ========== Experiments ==========

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_experiments(&self, ctx: &RequestContext) -> Result<Vec<Experiment>> {
        ctx.authorize(kind::EXPERIMENTS, "", verb::LIST, &[])?;

        let mut experiments = Vec::new();
        for record in self.store.experiments().await? {
            if !ctx.can(kind::EXPERIMENTS, &record.name, verb::LIST, &[]) {
                continue;
            }

            let vms = self.visible_vms(ctx, &record).await?;
            experiments.push(Experiment::new(&record, self.experiment_status(&record), vms));
        }

        Ok(experiments)
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn get_experiment(
        &self,
        ctx: &RequestContext,
        name: &str,
        show_dnb: bool,
    ) -> Result<Experiment> {
        ctx.authorize(kind::EXPERIMENTS, name, verb::GET, &[])?;

        let record = load_experiment(self.store.as_ref(), name).await?;
        let vms = self
            .visible_vms(ctx, &record)
            .await?
            .into_iter()
            .filter(|vm| show_dnb || !vm.do_not_boot)
            .collect();

        Ok(Experiment::new(&record, self.experiment_status(&record), vms))
    }

    #[instrument(skip(self, ctx, request), fields(user = %ctx.user, experiment = %request.name))]
    pub async fn create_experiment(
        &self,
        ctx: &RequestContext,
        request: CreateExperimentRequest,
    ) -> Result<Experiment> {
        if request.name.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "experiment name is required".to_string(),
            ));
        }
        if request.vlan_max > 0 && request.vlan_min > request.vlan_max {
            return Err(ControlError::InvalidRequest(format!(
                "VLAN range {}-{} is empty",
                request.vlan_min, request.vlan_max
            )));
        }

        let op = Operation::experiment(
            &request.name,
            LockStatus::Creating,
            kind::EXPERIMENTS,
            verb::CREATE,
        )
        .requiring(RequestPolicy::new(kind::EXPERIMENTS, "", verb::CREATE));

        let store = Arc::clone(&self.store);

        self.lifecycle
            .run(ctx, op, move || async move {
                if store.experiment(&request.name).await?.is_some() {
                    return Err(ControlError::InvalidRequest(format!(
                        "experiment {} already exists",
                        request.name
                    )));
                }

                let topology = store
                    .topology(&request.topology)
                    .await?
                    .ok_or_else(|| ControlError::NotFound(format!("topology {}", request.topology)))?;

                let mut record = ExperimentRecord::new(&request.name, &topology.name);
                record.vlan_min = request.vlan_min;
                record.vlan_max = request.vlan_max;
                record.vms = topology.vms;

                if let Some(name) = request.scenario.filter(|s| !s.is_empty()) {
                    let scenario = store
                        .scenarios()
                        .await?
                        .into_iter()
                        .find(|s| s.name == name)
                        .ok_or_else(|| ControlError::NotFound(format!("scenario {}", name)))?;

                    if scenario.topology != record.topology {
                        return Err(ControlError::InvalidRequest(format!(
                            "scenario {} is not for topology {}",
                            scenario.name, record.topology
                        )));
                    }

                    record.apps = scenario.apps;
                    record.scenario = Some(scenario.name);
                }

                store.save_experiment(record.clone()).await?;

                info!(experiment = %record.name, topology = %record.topology, "Experiment created");
                Ok(Experiment::new(
                    &record,
                    ExperimentStatus::Stopped,
                    record.vms.clone(),
                ))
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn delete_experiment(&self, ctx: &RequestContext, name: &str) -> Result<()> {
        let op = Operation::experiment(name, LockStatus::Deleting, kind::EXPERIMENTS, verb::DELETE);
        let store = Arc::clone(&self.store);
        let name = name.to_string();

        self.lifecycle
            .run(ctx, op, move || async move {
                let record = load_experiment(store.as_ref(), &name).await?;
                if record.running {
                    return Err(ControlError::InvalidRequest(format!(
                        "cannot delete running experiment {}",
                        name
                    )));
                }

                store.delete_experiment(&name).await?;
                info!(experiment = %name, "Experiment deleted");
                Ok(())
            })
            .await
    }

    /// Launch an experiment, reporting the fraction of VMs launched while
    /// the fabric works
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn start_experiment(&self, ctx: &RequestContext, name: &str) -> Result<Experiment> {
        let op = Operation::experiment(
            name,
            LockStatus::Starting,
            kind::EXPERIMENTS_START,
            verb::UPDATE,
        )
        .pending("starting", None);

        // Set once the work has loaded the experiment
        let vm_count = Arc::new(AtomicUsize::new(0));

        let poll = {
            let fabric = Arc::clone(&self.fabric);
            let name = name.to_string();
            let vm_count = Arc::clone(&vm_count);
            move || {
                let fabric = Arc::clone(&fabric);
                let name = name.clone();
                let count = vm_count.load(Ordering::Acquire);
                async move {
                    if count == 0 {
                        return Ok(0.0);
                    }
                    fabric.launch_progress(&name, count).await
                }
            }
        };

        let store = Arc::clone(&self.store);
        let fabric = Arc::clone(&self.fabric);
        let locks = Arc::clone(self.locks());
        let name = name.to_string();

        let work = move || async move {
            let mut record = load_experiment(store.as_ref(), &name).await?;
            if record.running {
                return Err(ControlError::InvalidRequest(format!(
                    "experiment {} is already running",
                    name
                )));
            }

            assign_vlans(&mut record)?;
            vm_count.store(record.vms.len(), Ordering::Release);

            fabric.launch(&record).await?;

            record.running = true;
            record.start_time = Some(chrono::Utc::now());
            store.save_experiment(record.clone()).await?;

            let vms = vm_views(fabric.as_ref(), &locks, &record).await?;
            info!(experiment = %name, vms = vms.len(), "Experiment started");
            Ok(Experiment::new(&record, ExperimentStatus::Started, vms))
        };

        self.lifecycle.run_polled(ctx, op, work, poll).await
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn stop_experiment(&self, ctx: &RequestContext, name: &str) -> Result<Experiment> {
        let op = Operation::experiment(
            name,
            LockStatus::Stopping,
            kind::EXPERIMENTS_STOP,
            verb::UPDATE,
        )
        .pending("stopping", None);

        let store = Arc::clone(&self.store);
        let fabric = Arc::clone(&self.fabric);
        let name = name.to_string();

        self.lifecycle
            .run(ctx, op, move || async move {
                let mut record = load_running(store.as_ref(), &name).await?;

                fabric.teardown(&name).await?;

                record.running = false;
                record.start_time = None;
                record.vlans.clear();
                store.save_experiment(record.clone()).await?;

                info!(experiment = %name, "Experiment stopped");
                Ok(Experiment::new(
                    &record,
                    ExperimentStatus::Stopped,
                    record.vms.clone(),
                ))
            })
            .await
    }

    /// Current VM placement. Refused while a mutation holds the experiment.
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn get_schedule(&self, ctx: &RequestContext, name: &str) -> Result<ExperimentSchedule> {
        ctx.authorize(kind::EXPERIMENTS_SCHEDULE, name, verb::GET, &[])?;
        self.ensure_unlocked(&LockKey::experiment(name))?;

        let record = load_experiment(self.store.as_ref(), name).await?;
        Ok(ExperimentSchedule::from(&record))
    }

    /// Place the experiment's unpinned VMs with `algorithm`
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn schedule_experiment(
        &self,
        ctx: &RequestContext,
        name: &str,
        algorithm: &str,
    ) -> Result<ExperimentSchedule> {
        ctx.authorize(kind::EXPERIMENTS_SCHEDULE, name, verb::CREATE, &[])?;
        let _guard = self
            .locks()
            .acquire(LockKey::experiment(name), LockStatus::Scheduling)?;

        let mut record = load_experiment(self.store.as_ref(), name).await?;
        if record.running {
            return Err(ControlError::InvalidRequest(format!(
                "cannot schedule running experiment {}",
                name
            )));
        }

        let hosts = self.fabric.hosts().await?;
        scheduler::schedule(algorithm, &mut record, &hosts)?;
        self.store.save_experiment(record.clone()).await?;

        let schedule = ExperimentSchedule::from(&record);
        self.announce(
            &RequestPolicy::new(kind::EXPERIMENTS, name, verb::GET),
            Resource::new("experiment", name, "schedule"),
            Some(&schedule),
        );

        Ok(schedule)
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_captures(&self, ctx: &RequestContext, name: &str) -> Result<Vec<Capture>> {
        ctx.authorize(kind::EXPERIMENTS_CAPTURES, name, verb::LIST, &[])?;

        let record = load_experiment(self.store.as_ref(), name).await?;
        if !record.running {
            return Ok(Vec::new());
        }

        let captures = self.fabric.captures(name).await?;
        Ok(captures
            .into_iter()
            .filter(|c| ctx.can(kind::EXPERIMENTS_CAPTURES, name, verb::LIST, &[&c.vm]))
            .collect())
    }

    /// Files the experiment has written, captures included
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_files(&self, ctx: &RequestContext, name: &str) -> Result<Vec<String>> {
        ctx.authorize(kind::EXPERIMENTS_FILES, name, verb::LIST, &[])?;

        load_experiment(self.store.as_ref(), name).await?;
        Ok(self.fabric.files(name).await?)
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn get_file(&self, ctx: &RequestContext, name: &str, filename: &str) -> Result<Vec<u8>> {
        ctx.authorize(kind::EXPERIMENTS_FILES, name, verb::GET, &[])?;

        if filename.is_empty() || filename.contains('/') || filename == ".." {
            return Err(ControlError::InvalidRequest(format!(
                "invalid file name {:?}",
                filename
            )));
        }

        load_experiment(self.store.as_ref(), name).await?;
        Ok(self.fabric.file(name, filename).await?)
    }

    // ========== VMs ==========

    #[instrument(skip(self, ctx, query), fields(user = %ctx.user))]
    pub async fn list_vms(&self, ctx: &RequestContext, exp: &str, query: &VmQuery) -> Result<VmList> {
        ctx.authorize(kind::VMS, exp, verb::LIST, &[])?;

        let record = load_experiment(self.store.as_ref(), exp).await?;
        let vms = self.visible_vms(ctx, &record).await?;
        Ok(query.apply(vms))
    }

    /// Every visible VM of every running experiment
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_all_vms(&self, ctx: &RequestContext) -> Result<VmList> {
        ctx.authorize(kind::VMS, "", verb::LIST, &[])?;

        let mut vms = Vec::new();
        for record in self.store.experiments().await? {
            if !record.running {
                continue;
            }
            for mut vm in self.visible_vms(ctx, &record).await? {
                vm.experiment = record.name.clone();
                vms.push(vm);
            }
        }

        Ok(VmList::from(vms))
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn get_vm(&self, ctx: &RequestContext, exp: &str, name: &str) -> Result<Vm> {
        ctx.authorize(kind::VMS, exp, verb::GET, &[name])?;

        let record = load_experiment(self.store.as_ref(), exp).await?;
        vm_view(self.fabric.as_ref(), self.locks(), &record, name).await
    }

    /// Change a VM definition of a stopped experiment
    #[instrument(skip(self, ctx, request), fields(user = %ctx.user))]
    pub async fn update_vm(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
        request: UpdateVmRequest,
    ) -> Result<Vm> {
        ctx.authorize(kind::VMS, exp, verb::PATCH, &[name])?;
        let (exp_guard, vm_guard) = self.hold_vm(exp, name, LockStatus::Updating)?;

        let mut record = load_experiment(self.store.as_ref(), exp).await?;
        if record.running {
            return Err(ControlError::InvalidRequest(format!(
                "cannot update VM {} while experiment {} is running",
                name, exp
            )));
        }

        apply_vm_update(&mut record, name, request)?;
        self.store.save_experiment(record.clone()).await?;
        drop(vm_guard);
        drop(exp_guard);

        let vm = vm_view(self.fabric.as_ref(), self.locks(), &record, name).await?;
        self.announce(
            &vm_audience(exp, name),
            Resource::new("experiment/vm", format!("{}/{}", exp, name), "update"),
            Some(&vm),
        );

        debug!(experiment = %exp, vm = %name, "VM updated");
        Ok(vm)
    }

    /// Kill a VM of a running experiment
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn delete_vm(&self, ctx: &RequestContext, exp: &str, name: &str) -> Result<()> {
        ctx.authorize(kind::VMS, exp, verb::DELETE, &[name])?;
        let (exp_guard, vm_guard) = self.hold_vm(exp, name, LockStatus::Deleting)?;

        load_running(self.store.as_ref(), exp).await?;
        self.fabric.kill_vm(exp, name).await?;
        drop(vm_guard);
        drop(exp_guard);

        self.announce::<()>(
            &vm_audience(exp, name),
            Resource::new("experiment/vm", format!("{}/{}", exp, name), "delete"),
            None,
        );

        info!(experiment = %exp, vm = %name, "VM killed");
        Ok(())
    }

    /// PNG of a running VM's console, longest side `size` pixels
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn screenshot(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
        size: u32,
    ) -> Result<Vec<u8>> {
        ctx.authorize(kind::VMS_SCREENSHOT, exp, verb::GET, &[name])?;

        if size == 0 {
            return Err(ControlError::InvalidRequest(
                "screenshot size must be positive".to_string(),
            ));
        }

        load_running(self.store.as_ref(), exp).await?;
        self.fabric
            .screenshot(exp, name, size)
            .await
            .map_err(|err| match err {
                FabricError::NotFound(what) => ControlError::NotFound(what),
                other => ControlError::InvalidRequest(other.to_string()),
            })
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn start_vm(&self, ctx: &RequestContext, exp: &str, name: &str) -> Result<Vm> {
        let op = Operation::vm(
            exp,
            name,
            LockStatus::Starting,
            "experiment/vm",
            kind::VMS_START,
            verb::UPDATE,
        )
        .pending("starting", None);

        self.power_vm(ctx, op, exp, name, true).await
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn stop_vm(&self, ctx: &RequestContext, exp: &str, name: &str) -> Result<Vm> {
        let op = Operation::vm(
            exp,
            name,
            LockStatus::Stopping,
            "experiment/vm",
            kind::VMS_STOP,
            verb::UPDATE,
        )
        .pending("stopping", None);

        self.power_vm(ctx, op, exp, name, false).await
    }

    async fn power_vm(
        &self,
        ctx: &RequestContext,
        op: Operation,
        exp: &str,
        name: &str,
        start: bool,
    ) -> Result<Vm> {
        let store = Arc::clone(&self.store);
        let fabric = Arc::clone(&self.fabric);
        let locks = Arc::clone(self.locks());
        let exp = exp.to_string();
        let name = name.to_string();

        self.lifecycle
            .run(ctx, op, move || async move {
                let record = load_running(store.as_ref(), &exp).await?;

                if start {
                    fabric.start_vm(&exp, &name).await?;
                } else {
                    fabric.stop_vm(&exp, &name).await?;
                }

                info!(experiment = %exp, vm = %name, running = start, "VM power changed");
                vm_view(fabric.as_ref(), &locks, &record, &name).await
            })
            .await
    }

    /// Rebuild a VM, optionally with new hardware. While it runs the VM is
    /// reported with `redeploying` set.
    #[instrument(skip(self, ctx, request), fields(user = %ctx.user))]
    pub async fn redeploy_vm(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
        request: VmRedeployRequest,
    ) -> Result<Vm> {
        ctx.authorize(kind::VMS_REDEPLOY, exp, verb::UPDATE, &[name])?;

        let record = load_running(self.store.as_ref(), exp).await?;
        let mut current = vm_view(self.fabric.as_ref(), self.locks(), &record, name).await?;
        current.redeploying = true;

        let op = Operation::vm(
            exp,
            name,
            LockStatus::Redeploying,
            "experiment/vm",
            kind::VMS_REDEPLOY,
            verb::UPDATE,
        )
        .pending("redeploying", serde_json::to_value(&current).ok())
        .hold_pending();

        let store = Arc::clone(&self.store);
        let fabric = Arc::clone(&self.fabric);
        let locks = Arc::clone(self.locks());
        let exp = exp.to_string();
        let name = name.to_string();

        self.lifecycle
            .run(ctx, op, move || async move {
                let mut spec = current;
                spec.redeploying = false;
                if let Some(cpus) = request.cpus.filter(|c| *c > 0) {
                    spec.cpus = cpus;
                }
                if let Some(ram) = request.ram.filter(|r| *r > 0) {
                    spec.ram = ram;
                }
                if let Some(disk) = request.disk.filter(|d| !d.is_empty()) {
                    spec.disk = disk;
                }

                fabric.redeploy_vm(&exp, &spec, request.injects).await?;

                let mut record = load_experiment(store.as_ref(), &exp).await?;
                if let Some(definition) = record.vm_mut(&name) {
                    definition.cpus = spec.cpus;
                    definition.ram = spec.ram;
                    definition.disk = spec.disk.clone();
                }
                store.save_experiment(record.clone()).await?;

                info!(experiment = %exp, vm = %name, "VM redeployed");
                let mut vm = vm_view(fabric.as_ref(), &locks, &record, &name).await?;
                vm.redeploying = false;
                Ok(vm)
            })
            .await
    }

    // ========== Captures ==========

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_vm_captures(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
    ) -> Result<Vec<Capture>> {
        ctx.authorize(kind::VMS_CAPTURES, exp, verb::LIST, &[name])?;

        let record = load_experiment(self.store.as_ref(), exp).await?;
        if !record.running {
            return Ok(Vec::new());
        }

        let captures = self.fabric.captures(exp).await?;
        Ok(captures.into_iter().filter(|c| c.vm == name).collect())
    }

    #[instrument(skip(self, ctx, request), fields(user = %ctx.user))]
    pub async fn start_capture(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
        request: StartCaptureRequest,
    ) -> Result<()> {
        ctx.authorize(kind::VMS_CAPTURES, exp, verb::CREATE, &[name])?;

        if request.filename.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "capture filename is required".to_string(),
            ));
        }

        load_running(self.store.as_ref(), exp).await?;
        self.fabric
            .start_capture(exp, name, request.interface, &request.filename)
            .await?;

        self.announce(
            &vm_audience(exp, name),
            Resource::new("experiment/vm/capture", format!("{}/{}", exp, name), "start"),
            Some(&request),
        );

        info!(experiment = %exp, vm = %name, interface = request.interface, "Capture started");
        Ok(())
    }

    /// Stop every capture on a VM. Stopping with none running succeeds.
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn stop_captures(&self, ctx: &RequestContext, exp: &str, name: &str) -> Result<()> {
        ctx.authorize(kind::VMS_CAPTURES, exp, verb::DELETE, &[name])?;

        load_running(self.store.as_ref(), exp).await?;
        self.fabric.stop_captures(exp, name).await?;

        self.announce::<()>(
            &vm_audience(exp, name),
            Resource::new("experiment/vm/capture", format!("{}/{}", exp, name), "stop"),
            None,
        );

        info!(experiment = %exp, vm = %name, "Captures stopped");
        Ok(())
    }

    // ========== Snapshots and disks ==========

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_snapshots(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
    ) -> Result<Vec<String>> {
        ctx.authorize(kind::VMS_SNAPSHOTS, exp, verb::LIST, &[name])?;

        load_running(self.store.as_ref(), exp).await?;
        Ok(self.fabric.snapshots(exp, name).await?)
    }

    #[instrument(skip(self, ctx, request), fields(user = %ctx.user))]
    pub async fn snapshot_vm(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
        request: SnapshotRequest,
    ) -> Result<()> {
        if request.filename.trim().is_empty() {
            return Err(ControlError::InvalidRequest(
                "snapshot filename is required".to_string(),
            ));
        }

        let op = Operation::vm(
            exp,
            name,
            LockStatus::Snapshotting,
            "experiment/vm/snapshot",
            kind::VMS_SNAPSHOTS,
            verb::CREATE,
        )
        .pending("creating", None);

        let store = Arc::clone(&self.store);
        let fabric = Arc::clone(&self.fabric);
        let exp = exp.to_string();
        let name = name.to_string();

        self.lifecycle
            .run_streamed(ctx, op, move |progress| async move {
                load_running(store.as_ref(), &exp).await?;
                fabric
                    .snapshot_vm(&exp, &name, &request.filename, progress)
                    .await?;

                info!(experiment = %exp, vm = %name, snapshot = %request.filename, "Snapshot created");
                Ok(())
            })
            .await
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn restore_vm(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
        snapshot: &str,
    ) -> Result<()> {
        let op = Operation::vm(
            exp,
            name,
            LockStatus::Restoring,
            "experiment/vm/snapshot",
            kind::VMS_SNAPSHOTS,
            verb::UPDATE,
        )
        .pending("restoring", None);

        let store = Arc::clone(&self.store);
        let fabric = Arc::clone(&self.fabric);
        let exp = exp.to_string();
        let name = name.to_string();
        let snapshot = snapshot.to_string();

        self.lifecycle
            .run(ctx, op, move || async move {
                load_running(store.as_ref(), &exp).await?;
                fabric.restore_vm(&exp, &name, &snapshot).await?;

                info!(experiment = %exp, vm = %name, snapshot = %snapshot, "Snapshot restored");
                Ok(())
            })
            .await
    }

    /// Commit a VM's disk to a new backing image.
    ///
    /// Without a request the image is named after the VM's current disk. A
    /// request with an empty filename is rejected.
    #[instrument(skip(self, ctx, request), fields(user = %ctx.user))]
    pub async fn commit_vm(
        &self,
        ctx: &RequestContext,
        exp: &str,
        name: &str,
        request: Option<BackingImageRequest>,
    ) -> Result<BackingImageResponse> {
        ctx.authorize(kind::VMS_COMMIT, exp, verb::CREATE, &[name])?;

        let filename = match request {
            Some(request) if request.filename.trim().is_empty() => {
                return Err(ControlError::InvalidRequest(
                    "backing image filename is required".to_string(),
                ));
            }
            Some(request) => request.filename,
            None => {
                let record = load_running(self.store.as_ref(), exp).await?;
                let vm = vm_view(self.fabric.as_ref(), self.locks(), &record, name).await?;
                derive_disk_name(&vm.disk, name)
            }
        };

        let pending = BackingImageResponse {
            disk: filename.clone(),
            vm: None,
        };

        let op = Operation::vm(
            exp,
            name,
            LockStatus::Committing,
            "experiment/vm/commit",
            kind::VMS_COMMIT,
            verb::CREATE,
        )
        .pending("committing", serde_json::to_value(&pending).ok());

        let store = Arc::clone(&self.store);
        let fabric = Arc::clone(&self.fabric);
        let locks = Arc::clone(self.locks());
        let exp = exp.to_string();
        let name = name.to_string();

        self.lifecycle
            .run_streamed(ctx, op, move |progress| async move {
                let record = load_running(store.as_ref(), &exp).await?;
                let disk = fabric.commit_vm(&exp, &name, &filename, progress).await?;
                let vm = vm_view(fabric.as_ref(), &locks, &record, &name).await?;

                info!(experiment = %exp, vm = %name, disk = %disk, "Disk committed");
                Ok(BackingImageResponse { disk, vm: Some(vm) })
            })
            .await
    }

    // ========== Cluster ==========

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_topologies(&self, ctx: &RequestContext) -> Result<Vec<String>> {
        ctx.authorize(kind::TOPOLOGIES, "", verb::LIST, &[])?;

        Ok(self
            .store
            .topologies()
            .await?
            .into_iter()
            .map(|t| t.name)
            .filter(|name| ctx.can(kind::TOPOLOGIES, "", verb::LIST, &[name]))
            .collect())
    }

    /// Scenarios written for `topology`
    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_scenarios(&self, ctx: &RequestContext, topology: &str) -> Result<Vec<Scenario>> {
        ctx.authorize(kind::SCENARIOS, "", verb::LIST, &[])?;

        Ok(self
            .store
            .scenarios()
            .await?
            .into_iter()
            .filter(|s| s.topology == topology)
            .filter(|s| ctx.can(kind::SCENARIOS, "", verb::LIST, &[&s.name]))
            .collect())
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_disks(&self, ctx: &RequestContext) -> Result<Vec<String>> {
        ctx.authorize(kind::DISKS, "", verb::LIST, &[])?;

        Ok(self
            .fabric
            .disks()
            .await?
            .into_iter()
            .filter(|disk| ctx.can(kind::DISKS, "", verb::LIST, &[disk]))
            .collect())
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_hosts(&self, ctx: &RequestContext) -> Result<Cluster> {
        ctx.authorize(kind::HOSTS, "", verb::LIST, &[])?;

        let hosts = self
            .fabric
            .hosts()
            .await?
            .into_iter()
            .filter(|host| ctx.can(kind::HOSTS, "", verb::LIST, &[&host.name]))
            .collect();

        Ok(Cluster { hosts })
    }

    // ========== Users ==========

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn list_users(&self, ctx: &RequestContext) -> Result<Vec<UserSpec>> {
        ctx.authorize(kind::USERS, "", verb::LIST, &[])?;

        Ok(self
            .store
            .users()
            .await?
            .into_iter()
            .filter(|u| ctx.can(kind::USERS, "", verb::LIST, &[&u.username]))
            .map(|u| u.spec())
            .collect())
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn get_user(&self, ctx: &RequestContext, username: &str) -> Result<UserSpec> {
        ctx.authorize(kind::USERS, "", verb::GET, &[username])?;
        Ok(self.load_user(username).await?.spec())
    }

    #[instrument(skip(self, ctx, request), fields(user = %ctx.user, username = %request.username))]
    pub async fn create_user(
        &self,
        ctx: &RequestContext,
        request: CreateUserRequest,
    ) -> Result<UserSpec> {
        ctx.authorize(kind::USERS, "", verb::CREATE, &[])?;

        if request.username.trim().is_empty() {
            return Err(ControlError::InvalidRequest("username is required".to_string()));
        }
        if self.store.user(&request.username).await?.is_some() {
            return Err(ControlError::InvalidRequest(format!(
                "user {} already exists",
                request.username
            )));
        }

        let role = self.role_from_store(&request.role_name).await?;
        let user = UserRecord::new(
            &request.username,
            &request.first_name,
            &request.last_name,
            role,
            &request.experiments,
            &request.resource_names,
        )?;

        let spec = user.spec();
        self.store.save_user(user).await?;

        self.announce(
            &RequestPolicy::new(kind::USERS, "", verb::GET),
            Resource::new("user", &spec.username, "create"),
            Some(&spec),
        );

        info!(username = %spec.username, role = ?spec.role_name, "User created");
        Ok(spec)
    }

    /// Update a user's details. A new role, or new experiment or name
    /// patterns, re-specialise the user's role from its stored definition.
    #[instrument(skip(self, ctx, request), fields(user = %ctx.user))]
    pub async fn update_user(
        &self,
        ctx: &RequestContext,
        username: &str,
        request: UpdateUserRequest,
    ) -> Result<UserSpec> {
        ctx.authorize(kind::USERS, "", verb::PATCH, &[username])?;

        let mut user = self.load_user(username).await?;

        if let Some(first_name) = request.first_name {
            user.first_name = first_name;
        }
        if let Some(last_name) = request.last_name {
            user.last_name = last_name;
        }

        let role_name = request.role_name.filter(|r| !r.is_empty());
        if role_name.is_some() || !request.experiments.is_empty() || !request.resource_names.is_empty() {
            let base = role_name.unwrap_or_else(|| user.role.name.clone());
            let role = self.role_from_store(&base).await?;
            user.role = specialise_role(role, username, &request.experiments, &request.resource_names)?;
        }

        let spec = user.spec();
        self.store.save_user(user).await?;

        self.announce(
            &RequestPolicy::new(kind::USERS, "", verb::GET).with_name(username),
            Resource::new("user", username, "update"),
            Some(&spec),
        );

        info!(username, "User updated");
        Ok(spec)
    }

    #[instrument(skip(self, ctx), fields(user = %ctx.user))]
    pub async fn delete_user(&self, ctx: &RequestContext, username: &str) -> Result<()> {
        ctx.authorize(kind::USERS, "", verb::DELETE, &[username])?;

        if ctx.user == username {
            return Err(ControlError::InvalidRequest(
                "users cannot delete themselves".to_string(),
            ));
        }

        if !self.store.delete_user(username).await? {
            return Err(ControlError::user_not_found(username));
        }

        self.announce::<()>(
            &RequestPolicy::new(kind::USERS, "", verb::GET).with_name(username),
            Resource::new("user", username, "delete"),
            None,
        );

        info!(username, "User deleted");
        Ok(())
    }

    // ========== Helpers ==========

    /// Look a role up by stored name or display alias
    pub async fn role_from_store(&self, name: &str) -> Result<RoleSpec> {
        let stored = resolve_role_name(name);
        self.store
            .role(stored)
            .await?
            .ok_or_else(|| RbacError::RoleNotFound(name.to_string()).into())
    }

    async fn load_user(&self, username: &str) -> Result<UserRecord> {
        self.store
            .user(username)
            .await?
            .ok_or_else(|| ControlError::user_not_found(username))
    }

    fn experiment_status(&self, record: &ExperimentRecord) -> ExperimentStatus {
        match self.locks().status_of(&LockKey::experiment(&record.name)) {
            Some(status) => ExperimentStatus::Busy(status),
            None => ExperimentStatus::settled(record.running),
        }
    }

    fn ensure_unlocked(&self, key: &LockKey) -> Result<()> {
        match self.locks().status_of(key) {
            Some(status) => Err(ControlError::Locked {
                key: key.clone(),
                status,
            }),
            None => Ok(()),
        }
    }

    /// Holds the experiment key, then the VM key. Fails with `Locked` when
    /// another mutation owns either one.
    fn hold_vm(&self, exp: &str, vm: &str, status: LockStatus) -> Result<(LockGuard, LockGuard)> {
        let exp_guard = self
            .locks()
            .acquire(LockKey::experiment(exp), LockStatus::Updating)?;
        let vm_guard = self.locks().acquire(LockKey::vm(exp, vm), status)?;
        Ok((exp_guard, vm_guard))
    }

    async fn visible_vms(&self, ctx: &RequestContext, record: &ExperimentRecord) -> Result<Vec<Vm>> {
        let vms = vm_views(self.fabric.as_ref(), self.locks(), record).await?;
        Ok(vms
            .into_iter()
            .filter(|vm| ctx.can(kind::VMS, &record.name, verb::LIST, &[&vm.name]))
            .collect())
    }

    fn announce<T: Serialize>(&self, policy: &RequestPolicy, resource: Resource, payload: Option<&T>) {
        let payload = payload.and_then(|p| serde_json::to_value(p).ok());
        self.broker().broadcast(policy, resource, payload);
    }
}

fn vm_audience(exp: &str, vm: &str) -> RequestPolicy {
    RequestPolicy::new(kind::VMS, exp, verb::GET).with_name(vm)
}

async fn load_experiment(store: &dyn ConfigStore, name: &str) -> Result<ExperimentRecord> {
    store
        .experiment(name)
        .await?
        .ok_or_else(|| ControlError::experiment_not_found(name))
}

async fn load_running(store: &dyn ConfigStore, name: &str) -> Result<ExperimentRecord> {
    let record = load_experiment(store, name).await?;
    if !record.running {
        return Err(ControlError::InvalidRequest(format!(
            "experiment {} is not running",
            name
        )));
    }
    Ok(record)
}

/// VMs of an experiment: the fabric's view while running, the stored
/// definitions otherwise. VMs being redeployed are flagged.
async fn vm_views(
    fabric: &dyn Fabric,
    locks: &LockTable,
    record: &ExperimentRecord,
) -> Result<Vec<Vm>> {
    let mut vms = if record.running {
        fabric.vms(&record.name).await?
    } else {
        record
            .vms
            .iter()
            .cloned()
            .map(|mut vm| {
                if let Some(host) = record.schedule.get(&vm.name) {
                    vm.host = host.clone();
                }
                vm
            })
            .collect()
    };

    for vm in &mut vms {
        if locks.status_of(&LockKey::vm(&record.name, &vm.name)) == Some(LockStatus::Redeploying) {
            vm.redeploying = true;
        }
    }

    Ok(vms)
}

async fn vm_view(
    fabric: &dyn Fabric,
    locks: &LockTable,
    record: &ExperimentRecord,
    name: &str,
) -> Result<Vm> {
    vm_views(fabric, locks, record)
        .await?
        .into_iter()
        .find(|vm| vm.name == name)
        .ok_or_else(|| ControlError::vm_not_found(&record.name, name))
}

fn apply_vm_update(record: &mut ExperimentRecord, name: &str, request: UpdateVmRequest) -> Result<()> {
    let exp = record.name.clone();
    let vm = record
        .vm_mut(name)
        .ok_or_else(|| ControlError::vm_not_found(&exp, name))?;

    if let Some(cpus) = request.cpus {
        vm.cpus = cpus;
    }
    if let Some(ram) = request.ram {
        vm.ram = ram;
    }
    if let Some(disk) = request.disk {
        vm.disk = disk;
    }
    if let Some(dnb) = request.do_not_boot {
        vm.do_not_boot = dnb;
    }
    if let Some(interface) = request.interface {
        let slot = vm.networks.get_mut(interface.index).ok_or_else(|| {
            ControlError::InvalidRequest(format!(
                "VM {} has no interface {}",
                name, interface.index
            ))
        })?;
        *slot = interface.vlan;
    }

    match request.host {
        Some(host) if host.is_empty() => {
            record.schedule.remove(name);
        }
        Some(host) => {
            record.schedule.insert(name.to_string(), host);
        }
        None => {}
    }

    Ok(())
}

/// Give every VLAN alias used by the experiment's VMs an id. Existing
/// assignments are kept.
fn assign_vlans(record: &mut ExperimentRecord) -> Result<()> {
    let aliases: BTreeSet<String> = record
        .vms
        .iter()
        .flat_map(|vm| vm.networks.iter().cloned())
        .filter(|alias| !record.vlans.contains_key(alias))
        .collect();

    let mut next = if record.vlan_min > 0 {
        record.vlan_min
    } else {
        DEFAULT_VLAN_BASE
    };

    for alias in aliases {
        while record.vlans.values().any(|id| *id == next) {
            next += 1;
        }
        if record.vlan_max > 0 && next > record.vlan_max {
            return Err(ControlError::InvalidRequest(format!(
                "VLAN range {}-{} exhausted",
                record.vlan_min, record.vlan_max
            )));
        }
        record.vlans.insert(alias, next);
        next += 1;
    }

    Ok(())
}

/// `base.qc2` committed from `web` becomes `base-web.qc2`
fn derive_disk_name(disk: &str, vm: &str) -> String {
    let path = Path::new(disk);
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or(DEFAULT_DISK_EXTENSION);

    match path.file_stem().and_then(|s| s.to_str()) {
        Some(stem) if !stem.is_empty() => format!("{}-{}.{}", stem, vm, extension),
        _ => format!("{}.{}", vm, extension),
    }
}
