//! In-memory store and simulated fabric for development and testing

use crate::error::{ControlError, Result};
use crate::fabric::{Fabric, FabricError, FabricResult, Progress};
use crate::store::{ConfigStore, UserRecord};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use phenix_rbac::{builtin, default_roles, RoleSpec};
use phenix_types::{Capture, ExperimentRecord, Host, Scenario, Topology, Vm};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A user as written in a seed file
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub username: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub role_name: String,
    #[serde(default)]
    pub experiments: Vec<String>,
    #[serde(default)]
    pub resource_names: Vec<String>,
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// Initial contents of the in-memory store and fabric
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Seed {
    /// Extra roles, added to (or replacing) the built-in ones
    #[serde(default)]
    pub roles: Vec<RoleSpec>,
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub topologies: Vec<Topology>,
    #[serde(default)]
    pub scenarios: Vec<Scenario>,
    #[serde(default)]
    pub experiments: Vec<ExperimentRecord>,
    #[serde(default)]
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub disks: Vec<String>,
}

impl Seed {
    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw)
            .map_err(|e| ControlError::InvalidRequest(format!("invalid seed: {}", e)))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ControlError::Internal(format!("reading seed {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }
}

/// In-memory config store seeded with the built-in roles
#[derive(Debug)]
pub struct InMemoryConfigStore {
    experiments: Arc<RwLock<HashMap<String, ExperimentRecord>>>,
    topologies: Arc<RwLock<HashMap<String, Topology>>>,
    scenarios: Arc<RwLock<HashMap<String, Scenario>>>,
    roles: Arc<RwLock<HashMap<String, RoleSpec>>>,
    users: Arc<RwLock<HashMap<String, UserRecord>>>,
}

impl Default for InMemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        let roles = default_roles()
            .into_iter()
            .map(|role| (role.name.clone(), role))
            .collect();

        Self {
            experiments: Arc::new(RwLock::new(HashMap::new())),
            topologies: Arc::new(RwLock::new(HashMap::new())),
            scenarios: Arc::new(RwLock::new(HashMap::new())),
            roles: Arc::new(RwLock::new(roles)),
            users: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Build a store from a seed. Seed users are specialised from their
    /// named role exactly as users created through the API are.
    pub async fn from_seed(seed: &Seed) -> Result<Self> {
        let store = Self::new();

        {
            let mut roles = store.roles.write().await;
            for role in &seed.roles {
                roles.insert(role.name.clone(), role.clone());
            }
        }

        for topology in &seed.topologies {
            store.insert_topology(topology.clone()).await;
        }

        for scenario in &seed.scenarios {
            store.insert_scenario(scenario.clone()).await;
        }

        for experiment in &seed.experiments {
            store.save_experiment(experiment.clone()).await?;
        }

        for seeded in &seed.users {
            let role = store
                .role(builtin::resolve_role_name(&seeded.role_name))
                .await?
                .ok_or_else(|| ControlError::NotFound(format!("role {}", seeded.role_name)))?;

            let mut user = UserRecord::new(
                &seeded.username,
                &seeded.first_name,
                &seeded.last_name,
                role,
                &seeded.experiments,
                &seeded.resource_names,
            )?;
            user.tokens = seeded.tokens.clone();

            store.save_user(user).await?;
        }

        info!(
            topologies = seed.topologies.len(),
            experiments = seed.experiments.len(),
            users = seed.users.len(),
            "Config store seeded"
        );

        Ok(store)
    }

    pub async fn insert_topology(&self, topology: Topology) {
        self.topologies
            .write()
            .await
            .insert(topology.name.clone(), topology);
    }

    pub async fn insert_scenario(&self, scenario: Scenario) {
        self.scenarios
            .write()
            .await
            .insert(scenario.name.clone(), scenario);
    }
}

fn sorted_by_name<T>(mut items: Vec<T>, name: impl Fn(&T) -> &str) -> Vec<T> {
    items.sort_by(|a, b| name(a).cmp(name(b)));
    items
}

#[async_trait]
impl ConfigStore for InMemoryConfigStore {
    async fn experiments(&self) -> Result<Vec<ExperimentRecord>> {
        let experiments = self.experiments.read().await;
        Ok(sorted_by_name(experiments.values().cloned().collect(), |e| {
            &e.name
        }))
    }

    async fn experiment(&self, name: &str) -> Result<Option<ExperimentRecord>> {
        Ok(self.experiments.read().await.get(name).cloned())
    }

    async fn save_experiment(&self, experiment: ExperimentRecord) -> Result<()> {
        self.experiments
            .write()
            .await
            .insert(experiment.name.clone(), experiment);
        Ok(())
    }

    async fn delete_experiment(&self, name: &str) -> Result<bool> {
        Ok(self.experiments.write().await.remove(name).is_some())
    }

    async fn topologies(&self) -> Result<Vec<Topology>> {
        let topologies = self.topologies.read().await;
        Ok(sorted_by_name(topologies.values().cloned().collect(), |t| {
            &t.name
        }))
    }

    async fn topology(&self, name: &str) -> Result<Option<Topology>> {
        Ok(self.topologies.read().await.get(name).cloned())
    }

    async fn scenarios(&self) -> Result<Vec<Scenario>> {
        let scenarios = self.scenarios.read().await;
        Ok(sorted_by_name(scenarios.values().cloned().collect(), |s| {
            &s.name
        }))
    }

    async fn role(&self, name: &str) -> Result<Option<RoleSpec>> {
        Ok(self.roles.read().await.get(name).cloned())
    }

    async fn users(&self) -> Result<Vec<UserRecord>> {
        let users = self.users.read().await;
        Ok(sorted_by_name(users.values().cloned().collect(), |u| {
            &u.username
        }))
    }

    async fn user(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self.users.read().await.get(username).cloned())
    }

    async fn save_user(&self, mut user: UserRecord) -> Result<()> {
        let mut users = self.users.write().await;
        if user.tokens.is_empty() {
            if let Some(existing) = users.get(&user.username) {
                user.tokens = existing.tokens.clone();
            }
        }
        users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn delete_user(&self, username: &str) -> Result<bool> {
        Ok(self.users.write().await.remove(username).is_some())
    }

    async fn user_by_token(&self, token: &str) -> Result<Option<UserRecord>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .find(|user| user.tokens.iter().any(|t| t == token))
            .cloned())
    }
}

/// Fabric that keeps VM state in memory.
///
/// Long-running calls sleep for `step_delay` per step so progress and lock
/// behaviour can be observed. Failures can be injected per operation name
/// (`launch`, `start_vm`, `commit_vm`, ...).
#[derive(Debug)]
pub struct SimulatedFabric {
    hosts: Vec<Host>,
    disks: DashSet<String>,
    step_delay: Duration,
    running: DashMap<String, Vec<Vm>>,
    launched: DashMap<String, Arc<AtomicUsize>>,
    captures: DashMap<String, Vec<Capture>>,
    snapshots: DashMap<String, Vec<String>>,
    files: DashMap<String, BTreeMap<String, Vec<u8>>>,
    failures: DashMap<String, String>,
    next_host: AtomicUsize,
}

const SNAPSHOT_STEPS: usize = 4;

const PCAP_MAGIC: [u8; 4] = [0xd4, 0xc3, 0xb2, 0xa1];
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];

impl SimulatedFabric {
    pub fn new(hosts: Vec<Host>, disks: Vec<String>) -> Self {
        Self {
            hosts,
            disks: disks.into_iter().collect(),
            step_delay: Duration::ZERO,
            running: DashMap::new(),
            launched: DashMap::new(),
            captures: DashMap::new(),
            snapshots: DashMap::new(),
            files: DashMap::new(),
            failures: DashMap::new(),
            next_host: AtomicUsize::new(0),
        }
    }

    pub fn from_seed(seed: &Seed) -> Self {
        Self::new(seed.hosts.clone(), seed.disks.clone())
    }

    /// Delay applied per VM launched and per progress step
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Make the next call to `operation` fail with `message`
    pub fn fail_next(&self, operation: &str, message: impl Into<String>) {
        self.failures.insert(operation.to_string(), message.into());
    }

    /// Write a file into an experiment's file area
    pub fn put_file(&self, experiment: &str, filename: &str, contents: impl Into<Vec<u8>>) {
        self.files
            .entry(experiment.to_string())
            .or_default()
            .insert(filename.to_string(), contents.into());
    }

    fn check(&self, operation: &str) -> FabricResult<()> {
        match self.failures.remove(operation) {
            Some((_, message)) => Err(FabricError::Failed(message)),
            None => Ok(()),
        }
    }

    async fn step(&self) {
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }
    }

    fn place(&self, experiment: &ExperimentRecord, vm: &str) -> String {
        if let Some(host) = experiment.schedule.get(vm) {
            return host.clone();
        }
        if self.hosts.is_empty() {
            return String::new();
        }
        let next = self.next_host.fetch_add(1, Ordering::Relaxed);
        self.hosts[next % self.hosts.len()].name.clone()
    }

    fn with_vm<R>(
        &self,
        experiment: &str,
        vm: &str,
        apply: impl FnOnce(&mut Vec<Vm>, usize) -> R,
    ) -> FabricResult<R> {
        let mut vms = self
            .running
            .get_mut(experiment)
            .ok_or_else(|| FabricError::NotFound(format!("experiment {}", experiment)))?;
        let index = vms
            .iter()
            .position(|v| v.name == vm)
            .ok_or_else(|| FabricError::NotFound(format!("VM {}", vm)))?;
        Ok(apply(&mut vms, index))
    }

    fn snapshot_key(experiment: &str, vm: &str) -> String {
        format!("{}/{}", experiment, vm)
    }

    async fn stepped(&self, progress: &Progress) {
        for step in 1..=SNAPSHOT_STEPS {
            self.step().await;
            progress.report(step as f64 / SNAPSHOT_STEPS as f64);
        }
    }
}

#[async_trait]
impl Fabric for SimulatedFabric {
    async fn launch(&self, experiment: &ExperimentRecord) -> FabricResult<()> {
        self.check("launch")?;

        let counter = Arc::new(AtomicUsize::new(0));
        self.launched
            .insert(experiment.name.clone(), Arc::clone(&counter));
        self.running.insert(experiment.name.clone(), Vec::new());

        for definition in &experiment.vms {
            self.step().await;

            let mut vm = definition.clone();
            vm.host = self.place(experiment, &vm.name);
            vm.running = !vm.do_not_boot;

            if let Some(mut vms) = self.running.get_mut(&experiment.name) {
                vms.push(vm);
            }
            counter.fetch_add(1, Ordering::Relaxed);
        }

        debug!(experiment = %experiment.name, vms = experiment.vms.len(), "Launched");
        Ok(())
    }

    async fn launch_progress(&self, experiment: &str, vm_count: usize) -> FabricResult<f64> {
        if vm_count == 0 {
            return Ok(1.0);
        }
        let launched = self
            .launched
            .get(experiment)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0);
        Ok(launched as f64 / vm_count as f64)
    }

    async fn teardown(&self, experiment: &str) -> FabricResult<()> {
        self.check("teardown")?;
        self.running.remove(experiment);
        self.launched.remove(experiment);
        self.captures.remove(experiment);
        Ok(())
    }

    async fn vms(&self, experiment: &str) -> FabricResult<Vec<Vm>> {
        self.running
            .get(experiment)
            .map(|vms| vms.clone())
            .ok_or_else(|| FabricError::NotFound(format!("experiment {}", experiment)))
    }

    async fn start_vm(&self, experiment: &str, vm: &str) -> FabricResult<()> {
        self.check("start_vm")?;
        self.with_vm(experiment, vm, |vms, i| vms[i].running = true)
    }

    async fn stop_vm(&self, experiment: &str, vm: &str) -> FabricResult<()> {
        self.check("stop_vm")?;
        self.with_vm(experiment, vm, |vms, i| vms[i].running = false)
    }

    async fn kill_vm(&self, experiment: &str, vm: &str) -> FabricResult<()> {
        self.check("kill_vm")?;
        self.with_vm(experiment, vm, |vms, i| {
            vms.remove(i);
        })
    }

    async fn redeploy_vm(&self, experiment: &str, spec: &Vm, injects: bool) -> FabricResult<()> {
        self.check("redeploy_vm")?;
        self.step().await;

        self.with_vm(experiment, &spec.name, |vms, i| {
            let host = vms[i].host.clone();
            vms[i] = spec.clone();
            vms[i].host = host;
            vms[i].running = true;
            vms[i].redeploying = false;
            vms[i].uptime = 0.0;
        })?;

        debug!(experiment, vm = %spec.name, injects, "Redeployed");
        Ok(())
    }

    async fn start_capture(
        &self,
        experiment: &str,
        vm: &str,
        interface: usize,
        filename: &str,
    ) -> FabricResult<()> {
        self.check("start_capture")?;

        let networks = self.with_vm(experiment, vm, |vms, i| vms[i].networks.len())?;
        if interface >= networks {
            return Err(FabricError::Failed(format!(
                "VM {} has no interface {}",
                vm, interface
            )));
        }

        let mut captures = self.captures.entry(experiment.to_string()).or_default();
        if captures
            .iter()
            .any(|c| c.vm == vm && c.interface == interface)
        {
            return Err(FabricError::Failed(format!(
                "capture already running on {} interface {}",
                vm, interface
            )));
        }

        captures.push(Capture {
            vm: vm.to_string(),
            interface,
            filepath: format!("/phenix/images/{}/files/{}", experiment, filename),
        });
        drop(captures);

        self.put_file(experiment, filename, PCAP_MAGIC.to_vec());
        Ok(())
    }

    async fn stop_captures(&self, experiment: &str, vm: &str) -> FabricResult<()> {
        self.check("stop_captures")?;
        if let Some(mut captures) = self.captures.get_mut(experiment) {
            captures.retain(|c| c.vm != vm);
        }
        Ok(())
    }

    async fn captures(&self, experiment: &str) -> FabricResult<Vec<Capture>> {
        Ok(self
            .captures
            .get(experiment)
            .map(|captures| captures.clone())
            .unwrap_or_default())
    }

    async fn snapshot_vm(
        &self,
        experiment: &str,
        vm: &str,
        filename: &str,
        progress: Progress,
    ) -> FabricResult<()> {
        self.check("snapshot_vm")?;
        self.with_vm(experiment, vm, |_, _| ())?;

        self.stepped(&progress).await;

        self.snapshots
            .entry(Self::snapshot_key(experiment, vm))
            .or_default()
            .push(filename.to_string());
        Ok(())
    }

    async fn snapshots(&self, experiment: &str, vm: &str) -> FabricResult<Vec<String>> {
        Ok(self
            .snapshots
            .get(&Self::snapshot_key(experiment, vm))
            .map(|snapshots| snapshots.clone())
            .unwrap_or_default())
    }

    async fn restore_vm(&self, experiment: &str, vm: &str, snapshot: &str) -> FabricResult<()> {
        self.check("restore_vm")?;

        let known = self
            .snapshots
            .get(&Self::snapshot_key(experiment, vm))
            .map(|snapshots| snapshots.iter().any(|s| s == snapshot))
            .unwrap_or(false);
        if !known {
            return Err(FabricError::NotFound(format!("snapshot {}", snapshot)));
        }

        self.step().await;
        self.with_vm(experiment, vm, |vms, i| {
            vms[i].running = true;
            vms[i].uptime = 0.0;
        })
    }

    async fn commit_vm(
        &self,
        experiment: &str,
        vm: &str,
        filename: &str,
        progress: Progress,
    ) -> FabricResult<String> {
        self.check("commit_vm")?;
        self.with_vm(experiment, vm, |_, _| ())?;

        self.stepped(&progress).await;

        self.disks.insert(filename.to_string());
        self.with_vm(experiment, vm, |vms, i| vms[i].disk = filename.to_string())?;
        Ok(filename.to_string())
    }

    async fn files(&self, experiment: &str) -> FabricResult<Vec<String>> {
        self.check("files")?;
        Ok(self
            .files
            .get(experiment)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn file(&self, experiment: &str, filename: &str) -> FabricResult<Vec<u8>> {
        self.check("file")?;
        self.files
            .get(experiment)
            .and_then(|files| files.get(filename).cloned())
            .ok_or_else(|| FabricError::NotFound(format!("file {}", filename)))
    }

    async fn screenshot(&self, experiment: &str, vm: &str, size: u32) -> FabricResult<Vec<u8>> {
        self.check("screenshot")?;

        if !self.with_vm(experiment, vm, |vms, i| vms[i].running)? {
            return Err(FabricError::Failed(format!("VM {} is not running", vm)));
        }

        let mut image = PNG_SIGNATURE.to_vec();
        image.extend_from_slice(format!("{}/{}@{}", experiment, vm, size).as_bytes());
        Ok(image)
    }

    async fn hosts(&self) -> FabricResult<Vec<Host>> {
        let mut hosts = self.hosts.clone();
        for host in &mut hosts {
            host.vms = self
                .running
                .iter()
                .flat_map(|entry| entry.value().clone())
                .filter(|vm| vm.host == host.name)
                .count() as u32;
        }
        Ok(hosts)
    }

    async fn disks(&self) -> FabricResult<Vec<String>> {
        let mut disks: Vec<String> = self.disks.iter().map(|d| d.clone()).collect();
        disks.sort();
        Ok(disks)
    }
}
