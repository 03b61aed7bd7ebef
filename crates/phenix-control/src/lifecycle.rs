//! Guarded lifecycle operations
//!
//! Every state-changing operation on an experiment or VM follows the same
//! protocol:
//!
//! 1. authorize the caller, denying with no lock taken and nothing announced
//! 2. take the resource lock, failing with `Locked` on conflict
//! 3. announce the pending state (`starting`, `redeploying`, ...)
//! 4. run the fabric work, relaying progress as `progress` events
//! 5. announce the outcome (`start`, `errorStarting`, ...)
//! 6. release the lock
//!
//! Steps 3 to 6 run on their own task so that an abandoned request still
//! announces its outcome and releases its lock. When the caller stops
//! waiting on a timeout, the lock stays held until the detached work ends.

use crate::broker::EventBroker;
use crate::context::RequestContext;
use crate::error::{ControlError, Result};
use crate::fabric::{FabricResult, Progress};
use crate::lock::{LockGuard, LockTable};
use phenix_types::{LockKey, LockStatus, RequestPolicy, Resource};
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn, Instrument};

/// Default interval between progress polls
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

const MIN_PROGRESS_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle tuning
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How often polled operations query their progress
    pub progress_interval: Duration,
    /// Minimum time an operation marked with
    /// [`hold_pending`](Operation::hold_pending) stays in its pending state.
    /// `None` reports completion as soon as the work finishes.
    pub min_pending: Option<Duration>,
    /// Stop waiting for the fabric after this long. The fabric call itself
    /// keeps running.
    pub operation_timeout: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            min_pending: None,
            operation_timeout: None,
        }
    }
}

/// Description of one guarded operation
#[derive(Debug, Clone)]
pub struct Operation {
    /// What the caller must be allowed
    pub requires: RequestPolicy,
    pub key: LockKey,
    pub status: LockStatus,
    /// Who hears about the operation
    pub audience: RequestPolicy,
    /// Resource kind in announcements (`experiment`, `experiment/vm`, ...)
    pub kind: String,
    /// Instance id in announcements
    pub id: String,
    pub pending: Option<String>,
    pub pending_payload: Option<serde_json::Value>,
    pub succeeded: String,
    pub failed: String,
    /// Apply the configured minimum pending duration
    pub hold_pending: bool,
}

impl Operation {
    /// An experiment-level operation, announced to everyone who can get the
    /// experiment
    pub fn experiment(name: &str, status: LockStatus, resource: &str, verb: &str) -> Self {
        Self::with_defaults(
            RequestPolicy::new(resource, name, verb),
            LockKey::experiment(name),
            status,
            RequestPolicy::new("experiments", name, "get"),
            "experiment",
            name.to_string(),
        )
    }

    /// A VM-level operation, announced to everyone who can get the VM
    pub fn vm(
        exp: &str,
        vm: &str,
        status: LockStatus,
        kind: &str,
        resource: &str,
        verb: &str,
    ) -> Self {
        Self::with_defaults(
            RequestPolicy::new(resource, exp, verb).with_name(vm),
            LockKey::vm(exp, vm),
            status,
            RequestPolicy::new("vms", exp, "get").with_name(vm),
            kind,
            format!("{}/{}", exp, vm),
        )
    }

    fn with_defaults(
        requires: RequestPolicy,
        key: LockKey,
        status: LockStatus,
        audience: RequestPolicy,
        kind: &str,
        id: String,
    ) -> Self {
        let (succeeded, failed) = default_outcome(status);

        Self {
            requires,
            key,
            status,
            audience,
            kind: kind.to_string(),
            id,
            pending: None,
            pending_payload: None,
            succeeded: succeeded.to_string(),
            failed: failed.to_string(),
            hold_pending: false,
        }
    }

    /// Authorize against `requires` instead of the operation's own scope
    pub fn requiring(mut self, requires: RequestPolicy) -> Self {
        self.requires = requires;
        self
    }

    /// Announce `action` once the lock is held
    pub fn pending(mut self, action: impl Into<String>, payload: Option<serde_json::Value>) -> Self {
        self.pending = Some(action.into());
        self.pending_payload = payload;
        self
    }

    pub fn outcome(mut self, succeeded: impl Into<String>, failed: impl Into<String>) -> Self {
        self.succeeded = succeeded.into();
        self.failed = failed.into();
        self
    }

    pub fn hold_pending(mut self) -> Self {
        self.hold_pending = true;
        self
    }

    fn resource(&self, action: &str) -> Resource {
        Resource::new(self.kind.clone(), self.id.clone(), action)
    }
}

fn default_outcome(status: LockStatus) -> (&'static str, &'static str) {
    match status {
        LockStatus::Creating | LockStatus::Snapshotting => ("create", "errorCreating"),
        LockStatus::Deleting => ("delete", "errorDeleting"),
        LockStatus::Starting => ("start", "errorStarting"),
        LockStatus::Stopping => ("stop", "errorStopping"),
        LockStatus::Redeploying => ("redeployed", "errorRedeploying"),
        LockStatus::Restoring => ("restore", "errorRestoring"),
        LockStatus::Committing => ("commit", "errorCommitting"),
        LockStatus::Updating => ("update", "errorUpdating"),
        LockStatus::Scheduling => ("schedule", "errorScheduling"),
    }
}

type Poller =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = FabricResult<f64>> + Send>> + Send + Sync>;

/// Runs guarded operations against a shared lock table and broker
#[derive(Clone)]
pub struct LifecycleCoordinator {
    locks: Arc<LockTable>,
    broker: EventBroker,
    config: LifecycleConfig,
}

impl LifecycleCoordinator {
    pub fn new(locks: Arc<LockTable>, broker: EventBroker, config: LifecycleConfig) -> Self {
        Self {
            locks,
            broker,
            config,
        }
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn broker(&self) -> &EventBroker {
        &self.broker
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Run an operation whose work reports a single result
    pub async fn run<T, F, Fut>(&self, ctx: &RequestContext, op: Operation, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.guarded(ctx, op, move |_| work(), None).await
    }

    /// Run an operation while polling `poll` for its completion fraction
    /// every progress interval. The highest fraction seen so far is
    /// announced after each poll.
    pub async fn run_polled<T, F, Fut, P, PFut>(
        &self,
        ctx: &RequestContext,
        op: Operation,
        work: F,
        poll: P,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
        P: Fn() -> PFut + Send + Sync + 'static,
        PFut: Future<Output = FabricResult<f64>> + Send + 'static,
    {
        let poller: Poller = Box::new(move || Box::pin(poll()));
        self.guarded(ctx, op, move |_| work(), Some(poller)).await
    }

    /// Run an operation that pushes its own completion fractions
    pub async fn run_streamed<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        op: Operation,
        work: F,
    ) -> Result<T>
    where
        F: FnOnce(Progress) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        self.guarded(ctx, op, work, None).await
    }

    async fn guarded<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        op: Operation,
        work: F,
        poller: Option<Poller>,
    ) -> Result<T>
    where
        F: FnOnce(Progress) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let names: Vec<&str> = op.requires.names.iter().map(String::as_str).collect();
        ctx.authorize(&op.requires.resource, &op.requires.scope, &op.requires.verb, &names)?;

        let guard = self.locks.acquire(op.key.clone(), op.status)?;

        let broker = self.broker.clone();
        let config = self.config.clone();

        let task = tokio::spawn(
            async move { drive(broker, config, op, guard, work, poller).await }
            .in_current_span(),
        );

        match task.await {
            Ok(result) => result,
            Err(err) => Err(ControlError::Internal(format!("lifecycle task failed: {}", err))),
        }
    }
}

async fn drive<T, F, Fut>(
    broker: EventBroker,
    config: LifecycleConfig,
    op: Operation,
    guard: LockGuard,
    work: F,
    poller: Option<Poller>,
) -> Result<T>
where
    F: FnOnce(Progress) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    T: Serialize + Send + 'static,
{
    let mut guard = Some(guard);

    if let Some(action) = &op.pending {
        broker.broadcast(&op.audience, op.resource(action), op.pending_payload.clone());
    }

    let started = Instant::now();
    let (progress, mut progress_rx) = Progress::channel();

    let poll_task = poller.map(|poll| spawn_poller(poll, config.progress_interval, progress.clone()));
    let mut work_task = tokio::spawn(work(progress));

    let wait = async {
        loop {
            tokio::select! {
                biased;

                joined = &mut work_task => break joined,

                Some(fraction) = progress_rx.recv() => {
                    info!(key = %op.key, percent = fraction * 100.0, "Operation progress");
                    broker.broadcast(
                        &op.audience,
                        op.resource("progress"),
                        Some(serde_json::json!({ "percent": fraction })),
                    );
                }
            }
        }
    };

    let joined = match config.operation_timeout {
        Some(limit) => tokio::time::timeout(limit, wait).await.ok(),
        None => Some(wait.await),
    };

    if let Some(poll_task) = poll_task {
        poll_task.abort();
    }

    let outcome = match joined {
        Some(Ok(result)) => result,
        Some(Err(err)) => Err(ControlError::Internal(format!("operation task failed: {}", err))),
        None => {
            // The fabric call keeps running detached and keeps the key locked
            if let Some(held) = guard.take() {
                tokio::spawn(
                    async move {
                        let _ = work_task.await;
                        info!(key = %held.key(), "Detached operation finished, releasing lock");
                        drop(held);
                    }
                    .in_current_span(),
                );
            }

            let after_secs = config.operation_timeout.map(|d| d.as_secs()).unwrap_or_default();
            warn!(key = %op.key, status = %op.status, after_secs, "Stopped waiting for operation");
            Err(ControlError::TimedOut {
                operation: format!("{} {}", op.status, op.key),
                after_secs,
            })
        }
    };

    if op.hold_pending {
        if let Some(min) = config.min_pending {
            let elapsed = started.elapsed();
            if elapsed < min {
                tokio::time::sleep(min - elapsed).await;
            }
        }
    }

    let result = match outcome {
        Ok(value) => {
            let payload = match serde_json::to_value(&value) {
                Ok(serde_json::Value::Null) => None,
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(key = %op.key, error = %err, "Could not encode outcome payload");
                    None
                }
            };

            broker.broadcast(&op.audience, op.resource(&op.succeeded), payload);
            info!(key = %op.key, action = %op.succeeded, "Lifecycle operation completed");
            Ok(value)
        }
        Err(err) => {
            broker.broadcast(&op.audience, op.resource(&op.failed), None);
            error!(key = %op.key, action = %op.failed, error = %err, "Lifecycle operation failed");
            Err(err)
        }
    };

    drop(guard);
    result
}

fn spawn_poller(poll: Poller, interval: Duration, progress: Progress) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(MIN_PROGRESS_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut best = 0.0_f64;

        loop {
            ticker.tick().await;

            match poll().await {
                Ok(fraction) => {
                    best = best.max(fraction);
                    progress.report(best);
                }
                Err(err) => warn!(error = %err, "Progress poll failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::FabricError;
    use phenix_rbac::{PolicySpec, Role, RoleSpec};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn admin() -> RequestContext {
        RequestContext::anonymous_admin()
    }

    fn viewer() -> RequestContext {
        let role = Role::new(RoleSpec::new(
            "viewer",
            vec![PolicySpec::new(["*"], ["*"], ["get", "list"], ["*"])],
        ));
        RequestContext::new("viewer", role)
    }

    fn coordinator(config: LifecycleConfig) -> LifecycleCoordinator {
        LifecycleCoordinator::new(Arc::new(LockTable::new()), EventBroker::new(), config)
    }

    fn start(name: &str) -> Operation {
        Operation::experiment(name, LockStatus::Starting, "experiments/start", "update")
            .pending("starting", None)
    }

    fn drain(sub: &mut crate::broker::Subscription) -> Vec<String> {
        let mut actions = Vec::new();
        while let Some(p) = sub.try_recv() {
            actions.push(p.resource.action.clone());
        }
        actions
    }

    #[tokio::test]
    async fn test_success_announces_and_unlocks() {
        let lc = coordinator(LifecycleConfig::default());
        let mut sub = lc.broker().subscribe("watcher", viewer().role);

        let value = lc
            .run(&admin(), start("exp1"), || async { Ok(serde_json::json!({"name": "exp1"})) })
            .await
            .unwrap();

        assert_eq!(value["name"], "exp1");
        assert!(lc.locks().is_empty());
        assert_eq!(drain(&mut sub), vec!["starting", "start"]);
    }

    #[tokio::test]
    async fn test_failure_announces_error_and_unlocks() {
        let lc = coordinator(LifecycleConfig::default());
        let mut sub = lc.broker().subscribe("watcher", viewer().role);

        let err = lc
            .run(&admin(), start("exp1"), || async {
                Err::<(), ControlError>(FabricError::Failed("boom".into()).into())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::OperationFailed(_)));
        assert!(lc.locks().is_empty());

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].resource.action, "errorStarting");
        assert!(events[1].payload.is_none());
    }

    #[tokio::test]
    async fn test_denied_takes_no_lock_and_announces_nothing() {
        let lc = coordinator(LifecycleConfig::default());
        let mut sub = lc.broker().subscribe("watcher", viewer().role);
        let ran = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&ran);

        let err = lc
            .run(&viewer(), start("exp1"), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::Forbidden { .. }));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(lc.locks().is_empty());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_conflict_announces_nothing() {
        let lc = coordinator(LifecycleConfig::default());
        lc.locks()
            .try_lock(LockKey::experiment("exp1"), LockStatus::Stopping)
            .unwrap();
        let mut sub = lc.broker().subscribe("watcher", viewer().role);

        let err = lc
            .run(&admin(), start("exp1"), || async { Ok(()) })
            .await
            .unwrap_err();

        match err {
            ControlError::Locked { status, .. } => assert_eq!(status, LockStatus::Stopping),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(sub.try_recv().is_none());
        assert_eq!(
            lc.locks().status_of(&LockKey::experiment("exp1")),
            Some(LockStatus::Stopping)
        );
    }

    #[tokio::test]
    async fn test_lock_held_while_running() {
        let lc = coordinator(LifecycleConfig::default());
        let locks = Arc::clone(lc.locks());

        lc.run(&admin(), start("exp1"), move || async move {
            assert_eq!(
                locks.status_of(&LockKey::experiment("exp1")),
                Some(LockStatus::Starting)
            );
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_polled_progress_until_completion() {
        let lc = coordinator(LifecycleConfig {
            progress_interval: Duration::from_secs(2),
            ..Default::default()
        });
        let mut sub = lc.broker().subscribe("watcher", viewer().role);
        let polls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&polls);

        lc.run_polled(
            &admin(),
            start("exp1"),
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(if n == 1 { 0.6 } else { 0.3 }) }
            },
        )
        .await
        .unwrap();

        let events: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
        let actions: Vec<&str> = events.iter().map(|p| p.resource.action.as_str()).collect();

        assert_eq!(actions.first(), Some(&"starting"));
        assert_eq!(actions.last(), Some(&"start"));

        let percents: Vec<f64> = events
            .iter()
            .filter(|p| p.resource.action == "progress")
            .filter_map(|p| p.payload.as_ref()?.get("percent")?.as_f64())
            .collect();
        assert!(percents.len() >= 2);
        // Never regresses below the best value seen
        assert!(percents.windows(2).all(|w| w[1] >= w[0]));
        assert!(lc.locks().is_empty());
    }

    #[tokio::test]
    async fn test_streamed_progress() {
        let lc = coordinator(LifecycleConfig::default());
        let mut sub = lc.broker().subscribe("watcher", viewer().role);

        let op = Operation::vm(
            "exp1",
            "host-01",
            LockStatus::Snapshotting,
            "experiment/vm/snapshot",
            "vms/snapshots",
            "create",
        )
        .pending("creating", None);

        lc.run_streamed(&admin(), op, |progress| async move {
            for step in [0.25, 0.5, 1.0] {
                progress.report(step);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(())
        })
        .await
        .unwrap();

        let actions = drain(&mut sub);
        assert_eq!(actions.first().map(String::as_str), Some("creating"));
        assert_eq!(actions.last().map(String::as_str), Some("create"));
        assert!(actions.iter().filter(|a| *a == "progress").count() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_pending_delays_completion() {
        let lc = coordinator(LifecycleConfig {
            min_pending: Some(Duration::from_secs(5)),
            ..Default::default()
        });

        let op = Operation::vm(
            "exp1",
            "host-01",
            LockStatus::Redeploying,
            "experiment/vm",
            "vms/redeploy",
            "update",
        )
        .pending("redeploying", None)
        .hold_pending();

        let started = Instant::now();
        lc.run(&admin(), op, || async { Ok(()) }).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_lock_until_work_ends() {
        let lc = coordinator(LifecycleConfig {
            operation_timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        });
        let mut sub = lc.broker().subscribe("watcher", viewer().role);
        let finished = Arc::new(AtomicU32::new(0));
        let done = Arc::clone(&finished);

        let err = lc
            .run(&admin(), start("exp1"), move || async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::TimedOut { after_secs: 3, .. }));
        assert_eq!(drain(&mut sub), vec!["starting", "errorStarting"]);

        // A second operation on the same key cannot overlap the detached work
        let key = LockKey::experiment("exp1");
        assert_eq!(lc.locks().status_of(&key), Some(LockStatus::Starting));
        let second = lc.run(&admin(), start("exp1"), || async { Ok(()) }).await;
        assert!(matches!(second, Err(ControlError::Locked { .. })));

        tokio::time::sleep(Duration::from_secs(58)).await;
        while lc.locks().is_locked(&key) {
            tokio::task::yield_now().await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        lc.run(&admin(), start("exp1"), || async { Ok(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_abandoned_request_still_completes() {
        let lc = coordinator(LifecycleConfig::default());
        let mut sub = lc.broker().subscribe("watcher", viewer().role);
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let request = {
            let lc = lc.clone();
            tokio::spawn(async move {
                lc.run(&admin(), start("exp1"), || async move {
                    let _ = release_rx.await;
                    Ok(())
                })
                .await
            })
        };

        // Wait until the operation holds its lock, then abandon the request
        while lc.locks().is_empty() {
            tokio::task::yield_now().await;
        }
        request.abort();
        let _ = release_tx.send(());

        let mut actions = Vec::new();
        while actions.last().map(String::as_str) != Some("start") {
            let publication = tokio::time::timeout(Duration::from_secs(1), sub.recv())
                .await
                .expect("timeout")
                .expect("closed");
            actions.push(publication.resource.action.clone());
        }

        while !lc.locks().is_empty() {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_default_outcomes() {
        let op = Operation::vm(
            "exp1",
            "vm",
            LockStatus::Committing,
            "experiment/vm/commit",
            "vms/commit",
            "create",
        );
        assert_eq!(op.succeeded, "commit");
        assert_eq!(op.failed, "errorCommitting");
        assert_eq!(op.id, "exp1/vm");
        assert_eq!(op.audience.names, vec!["vm".to_string()]);
    }
}
