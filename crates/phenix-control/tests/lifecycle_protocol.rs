//! End-to-end lifecycle protocol against the simulated fabric

use phenix_control::{
    ControlError, ControlPlane, ControlPlaneConfig, InMemoryConfigStore, LifecycleConfig,
    RequestContext, Seed, SimulatedFabric, Subscription,
};
use phenix_rbac::{PolicySpec, Role, RoleSpec};
use phenix_types::{
    CreateExperimentRequest, ExperimentStatus, LockKey, LockStatus, Publication, SnapshotRequest,
    UpdateVmRequest,
};
use std::sync::Arc;
use std::time::Duration;

const SEED: &str = r#"
topologies:
  - name: lab
    vms:
      - name: web
        networks: ["EXP_1"]
      - name: db
        networks: ["EXP_1"]
      - name: cache
        networks: ["EXP_2"]
      - name: proxy
        networks: ["EXP_2"]
hosts:
  - name: compute1
    cpus: 16
  - name: compute2
    cpus: 16
"#;

async fn setup(lifecycle: LifecycleConfig) -> (ControlPlane, Arc<SimulatedFabric>) {
    let seed = Seed::from_yaml(SEED).expect("seed should parse");
    let store = InMemoryConfigStore::from_seed(&seed)
        .await
        .expect("seed should load");
    let fabric = Arc::new(SimulatedFabric::from_seed(&seed).with_step_delay(Duration::from_millis(50)));

    let plane = ControlPlane::new(
        Arc::new(store),
        fabric.clone(),
        ControlPlaneConfig {
            lifecycle,
            ..Default::default()
        },
    );

    let admin = RequestContext::anonymous_admin();
    plane
        .create_experiment(
            &admin,
            CreateExperimentRequest {
                name: "exp1".into(),
                topology: "lab".into(),
                scenario: None,
                vlan_min: 0,
                vlan_max: 0,
            },
        )
        .await
        .expect("experiment should be created");

    (plane, fabric)
}

fn polled() -> LifecycleConfig {
    LifecycleConfig {
        progress_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

fn drain(sub: &mut Subscription) -> Vec<Arc<Publication>> {
    let mut received = Vec::new();
    while let Some(publication) = sub.try_recv() {
        received.push(publication);
    }
    received
}

fn actions(publications: &[Arc<Publication>]) -> Vec<String> {
    publications
        .iter()
        .map(|p| p.resource.action.clone())
        .collect()
}

fn scoped_viewer(user: &str, scope: &str) -> RequestContext {
    RequestContext::new(
        user,
        Role::new(RoleSpec::new(
            "viewer",
            vec![PolicySpec::new(["experiments", "vms"], [scope], ["get", "list"], ["*"])],
        )),
    )
}

#[tokio::test(start_paused = true)]
async fn start_announces_pending_progress_and_outcome() {
    let (plane, _fabric) = setup(polled()).await;
    let admin = RequestContext::anonymous_admin();
    let mut watcher = plane.subscribe(&scoped_viewer("watcher", "exp*"));
    let mut outsider = plane.subscribe(&scoped_viewer("outsider", "other"));

    let exp = plane.start_experiment(&admin, "exp1").await.unwrap();
    assert_eq!(exp.status, ExperimentStatus::Started);
    assert_eq!(exp.vm_count, 4);

    let received = drain(&mut watcher);
    let actions = actions(&received);
    assert_eq!(actions.first().map(String::as_str), Some("starting"));
    assert_eq!(actions.last().map(String::as_str), Some("start"));
    assert!(actions.iter().any(|a| a == "progress"));

    for publication in &received {
        assert_eq!(publication.resource.kind, "experiment");
        assert_eq!(publication.resource.id, "exp1");
        if publication.resource.action == "progress" {
            let percent = publication.payload.as_ref().unwrap()["percent"]
                .as_f64()
                .unwrap();
            assert!((0.0..=1.0).contains(&percent));
        }
    }

    let terminal = received.last().unwrap();
    assert_eq!(terminal.payload.as_ref().unwrap()["status"], "started");

    assert!(drain(&mut outsider).is_empty());
    assert!(!plane.locks().is_locked(&LockKey::experiment("exp1")));
}

#[tokio::test(start_paused = true)]
async fn fabric_failure_announces_error_and_unlocks() {
    let (plane, fabric) = setup(polled()).await;
    let admin = RequestContext::anonymous_admin();
    let mut sub = plane.subscribe(&admin);

    fabric.fail_next("launch", "no capacity");
    let err = plane.start_experiment(&admin, "exp1").await.unwrap_err();
    assert!(matches!(err, ControlError::OperationFailed(_)));

    let received = drain(&mut sub);
    let terminal = received.last().unwrap();
    assert_eq!(terminal.resource.action, "errorStarting");
    assert!(terminal.payload.is_none());

    assert!(plane.locks().is_empty());
    let exp = plane.get_experiment(&admin, "exp1", false).await.unwrap();
    assert_eq!(exp.status, ExperimentStatus::Stopped);

    // The lock is free again, so a retry goes through
    plane.start_experiment(&admin, "exp1").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn concurrent_mutation_is_refused_while_in_flight() {
    let (plane, _fabric) = setup(polled()).await;
    let admin = RequestContext::anonymous_admin();

    let starting = {
        let plane = plane.clone();
        tokio::spawn(async move {
            plane
                .start_experiment(&RequestContext::anonymous_admin(), "exp1")
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;

    let listed = plane.list_experiments(&admin).await.unwrap();
    assert_eq!(listed[0].status, ExperimentStatus::Busy(LockStatus::Starting));

    match plane.stop_experiment(&admin, "exp1").await {
        Err(ControlError::Locked { status, .. }) => assert_eq!(status, LockStatus::Starting),
        other => panic!("expected lock conflict, got {:?}", other),
    }

    starting.await.unwrap().unwrap();
    plane.stop_experiment(&admin, "exp1").await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn definition_edits_wait_out_an_in_flight_start() {
    let (plane, _fabric) = setup(polled()).await;
    let admin = RequestContext::anonymous_admin();
    let before = plane.get_vm(&admin, "exp1", "web").await.unwrap().cpus;

    let starting = {
        let plane = plane.clone();
        tokio::spawn(async move {
            plane
                .start_experiment(&RequestContext::anonymous_admin(), "exp1")
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(60)).await;

    let request = UpdateVmRequest {
        cpus: Some(before + 6),
        ..Default::default()
    };
    match plane.update_vm(&admin, "exp1", "web", request.clone()).await {
        Err(ControlError::Locked { status, .. }) => assert_eq!(status, LockStatus::Starting),
        other => panic!("expected lock conflict, got {:?}", other),
    }
    assert!(matches!(
        plane.delete_vm(&admin, "exp1", "db").await,
        Err(ControlError::Locked { .. })
    ));
    assert!(matches!(
        plane.schedule_experiment(&admin, "exp1", "round-robin").await,
        Err(ControlError::Locked { .. })
    ));

    starting.await.unwrap().unwrap();
    plane.stop_experiment(&admin, "exp1").await.unwrap();

    // The refused edit never reached the stored definition
    assert_eq!(plane.get_vm(&admin, "exp1", "web").await.unwrap().cpus, before);

    let vm = plane.update_vm(&admin, "exp1", "web", request).await.unwrap();
    assert_eq!(vm.cpus, before + 6);
    assert!(plane.locks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn denied_request_takes_no_lock_and_announces_nothing() {
    let (plane, _fabric) = setup(polled()).await;
    let admin = RequestContext::anonymous_admin();
    let mut sub = plane.subscribe(&admin);

    let viewer = scoped_viewer("viewer", "*");
    assert!(matches!(
        plane.start_experiment(&viewer, "exp1").await,
        Err(ControlError::Forbidden { .. })
    ));

    assert!(plane.locks().is_empty());
    assert!(drain(&mut sub).is_empty());
}

#[tokio::test(start_paused = true)]
async fn snapshot_streams_progress_to_vm_audience() {
    let (plane, _fabric) = setup(polled()).await;
    let admin = RequestContext::anonymous_admin();
    plane.start_experiment(&admin, "exp1").await.unwrap();

    let web_only = RequestContext::new(
        "web-viewer",
        Role::new(RoleSpec::new(
            "vm-viewer",
            vec![PolicySpec::new(["vms"], ["*"], ["get"], ["web"])],
        )),
    );
    let mut web_sub = plane.subscribe(&web_only);
    let mut admin_sub = plane.subscribe(&admin);

    plane
        .snapshot_vm(
            &admin,
            "exp1",
            "db",
            SnapshotRequest {
                filename: "db-snap".into(),
            },
        )
        .await
        .unwrap();

    let received = drain(&mut admin_sub);
    let actions = actions(&received);
    assert_eq!(actions.first().map(String::as_str), Some("creating"));
    assert_eq!(actions.last().map(String::as_str), Some("create"));
    assert!(received
        .iter()
        .all(|p| p.resource.kind == "experiment/vm/snapshot" && p.resource.id == "exp1/db"));

    // Completion may overtake the final report
    let percents: Vec<f64> = received
        .iter()
        .filter(|p| p.resource.action == "progress")
        .map(|p| p.payload.as_ref().unwrap()["percent"].as_f64().unwrap())
        .collect();
    assert!(percents.len() >= 3);
    assert!(percents.windows(2).all(|w| w[0] <= w[1]));

    assert!(drain(&mut web_sub).is_empty());
}

#[tokio::test(start_paused = true)]
async fn operation_timeout_holds_lock_until_fabric_finishes() {
    let (plane, _fabric) = setup(LifecycleConfig {
        progress_interval: Duration::from_millis(20),
        operation_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    })
    .await;
    let admin = RequestContext::anonymous_admin();
    let mut sub = plane.subscribe(&admin);

    assert!(matches!(
        plane.start_experiment(&admin, "exp1").await,
        Err(ControlError::TimedOut { .. })
    ));
    assert_eq!(
        drain(&mut sub).last().map(|p| p.resource.action.clone()),
        Some("errorStarting".to_string())
    );

    // The launch keeps running after the caller gave up, so the experiment
    // stays locked against a concurrent stop
    assert_eq!(
        plane.locks().status_of(&LockKey::experiment("exp1")),
        Some(LockStatus::Starting)
    );
    assert!(matches!(
        plane.stop_experiment(&admin, "exp1").await,
        Err(ControlError::Locked { .. })
    ));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(plane.locks().is_empty());
}
