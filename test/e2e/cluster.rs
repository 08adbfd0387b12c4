//! End-to-end cluster test.
//!
//! Two scheduler instances and two minion agents share one in-memory
//! coordinator and a mock backend, and the release set is read from disk.
//! The test walks through:
//!
//! 1. Initial convergence of a formation
//! 2. Scaling up by rewriting the release file
//! 3. A minion crashing and its units moving to the survivor
//! 4. A leader handover that causes no unit churn
//!
//! ## Running
//!
//! ```bash
//! cargo test -p flotilla-e2e --test cluster
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use flotilla_coordination::memory::InMemoryCoordinator;
use flotilla_coordination::{CoordinationError, Registration, Registry};
use flotilla_id::{JobName, MinionId};
use flotilla_minion::Heartbeat;
use flotilla_scheduler::backend::MockBackend;
use flotilla_scheduler::{
    ControlLoop, FileReleases, LoopConfig, LoopState, MinionRegistry, Reconciler,
};
use flotilla_testing::{unique_suffix, wait_until};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const SERVICE: &str = "flotilla-minions";

fn minion(s: &str) -> MinionId {
    MinionId::parse(s).unwrap()
}

/// Atomically replace the release file.
async fn write_releases(path: &Path, web: u32, worker: u32) {
    let body = serde_json::json!([{
        "version": web + worker,
        "app": {"id": "acme"},
        "config": {"vars": {"PORT": "8080"}},
        "slug": {
            "image": "registry.local:5000/acme:v1",
            "process_types": {"web": "./bin/web", "worker": "./bin/worker"}
        },
        "formation": {"web": {"count": web}, "worker": {"count": worker}}
    }]);
    let staging = path.with_extension("tmp");
    tokio::fs::write(&staging, serde_json::to_vec(&body).unwrap())
        .await
        .unwrap();
    tokio::fs::rename(&staging, path).await.unwrap();
}

struct Agent {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<Result<(), CoordinationError>>,
}

fn start_agent(coordinator: &InMemoryCoordinator, id: &str) -> Agent {
    let heartbeat = Heartbeat::new(
        Arc::new(coordinator.clone()),
        Registration {
            service: SERVICE.to_string(),
            minion: minion(id),
            ttl: Duration::from_millis(300),
        },
        Duration::from_millis(50),
    );
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { heartbeat.run(rx).await });
    Agent { shutdown, handle }
}

struct Scheduler {
    state: watch::Receiver<LoopState>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

fn start_scheduler(
    coordinator: &InMemoryCoordinator,
    backend: &MockBackend,
    releases: &Path,
) -> Scheduler {
    let control = ControlLoop::new(
        Arc::new(coordinator.contender()),
        MinionRegistry::new(Arc::new(coordinator.clone()), SERVICE),
        Reconciler::new(
            Arc::new(backend.clone()),
            Arc::new(FileReleases::new(releases)),
            3,
        ),
        LoopConfig {
            reconcile_interval: Duration::from_millis(30),
            lock_retry: Duration::from_millis(50),
        },
    );
    let state = control.subscribe();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { control.run(rx).await });
    Scheduler {
        state,
        shutdown,
        handle,
    }
}

fn leader_count(schedulers: &[Scheduler]) -> usize {
    schedulers
        .iter()
        .filter(|s| *s.state.borrow() == LoopState::Leader)
        .count()
}

fn all_on(backend: &MockBackend, machine: &MinionId) -> bool {
    backend
        .containers()
        .iter()
        .all(|c| backend.machine_of(&c.name).as_ref() == Some(machine))
}

#[tokio::test]
async fn test_cluster_lifecycle() {
    let releases = std::env::temp_dir().join(format!("flotilla-e2e-{}.json", unique_suffix()));
    write_releases(&releases, 2, 1).await;

    let coordinator = InMemoryCoordinator::new();
    let backend = MockBackend::new(vec![minion("m1"), minion("m2")]);
    let m1 = start_agent(&coordinator, "m1");
    let m2 = start_agent(&coordinator, "m2");
    let schedulers: Vec<Scheduler> = (0..2)
        .map(|_| start_scheduler(&coordinator, &backend, &releases))
        .collect();

    // 1. Converge.
    let units = &backend;
    assert!(
        wait_until(Duration::from_secs(5), move || async move {
            units.containers().len() == 3
        })
        .await,
        "initial formation never converged"
    );
    assert_eq!(leader_count(&schedulers), 1);
    let names: Vec<String> = backend
        .containers()
        .iter()
        .map(|c| c.name.to_string())
        .collect();
    assert_eq!(names, vec!["acme.web.1", "acme.web.2", "acme.worker.1"]);

    // 2. Scale web to three.
    write_releases(&releases, 3, 1).await;
    assert!(
        wait_until(Duration::from_secs(5), move || async move {
            units.containers().len() == 4
        })
        .await,
        "scale-up never applied"
    );

    // 3. m1 crashes without deregistering. The backend still lists it as a
    // machine; only the registry knows it is gone.
    m1.handle.abort();
    let survivor = minion("m2");
    let target = &survivor;
    assert!(
        wait_until(Duration::from_secs(5), move || async move {
            units.containers().len() == 4 && all_on(units, target)
        })
        .await,
        "units were not moved off the dead minion"
    );
    let registry = &coordinator;
    assert!(
        wait_until(Duration::from_secs(5), move || async move {
            let checks = registry.checks(SERVICE).await.unwrap();
            checks.len() == 1 && checks[0].minion == minion("m2") && checks[0].healthy
        })
        .await,
        "dead minion was not reaped"
    );

    // 4. Handover: the new leader finds nothing to do.
    let before = backend.submissions();
    coordinator.revoke();
    let contenders = &schedulers;
    assert!(
        wait_until(Duration::from_secs(5), move || async move {
            registry.leader().is_some() && leader_count(contenders) == 1
        })
        .await,
        "no leader after revocation"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.submissions(), before);
    assert_eq!(backend.containers().len(), 4);
    assert!(backend
        .machine_of(&JobName::parse("acme.web.3").unwrap())
        .is_some());

    for scheduler in schedulers {
        scheduler.shutdown.send(true).unwrap();
        scheduler.handle.await.unwrap();
    }
    m2.shutdown.send(true).unwrap();
    m2.handle.await.unwrap().unwrap();
    assert!(coordinator.checks(SERVICE).await.unwrap().is_empty());
    assert_eq!(coordinator.leader(), None);

    let _ = tokio::fs::remove_file(&releases).await;
}
