//! Placement reconciler.
//!
//! One pass:
//! 1. Read the current release set and expand it into desired jobs.
//! 2. Read the backend's observed units.
//! 3. Plan creates, replaces (spec drift, displacement, units stranded on
//!    minions that are no longer eligible, restartable failures) and
//!    removes.
//! 4. Apply the plan one job at a time, stopping as soon as leadership is
//!    lost.
//!
//! Per-job backend failures are logged and counted; they never abort the
//! pass. A release set that cannot be read aborts the pass before any
//! action, so missing data is never taken to mean "run nothing".

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use flotilla_coordination::Leadership;
use flotilla_id::{JobName, MinionId};
use flotilla_reconcile::{plan, ConvergencePlan, RetryTracker, SpecHash, DEFAULT_RETRY_WINDOW};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{Backend, BackendError, ContainerState};
use crate::error::{SchedulerError, SchedulerResult};
use crate::formation::expand_release;
use crate::job::{Container, Job, State};
use crate::source::ReleaseSource;

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub apps: usize,
    pub desired: usize,
    pub observed: usize,
    pub created: usize,
    pub replaced: usize,
    pub removed: usize,

    /// Units forced off minions outside the eligible set.
    pub stranded: usize,

    /// Failed units resubmitted.
    pub restarted: usize,

    /// Failed units left alone because their restart budget is spent.
    pub exhausted: usize,

    /// Actions the backend rejected.
    pub failed: usize,
}

impl ReconcileStats {
    /// Actions that succeeded.
    pub fn applied(&self) -> usize {
        self.created + self.replaced + self.removed
    }
}

enum Action<'a> {
    Remove(&'a JobName),
    Replace(&'a Job),
    Create(&'a Job),
}

impl Action<'_> {
    fn name(&self) -> &JobName {
        match self {
            Self::Remove(name) => name,
            Self::Replace(job) | Self::Create(job) => &job.name,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Remove(_) => "remove",
            Self::Replace(_) => "replace",
            Self::Create(_) => "create",
        }
    }
}

struct Restarts {
    tracker: RetryTracker<JobName>,

    /// Units that must be replaced but were not yet, carried across passes.
    pending: BTreeSet<JobName>,
}

/// Converges backend units onto the expanded release set.
pub struct Reconciler {
    backend: Arc<dyn Backend>,
    releases: Arc<dyn ReleaseSource>,
    restarts: Mutex<Restarts>,
}

impl Reconciler {
    /// A reconciler restarting failed units up to `max_restarts` times per
    /// retry window.
    pub fn new(
        backend: Arc<dyn Backend>,
        releases: Arc<dyn ReleaseSource>,
        max_restarts: u32,
    ) -> Self {
        Self::with_retry_window(backend, releases, max_restarts, DEFAULT_RETRY_WINDOW)
    }

    pub fn with_retry_window(
        backend: Arc<dyn Backend>,
        releases: Arc<dyn ReleaseSource>,
        max_restarts: u32,
        window: Duration,
    ) -> Self {
        Self {
            backend,
            releases,
            restarts: Mutex::new(Restarts {
                tracker: RetryTracker::new(max_restarts, window),
                pending: BTreeSet::new(),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    fn restarts(&self) -> MutexGuard<'_, Restarts> {
        self.restarts.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run one pass. `displaced` units are replaced even if their spec is
    /// unchanged.
    ///
    /// With an `eligible` set, placement is restricted to those minions and
    /// any desired unit observed on another minion is replaced. `None`
    /// means eligibility is unknown this pass; placement is left as it was.
    #[instrument(skip_all, fields(session = %leadership.session(), backend = self.backend.name()))]
    pub async fn reconcile(
        &self,
        displaced: &BTreeSet<JobName>,
        eligible: Option<&BTreeSet<MinionId>>,
        leadership: &Leadership,
    ) -> SchedulerResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();

        let releases = self.releases.releases().await?;
        stats.apps = releases.len();

        let desired: BTreeMap<JobName, Job> = releases
            .iter()
            .flat_map(expand_release)
            .map(|job| (job.name.clone(), job))
            .collect();
        stats.desired = desired.len();

        if let Some(eligible) = eligible {
            self.backend.set_eligible(eligible);
        }
        let observed = self.backend.container_states().await?;
        stats.observed = observed.len();

        let (force, restarted) = self.forced(&desired, &observed, displaced, eligible, &mut stats);
        let desired_specs: BTreeMap<JobName, SpecHash> = desired
            .iter()
            .map(|(name, job)| (name.clone(), job.spec_hash()))
            .collect();
        let observed_specs: BTreeMap<JobName, Option<SpecHash>> = observed
            .iter()
            .map(|s| (s.name.clone(), s.spec_hash.clone()))
            .collect();
        let plan = plan(&desired_specs, &observed_specs, &force);
        debug!(
            create = plan.create.len(),
            replace = plan.replace.len(),
            remove = plan.remove.len(),
            unchanged = plan.unchanged.len(),
            "Planned reconciliation"
        );

        for action in actions(&plan, &desired) {
            if leadership.is_lost() {
                warn!(
                    applied = stats.applied(),
                    "Leadership lost, abandoning reconciliation"
                );
                return Err(SchedulerError::Deposed);
            }

            let name = action.name().clone();
            match self.apply(&action).await {
                Ok(()) => {
                    match action {
                        Action::Remove(_) => stats.removed += 1,
                        Action::Replace(_) => {
                            stats.replaced += 1;
                            if restarted.contains(&name) {
                                stats.restarted += 1;
                            }
                        }
                        Action::Create(_) => stats.created += 1,
                    }
                    self.restarts().pending.remove(&name);
                }
                Err(e) => {
                    warn!(job = %name, action = action.kind(), error = %e, "Reconciliation action failed");
                    stats.failed += 1;
                    if matches!(action, Action::Replace(_)) {
                        self.restarts().pending.insert(name);
                    }
                }
            }
        }

        if !plan.status().is_converged() || stats.exhausted > 0 {
            info!(
                apps = stats.apps,
                desired = stats.desired,
                created = stats.created,
                replaced = stats.replaced,
                removed = stats.removed,
                stranded = stats.stranded,
                restarted = stats.restarted,
                exhausted = stats.exhausted,
                failed = stats.failed,
                "Reconciliation pass complete"
            );
        }

        Ok(stats)
    }

    /// Units to replace regardless of spec: displaced ones, ones placed on
    /// ineligible minions, replacements left over from earlier passes, and
    /// failed ones with restarts left. Returns the forced set and the
    /// restartable failures within it.
    fn forced(
        &self,
        desired: &BTreeMap<JobName, Job>,
        observed: &[ContainerState],
        displaced: &BTreeSet<JobName>,
        eligible: Option<&BTreeSet<MinionId>>,
        stats: &mut ReconcileStats,
    ) -> (BTreeSet<JobName>, BTreeSet<JobName>) {
        let mut restarts = self.restarts();
        restarts.tracker.prune();
        restarts.pending.retain(|name| desired.contains_key(name));

        let mut force: BTreeSet<JobName> = displaced.iter().cloned().collect();
        force.extend(restarts.pending.iter().cloned());

        let mut restartable = BTreeSet::new();
        for unit in observed {
            if !desired.contains_key(&unit.name) {
                continue;
            }
            if let (Some(machine), Some(eligible)) = (&unit.machine_id, eligible) {
                if !eligible.contains(machine) && force.insert(unit.name.clone()) {
                    info!(
                        job = %unit.name,
                        minion = %machine,
                        "Unit stranded on ineligible minion"
                    );
                    stats.stranded += 1;
                }
            }
            match unit.state {
                State::Running => restarts.tracker.clear(&unit.name),
                State::Pending => {}
                State::Failed => {
                    if restarts.tracker.is_exhausted(&unit.name) {
                        stats.exhausted += 1;
                        continue;
                    }
                    if restarts.tracker.record_failure(&unit.name) {
                        error!(job = %unit.name, "Unit keeps failing, restarts exhausted");
                        stats.exhausted += 1;
                        continue;
                    }
                    restartable.insert(unit.name.clone());
                }
            }
        }

        force.extend(restartable.iter().cloned());
        (force, restartable)
    }

    async fn apply(&self, action: &Action<'_>) -> Result<(), BackendError> {
        match action {
            Action::Remove(name) => self.backend.unschedule(std::slice::from_ref(*name)).await,
            Action::Create(job) => self.backend.schedule(&[Container::from(*job)]).await,
            Action::Replace(job) => {
                self.backend
                    .unschedule(std::slice::from_ref(&job.name))
                    .await?;
                self.backend.schedule(&[Container::from(*job)]).await
            }
        }
    }
}

/// Orders a plan into actions: removes, then replaces, then creates.
fn actions<'a>(
    plan: &'a ConvergencePlan<JobName>,
    desired: &'a BTreeMap<JobName, Job>,
) -> Vec<Action<'a>> {
    let removes = plan.remove.iter().map(Action::Remove);
    let replaces = plan
        .replace
        .iter()
        .filter_map(|name| desired.get(name))
        .map(Action::Replace);
    let creates = plan
        .create
        .iter()
        .filter_map(|name| desired.get(name))
        .map(Action::Create);

    removes.chain(replaces).chain(creates).collect()
}

#[cfg(test)]
mod tests {
    use flotilla_id::SessionId;

    use super::*;
    use crate::backend::MockBackend;
    use crate::release::Release;
    use crate::source::StaticReleases;

    fn release(app: &str, image_tag: &str, web: u32) -> Release {
        serde_json::from_value(serde_json::json!({
            "version": 1,
            "app": {"id": app},
            "config": {"vars": {"PORT": "8080"}},
            "slug": {
                "image": format!("registry/{app}:{image_tag}"),
                "process_types": {"web": "./bin/web"}
            },
            "formation": {"web": {"count": web}}
        }))
        .unwrap()
    }

    fn name(s: &str) -> JobName {
        JobName::parse(s).unwrap()
    }

    fn minion(s: &str) -> MinionId {
        MinionId::parse(s).unwrap()
    }

    fn setup(releases: Vec<Release>) -> (MockBackend, StaticReleases, Reconciler) {
        let backend = MockBackend::new(vec![minion("m1")]);
        let source = StaticReleases::new(releases);
        let reconciler = Reconciler::new(Arc::new(backend.clone()), Arc::new(source.clone()), 2);
        (backend, source, reconciler)
    }

    fn names(backend: &MockBackend) -> Vec<String> {
        backend
            .containers()
            .iter()
            .map(|c| c.name.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_creates_then_converges() {
        let (backend, _source, reconciler) = setup(vec![release("acme", "v1", 2)]);
        let (_tx, leadership) = Leadership::channel(SessionId::new());

        let stats = reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();
        assert_eq!(stats.created, 2);
        assert_eq!(names(&backend), vec!["acme.web.1", "acme.web.2"]);

        let stats = reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();
        assert_eq!(stats.applied(), 0);
        assert_eq!(backend.submissions(), 2);
    }

    #[tokio::test]
    async fn test_scale_down_and_new_image() {
        let (backend, source, reconciler) = setup(vec![release("acme", "v1", 3)]);
        let (_tx, leadership) = Leadership::channel(SessionId::new());
        reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();

        source.upsert(release("acme", "v2", 1));
        let stats = reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();

        assert_eq!(stats.removed, 2);
        assert_eq!(stats.replaced, 1);
        assert_eq!(names(&backend), vec!["acme.web.1"]);
        assert_eq!(backend.containers()[0].image.tag, "v2");
    }

    #[tokio::test]
    async fn test_displaced_units_replaced() {
        let (backend, _source, reconciler) = setup(vec![release("acme", "v1", 2)]);
        let (_tx, leadership) = Leadership::channel(SessionId::new());
        reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();

        backend.set_machines(vec![minion("m2")]);
        let displaced = BTreeSet::from([name("acme.web.1")]);
        let stats = reconciler
            .reconcile(&displaced, None, &leadership)
            .await
            .unwrap();

        assert_eq!(stats.replaced, 1);
        assert_eq!(
            backend.machine_of(&name("acme.web.1")).unwrap().as_str(),
            "m2"
        );
        assert_eq!(
            backend.machine_of(&name("acme.web.2")).unwrap().as_str(),
            "m1"
        );
    }

    #[tokio::test]
    async fn test_units_on_ineligible_minion_moved() {
        let (backend, _source, reconciler) = setup(vec![release("acme", "v1", 2)]);
        backend.set_machines(vec![minion("m1"), minion("m2")]);
        let (_tx, leadership) = Leadership::channel(SessionId::new());
        reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();
        assert_eq!(backend.machine_of(&name("acme.web.1")), Some(minion("m1")));

        // m1 dropped out of the registry without anyone naming its units.
        let eligible = BTreeSet::from([minion("m2")]);
        let stats = reconciler
            .reconcile(&BTreeSet::new(), Some(&eligible), &leadership)
            .await
            .unwrap();

        assert_eq!(stats.stranded, 1);
        assert_eq!(stats.replaced, 1);
        assert_eq!(backend.machine_of(&name("acme.web.1")), Some(minion("m2")));
        assert_eq!(backend.machine_of(&name("acme.web.2")), Some(minion("m2")));

        let stats = reconciler
            .reconcile(&BTreeSet::new(), Some(&eligible), &leadership)
            .await
            .unwrap();
        assert_eq!(stats.applied(), 0);
    }

    #[tokio::test]
    async fn test_no_eligible_minion_leaves_units_pending() {
        let (backend, _source, reconciler) = setup(vec![release("acme", "v1", 1)]);
        let (_tx, leadership) = Leadership::channel(SessionId::new());
        reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();

        let nobody = BTreeSet::new();
        let stats = reconciler
            .reconcile(&BTreeSet::new(), Some(&nobody), &leadership)
            .await
            .unwrap();
        assert_eq!(stats.stranded, 1);
        assert_eq!(backend.machine_of(&name("acme.web.1")), None);

        // Pending with nowhere to go is not replaced again.
        let stats = reconciler
            .reconcile(&BTreeSet::new(), Some(&nobody), &leadership)
            .await
            .unwrap();
        assert_eq!(stats.applied(), 0);

        let eligible = BTreeSet::from([minion("m1")]);
        reconciler
            .reconcile(&BTreeSet::new(), Some(&eligible), &leadership)
            .await
            .unwrap();
        assert_eq!(backend.machine_of(&name("acme.web.1")), Some(minion("m1")));
    }

    #[tokio::test]
    async fn test_failed_replacement_carried_to_next_pass() {
        let (backend, _source, reconciler) = setup(vec![release("acme", "v1", 1)]);
        let (_tx, leadership) = Leadership::channel(SessionId::new());
        reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();

        backend.set_machines(vec![minion("m2")]);
        backend.fail_unit(&name("acme.web.1"));
        let displaced = BTreeSet::from([name("acme.web.1")]);
        let stats = reconciler
            .reconcile(&displaced, None, &leadership)
            .await
            .unwrap();
        assert_eq!(stats.failed, 1);

        backend.clear_failures();
        let stats = reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();
        assert_eq!(stats.replaced, 1);
        assert_eq!(
            backend.machine_of(&name("acme.web.1")).unwrap().as_str(),
            "m2"
        );
    }

    #[tokio::test]
    async fn test_failed_units_restart_until_exhausted() {
        let (backend, _source, reconciler) = setup(vec![release("acme", "v1", 1)]);
        let (_tx, leadership) = Leadership::channel(SessionId::new());
        reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();

        let mut restarted = 0;
        let mut exhausted = 0;
        for _ in 0..4 {
            backend.set_state(&name("acme.web.1"), State::Failed);
            let stats = reconciler
                .reconcile(&BTreeSet::new(), None, &leadership)
                .await
                .unwrap();
            restarted += stats.restarted;
            exhausted += stats.exhausted;
        }

        assert_eq!(restarted, 2);
        assert_eq!(exhausted, 2);
    }

    #[tokio::test]
    async fn test_per_job_failure_does_not_abort() {
        let (backend, _source, reconciler) = setup(vec![release("acme", "v1", 3)]);
        backend.fail_unit(&name("acme.web.2"));
        let (_tx, leadership) = Leadership::channel(SessionId::new());

        let stats = reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();

        assert_eq!(stats.created, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(names(&backend), vec!["acme.web.1", "acme.web.3"]);
    }

    #[tokio::test]
    async fn test_lost_leadership_stops_pass() {
        let (backend, _source, reconciler) = setup(vec![release("acme", "v1", 2)]);
        let (tx, leadership) = Leadership::channel(SessionId::new());
        tx.send(true).unwrap();

        let err = reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap_err();

        assert!(err.is_deposed());
        assert!(backend.containers().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_releases_refuse_to_act() {
        struct Broken;

        #[async_trait::async_trait]
        impl ReleaseSource for Broken {
            async fn releases(&self) -> Result<Vec<Release>, SchedulerError> {
                Err(SchedulerError::Releases("disk on fire".to_string()))
            }
        }

        let backend = MockBackend::new(vec![minion("m1")]);
        let seeded = Reconciler::new(
            Arc::new(backend.clone()),
            Arc::new(StaticReleases::new(vec![release("acme", "v1", 1)])),
            2,
        );
        let (_tx, leadership) = Leadership::channel(SessionId::new());
        seeded
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap();

        let reconciler = Reconciler::new(Arc::new(backend.clone()), Arc::new(Broken), 2);
        let err = reconciler
            .reconcile(&BTreeSet::new(), None, &leadership)
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::Releases(_)));
        assert_eq!(names(&backend), vec!["acme.web.1"]);
    }
}
