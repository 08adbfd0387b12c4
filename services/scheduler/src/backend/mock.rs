//! In-memory backend for tests and local runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use flotilla_id::{JobName, MinionId};
use tracing::debug;

use super::{batch_result, Backend, BackendError, ContainerState, UnitFailure};
use crate::job::{Container, State};

#[derive(Debug, Clone)]
struct MockUnit {
    container: Container,
    machine: Option<MinionId>,
    state: State,
}

#[derive(Debug, Default)]
struct MockState {
    units: BTreeMap<JobName, MockUnit>,
    machines: Vec<MinionId>,

    /// Minions placement is restricted to, once known.
    eligible: Option<BTreeSet<MinionId>>,
    next_machine: usize,
    failing: BTreeSet<JobName>,
    unavailable: bool,
    submissions: usize,
}

impl MockState {
    fn is_live(&self, machine: &MinionId) -> bool {
        self.machines.contains(machine)
            && self
                .eligible
                .as_ref()
                .map_or(true, |eligible| eligible.contains(machine))
    }

    fn place(&mut self) -> Option<MinionId> {
        let candidates: Vec<&MinionId> =
            self.machines.iter().filter(|m| self.is_live(m)).collect();
        if candidates.is_empty() {
            return None;
        }
        let machine = candidates[self.next_machine % candidates.len()].clone();
        self.next_machine = self.next_machine.wrapping_add(1);
        Some(machine)
    }

    /// Place units still waiting for a machine, the way a cluster picks
    /// pending units up once capacity appears.
    fn place_pending(&mut self) {
        let pending: Vec<JobName> = self
            .units
            .iter()
            .filter(|(_, unit)| unit.machine.is_none())
            .map(|(name, _)| name.clone())
            .collect();

        for name in pending {
            let Some(machine) = self.place() else {
                return;
            };
            debug!(unit = %name, machine = %machine, "Mock pending unit placed");
            if let Some(unit) = self.units.get_mut(&name) {
                unit.machine = Some(machine);
                unit.state = State::Running;
            }
        }
    }

    fn check_available(&self) -> Result<(), BackendError> {
        if self.unavailable {
            return Err(BackendError::Unavailable(
                "mock backend marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_unit(&self, name: &JobName) -> Result<(), BackendError> {
        if self.failing.contains(name) {
            return Err(BackendError::Unavailable(format!("injected failure for {name}")));
        }
        Ok(())
    }
}

/// A backend that keeps units in memory.
///
/// Units are placed round-robin over the configured machines that are also
/// eligible, and reported `Running`; with no such machine they stay
/// `Pending` until one appears. Resubmitting an identical container on a
/// live machine changes nothing.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Backend placing units over `machines`.
    pub fn new(machines: Vec<MinionId>) -> Self {
        let backend = Self::default();
        backend.set_machines(machines);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the set of machines new units may be placed on.
    pub fn set_machines(&self, machines: Vec<MinionId>) {
        self.lock().machines = machines;
    }

    /// Make every call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Make scheduling and unscheduling `name` fail.
    pub fn fail_unit(&self, name: &JobName) {
        self.lock().failing.insert(name.clone());
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    /// Override the observed state of a unit.
    pub fn set_state(&self, name: &JobName, state: State) {
        if let Some(unit) = self.lock().units.get_mut(name) {
            unit.state = state;
        }
    }

    /// Scheduled containers, ordered by name.
    pub fn containers(&self) -> Vec<Container> {
        self.lock()
            .units
            .values()
            .map(|u| u.container.clone())
            .collect()
    }

    /// Machine a unit is placed on.
    pub fn machine_of(&self, name: &JobName) -> Option<MinionId> {
        self.lock().units.get(name).and_then(|u| u.machine.clone())
    }

    /// Number of units actually (re)submitted so far.
    pub fn submissions(&self) -> usize {
        self.lock().submissions
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn set_eligible(&self, eligible: &BTreeSet<MinionId>) {
        let mut state = self.lock();
        state.eligible = Some(eligible.clone());
        state.place_pending();
    }

    async fn schedule(&self, containers: &[Container]) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.check_available()?;

        let mut failures = Vec::new();
        for container in containers {
            if let Err(error) = state.check_unit(&container.name) {
                failures.push(UnitFailure {
                    name: container.name.clone(),
                    error,
                });
                continue;
            }

            let unchanged = state.units.get(&container.name).is_some_and(|unit| {
                unit.container == *container
                    && unit.machine.as_ref().is_some_and(|m| state.is_live(m))
            });
            if unchanged {
                continue;
            }

            let machine = state.place();
            let unit_state = if machine.is_some() {
                State::Running
            } else {
                State::Pending
            };
            debug!(unit = %container.name, machine = ?machine, "Mock unit placed");
            state.units.insert(
                container.name.clone(),
                MockUnit {
                    container: container.clone(),
                    machine,
                    state: unit_state,
                },
            );
            state.submissions += 1;
        }

        batch_result(containers.len(), failures)
    }

    async fn unschedule(&self, names: &[JobName]) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.check_available()?;

        let mut failures = Vec::new();
        for name in names {
            match state.check_unit(name) {
                Ok(()) => {
                    state.units.remove(name);
                }
                Err(error) => failures.push(UnitFailure {
                    name: name.clone(),
                    error,
                }),
            }
        }

        batch_result(names.len(), failures)
    }

    async fn container_states(&self) -> Result<Vec<ContainerState>, BackendError> {
        let state = self.lock();
        state.check_available()?;

        Ok(state
            .units
            .iter()
            .map(|(name, unit)| ContainerState {
                name: name.clone(),
                machine_id: unit.machine.clone(),
                state: unit.state,
                spec_hash: Some(unit.container.spec_hash()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::release::Image;

    fn minion(s: &str) -> MinionId {
        MinionId::parse(s).unwrap()
    }

    fn name(s: &str) -> JobName {
        JobName::parse(s).unwrap()
    }

    fn container(name: &str) -> Container {
        Container {
            name: JobName::parse(name).unwrap(),
            image: Image::new("registry/acme", "v1"),
            command: "./bin/web".to_string(),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_schedule_twice_is_idempotent() {
        let backend = MockBackend::new(vec![minion("m1"), minion("m2")]);
        let batch = vec![container("acme.web.1"), container("acme.web.2")];

        backend.schedule(&batch).await.unwrap();
        let once = backend.container_states().await.unwrap();
        backend.schedule(&batch).await.unwrap();
        let twice = backend.container_states().await.unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.len(), 2);
        assert_eq!(backend.submissions(), 2);
    }

    #[tokio::test]
    async fn test_round_robin_placement() {
        let backend = MockBackend::new(vec![minion("m1"), minion("m2")]);
        backend
            .schedule(&[
                container("acme.web.1"),
                container("acme.web.2"),
                container("acme.web.3"),
            ])
            .await
            .unwrap();

        let machines: Vec<String> = backend
            .container_states()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.machine_id.unwrap().to_string())
            .collect();
        assert_eq!(machines, vec!["m1", "m2", "m1"]);
    }

    #[tokio::test]
    async fn test_replace_moves_off_removed_machine() {
        let backend = MockBackend::new(vec![minion("m1")]);
        let c = container("acme.web.1");
        backend.schedule(std::slice::from_ref(&c)).await.unwrap();

        backend.set_machines(vec![minion("m2")]);
        backend.schedule(std::slice::from_ref(&c)).await.unwrap();

        assert_eq!(backend.machine_of(&c.name), Some(minion("m2")));
    }

    #[tokio::test]
    async fn test_placement_skips_ineligible_machines() {
        let backend = MockBackend::new(vec![minion("m1"), minion("m2")]);
        backend.set_eligible(&BTreeSet::from([minion("m2")]));

        backend
            .schedule(&[container("acme.web.1"), container("acme.web.2")])
            .await
            .unwrap();

        assert_eq!(backend.machine_of(&name("acme.web.1")), Some(minion("m2")));
        assert_eq!(backend.machine_of(&name("acme.web.2")), Some(minion("m2")));
    }

    #[tokio::test]
    async fn test_resubmit_leaves_ineligible_machine() {
        let backend = MockBackend::new(vec![minion("m1"), minion("m2")]);
        let c = container("acme.web.1");
        backend.schedule(std::slice::from_ref(&c)).await.unwrap();
        assert_eq!(backend.machine_of(&c.name), Some(minion("m1")));

        backend.set_eligible(&BTreeSet::from([minion("m2")]));
        backend.schedule(std::slice::from_ref(&c)).await.unwrap();

        assert_eq!(backend.machine_of(&c.name), Some(minion("m2")));
    }

    #[tokio::test]
    async fn test_pending_units_placed_once_eligible() {
        let backend = MockBackend::new(vec![minion("m1")]);
        backend.set_eligible(&BTreeSet::new());
        backend.schedule(&[container("acme.web.1")]).await.unwrap();
        assert_eq!(backend.machine_of(&name("acme.web.1")), None);

        backend.set_eligible(&BTreeSet::from([minion("m1")]));

        let states = backend.container_states().await.unwrap();
        assert_eq!(states[0].machine_id, Some(minion("m1")));
        assert_eq!(states[0].state, State::Running);
        assert_eq!(backend.submissions(), 1);
    }

    #[tokio::test]
    async fn test_no_machines_stays_pending() {
        let backend = MockBackend::default();
        backend.schedule(&[container("acme.web.1")]).await.unwrap();

        let states = backend.container_states().await.unwrap();
        assert_eq!(states[0].state, State::Pending);
        assert_eq!(states[0].machine_id, None);
    }

    #[tokio::test]
    async fn test_injected_failure_is_best_effort() {
        let backend = MockBackend::new(vec![minion("m1")]);
        let failing = JobName::parse("acme.web.1").unwrap();
        backend.fail_unit(&failing);

        let err = backend
            .schedule(&[container("acme.web.1"), container("acme.web.2")])
            .await
            .unwrap_err();

        assert_eq!(err.first().unwrap().name, failing);
        assert_eq!(backend.containers().len(), 1);
    }

    #[tokio::test]
    async fn test_unschedule_unknown_is_ok() {
        let backend = MockBackend::default();
        backend
            .unschedule(&[JobName::parse("acme.web.9").unwrap()])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unavailable() {
        let backend = MockBackend::default();
        backend.set_unavailable(true);
        assert!(matches!(
            backend.container_states().await,
            Err(BackendError::Unavailable(_))
        ));
    }
}
