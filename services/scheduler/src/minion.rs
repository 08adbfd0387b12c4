//! Scheduler-side view of the minion registry.
//!
//! Minions register and heartbeat themselves; the scheduler only reads
//! their health and reaps the ones whose check has expired. Reaping
//! deregisters the minion, which takes it out of the eligible pool, and
//! reports the units the backend still places on it so the same tick's
//! reconciliation can move them.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use flotilla_coordination::{HealthCheck, Leadership, Registry};
use flotilla_id::{JobName, MinionId};
use tracing::{info, instrument, warn};

use crate::backend::Backend;
use crate::error::{SchedulerError, SchedulerResult};

/// Outcome of one reap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Minions deregistered.
    pub reaped: Vec<MinionId>,

    /// Units that were placed on reaped minions.
    pub displaced: BTreeSet<JobName>,

    /// Expired minions whose deregistration failed; retried next tick.
    pub failed: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.reaped.is_empty() && self.displaced.is_empty() && self.failed == 0
    }
}

/// Health queries and reaping over a [`Registry`].
#[derive(Clone)]
pub struct MinionRegistry {
    registry: Arc<dyn Registry>,
    service: String,

    /// Reaped minions whose units have not been collected yet.
    unswept: Arc<Mutex<BTreeSet<MinionId>>>,
}

impl MinionRegistry {
    pub fn new(registry: Arc<dyn Registry>, service: impl Into<String>) -> Self {
        Self {
            registry,
            service: service.into(),
            unswept: Arc::default(),
        }
    }

    /// Well-known service minions register under.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn unswept(&self) -> MutexGuard<'_, BTreeSet<MinionId>> {
        self.unswept.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn checks(&self) -> SchedulerResult<Vec<HealthCheck>> {
        Ok(self.registry.checks(&self.service).await?)
    }

    /// Minions eligible to receive units.
    pub async fn eligible(&self) -> SchedulerResult<Vec<MinionId>> {
        Ok(self
            .checks()
            .await?
            .into_iter()
            .filter(|c| c.healthy)
            .map(|c| c.minion)
            .collect())
    }

    /// Minions whose check has expired.
    pub async fn expired(&self) -> SchedulerResult<Vec<MinionId>> {
        Ok(self
            .checks()
            .await?
            .into_iter()
            .filter(|c| !c.healthy)
            .map(|c| c.minion)
            .collect())
    }

    /// Deregister every expired minion and collect the units placed on them.
    ///
    /// A minion that fails to deregister is skipped and counted; the others
    /// are still reaped. Units on a minion are reported as displaced only
    /// once it is gone. If the backend cannot be read, the reaped minions
    /// are swept again on the next call. Leadership is checked before each
    /// deregistration; once it is lost the reap stops with
    /// [`SchedulerError::Deposed`].
    #[instrument(skip_all, fields(service = %self.service))]
    pub async fn reap(
        &self,
        backend: &dyn Backend,
        leadership: &Leadership,
    ) -> SchedulerResult<ReapReport> {
        let expired = self.expired().await?;

        let mut report = ReapReport::default();
        for minion in expired {
            if leadership.is_lost() {
                warn!(
                    reaped = report.reaped.len(),
                    "Leadership lost, abandoning reap"
                );
                self.unswept().extend(report.reaped);
                return Err(SchedulerError::Deposed);
            }
            match self.registry.deregister(&minion).await {
                Ok(()) => {
                    info!(minion = %minion, "Reaped dead minion");
                    report.reaped.push(minion);
                }
                Err(e) => {
                    warn!(minion = %minion, error = %e, "Failed to deregister dead minion");
                    report.failed += 1;
                }
            }
        }

        let mut gone = std::mem::take(&mut *self.unswept());
        gone.extend(report.reaped.iter().cloned());
        if gone.is_empty() {
            return Ok(report);
        }

        let states = match backend.container_states().await {
            Ok(states) => states,
            Err(e) => {
                self.unswept().extend(gone);
                return Err(e.into());
            }
        };
        report.displaced = states
            .into_iter()
            .filter(|s| s.machine_id.as_ref().is_some_and(|m| gone.contains(m)))
            .map(|s| s.name)
            .collect();

        if !report.displaced.is_empty() {
            info!(
                reaped = report.reaped.len(),
                displaced = report.displaced.len(),
                "Units displaced from reaped minions"
            );
        }

        Ok(report)
    }
}
