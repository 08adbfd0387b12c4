//! The leader-elected control loop.
//!
//! ```text
//!            acquire ok
//!  Follower ────────────▶ Leader ──┐ tick: reap, then reconcile
//!     ▲  │                  │  ▲   │
//!     │  └─ acquire err:    │  └───┘
//!     │     back off        │
//!     └─────────────────────┘ lock lost: back off
//! ```
//!
//! Only the leader touches the backend or the registry. Ticks run inline
//! in the leader loop and missed ticks are skipped, so two ticks never
//! overlap. Loss of the lock is observed through the [`Leadership`] loss
//! signal, both between ticks and between jobs inside a tick.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use flotilla_coordination::{Leadership, LockService};
use flotilla_id::MinionId;
use flotilla_reconcile::DEFAULT_RECONCILE_INTERVAL;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{SchedulerError, SchedulerResult};
use crate::minion::{MinionRegistry, ReapReport};
use crate::reconciler::{ReconcileStats, Reconciler};

/// Default wait before retrying a failed lock attempt.
pub const DEFAULT_LOCK_RETRY: Duration = Duration::from_secs(5);

/// Role of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Trying to acquire the leader lock.
    Follower,

    /// Holding the lock and running ticks.
    Leader,
}

/// Control loop timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub reconcile_interval: Duration,
    pub lock_retry: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            lock_retry: DEFAULT_LOCK_RETRY,
        }
    }
}

/// Outcome of one leader tick. The two steps fail independently.
#[derive(Debug)]
pub struct TickReport {
    pub reap: SchedulerResult<ReapReport>,
    pub reconcile: SchedulerResult<ReconcileStats>,
}

impl TickReport {
    /// True if either step stopped because leadership was lost.
    pub fn is_deposed(&self) -> bool {
        matches!(&self.reap, Err(e) if e.is_deposed())
            || matches!(&self.reconcile, Err(e) if e.is_deposed())
    }
}

enum LeaderExit {
    Deposed,
    Shutdown,
}

enum LeaderStep {
    Tick,
    Lost,
    Shutdown,
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Contends for leadership and, while leader, reaps and reconciles.
pub struct ControlLoop {
    lock: Arc<dyn LockService>,
    minions: MinionRegistry,
    reconciler: Reconciler,
    config: LoopConfig,
    state: watch::Sender<LoopState>,
}

impl ControlLoop {
    pub fn new(
        lock: Arc<dyn LockService>,
        minions: MinionRegistry,
        reconciler: Reconciler,
        config: LoopConfig,
    ) -> Self {
        let (state, _) = watch::channel(LoopState::Follower);
        Self {
            lock,
            minions,
            reconciler,
            config,
            state,
        }
    }

    /// Watch this instance's role.
    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Run until `shutdown` is set.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            lock_retry_secs = self.config.lock_retry.as_secs(),
            backend = self.reconciler.backend().name(),
            "Starting control loop"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.lock.acquire(shutdown.clone()).await {
                Ok(Some(leadership)) => {
                    info!(session = %leadership.session(), "Acquired leadership");
                    self.set_state(LoopState::Leader);
                    match self.lead(leadership, &mut shutdown).await {
                        LeaderExit::Shutdown => break,
                        // A deposed instance waits one retry interval before
                        // contending again.
                        LeaderExit::Deposed => {
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.lock_retry) => {}
                                _ = shutdown_requested(&mut shutdown) => break,
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_secs = self.config.lock_retry.as_secs(),
                        "Failed to acquire leader lock"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.lock_retry) => {}
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
            }
        }

        info!("Control loop stopped");
    }

    #[instrument(skip_all, fields(session = %leadership.session()))]
    async fn lead(
        &self,
        mut leadership: Leadership,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LeaderExit {
        let mut ticker = tokio::time::interval(self.config.reconcile_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let exit = loop {
            let step = tokio::select! {
                _ = leadership.lost() => LeaderStep::Lost,
                _ = shutdown_requested(shutdown) => LeaderStep::Shutdown,
                _ = ticker.tick() => LeaderStep::Tick,
            };

            match step {
                LeaderStep::Tick => {
                    let report = self.tick(&leadership).await;
                    if report.is_deposed() || leadership.is_lost() {
                        break LeaderExit::Deposed;
                    }
                }
                LeaderStep::Lost => break LeaderExit::Deposed,
                LeaderStep::Shutdown => break LeaderExit::Shutdown,
            }
        };

        if matches!(exit, LeaderExit::Deposed) {
            warn!("Leadership lost, returning to follower");
        }

        // Stop claiming leadership before another instance can take the lock.
        self.set_state(LoopState::Follower);
        if let Err(e) = self.lock.release(leadership).await {
            debug!(error = %e, "Failed to release leader lock");
        } else if matches!(exit, LeaderExit::Shutdown) {
            info!("Released leader lock");
        }

        exit
    }

    /// One leader tick: reap dead minions, then reconcile placement over the
    /// minions still eligible.
    pub async fn tick(&self, leadership: &Leadership) -> TickReport {
        if leadership.is_lost() {
            return TickReport {
                reap: Err(SchedulerError::Deposed),
                reconcile: Err(SchedulerError::Deposed),
            };
        }

        let reap = self
            .minions
            .reap(self.reconciler.backend().as_ref(), leadership)
            .await;
        if reap.as_ref().is_err_and(SchedulerError::is_deposed) {
            return TickReport {
                reap,
                reconcile: Err(SchedulerError::Deposed),
            };
        }
        let displaced = match &reap {
            Ok(report) => report.displaced.clone(),
            Err(e) => {
                error!(error = %e, "Reap failed");
                BTreeSet::new()
            }
        };

        let eligible: Option<BTreeSet<MinionId>> = match self.minions.eligible().await {
            Ok(minions) => Some(minions.into_iter().collect()),
            Err(e) => {
                warn!(error = %e, "Eligible minions unknown, keeping previous placement");
                None
            }
        };

        let reconcile = self
            .reconciler
            .reconcile(&displaced, eligible.as_ref(), leadership)
            .await;
        match &reconcile {
            Ok(stats) => debug!(
                desired = stats.desired,
                observed = stats.observed,
                applied = stats.applied(),
                failed = stats.failed,
                "Tick complete"
            ),
            Err(e) if e.is_deposed() => {}
            Err(e) => error!(error = %e, "Reconciliation failed"),
        }

        TickReport { reap, reconcile }
    }
}
