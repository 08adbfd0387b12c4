//! Heartbeat loop keeping this minion's check alive.
//!
//! The first tick registers the minion; later ticks heartbeat. A registry
//! that no longer knows the minion (it was reaped, or the coordination
//! agent restarted) answers `NotRegistered`, and the loop registers again
//! under the same service name. Other failures are retried on the next
//! tick. On shutdown the minion deregisters.

use std::sync::Arc;
use std::time::Duration;

use flotilla_coordination::{CoordinationError, Registration, Registry};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Consecutive failures logged as warnings before escalating to errors.
const WARN_FAILURES: u32 = 3;

/// Registers a minion and keeps its check passing.
pub struct Heartbeat {
    registry: Arc<dyn Registry>,
    registration: Registration,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(registry: Arc<dyn Registry>, registration: Registration, interval: Duration) -> Self {
        Self {
            registry,
            registration,
            interval,
        }
    }

    /// Run until `shutdown` is set, then deregister.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), CoordinationError> {
        info!(
            minion = %self.registration.minion,
            service = %self.registration.service,
            interval_secs = self.interval.as_secs(),
            ttl_secs = self.registration.ttl.as_secs(),
            "Starting heartbeat loop"
        );

        let mut registered = false;
        let mut consecutive_failures = 0u32;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.beat(&mut registered).await {
                        Ok(()) => {
                            if consecutive_failures > 0 {
                                info!(consecutive_failures, "Heartbeat recovered");
                            }
                            consecutive_failures = 0;
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= WARN_FAILURES {
                                warn!(error = %e, consecutive_failures, "Heartbeat failed");
                            } else {
                                error!(
                                    error = %e,
                                    consecutive_failures,
                                    "Heartbeat failed repeatedly"
                                );
                            }
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Heartbeat loop shutting down");
                        break;
                    }
                }
            }
        }

        self.registry.deregister(&self.registration.minion).await?;
        info!(minion = %self.registration.minion, "Deregistered");
        Ok(())
    }

    async fn beat(&self, registered: &mut bool) -> Result<(), CoordinationError> {
        if !*registered {
            self.registry.register(&self.registration).await?;
            *registered = true;
            info!(minion = %self.registration.minion, "Registered");
            return Ok(());
        }

        match self.registry.heartbeat(&self.registration.minion).await {
            Err(e) if e.is_not_registered() => {
                warn!(minion = %self.registration.minion, "Registry lost this minion, re-registering");
                *registered = false;
                self.registry.register(&self.registration).await?;
                *registered = true;
                Ok(())
            }
            Err(e) => Err(e),
            Ok(()) => {
                debug!("Heartbeat acknowledged");
                Ok(())
            }
        }
    }
}
