//! In-process coordinator.
//!
//! Provides one leader lock and a TTL registry inside a single process.
//! Contenders get their own [`MemoryLock`] handle (their own session) from
//! a shared [`InMemoryCoordinator`]. Time is measured with
//! `tokio::time::Instant`, so tests can pause and advance the clock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_id::{MinionId, SessionId};
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::lock::stopped;
use crate::{CoordinationError, HealthCheck, Leadership, LockService, Registration, Registry};

struct Holder {
    session: SessionId,
    lost: watch::Sender<bool>,
}

struct MinionEntry {
    service: String,
    ttl: Duration,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
}

impl MinionEntry {
    fn healthy(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) <= self.ttl
    }
}

#[derive(Default)]
struct Inner {
    holder: Mutex<Option<Holder>>,
    released: Notify,
    minions: Mutex<BTreeMap<MinionId, MinionEntry>>,
    unavailable: AtomicBool,
}

impl Inner {
    fn check_available(&self) -> Result<(), CoordinationError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinationError::Unavailable(
                "in-memory coordinator marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn holder(&self) -> MutexGuard<'_, Option<Holder>> {
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn minions(&self) -> MutexGuard<'_, BTreeMap<MinionId, MinionEntry>> {
        self.minions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Process-local coordination service.
#[derive(Clone, Default)]
pub struct InMemoryCoordinator {
    inner: Arc<Inner>,
}

impl InMemoryCoordinator {
    /// Create an empty coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A new lock contender with its own session.
    pub fn contender(&self) -> MemoryLock {
        MemoryLock {
            inner: Arc::clone(&self.inner),
            session: SessionId::new(),
        }
    }

    /// The session currently holding the lock.
    pub fn leader(&self) -> Option<SessionId> {
        self.inner.holder().as_ref().map(|h| h.session)
    }

    /// Revoke the current holder's lock, as a session expiry or network
    /// partition would. Returns the deposed session.
    pub fn revoke(&self) -> Option<SessionId> {
        let holder = self.inner.holder().take()?;
        info!(session = %holder.session, "Revoking leader lock");
        let _ = holder.lost.send(true);
        self.inner.released.notify_waiters();
        Some(holder.session)
    }

    /// Make every lock and registry call fail until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Registry for InMemoryCoordinator {
    async fn register(&self, registration: &Registration) -> Result<(), CoordinationError> {
        self.inner.check_available()?;

        let entry = MinionEntry {
            service: registration.service.clone(),
            ttl: registration.ttl,
            last_seen: Instant::now(),
            last_seen_at: Utc::now(),
        };
        let previous = self
            .inner
            .minions()
            .insert(registration.minion.clone(), entry);

        debug!(
            minion = %registration.minion,
            service = %registration.service,
            reregistered = previous.is_some(),
            "Minion registered"
        );
        Ok(())
    }

    async fn heartbeat(&self, minion: &MinionId) -> Result<(), CoordinationError> {
        self.inner.check_available()?;

        let mut minions = self.inner.minions();
        let entry = minions
            .get_mut(minion)
            .ok_or_else(|| CoordinationError::NotRegistered(minion.clone()))?;
        entry.last_seen = Instant::now();
        entry.last_seen_at = Utc::now();
        Ok(())
    }

    async fn deregister(&self, minion: &MinionId) -> Result<(), CoordinationError> {
        self.inner.check_available()?;
        self.inner.minions().remove(minion);
        Ok(())
    }

    async fn checks(&self, service: &str) -> Result<Vec<HealthCheck>, CoordinationError> {
        self.inner.check_available()?;

        let now = Instant::now();
        let checks = self
            .inner
            .minions()
            .iter()
            .filter(|(_, entry)| entry.service == service)
            .map(|(minion, entry)| HealthCheck {
                minion: minion.clone(),
                healthy: entry.healthy(now),
                last_heartbeat: Some(entry.last_seen_at),
            })
            .collect();
        Ok(checks)
    }
}

/// One contender for the in-memory leader lock.
pub struct MemoryLock {
    inner: Arc<Inner>,
    session: SessionId,
}

impl MemoryLock {
    /// This contender's session.
    pub fn session(&self) -> SessionId {
        self.session
    }

    fn try_acquire(&self) -> Option<Leadership> {
        let mut holder = self.inner.holder();
        if holder.is_some() {
            return None;
        }

        let (lost, leadership) = Leadership::channel(self.session);
        *holder = Some(Holder {
            session: self.session,
            lost,
        });
        Some(leadership)
    }
}

#[async_trait]
impl LockService for MemoryLock {
    async fn acquire(
        &self,
        mut stop: watch::Receiver<bool>,
    ) -> Result<Option<Leadership>, CoordinationError> {
        loop {
            if *stop.borrow() {
                return Ok(None);
            }
            self.inner.check_available()?;

            // Register for wake-ups before looking, so a release between the
            // check and the await is not missed.
            let released = self.inner.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(leadership) = self.try_acquire() {
                debug!(session = %self.session, "Acquired in-memory leader lock");
                return Ok(Some(leadership));
            }

            tokio::select! {
                _ = &mut released => {}
                _ = stopped(&mut stop) => return Ok(None),
            }
        }
    }

    async fn release(&self, leadership: Leadership) -> Result<(), CoordinationError> {
        let mut holder = self.inner.holder();
        if holder
            .as_ref()
            .is_some_and(|h| h.session == leadership.session())
        {
            *holder = None;
            drop(holder);
            debug!(session = %self.session, "Released in-memory leader lock");
            self.inner.released.notify_waiters();
        }
        Ok(())
    }
}
