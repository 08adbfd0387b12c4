//! Leader lock contract.

use async_trait::async_trait;
use flotilla_id::SessionId;
use tokio::sync::watch;

use crate::CoordinationError;

/// Proof of current leadership.
///
/// The loss signal is driven by the lock implementation: it flips to `true`
/// (or its sender is dropped) when the coordination service revokes or
/// expires the lock. Holders check [`Leadership::is_lost`] at safe points
/// and may await [`Leadership::lost`] while idle.
#[derive(Debug)]
pub struct Leadership {
    session: SessionId,
    lost: watch::Receiver<bool>,
}

impl Leadership {
    /// Wraps a loss signal for `session`.
    pub fn new(session: SessionId, lost: watch::Receiver<bool>) -> Self {
        Self { session, lost }
    }

    /// Creates a leadership together with the sender that revokes it.
    pub fn channel(session: SessionId) -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self::new(session, rx))
    }

    /// The session holding the lock.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Non-blocking check, used between units of work.
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow() || self.lost.has_changed().is_err()
    }

    /// Resolves once leadership has been lost.
    pub async fn lost(&mut self) {
        loop {
            if *self.lost.borrow_and_update() {
                return;
            }
            if self.lost.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A named, cluster-wide mutual-exclusion lock.
///
/// Each contender owns its own `LockService` value (its own coordination
/// session); at most one contender holds the lock at a time.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Block until the lock is held, `stop` fires, or the attempt fails.
    ///
    /// Returns `Ok(None)` when stopped before acquiring. There is no
    /// timeout; callers back off on `Err` themselves.
    async fn acquire(
        &self,
        stop: watch::Receiver<bool>,
    ) -> Result<Option<Leadership>, CoordinationError>;

    /// Give the lock up. Releasing a lock that was already lost is not an error.
    async fn release(&self, leadership: Leadership) -> Result<(), CoordinationError>;
}

/// Waits until `stop` is set or its sender goes away.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}
