//! Minion registration contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flotilla_id::MinionId;
use serde::{Deserialize, Serialize};

use crate::CoordinationError;

/// A minion's registration under the well-known minion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Well-known service name shared by all minions.
    pub service: String,

    /// The registering minion.
    pub minion: MinionId,

    /// How long the check stays healthy without a heartbeat.
    pub ttl: Duration,
}

/// Liveness of one registered minion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub minion: MinionId,
    pub healthy: bool,

    /// Last heartbeat, when the registry tracks it.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Minion registration service.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Register (or re-register) a minion. Idempotent; registering counts as
    /// a heartbeat.
    async fn register(&self, registration: &Registration) -> Result<(), CoordinationError>;

    /// Report that a minion is still alive.
    ///
    /// Fails with [`CoordinationError::NotRegistered`] if the registry does
    /// not know the minion (for example after it was reaped).
    async fn heartbeat(&self, minion: &MinionId) -> Result<(), CoordinationError>;

    /// Remove a minion. Removing an unknown minion succeeds.
    async fn deregister(&self, minion: &MinionId) -> Result<(), CoordinationError>;

    /// Health of every minion registered under `service`.
    async fn checks(&self, service: &str) -> Result<Vec<HealthCheck>, CoordinationError>;
}
