//! Scheduler backends.
//!
//! A backend turns containers into running units on the cluster, removes
//! them by name, and reports what it observes. The control loop only talks
//! to the [`Backend`] trait; the concrete variant is picked once at startup
//! from [`BackendKind`].
//!
//! Batches are best-effort: every container or name in a call is attempted,
//! and failures are collected into [`BackendError::Batch`].

mod fleet;
mod mock;
pub mod unit;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use flotilla_id::{JobName, MinionId};
use flotilla_reconcile::SpecHash;
use thiserror::Error;

use crate::job::{Container, State};

pub use fleet::FleetBackend;
pub use mock::MockBackend;
pub use unit::{CompileError, UnitFile, UnitOption, UnitTemplate};

/// Observed state of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub name: JobName,

    /// Machine the unit is placed on, once placed.
    pub machine_id: Option<MinionId>,
    pub state: State,

    /// Spec the unit was submitted with, when the backend records it.
    pub spec_hash: Option<SpecHash>,
}

/// A cluster scheduler.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Create or replace a unit per container. Scheduling a name that
    /// already exists replaces it.
    async fn schedule(&self, containers: &[Container]) -> Result<(), BackendError>;

    /// Remove units by name. Unknown names are not an error.
    async fn unschedule(&self, names: &[JobName]) -> Result<(), BackendError>;

    /// Every unit this backend manages.
    async fn container_states(&self) -> Result<Vec<ContainerState>, BackendError>;

    /// Restrict placement to the `eligible` minions.
    ///
    /// Backends that place over their own cluster membership keep the
    /// default, which ignores the set; the reconciler still replaces any
    /// unit it observes on a minion outside it.
    fn set_eligible(&self, _eligible: &BTreeSet<MinionId>) {}
}

/// Which backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Fleet,
    Mock,
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fleet" => Ok(Self::Fleet),
            "mock" | "noop" => Ok(Self::Mock),
            other => Err(BackendError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fleet => f.write_str("fleet"),
            Self::Mock => f.write_str("mock"),
        }
    }
}

/// One failed unit within a batch.
#[derive(Debug)]
pub struct UnitFailure {
    pub name: JobName,
    pub error: BackendError,
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.error)
    }
}

/// Backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("unknown backend '{0}', expected fleet or mock")]
    UnknownKind(String),

    /// Some units of a batch failed; the rest were applied.
    #[error("{} of {attempted} units failed, first: {}", failures.len(), first_message(failures))]
    Batch {
        attempted: usize,
        failures: Vec<UnitFailure>,
    },
}

impl BackendError {
    /// The first failure of a batch.
    pub fn first(&self) -> Option<&UnitFailure> {
        match self {
            Self::Batch { failures, .. } => failures.first(),
            _ => None,
        }
    }

    /// Units that failed, or none if this is not a batch error.
    pub fn failed_units(&self) -> Vec<&JobName> {
        match self {
            Self::Batch { failures, .. } => failures.iter().map(|f| &f.name).collect(),
            _ => Vec::new(),
        }
    }
}

fn first_message(failures: &[UnitFailure]) -> String {
    failures
        .first()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}

/// Turns collected per-unit failures into the batch result.
pub(crate) fn batch_result(
    attempted: usize,
    failures: Vec<UnitFailure>,
) -> Result<(), BackendError> {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(BackendError::Batch {
            attempted,
            failures,
        })
    }
}
