//! Scheduler errors.

use flotilla_coordination::CoordinationError;
use thiserror::Error;

use crate::backend::BackendError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors surfaced by the reaper, the reconciler and the control loop.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The release set could not be read; nothing may be acted on.
    #[error("release set unavailable: {0}")]
    Releases(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Leadership was lost part-way through a pass.
    #[error("leadership lost")]
    Deposed,
}

impl SchedulerError {
    /// Returns true if the pass stopped because leadership was lost.
    pub fn is_deposed(&self) -> bool {
        matches!(self, Self::Deposed)
    }
}
