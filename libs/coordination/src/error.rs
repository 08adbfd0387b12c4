//! Coordination errors.

use flotilla_id::MinionId;
use thiserror::Error;

/// Errors returned by lock and registry implementations.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Transport failure talking to the coordination service.
    #[error("coordination request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The coordination service answered with an unexpected status.
    #[error("coordination service returned {status}: {body}")]
    Api { status: u16, body: String },

    /// A response body could not be interpreted.
    #[error("unexpected response from coordination service: {0}")]
    Decode(String),

    /// The coordination service cannot be reached or refused the request.
    #[error("coordination service unavailable: {0}")]
    Unavailable(String),

    /// A heartbeat arrived for a minion the registry does not know.
    #[error("minion {0} is not registered")]
    NotRegistered(MinionId),
}

impl CoordinationError {
    /// Returns true if the caller should register again before retrying.
    pub fn is_not_registered(&self) -> bool {
        matches!(self, Self::NotRegistered(_))
    }
}
