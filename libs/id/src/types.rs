//! Typed ID definitions.
//!
//! Labels that take part in a [`JobName`](crate::JobName) are restricted to
//! `[A-Za-z0-9_-]` so the `.` separator stays unambiguous.

use crate::{define_id, define_label, IdError};

/// Maximum length of a name segment (app id or process type).
pub const MAX_SEGMENT_LEN: usize = 63;

// =============================================================================
// Labels
// =============================================================================

define_label!(AppId, "app id", validate_segment);
define_label!(ProcessType, "process type", validate_segment);
define_label!(MinionId, "minion id", validate_minion);

// =============================================================================
// Generated IDs
// =============================================================================

// One per control-loop process, for the lifetime of its coordination session.
define_id!(SessionId, "sess");

pub(crate) fn validate_segment(kind: &'static str, s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    if s.len() > MAX_SEGMENT_LEN {
        return Err(IdError::format(
            kind,
            format!("'{s}' is longer than {MAX_SEGMENT_LEN} characters"),
        ));
    }

    if let Some(c) = s
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(IdError::format(
            kind,
            format!("'{s}' contains invalid character {c:?}"),
        ));
    }

    Ok(())
}

fn validate_minion(kind: &'static str, s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }

    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IdError::format(
            kind,
            format!("'{}' contains whitespace or control characters", s.escape_debug()),
        ));
    }

    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
