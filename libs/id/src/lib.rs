//! # flotilla-id
//!
//! Typed identifiers for the flotilla scheduler.
//!
//! ## Identifier kinds
//!
//! - **Labels** (`AppId`, `ProcessType`, `MinionId`) are user- or
//!   host-controlled strings, validated on construction.
//! - **Generated IDs** (`SessionId`) use a prefixed ULID: `{prefix}_{ulid}`.
//! - **Job names** (`JobName`) compose an app, a process type and a 1-based
//!   instance index as `app.type.N`:
//!
//! ```text
//! acme.web.1
//! acme.worker.3
//! ```
//!
//! Labels that take part in a job name may not contain `.`, so every job
//! name parses back to exactly one `(app, type, instance)` triple.

mod error;
mod macros;
mod name;
mod types;

pub use error::IdError;
pub use name::JobName;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
