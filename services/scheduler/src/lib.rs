//! flotilla scheduler
//!
//! Turns app releases into units on a compute cluster and keeps them there.
//! Many scheduler instances may run; a cluster-wide leader lock makes sure
//! exactly one of them acts at a time.
//!
//! ## Architecture
//!
//! ```text
//! ReleaseSource ──▶ expand ──▶ desired jobs ─┐
//!                                            ├─▶ Reconciler ──▶ Backend (fleet | mock)
//! Backend::container_states ──▶ observed ────┘        ▲
//!                                                     │ displaced units
//! Registry (minion TTL checks) ──▶ MinionRegistry::reap
//! ```
//!
//! - **Formation expansion** (`formation`): one job per process type and
//!   instance of a release.
//! - **Backends** (`backend`): the [`backend::Backend`] trait with a fleet
//!   implementation that compiles systemd units, and an in-memory mock.
//! - **Minion registry** (`minion`): health of worker nodes and reaping of
//!   the dead ones.
//! - **Control loop** (`control`): follower/leader state machine running
//!   reap + reconcile ticks while it holds the lock.

pub mod backend;
pub mod config;
pub mod control;
pub mod error;
pub mod formation;
pub mod job;
pub mod minion;
pub mod reconciler;
pub mod release;
pub mod source;

pub use control::{ControlLoop, LoopConfig, LoopState, TickReport};
pub use error::{SchedulerError, SchedulerResult};
pub use formation::{expand, expand_release};
pub use job::{Container, Job, JobState, State};
pub use minion::{MinionRegistry, ReapReport};
pub use reconciler::{ReconcileStats, Reconciler};
pub use release::{App, Formation, Image, ProcessFormation, Release, Slug};
pub use source::{FileReleases, ReleaseSource, StaticReleases};
