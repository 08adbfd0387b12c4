//! Coordination-service seam for the flotilla scheduler.
//!
//! Two capabilities are consumed from the coordination service:
//!
//! - [`LockService`]: a blocking, revocable, cluster-wide leader lock. A
//!   successful acquisition yields a [`Leadership`] whose loss signal fires
//!   when the lock is revoked underneath its holder.
//! - [`Registry`]: minion registration with a TTL health check, periodic
//!   heartbeats, health listing and deregistration.
//!
//! Implementations:
//!
//! - [`memory::InMemoryCoordinator`]: process-local, used by tests and
//!   single-node development.
//! - [`consul`]: Consul sessions, KV locks and agent TTL checks over HTTP.

pub mod consul;
mod endpoint;
mod error;
mod lock;
pub mod memory;
mod registry;

pub use endpoint::Coordinator;
pub use error::CoordinationError;
pub use lock::{Leadership, LockService};
pub use registry::{HealthCheck, Registration, Registry};
