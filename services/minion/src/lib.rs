//! flotilla minion agent.
//!
//! Runs on every worker node. Registers the node under the well-known
//! minion service with a TTL check and keeps the check passing until
//! shutdown. The scheduler reaps nodes whose check expires.

pub mod config;
pub mod heartbeat;

pub use heartbeat::Heartbeat;
