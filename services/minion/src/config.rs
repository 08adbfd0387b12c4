//! Configuration for the minion agent.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use flotilla_coordination::Coordinator;
use flotilla_id::MinionId;
use flotilla_reconcile::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MINION_TTL};

/// Host identity file; fleet reports placements by this same id.
pub const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Minion agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub coordinator: Coordinator,

    /// Identity of this node. Defaults to the host's machine id, then to
    /// the host name.
    pub minion_id: MinionId,

    pub minion_service: String,
    pub minion_ttl: Duration,
    pub heartbeat_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables and the host's
    /// machine id.
    pub fn from_env() -> Result<Self> {
        let machine_id = std::fs::read_to_string(MACHINE_ID_PATH).ok();
        Self::from_lookup(|key| std::env::var(key).ok(), machine_id)
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value. `machine_id` is the content of the host identity file,
    /// if there is one.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
        machine_id: Option<String>,
    ) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let secs = |key: &str, default: u64| -> Result<Duration> {
            match lookup(key) {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be a whole number of seconds, got '{raw}'")),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let machine_id = machine_id.filter(|id| !id.trim().is_empty());
        let raw_id = lookup("FLOTILLA_MINION_ID")
            .or(machine_id)
            .or_else(|| lookup("HOSTNAME"))
            .context("FLOTILLA_MINION_ID is not set and neither the machine id nor HOSTNAME is available")?;
        let minion_id = MinionId::parse(raw_id.trim())
            .with_context(|| format!("invalid minion id '{raw_id}'"))?;

        let config = Self {
            coordinator: Coordinator::parse(&var("FLOTILLA_COORDINATOR", "http://127.0.0.1:8500")),
            minion_id,
            minion_service: var("FLOTILLA_MINION_SERVICE", "flotilla-minions"),
            minion_ttl: secs("FLOTILLA_MINION_TTL_SECS", DEFAULT_MINION_TTL.as_secs())?,
            heartbeat_interval: secs(
                "FLOTILLA_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            )?,
            log_level: var("FLOTILLA_LOG_LEVEL", "info"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.minion_ttl.is_zero() {
            bail!("FLOTILLA_MINION_TTL_SECS must be greater than zero");
        }
        if self.heartbeat_interval.is_zero() {
            bail!("FLOTILLA_HEARTBEAT_INTERVAL_SECS must be greater than zero");
        }
        if self.heartbeat_interval >= self.minion_ttl {
            bail!(
                "heartbeat interval ({}s) must be shorter than the minion TTL ({}s)",
                self.heartbeat_interval.as_secs(),
                self.minion_ttl.as_secs()
            );
        }
        if self.minion_service.trim().is_empty() {
            bail!("FLOTILLA_MINION_SERVICE must not be empty");
        }
        Ok(())
    }
}
