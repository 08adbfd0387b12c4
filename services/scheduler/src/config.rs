//! Configuration for the scheduler.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
pub use flotilla_coordination::Coordinator;
use flotilla_reconcile::{
    DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_RETRIES, DEFAULT_MINION_TTL, DEFAULT_RECONCILE_INTERVAL,
};

use crate::backend::BackendKind;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub coordinator: Coordinator,
    pub backend: BackendKind,

    /// fleet API base URL.
    pub fleet_url: String,

    /// JSON file holding the current release set.
    pub releases_path: PathBuf,

    pub reconcile_interval: Duration,

    /// Heartbeat period minions are expected to use. Only validated here.
    pub heartbeat_interval: Duration,
    pub minion_ttl: Duration,
    pub lock_retry: Duration,

    /// TTL of the coordination session backing the leader lock.
    pub lock_ttl: Duration,
    pub lock_key: String,
    pub minion_service: String,

    /// Machine metadata role units are restricted to.
    pub minion_role: String,

    /// Restarts of a failed unit per retry window.
    pub max_restarts: u32,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
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

        let backend = var("FLOTILLA_BACKEND", "fleet")
            .parse()
            .context("FLOTILLA_BACKEND")?;

        let max_restarts = match lookup("FLOTILLA_MAX_RESTARTS") {
            Some(raw) => raw
                .trim()
                .parse()
                .with_context(|| format!("FLOTILLA_MAX_RESTARTS must be a number, got '{raw}'"))?,
            None => DEFAULT_MAX_RETRIES,
        };

        let config = Self {
            coordinator: Coordinator::parse(&var("FLOTILLA_COORDINATOR", "http://127.0.0.1:8500")),
            backend,
            fleet_url: var("FLOTILLA_FLEET_URL", "http://127.0.0.1:49153"),
            releases_path: PathBuf::from(var(
                "FLOTILLA_RELEASES_PATH",
                "/etc/flotilla/releases.json",
            )),
            reconcile_interval: secs(
                "FLOTILLA_RECONCILE_INTERVAL_SECS",
                DEFAULT_RECONCILE_INTERVAL.as_secs(),
            )?,
            heartbeat_interval: secs(
                "FLOTILLA_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            )?,
            minion_ttl: secs("FLOTILLA_MINION_TTL_SECS", DEFAULT_MINION_TTL.as_secs())?,
            lock_retry: secs("FLOTILLA_LOCK_RETRY_SECS", 5)?,
            lock_ttl: secs("FLOTILLA_LOCK_TTL_SECS", 15)?,
            lock_key: var("FLOTILLA_LOCK_KEY", "flotilla/scheduler/leader"),
            minion_service: var("FLOTILLA_MINION_SERVICE", "flotilla-minions"),
            minion_role: var("FLOTILLA_MINION_ROLE", "flotilla_minion"),
            max_restarts,
            log_level: var("FLOTILLA_LOG_LEVEL", "info"),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("FLOTILLA_RECONCILE_INTERVAL_SECS", self.reconcile_interval),
            ("FLOTILLA_HEARTBEAT_INTERVAL_SECS", self.heartbeat_interval),
            ("FLOTILLA_MINION_TTL_SECS", self.minion_ttl),
            ("FLOTILLA_LOCK_RETRY_SECS", self.lock_retry),
            ("FLOTILLA_LOCK_TTL_SECS", self.lock_ttl),
        ] {
            if value.is_zero() {
                bail!("{name} must be greater than zero");
            }
        }

        if self.heartbeat_interval >= self.minion_ttl {
            bail!(
                "heartbeat interval ({}s) must be shorter than the minion TTL ({}s)",
                self.heartbeat_interval.as_secs(),
                self.minion_ttl.as_secs()
            );
        }

        if self.lock_key.trim().is_empty() {
            bail!("FLOTILLA_LOCK_KEY must not be empty");
        }
        if self.minion_service.trim().is_empty() {
            bail!("FLOTILLA_MINION_SERVICE must not be empty");
        }

        Ok(())
    }
}
