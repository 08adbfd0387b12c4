//! flotilla minion agent
//!
//! Registers this worker node with the coordination service and heartbeats
//! until Ctrl-C, then deregisters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flotilla_coordination::consul::{ConsulClient, ConsulRegistry};
use flotilla_coordination::memory::InMemoryCoordinator;
use flotilla_coordination::{Coordinator, Registration, Registry};
use flotilla_minion::config::Config;
use flotilla_minion::Heartbeat;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn registry(config: &Config) -> Result<Arc<dyn Registry>> {
    let registry: Arc<dyn Registry> = match &config.coordinator {
        Coordinator::Memory => {
            warn!("Using in-memory coordinator; no scheduler will see this minion");
            Arc::new(InMemoryCoordinator::new())
        }
        Coordinator::Consul(addr) => {
            let client = ConsulClient::new(addr.as_str()).context("building Consul client")?;
            Arc::new(ConsulRegistry::new(client, config.minion_service.as_str()))
        }
    };
    Ok(registry)
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        minion = %config.minion_id,
        coordinator = ?config.coordinator,
        service = %config.minion_service,
        "Starting flotilla minion"
    );

    let heartbeat = Heartbeat::new(
        registry(&config)?,
        Registration {
            service: config.minion_service.clone(),
            minion: config.minion_id.clone(),
            ttl: config.minion_ttl,
        },
        config.heartbeat_interval,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut heartbeat_handle = tokio::spawn(async move { heartbeat.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut heartbeat_handle => {
            match result {
                Ok(Ok(())) => info!("Heartbeat loop exited"),
                Ok(Err(e)) => error!(error = %e, "Heartbeat loop error"),
                Err(e) => error!(error = %e, "Heartbeat task panicked"),
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_GRACE, heartbeat_handle).await {
        Ok(Ok(Ok(()))) => info!("Minion shutdown complete"),
        Ok(Ok(Err(e))) => warn!(error = %e, "Failed to deregister"),
        Ok(Err(e)) => error!(error = %e, "Heartbeat task panicked"),
        Err(_) => warn!("Heartbeat loop did not stop in time"),
    }

    Ok(())
}
