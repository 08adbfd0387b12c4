//! flotilla scheduler
//!
//! Contends for the cluster leader lock and, while leader, reaps dead
//! minions and reconciles units against the current release set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use flotilla_coordination::consul::{ConsulClient, ConsulLock, ConsulRegistry};
use flotilla_coordination::memory::InMemoryCoordinator;
use flotilla_coordination::{LockService, Registry};
use flotilla_scheduler::backend::{Backend, BackendKind, FleetBackend, MockBackend, UnitTemplate};
use flotilla_scheduler::config::{Config, Coordinator};
use flotilla_scheduler::{ControlLoop, FileReleases, LoopConfig, MinionRegistry, Reconciler};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn coordinator(config: &Config) -> Result<(Arc<dyn LockService>, Arc<dyn Registry>)> {
    match &config.coordinator {
        Coordinator::Memory => {
            warn!("Using in-memory coordinator; leader election is process-local");
            let coordinator = InMemoryCoordinator::new();
            let lock: Arc<dyn LockService> = Arc::new(coordinator.contender());
            let registry: Arc<dyn Registry> = Arc::new(coordinator);
            Ok((lock, registry))
        }
        Coordinator::Consul(addr) => {
            let client = ConsulClient::new(addr.as_str()).context("building Consul client")?;
            let lock: Arc<dyn LockService> = Arc::new(ConsulLock::new(
                client.clone(),
                config.lock_key.as_str(),
                config.lock_ttl,
            ));
            let registry: Arc<dyn Registry> =
                Arc::new(ConsulRegistry::new(client, config.minion_service.as_str()));
            Ok((lock, registry))
        }
    }
}

fn backend(config: &Config) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Fleet => Arc::new(
            FleetBackend::new(
                config.fleet_url.as_str(),
                UnitTemplate::new(config.minion_role.as_str()),
            )
            .context("building fleet client")?,
        ),
        BackendKind::Mock => Arc::new(MockBackend::default()),
    };
    Ok(backend)
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
        coordinator = ?config.coordinator,
        backend = %config.backend,
        releases_path = %config.releases_path.display(),
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        "Starting flotilla scheduler"
    );

    let (lock, registry) = coordinator(&config)?;

    // An unreachable coordinator at startup is fatal; the supervisor restarts us.
    registry
        .checks(&config.minion_service)
        .await
        .context("coordination service unreachable")?;

    let reconciler = Reconciler::new(
        backend(&config)?,
        Arc::new(FileReleases::new(&config.releases_path)),
        config.max_restarts,
    );
    let control = ControlLoop::new(
        lock,
        MinionRegistry::new(registry, config.minion_service.as_str()),
        reconciler,
        LoopConfig {
            reconcile_interval: config.reconcile_interval,
            lock_retry: config.lock_retry,
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut control_handle = tokio::spawn(async move { control.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut control_handle => {
            if let Err(e) = result {
                error!(error = %e, "Control loop task panicked");
            }
            return Ok(());
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for control loop to stop...");
    match tokio::time::timeout(SHUTDOWN_GRACE, control_handle).await {
        Ok(Ok(())) => info!("Scheduler shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "Control loop task panicked"),
        Err(_) => warn!("Control loop did not stop in time"),
    }

    Ok(())
}
