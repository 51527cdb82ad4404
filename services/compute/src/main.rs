//! Stratus compute daemon.
//!
//! Builds the compute core on the configured container runtime and keeps the
//! reconciler running until interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stratus_compute::config::{Config, RuntimeKind};
use stratus_compute::docker::DockerRuntime;
use stratus_compute::naming::SelfLinks;
use stratus_compute::{
    AddressAllocator, ContainerRuntime, InstanceOrchestrator, InstanceStore, MockRuntime,
    OperationTracker, OrchestratorConfig, Reconciler, ReconcilerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env().context("loading configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        runtime = ?config.runtime,
        reconcile_interval_secs = config.reconcile_interval.as_secs(),
        stop_grace_secs = config.stop_grace.as_secs(),
        stop_escalation_secs = config.stop_escalation.as_secs(),
        base_url = %config.base_url,
        "Starting stratus compute daemon"
    );

    let runtime: Arc<dyn ContainerRuntime> = match config.runtime {
        RuntimeKind::Mock => Arc::new(MockRuntime::new()),
        RuntimeKind::Docker => {
            let docker = DockerRuntime::new(&config.docker_socket);
            docker
                .ping()
                .await
                .with_context(|| format!("docker daemon at {}", config.docker_socket))?;
            Arc::new(docker)
        }
    };

    let links = SelfLinks::new(&config.base_url);
    let store = Arc::new(InstanceStore::new());
    let orchestrator = InstanceOrchestrator::new(
        Arc::clone(&runtime),
        Arc::clone(&store),
        Arc::new(OperationTracker::new(links.clone())),
        Arc::new(AddressAllocator::new(config.addresses.clone(), links.clone())),
        links,
        OrchestratorConfig {
            default_image: config.default_image.clone(),
            stop_grace: config.stop_grace,
            stop_escalation: config.stop_escalation,
        },
    );

    let reconciler = Reconciler::new(
        runtime,
        Arc::clone(orchestrator.store()),
        ReconcilerConfig {
            interval: config.reconcile_interval,
        },
    )
    .spawn();

    info!("Compute core ready");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Received shutdown signal");

    if !reconciler.shutdown(config.shutdown_timeout).await {
        warn!("Reconciler did not shut down cleanly");
    }

    info!(instances = store.len().await, "Compute daemon shutdown complete");
    Ok(())
}
