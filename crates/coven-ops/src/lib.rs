// ABOUTME: coven-ops library: supervises dashboard services as OS processes.
// ABOUTME: Re-exports the supervisor, health monitor, state store, and orchestrator.

pub mod error;
pub mod events;
pub mod health;
pub mod init;
pub mod orchestrator;
pub mod os;
pub mod state;
pub mod supervisor;

pub use coven_ops_core::{OpsConfig, ServiceConfig, ServiceKind};
pub use error::{OpsError, StateError, SupervisorError};
pub use events::{HealthEvent, OpsEvent, SupervisorEvent};
pub use health::{HealthMonitor, HealthStatus, ProcessSource};
pub use init::run_init;
pub use orchestrator::{
    ActionOutcome, Orchestrator, OrchestratorOptions, PortOwners, ServerStarted, ServerStopped,
    ServiceStatus,
};
pub use state::{PersistedProcess, StateStore};
pub use supervisor::{KillReport, ProcessInfo, ProcessStatus, SpawnRequest, Supervisor};

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

/// Options for running the supervisor daemon
pub struct RunOptions {
    /// Path to configuration file
    pub config_path: Option<PathBuf>,
    /// Skip the config's autostart list
    pub no_autostart: bool,
}

/// Run the daemon until Ctrl-C or SIGTERM, then stop every managed service.
pub async fn run(options: RunOptions) -> Result<()> {
    let config_path = options
        .config_path
        .unwrap_or_else(OpsConfig::default_path);
    let config = OpsConfig::load(&config_path)?;

    let orchestrator = Orchestrator::new(OrchestratorOptions::from_config(&config));
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "Event log lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    orchestrator.register_services(config.services.clone());
    let recovered = orchestrator.initialize().await;
    tracing::info!(
        services = config.services.len(),
        recovered,
        config = %config_path.display(),
        "coven-ops running"
    );

    if !options.no_autostart {
        for id in &config.autostart {
            let outcome = ActionOutcome::from(orchestrator.start_server(id));
            if outcome.success {
                tracing::info!(id = %id, "{}", outcome.message);
            } else {
                tracing::error!(id = %id, "{}", outcome.message);
            }
        }
    }

    wait_for_shutdown_signal().await?;
    tracing::info!("Shutdown requested");
    orchestrator.shutdown().await;
    Ok(())
}

fn log_event(event: &OpsEvent) {
    match event {
        OpsEvent::Health {
            event: HealthEvent::HealthCheck { statuses },
        } => {
            let unhealthy = statuses.values().filter(|s| !s.healthy).count();
            tracing::debug!(checked = statuses.len(), unhealthy, "healthCheck");
        }
        OpsEvent::Health {
            event: HealthEvent::StatusChange { id, current, .. },
        } => {
            tracing::info!(
                id = %id,
                running = current.running,
                healthy = current.healthy,
                "statusChange"
            );
        }
        other => match serde_json::to_string(other) {
            Ok(json) => tracing::info!(event = %json, "{}", other.name()),
            Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
        },
    }
}

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
