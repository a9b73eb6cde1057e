//! vmfleet Host Agent
//!
//! Runs on each bare-metal host and reconciles Firecracker guests against
//! the desired-state table.
//!
//! ## Architecture
//!
//! - **Reconciler**: immediate first cycle, then one cycle per interval
//! - **Control API**: health, ping, on-demand reconciliation, last status
//! - **Runtime**: launches and terminates Firecracker guests
//!
//! Guests are children of this process and die with it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmfleet_host_agent::config::Config;
use vmfleet_host_agent::control;
use vmfleet_host_agent::desired::{DesiredStateStore, FileDesiredState, PostgresDesiredState};
use vmfleet_host_agent::firecracker::FirecrackerRuntime;
use vmfleet_host_agent::preflight;
use vmfleet_host_agent::process::ProcessInspector;
use vmfleet_host_agent::reconciler::{Reconciler, ReconcilerConfig};
use vmfleet_host_agent::status::{HttpStatusSink, LogStatusSink, StatusSink};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        host_id = %config.host_id,
        firecracker = %config.firecracker_binary.display(),
        socket_prefix = %config.socket_prefix,
        match_key = ?config.match_key,
        "Starting vmfleet host agent"
    );

    preflight::verify_installation(&config)?;

    let desired: Arc<dyn DesiredStateStore> = match &config.slots_file {
        Some(path) => {
            info!(path = %path.display(), "Reading desired state from file");
            Arc::new(FileDesiredState::new(path))
        }
        None => Arc::new(
            PostgresDesiredState::connect(&config.database)
                .await
                .context("failed to connect to desired-state database")?,
        ),
    };

    let status: Arc<dyn StatusSink> = match &config.status_url {
        Some(url) => Arc::new(HttpStatusSink::new(url.clone())?),
        None => Arc::new(LogStatusSink),
    };
    status
        .announce(&config.host_id)
        .await
        .context("failed to announce host")?;

    let reconciler = Arc::new(Reconciler::new(
        ReconcilerConfig {
            host_id: config.host_id.clone(),
            match_key: config.match_key,
            reconcile_interval: config.reconcile_interval,
        },
        desired,
        Arc::new(ProcessInspector::new(&config.firecracker_binary)),
        Arc::new(FirecrackerRuntime::from_config(&config)),
        status,
    ));

    // Without ground truth there is nothing to reconcile against.
    reconciler
        .run_once()
        .await
        .context("initial reconciliation failed")?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start the reconciliation loop
    let reconciler_handle = tokio::spawn({
        let reconciler = Arc::clone(&reconciler);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Start the control API
    let control_handle = config.control_listen_addr.map(|addr| {
        tokio::spawn(control::serve(
            addr,
            Arc::clone(&reconciler),
            shutdown_rx.clone(),
        ))
    });
    let control_exit = async {
        match control_handle {
            Some(handle) => handle.await,
            None => std::future::pending().await,
        }
    };

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = control_exit => {
            match result {
                Ok(Ok(())) => info!("Control API exited"),
                Ok(Err(e)) => error!(error = %e, "Control API error"),
                Err(e) => error!(error = %e, "Control API task panicked"),
            }
        }
        _ = reconciler_handle => {
            info!("Reconciler exited");
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    info!("Host agent shutdown complete");
    Ok(())
}
