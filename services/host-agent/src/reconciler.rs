//! Reconciliation loop for converging host state.
//!
//! Each cycle:
//! - reads the enabled slots for this host from the desired-state store
//! - discovers running guests from the process table
//! - diffs the two and starts or stops guests
//! - publishes a status report
//!
//! Nothing is remembered between cycles. At most one cycle runs at a time;
//! a trigger arriving while a cycle is in flight is skipped.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};
use vmfleet_reconcile::{plan, MatchKey};

use crate::desired::{DesiredStateError, DesiredStateStore};
use crate::process::{GuestDiscovery, ScanError};
use crate::runtime::Runtime;
use crate::status::{StatusReport, StatusSink};

/// Errors that abort a cycle before any action.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read desired state: {0}")]
    DesiredState(#[from] DesiredStateError),

    #[error("failed to scan running guests: {0}")]
    Scan(#[from] ScanError),
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    /// Slots whose guest was started.
    pub started: Vec<u32>,
    /// Slots whose guest was stopped.
    pub stopped: Vec<u32>,
    /// Slots whose start or stop failed.
    pub failed: Vec<u32>,
    /// Slots waiting for a replaced guest to go away.
    pub deferred: Vec<u32>,
    /// The published report.
    pub report: StatusReport,
}

/// Result of asking for a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Completed(CycleSummary),
    /// Another cycle was already running.
    Skipped,
}

/// Reconciler settings.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub host_id: String,
    pub match_key: MatchKey,
    pub reconcile_interval: Duration,
}

/// Converges running guests to the desired slots.
pub struct Reconciler {
    config: ReconcilerConfig,
    desired: Arc<dyn DesiredStateStore>,
    discovery: Arc<dyn GuestDiscovery>,
    runtime: Arc<dyn Runtime>,
    status: Arc<dyn StatusSink>,
    in_flight: Mutex<()>,
    last_report: RwLock<Option<StatusReport>>,
}

impl Reconciler {
    pub fn new(
        config: ReconcilerConfig,
        desired: Arc<dyn DesiredStateStore>,
        discovery: Arc<dyn GuestDiscovery>,
        runtime: Arc<dyn Runtime>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            config,
            desired,
            discovery,
            runtime,
            status,
            in_flight: Mutex::new(()),
            last_report: RwLock::new(None),
        }
    }

    /// Host this reconciler serves.
    pub fn host_id(&self) -> &str {
        &self.config.host_id
    }

    /// Report of the last completed cycle.
    pub async fn last_report(&self) -> Option<StatusReport> {
        self.last_report.read().await.clone()
    }

    /// Run one cycle now, unless one is already running.
    pub async fn run_once(&self) -> Result<CycleOutcome, ReconcileError> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Reconciliation already in flight, skipping");
            return Ok(CycleOutcome::Skipped);
        };

        self.reconcile().await.map(CycleOutcome::Completed)
    }

    /// Run cycles on the configured interval until shutdown. The first
    /// timed cycle fires one interval after the call.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            reconcile_interval_secs = self.config.reconcile_interval.as_secs(),
            "Starting reconciliation loop"
        );

        let period = self.config.reconcile_interval;
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Reconciliation failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn reconcile(&self) -> Result<CycleSummary, ReconcileError> {
        debug!("Starting reconciliation");

        let desired = self.desired.list_enabled_slots(&self.config.host_id).await?;
        let running = self.discovery.discover().await?;

        let plan = plan(&desired, &running, self.config.match_key);
        for slot in &plan.duplicate_slots {
            warn!(slot, "Slot appears more than once in desired state, using first row");
        }
        for slot in &plan.deferred {
            info!(slot, "Guest on slot runs a different agent, replacement deferred");
        }

        let mut summary = CycleSummary {
            deferred: plan.deferred.clone(),
            report: StatusReport {
                tasks: plan.tasks().iter().map(ToString::to_string).collect(),
                running_agents: running.iter().map(|g| g.identity_string()).collect(),
            },
            ..Default::default()
        };

        for slot in &plan.to_start {
            info!(agent_id = %slot.agent_id, slot = slot.slot, "Starting guest");
            match self.runtime.start_guest(slot).await {
                Ok(pid) => {
                    debug!(slot = slot.slot, pid, "Guest start complete");
                    summary.started.push(slot.slot);
                }
                Err(e) => {
                    error!(
                        agent_id = %slot.agent_id,
                        slot = slot.slot,
                        error = %format!("{e:#}"),
                        "Failed to start guest"
                    );
                    summary.failed.push(slot.slot);
                }
            }
        }

        for guest in &plan.to_stop {
            info!(
                agent_id = %guest.agent_id,
                slot = guest.slot,
                pid = guest.pid,
                "Stopping guest"
            );
            match self.runtime.stop_guest(guest).await {
                Ok(()) => summary.stopped.push(guest.slot),
                Err(e) => {
                    error!(
                        agent_id = %guest.agent_id,
                        slot = guest.slot,
                        pid = guest.pid,
                        error = %format!("{e:#}"),
                        "Failed to stop guest"
                    );
                    summary.failed.push(guest.slot);
                }
            }
        }

        if let Err(e) = self
            .status
            .publish(&self.config.host_id, &summary.report)
            .await
        {
            warn!(error = %e, "Failed to publish status report");
        }
        *self.last_report.write().await = Some(summary.report.clone());

        if plan.is_converged() {
            debug!(running = running.len(), "Host converged");
        } else {
            info!(
                started = summary.started.len(),
                stopped = summary.stopped.len(),
                failed = summary.failed.len(),
                "Reconciliation cycle complete"
            );
        }

        Ok(summary)
    }
}
