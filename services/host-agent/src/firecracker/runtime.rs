//! Firecracker runtime.
//!
//! Composes [`VmLauncher`] and [`VmTerminator`] behind the [`Runtime`] seam.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use vmfleet_reconcile::{RunningGuest, SlotDefinition};

use super::api::{ControlPlaneClient, FirecrackerClient};
use super::launcher::{LauncherConfig, VmLauncher};
use super::terminator::{TerminatorConfig, VmTerminator};
use crate::config::Config;
use crate::process::{LivenessProbe, SignalProbe};
use crate::runtime::Runtime;

/// Runtime backed by real Firecracker processes.
pub struct FirecrackerRuntime {
    launcher: VmLauncher,
    terminator: VmTerminator,
}

impl FirecrackerRuntime {
    /// Build from agent configuration with the Unix-socket client and signal probe.
    pub fn from_config(config: &Config) -> Self {
        let client: Arc<dyn ControlPlaneClient> =
            Arc::new(FirecrackerClient::new(config.api_timeout));
        let probe: Arc<dyn LivenessProbe> = Arc::new(SignalProbe::new());
        Self::new(
            LauncherConfig::from_config(config),
            TerminatorConfig::from_config(config),
            client,
            probe,
        )
    }

    pub fn new(
        launcher: LauncherConfig,
        terminator: TerminatorConfig,
        client: Arc<dyn ControlPlaneClient>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            launcher: VmLauncher::new(launcher, Arc::clone(&client)),
            terminator: VmTerminator::new(terminator, client, probe),
        }
    }
}

#[async_trait]
impl Runtime for FirecrackerRuntime {
    async fn start_guest(&self, slot: &SlotDefinition) -> Result<u32> {
        let guest = self.launcher.launch(slot).await?;
        Ok(guest.pid)
    }

    async fn stop_guest(&self, guest: &RunningGuest) -> Result<()> {
        self.terminator.terminate(guest).await?;
        Ok(())
    }
}
