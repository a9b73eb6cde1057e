//! Guest launch.
//!
//! A launch provisions the agent's disk, spawns the hypervisor, waits until
//! its control socket answers `GET /` with the guest's id and drives the
//! configuration sequence:
//!
//! ```text
//! boot-source -> rootfs drive -> machine-config -> eth0 -> InstanceStart
//! ```
//!
//! Every step must succeed. A failure after the spawn kills the child and
//! removes its socket before the error is returned.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};
use vmfleet_networking::{NetworkError, NetworkIdentity};
use vmfleet_reconcile::{GuestIdentity, IdentityError, SlotDefinition};

use super::api::{instance_info, put_json, send_action, ApiError, ControlPlaneClient};
use super::config::{ActionType, BootSource, DriveConfig, MachineConfig, NetworkInterface};
use crate::config::{socket_path, Config};
use crate::image::{ProvisionError, RootfsProvisioner};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration step of a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStep {
    BootSource,
    RootDrive,
    MachineConfig,
    NetworkInterface,
    InstanceStart,
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BootSource => "boot-source",
            Self::RootDrive => "root-drive",
            Self::MachineConfig => "machine-config",
            Self::NetworkInterface => "network-interface",
            Self::InstanceStart => "instance-start",
        };
        f.write_str(name)
    }
}

/// Errors from launching a guest.
///
/// See [`LaunchError::rolled_back`] for which variants imply a spawned and
/// killed child.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("invalid guest identity: {0}")]
    Identity(#[from] IdentityError),

    #[error("invalid network identity: {0}")]
    Network(#[from] NetworkError),

    #[error("root filesystem provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("provisioning task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("failed to remove stale socket {path}: {source}")]
    StaleSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn hypervisor: {0}")]
    Spawn(#[source] io::Error),

    #[error("socket {path} not ready within {waited:?}")]
    SocketTimeout { path: PathBuf, waited: Duration },

    #[error("hypervisor exited before its socket appeared ({status})")]
    ExitedEarly { status: String },

    #[error("control socket answers for {found}, expected {expected}")]
    WrongInstance { expected: String, found: String },

    #[error("launch failed at {step}: {cause}")]
    LaunchFailed {
        step: LaunchStep,
        #[source]
        cause: ApiError,
    },
}

impl LaunchError {
    /// True when the error happened after a child was spawned (and killed).
    pub fn rolled_back(&self) -> bool {
        matches!(
            self,
            Self::SocketTimeout { .. }
                | Self::ExitedEarly { .. }
                | Self::WrongInstance { .. }
                | Self::LaunchFailed { .. }
        )
    }
}

/// Launcher settings.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub firecracker_binary: PathBuf,
    pub socket_prefix: String,
    pub rootfs_dir: PathBuf,
    pub kernel_path: PathBuf,
    pub tenant: String,
    pub machine: MachineConfig,
    pub socket_wait: Duration,
}

impl LauncherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            firecracker_binary: config.firecracker_binary.clone(),
            socket_prefix: config.socket_prefix.clone(),
            rootfs_dir: config.rootfs_dir.clone(),
            kernel_path: config.kernel_path.clone(),
            tenant: config.tenant.clone(),
            machine: MachineConfig::new(config.vcpu_count, config.mem_size_mib),
            socket_wait: config.socket_wait,
        }
    }
}

/// A guest that finished booting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedGuest {
    pub pid: u32,
    pub identity: GuestIdentity,
    pub socket: PathBuf,
    pub disk: PathBuf,
}

struct Prepared {
    identity: GuestIdentity,
    network: NetworkIdentity,
    disk: PathBuf,
    socket: PathBuf,
}

/// Brings desired slots up.
pub struct VmLauncher {
    config: LauncherConfig,
    client: Arc<dyn ControlPlaneClient>,
    provisioner: RootfsProvisioner,
}

impl VmLauncher {
    pub fn new(config: LauncherConfig, client: Arc<dyn ControlPlaneClient>) -> Self {
        let provisioner = RootfsProvisioner::new(config.rootfs_dir.clone());
        Self {
            config,
            client,
            provisioner,
        }
    }

    /// Launch the guest for a slot.
    pub async fn launch(&self, slot: &SlotDefinition) -> Result<LaunchedGuest, LaunchError> {
        let (prepared, mut child) = match self.prepare_and_spawn(slot).await {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(
                    agent_id = %slot.agent_id,
                    slot = slot.slot,
                    rolled_back = e.rolled_back(),
                    error = %e,
                    "Launch failed before spawn"
                );
                return Err(e);
            }
        };
        let Prepared {
            identity,
            network,
            disk,
            socket,
        } = prepared;
        let pid = child.id().unwrap_or_default();
        info!(agent_id = %slot.agent_id, slot = slot.slot, pid, "Spawned hypervisor");

        if let Err(e) = self.wait_until_ready(&mut child, &socket, &identity).await {
            let killed = abort(child, &socket, slot).await;
            error!(
                agent_id = %slot.agent_id,
                slot = slot.slot,
                pid,
                rolled_back = e.rolled_back(),
                killed,
                error = %e,
                "Hypervisor never became ready"
            );
            return Err(e);
        }

        if let Err((step, cause)) = self.configure(&socket, slot, &disk, &network).await {
            let killed = abort(child, &socket, slot).await;
            let e = LaunchError::LaunchFailed { step, cause };
            error!(
                agent_id = %slot.agent_id,
                slot = slot.slot,
                pid,
                step = %step,
                rolled_back = e.rolled_back(),
                killed,
                error = %e,
                "Guest configuration failed"
            );
            return Err(e);
        }

        reap(child, identity.clone());

        info!(agent_id = %slot.agent_id, slot = slot.slot, pid, "Guest started");
        Ok(LaunchedGuest {
            pid,
            identity,
            socket,
            disk,
        })
    }

    /// Validate identities, provision the disk, clear a stale socket and
    /// spawn the hypervisor.
    async fn prepare_and_spawn(
        &self,
        slot: &SlotDefinition,
    ) -> Result<(Prepared, Child), LaunchError> {
        let identity = slot.identity()?;
        let network = NetworkIdentity::for_slot(slot.slot)?;

        let disk = {
            let provisioner = self.provisioner.clone();
            let slot = slot.clone();
            tokio::task::spawn_blocking(move || provisioner.provision(&slot)).await??
        };
        if disk.created {
            info!(
                agent_id = %slot.agent_id,
                slot = slot.slot,
                path = %disk.path.display(),
                "Provisioned root filesystem"
            );
        }

        let socket = socket_path(&self.config.socket_prefix, slot.slot);
        remove_socket(&socket).map_err(|source| LaunchError::StaleSocket {
            path: socket.clone(),
            source,
        })?;

        let child = self.spawn(&identity, &socket)?;
        let prepared = Prepared {
            identity,
            network,
            disk: disk.path,
            socket,
        };
        Ok((prepared, child))
    }

    /// Spawn the hypervisor in its own session. The child receives SIGKILL
    /// if the spawning thread exits, so guests never outlive the agent.
    fn spawn(&self, identity: &GuestIdentity, socket: &Path) -> Result<Child, LaunchError> {
        let mut command = Command::new(&self.config.firecracker_binary);
        command
            .arg("--id")
            .arg(identity.to_string())
            .arg("--api-sock")
            .arg(socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) == -1 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        command.spawn().map_err(LaunchError::Spawn)
    }

    /// Poll until the socket answers `GET /` for `identity`, the child exits
    /// or the socket wait elapses.
    async fn wait_until_ready(
        &self,
        child: &mut Child,
        socket: &Path,
        identity: &GuestIdentity,
    ) -> Result<(), LaunchError> {
        let deadline = tokio::time::Instant::now() + self.config.socket_wait;
        let expected = identity.to_string();
        loop {
            if socket.exists() {
                let request = instance_info(self.client.as_ref(), socket);
                match tokio::time::timeout_at(deadline, request).await {
                    Ok(Ok(info)) if info.id == expected => {
                        debug!(socket = %socket.display(), "Control socket ready");
                        return Ok(());
                    }
                    Ok(Ok(info)) => {
                        return Err(LaunchError::WrongInstance {
                            expected,
                            found: info.id,
                        });
                    }
                    Ok(Err(e)) => {
                        debug!(
                            socket = %socket.display(),
                            error = %e,
                            "Control socket not answering yet"
                        );
                    }
                    Err(_) => {}
                }
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(LaunchError::ExitedEarly {
                    status: status.to_string(),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LaunchError::SocketTimeout {
                    path: socket.to_path_buf(),
                    waited: self.config.socket_wait,
                });
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn configure(
        &self,
        socket: &Path,
        slot: &SlotDefinition,
        disk: &Path,
        network: &NetworkIdentity,
    ) -> Result<(), (LaunchStep, ApiError)> {
        let client = self.client.as_ref();

        let boot = BootSource::for_guest(
            self.config.kernel_path.clone(),
            &slot.agent_id,
            &self.config.tenant,
            slot.slot,
        );
        put_json(client, socket, "/boot-source", &boot)
            .await
            .map_err(|e| (LaunchStep::BootSource, e))?;

        let drive = DriveConfig::root_disk(disk.to_path_buf());
        put_json(client, socket, "/drives/rootfs", &drive)
            .await
            .map_err(|e| (LaunchStep::RootDrive, e))?;

        put_json(client, socket, "/machine-config", &self.config.machine)
            .await
            .map_err(|e| (LaunchStep::MachineConfig, e))?;

        let iface = NetworkInterface::eth0(network.mac.to_string(), network.tap_device.clone());
        let path = format!("/network-interfaces/{}", iface.iface_id);
        put_json(client, socket, &path, &iface)
            .await
            .map_err(|e| (LaunchStep::NetworkInterface, e))?;

        send_action(client, socket, ActionType::InstanceStart)
            .await
            .map_err(|e| (LaunchStep::InstanceStart, e))?;

        Ok(())
    }
}

/// Remove a socket file, ignoring a missing one.
pub(crate) fn remove_socket(socket: &Path) -> io::Result<()> {
    match std::fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Kill the child unless it has already exited, then remove its socket.
/// Returns whether a kill was delivered.
async fn abort(mut child: Child, socket: &Path, slot: &SlotDefinition) -> bool {
    let killed = match child.try_wait() {
        Ok(Some(_)) => false,
        _ => match child.kill().await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    agent_id = %slot.agent_id,
                    slot = slot.slot,
                    error = %e,
                    "Failed to kill aborted hypervisor"
                );
                false
            }
        },
    };
    if let Err(e) = remove_socket(socket) {
        warn!(socket = %socket.display(), error = %e, "Failed to remove socket of aborted guest");
    }
    killed
}

/// Wait on the child in the background so it never lingers as a zombie.
fn reap(mut child: Child, identity: GuestIdentity) {
    let pid = child.id().unwrap_or_default();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => info!(
                agent_id = %identity.agent_id(),
                slot = identity.slot(),
                pid,
                status = %status,
                "Hypervisor exited"
            ),
            Err(e) => warn!(
                agent_id = %identity.agent_id(),
                slot = identity.slot(),
                pid,
                error = %e,
                "Failed to wait on hypervisor"
            ),
        }
    });
}
