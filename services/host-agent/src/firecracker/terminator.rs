//! Guest termination: ask nicely, then kill.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};
use vmfleet_reconcile::RunningGuest;

use super::api::{send_action, ControlPlaneClient};
use super::config::ActionType;
use super::launcher::remove_socket;
use crate::config::{socket_path, Config};
use crate::process::{send_signal, Liveness, LivenessProbe};

/// Errors from stopping a guest.
#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("pid {pid} is still alive after SIGKILL")]
    StillAlive { pid: u32 },
}

/// Terminator settings.
#[derive(Debug, Clone)]
pub struct TerminatorConfig {
    pub socket_prefix: String,
    /// Wait after the graceful shutdown request.
    pub grace_period: Duration,
    /// Wait after the kill signal before probing.
    pub kill_wait: Duration,
}

impl TerminatorConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            socket_prefix: config.socket_prefix.clone(),
            grace_period: config.stop_grace_period,
            kill_wait: config.kill_wait,
        }
    }
}

/// Takes undesired guests down.
pub struct VmTerminator {
    config: TerminatorConfig,
    client: Arc<dyn ControlPlaneClient>,
    probe: Arc<dyn LivenessProbe>,
}

impl VmTerminator {
    pub fn new(
        config: TerminatorConfig,
        client: Arc<dyn ControlPlaneClient>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        Self {
            config,
            client,
            probe,
        }
    }

    /// Stop a guest. The socket is removed whatever the outcome.
    ///
    /// Returns the final liveness, `Dead` or `Unknown`.
    pub async fn terminate(&self, guest: &RunningGuest) -> Result<Liveness, TerminateError> {
        let socket = socket_path(&self.config.socket_prefix, guest.slot);
        let result = self.stop(guest, &socket).await;

        if let Err(e) = remove_socket(&socket) {
            warn!(
                socket = %socket.display(),
                slot = guest.slot,
                error = %e,
                "Failed to remove socket"
            );
        }

        result
    }

    async fn stop(&self, guest: &RunningGuest, socket: &Path) -> Result<Liveness, TerminateError> {
        let pid = guest.pid;

        match send_action(self.client.as_ref(), socket, ActionType::SendCtrlAltDel).await {
            Ok(_) => debug!(agent_id = %guest.agent_id, slot = guest.slot, pid, "Sent CtrlAltDel"),
            Err(e) => warn!(
                agent_id = %guest.agent_id,
                slot = guest.slot,
                pid,
                error = %e,
                "CtrlAltDel failed, will force kill"
            ),
        }

        tokio::time::sleep(self.config.grace_period).await;

        match send_signal(pid, libc::SIGKILL) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {
                debug!(slot = guest.slot, pid, "Guest already exited");
            }
            Err(source) => return Err(TerminateError::Signal { pid, source }),
        }

        tokio::time::sleep(self.config.kill_wait).await;

        match self.probe.probe(pid) {
            Liveness::Dead => {
                info!(agent_id = %guest.agent_id, slot = guest.slot, pid, "Guest stopped");
                Ok(Liveness::Dead)
            }
            Liveness::Unknown => {
                warn!(
                    agent_id = %guest.agent_id,
                    slot = guest.slot,
                    pid,
                    "Could not confirm guest exit"
                );
                Ok(Liveness::Unknown)
            }
            Liveness::Alive => Err(TerminateError::StillAlive { pid }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firecracker::{ApiError, ApiResponse};
    use crate::process::SignalProbe;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeClient {
        actions: Mutex<Vec<serde_json::Value>>,
        unreachable: bool,
    }

    #[async_trait]
    impl ControlPlaneClient for FakeClient {
        async fn put(
            &self,
            socket: &Path,
            _path: &str,
            body: &serde_json::Value,
        ) -> Result<ApiResponse, ApiError> {
            self.actions.lock().unwrap().push(body.clone());
            if self.unreachable {
                return Err(ApiError::SocketNotFound(socket.display().to_string()));
            }
            Ok(ApiResponse {
                status: 204,
                body: String::new(),
            })
        }

        async fn get(&self, _socket: &Path, _path: &str) -> Result<ApiResponse, ApiError> {
            unreachable!()
        }
    }

    struct FixedProbe(Liveness);

    impl LivenessProbe for FixedProbe {
        fn probe(&self, _pid: u32) -> Liveness {
            self.0
        }
    }

    fn config(dir: &Path) -> TerminatorConfig {
        TerminatorConfig {
            socket_prefix: dir.join("fc.sock").display().to_string(),
            grace_period: Duration::from_millis(10),
            kill_wait: Duration::from_millis(50),
        }
    }

    fn spawn_sleeper() -> std::process::Child {
        std::process::Command::new("sleep").arg("30").spawn().unwrap()
    }

    #[tokio::test]
    async fn test_terminate_kills_and_removes_socket() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let socket = socket_path(&config.socket_prefix, 2);
        std::fs::write(&socket, b"").unwrap();

        let mut child = spawn_sleeper();
        let pid = child.id();
        let client = Arc::new(FakeClient::default());

        // Reap the child as soon as it dies so the probe sees it gone.
        let reaper = std::thread::spawn(move || child.wait());

        let terminator = VmTerminator::new(config, client.clone(), Arc::new(SignalProbe::new()));
        let guest = RunningGuest {
            pid,
            agent_id: "a".to_string(),
            slot: 2,
        };
        let outcome = terminator.terminate(&guest).await.unwrap();
        assert_eq!(outcome, Liveness::Dead);
        assert!(!socket.exists());
        assert_eq!(
            client.actions.lock().unwrap()[0]["action_type"],
            "SendCtrlAltDel"
        );
        reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_graceful_failure_still_kills() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_sleeper();
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        let client = Arc::new(FakeClient {
            unreachable: true,
            ..Default::default()
        });
        let terminator =
            VmTerminator::new(config(dir.path()), client, Arc::new(SignalProbe::new()));
        let guest = RunningGuest {
            pid,
            agent_id: "a".to_string(),
            slot: 3,
        };
        assert_eq!(terminator.terminate(&guest).await.unwrap(), Liveness::Dead);
        reaper.join().unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_still_alive_is_error_and_socket_removed() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let socket = socket_path(&config.socket_prefix, 4);
        std::fs::write(&socket, b"").unwrap();

        let mut child = spawn_sleeper();
        let pid = child.id();
        let terminator = VmTerminator::new(
            config,
            Arc::new(FakeClient::default()),
            Arc::new(FixedProbe(Liveness::Alive)),
        );
        let guest = RunningGuest {
            pid,
            agent_id: "a".to_string(),
            slot: 4,
        };
        let err = terminator.terminate(&guest).await.unwrap_err();
        assert!(matches!(err, TerminateError::StillAlive { pid: p } if p == pid));
        assert!(!socket.exists());
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_liveness_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = spawn_sleeper();
        let pid = child.id();
        let terminator = VmTerminator::new(
            config(dir.path()),
            Arc::new(FakeClient::default()),
            Arc::new(FixedProbe(Liveness::Unknown)),
        );
        let guest = RunningGuest {
            pid,
            agent_id: "a".to_string(),
            slot: 5,
        };
        assert_eq!(
            terminator.terminate(&guest).await.unwrap(),
            Liveness::Unknown
        );
        child.wait().unwrap();
    }

    #[tokio::test]
    async fn test_already_exited_guest() {
        let dir = tempfile::tempdir().unwrap();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let terminator = VmTerminator::new(
            config(dir.path()),
            Arc::new(FakeClient::default()),
            Arc::new(FixedProbe(Liveness::Dead)),
        );
        let guest = RunningGuest {
            pid,
            agent_id: "a".to_string(),
            slot: 6,
        };
        assert_eq!(terminator.terminate(&guest).await.unwrap(), Liveness::Dead);
    }
}
