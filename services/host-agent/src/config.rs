//! Configuration for the host agent.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use vmfleet_reconcile::MatchKey;

use crate::desired::DbConfig;

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host id; selects this host's rows in the desired-state table.
    pub host_id: String,

    /// Path to the firecracker binary.
    pub firecracker_binary: PathBuf,

    /// Control-plane sockets live at `<prefix>.<slot>`.
    pub socket_prefix: String,

    /// Directory holding base images and agent disks.
    pub rootfs_dir: PathBuf,

    /// Path to the guest kernel.
    pub kernel_path: PathBuf,

    /// Tenant passed on the guest kernel command line.
    pub tenant: String,

    /// vCPUs per guest.
    pub vcpu_count: u8,

    /// Memory per guest in MiB.
    pub mem_size_mib: u32,

    /// Interval between reconciliation cycles.
    pub reconcile_interval: Duration,

    /// Timeout for each control-plane call.
    pub api_timeout: Duration,

    /// How long to wait for a new guest's socket to appear.
    pub socket_wait: Duration,

    /// Pause between the graceful shutdown request and the kill signal.
    pub stop_grace_period: Duration,

    /// Pause between the kill signal and the liveness check.
    pub kill_wait: Duration,

    /// How running guests are matched to desired slots.
    pub match_key: MatchKey,

    /// Read desired state from this JSON file instead of Postgres.
    pub slots_file: Option<PathBuf>,

    /// Postgres desired-state store.
    pub database: DbConfig,

    /// Base URL status reports are POSTed to. Logged only when unset.
    pub status_url: Option<String>,

    /// Inbound control API address. Disabled when `None`.
    pub control_listen_addr: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host_id = var("VMFLEET_HOST_ID")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("VMFLEET_HOST_ID must be set"))?;

        let firecracker_binary = var("VMFLEET_FIRECRACKER_BINARY")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/usr/bin/firecracker"));

        let socket_prefix =
            var("VMFLEET_SOCKET_PREFIX").unwrap_or_else(|| "/tmp/firecracker.socket".to_string());

        let rootfs_dir = var("VMFLEET_ROOTFS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/vmfleet/rootfs"));

        let kernel_path = var("VMFLEET_KERNEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/lib/vmfleet/vmlinux"));

        let tenant = var("VMFLEET_TENANT").unwrap_or_else(|| "0".to_string());

        let vcpu_count = var("VMFLEET_VCPU_COUNT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let mem_size_mib = var("VMFLEET_MEM_SIZE_MIB")
            .and_then(|s| s.parse().ok())
            .unwrap_or(512);

        let reconcile_interval = var("VMFLEET_RECONCILE_INTERVAL")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(15));

        let api_timeout = var("VMFLEET_API_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let socket_wait = var("VMFLEET_SOCKET_WAIT_MS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let match_key = match var("VMFLEET_MATCH_KEY") {
            Some(s) => s.parse::<MatchKey>().map_err(|e| anyhow!(e))?,
            None => MatchKey::Slot,
        };

        let slots_file = var("VMFLEET_SLOTS_FILE")
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let database = DbConfig::from_vars(&var);

        let status_url = var("VMFLEET_STATUS_URL").filter(|s| !s.is_empty());

        let control_listen_addr = match var("VMFLEET_CONTROL_LISTEN_ADDR").as_deref() {
            Some("off") | Some("") => None,
            Some(addr) => Some(
                addr.parse()
                    .with_context(|| format!("invalid VMFLEET_CONTROL_LISTEN_ADDR {addr:?}"))?,
            ),
            None => Some(SocketAddr::from(([127, 0, 0, 1], 7070))),
        };

        let log_level = var("VMFLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            host_id,
            firecracker_binary,
            socket_prefix,
            rootfs_dir,
            kernel_path,
            tenant,
            vcpu_count,
            mem_size_mib,
            reconcile_interval,
            api_timeout,
            socket_wait,
            stop_grace_period: Duration::from_secs(1),
            kill_wait: Duration::from_millis(300),
            match_key,
            slots_file,
            database,
            status_url,
            control_listen_addr,
            log_level,
        })
    }

    /// Control-plane socket path for a slot.
    pub fn socket_path(&self, slot: u32) -> PathBuf {
        socket_path(&self.socket_prefix, slot)
    }
}

/// `<prefix>.<slot>`
pub fn socket_path(prefix: &str, slot: u32) -> PathBuf {
    PathBuf::from(format!("{}.{}", prefix, slot))
}

/// Directory a socket prefix places its sockets in.
pub fn socket_dir(prefix: &str) -> &Path {
    Path::new(prefix)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}
