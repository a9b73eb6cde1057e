//! Guest discovery from the OS process table.
//!
//! Running guests are not tracked in memory. Every cycle re-reads `/proc`,
//! keeps the entries whose `comm` matches the hypervisor binary, and recovers
//! the guest identity from the `--id` argument. Entries that vanish mid-scan
//! or carry an unparsable id are skipped; only a failure to list the process
//! table itself is an error.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use vmfleet_reconcile::{GuestIdentity, RunningGuest};

/// Kernel limit on `comm` length, excluding the trailing NUL.
const TASK_COMM_LEN: usize = 15;

/// Errors from scanning the process table.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("failed to read process table at {path}: {source}")]
    ProcessTable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("process scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Source of the running-guest set.
#[async_trait]
pub trait GuestDiscovery: Send + Sync {
    /// List guests currently running on this host.
    async fn discover(&self) -> Result<Vec<RunningGuest>, ScanError>;
}

/// Reads guests out of a procfs tree.
#[derive(Debug, Clone)]
pub struct ProcessInspector {
    proc_root: PathBuf,
    comm: String,
}

impl ProcessInspector {
    /// Inspect `/proc` for processes of the given hypervisor binary.
    pub fn new(binary: &Path) -> Self {
        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| binary.display().to_string());
        Self::with_proc_root("/proc", &name)
    }

    /// Inspect an alternate procfs root.
    pub fn with_proc_root(proc_root: impl Into<PathBuf>, binary_name: &str) -> Self {
        Self {
            proc_root: proc_root.into(),
            comm: truncate_comm(binary_name),
        }
    }

    /// Scan the process table, ordered by pid.
    pub fn scan(&self) -> Result<Vec<RunningGuest>, ScanError> {
        let entries = fs::read_dir(&self.proc_root).map_err(|source| ScanError::ProcessTable {
            path: self.proc_root.display().to_string(),
            source,
        })?;

        let mut guests = Vec::new();
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            if let Some(guest) = self.inspect(pid, &entry.path()) {
                guests.push(guest);
            }
        }

        guests.sort_by_key(|g| g.pid);
        Ok(guests)
    }

    /// Examine one `/proc/<pid>` directory.
    fn inspect(&self, pid: u32, dir: &Path) -> Option<RunningGuest> {
        let comm = fs::read_to_string(dir.join("comm")).ok()?;
        if comm.trim_end_matches('\n') != self.comm {
            return None;
        }

        let cmdline = fs::read(dir.join("cmdline")).ok()?;
        let args: Vec<String> = cmdline
            .split(|b| *b == 0)
            .filter(|a| !a.is_empty())
            .map(|a| String::from_utf8_lossy(a).to_string())
            .collect();

        let Some(id) = find_id_arg(&args) else {
            debug!(pid, "Hypervisor process without --id, skipping");
            return None;
        };

        match id.parse::<GuestIdentity>() {
            Ok(identity) => Some(RunningGuest::from_identity(pid, identity)),
            Err(e) => {
                debug!(pid, id = %id, error = %e, "Unparsable guest id, skipping");
                None
            }
        }
    }
}

#[async_trait]
impl GuestDiscovery for ProcessInspector {
    async fn discover(&self) -> Result<Vec<RunningGuest>, ScanError> {
        let inspector = self.clone();
        tokio::task::spawn_blocking(move || inspector.scan()).await?
    }
}

/// Value of `--id <value>` or `--id=<value>`.
fn find_id_arg(args: &[String]) -> Option<&str> {
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--id" {
            return iter.next().map(String::as_str);
        }
        if let Some(value) = arg.strip_prefix("--id=") {
            return Some(value);
        }
    }
    None
}

fn truncate_comm(name: &str) -> String {
    let mut end = name.len().min(TASK_COMM_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}
