//! Process liveness probing and signalling.

use std::fs;
use std::io;
use std::path::PathBuf;

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// The process exists and has not exited.
    Alive,
    /// No such process, or only an unreaped zombie remains.
    Dead,
    /// The probe could not tell.
    Unknown,
}

/// Answers whether a pid still refers to a live process.
pub trait LivenessProbe: Send + Sync {
    fn probe(&self, pid: u32) -> Liveness;
}

/// Probes with the null signal, then checks procfs for zombies.
///
/// `kill(pid, 0)` succeeds for zombies, so a killed guest that the reaper
/// has not collected yet would otherwise still look alive.
#[derive(Debug, Clone)]
pub struct SignalProbe {
    proc_root: PathBuf,
}

impl SignalProbe {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl Default for SignalProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl LivenessProbe for SignalProbe {
    fn probe(&self, pid: u32) -> Liveness {
        let Some(raw) = to_pid(pid) else {
            return Liveness::Unknown;
        };

        // SAFETY: signal 0 performs permission and existence checks only.
        let rc = unsafe { libc::kill(raw, 0) };
        if rc != 0 {
            return match io::Error::last_os_error().raw_os_error() {
                Some(libc::ESRCH) => Liveness::Dead,
                // Exists, owned by someone else.
                Some(libc::EPERM) => Liveness::Alive,
                _ => Liveness::Unknown,
            };
        }

        let stat_path = self.proc_root.join(pid.to_string()).join("stat");
        match fs::read_to_string(&stat_path) {
            Ok(stat) => match process_state(&stat) {
                Some('Z') | Some('X') => Liveness::Dead,
                Some(_) => Liveness::Alive,
                None => Liveness::Unknown,
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => Liveness::Dead,
            Err(_) => Liveness::Alive,
        }
    }
}

/// Send a signal to a process.
pub fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let Some(raw) = to_pid(pid) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        ));
    };

    // SAFETY: raw is a single positive pid, never 0 or -1 (process groups).
    if unsafe { libc::kill(raw, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Positive pids only. 0 and negative values address process groups.
fn to_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

/// State character from `/proc/<pid>/stat`. The comm field may contain
/// spaces and parentheses, so parse from the last ')'.
fn process_state(stat: &str) -> Option<char> {
    let close = stat.rfind(')')?;
    stat[close + 1..].trim_start().chars().next()
}
