//! vmfleet Host Agent Library
//!
//! The host agent runs on each bare-metal host and keeps its Firecracker
//! guests in line with the desired-state table: every cycle it reads the
//! enabled slots for this host, scans the process table for running
//! hypervisors and starts or stops guests until the two agree.
//!
//! ## Modules
//!
//! - `config`: environment configuration
//! - `desired`: desired-state stores (Postgres, JSON file, in-memory)
//! - `firecracker`: control-plane client, launcher, terminator, runtime
//! - `image`: per-agent root filesystem provisioning
//! - `process`: process-table discovery and liveness probing
//! - `reconciler`: the control loop
//! - `status`: status report sinks
//! - `control`: inbound control API
//! - `preflight`: startup installation checks

pub mod config;
pub mod control;
pub mod desired;
pub mod firecracker;
pub mod image;
pub mod preflight;
pub mod process;
pub mod reconciler;
pub mod runtime;
pub mod status;

// Re-export commonly used types
pub use config::Config;
pub use reconciler::{CycleOutcome, CycleSummary, ReconcileError, Reconciler, ReconcilerConfig};
pub use runtime::{MockRuntime, Runtime};
pub use status::{StatusReport, StatusSink};
