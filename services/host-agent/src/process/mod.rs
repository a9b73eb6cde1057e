//! OS process table access: guest discovery and liveness.

mod inspector;
mod liveness;

pub use inspector::{GuestDiscovery, ProcessInspector, ScanError};
pub use liveness::{send_signal, Liveness, LivenessProbe, SignalProbe};
