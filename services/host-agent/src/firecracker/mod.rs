//! Firecracker hypervisor integration.
//!
//! ## Components
//!
//! - `api`: `ControlPlaneClient` seam and the HTTP-over-Unix-socket client
//! - `config`: request bodies for boot source, drives, machine, network and actions
//! - `launcher`: spawn, configure and boot a guest, rolling back on failure
//! - `terminator`: graceful-then-forced shutdown
//! - `runtime`: `Runtime` implementation composing launcher and terminator

mod api;
mod config;
mod launcher;
mod runtime;
mod terminator;

pub use api::{
    instance_info, put_json, send_action, ApiError, ApiResponse, ControlPlaneClient,
    FirecrackerClient,
};
pub use config::{
    ActionType, BootSource, DriveConfig, InstanceAction, InstanceInfo, MachineConfig,
    NetworkInterface,
};
pub use launcher::{LaunchError, LaunchStep, LaunchedGuest, LauncherConfig, VmLauncher};
pub use runtime::FirecrackerRuntime;
pub use terminator::{TerminateError, TerminatorConfig, VmTerminator};
