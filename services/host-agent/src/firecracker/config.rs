//! Firecracker VM configuration structures.
//!
//! These structures map to the Firecracker API configuration objects
//! for machine configuration, boot source, drives, network interfaces and actions.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/api_server/swagger/firecracker.yaml

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Machine configuration for the microVM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Number of vCPUs (1-32).
    pub vcpu_count: u8,
    /// Memory size in MiB.
    pub mem_size_mib: u32,
    /// Enable simultaneous multithreading (hyperthreading).
    pub smt: bool,
    /// Track dirty pages for incremental snapshots.
    pub track_dirty_pages: bool,
    /// Huge page backing ("None", "2M").
    pub huge_pages: String,
}

impl MachineConfig {
    /// Create a new machine configuration with SMT, dirty tracking and huge pages off.
    pub fn new(vcpu_count: u8, mem_size_mib: u32) -> Self {
        Self {
            vcpu_count,
            mem_size_mib,
            smt: false,
            track_dirty_pages: false,
            huge_pages: "None".to_string(),
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self::new(2, 512)
    }
}

/// Boot source configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    /// Path to the kernel image.
    pub kernel_image_path: PathBuf,
    /// Kernel boot arguments.
    pub boot_args: String,
}

impl BootSource {
    /// Boot source for a guest, embedding agent, tenant and slot in the
    /// kernel command line so the guest can find out who it is.
    pub fn for_guest(kernel_image_path: PathBuf, agent_id: &str, tenant: &str, slot: u32) -> Self {
        Self {
            kernel_image_path,
            boot_args: format!(
                "reboot=k panic=1 agent={} tenant={} slot={}",
                agent_id, tenant, slot
            ),
        }
    }
}

/// Block device (drive) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier.
    pub drive_id: String,
    /// Path to the drive image file.
    pub path_on_host: PathBuf,
    /// Whether this is the root device.
    pub is_root_device: bool,
    /// Whether the drive is read-only.
    pub is_read_only: bool,
}

impl DriveConfig {
    /// Writable root disk. Agents keep their disk state across restarts.
    pub fn root_disk(path: PathBuf) -> Self {
        Self {
            drive_id: "rootfs".to_string(),
            path_on_host: path,
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Unique interface identifier.
    pub iface_id: String,
    /// Guest MAC address.
    pub guest_mac: String,
    /// Host device name (tap device).
    pub host_dev_name: String,
}

impl NetworkInterface {
    /// The guest's eth0.
    pub fn eth0(guest_mac: String, host_dev_name: String) -> Self {
        Self {
            iface_id: "eth0".to_string(),
            guest_mac,
            host_dev_name,
        }
    }
}

/// Instance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    /// Boot the configured microVM.
    InstanceStart,
    /// Ask the guest to shut down.
    SendCtrlAltDel,
}

/// Body of `PUT /actions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceAction {
    pub action_type: ActionType,
}

/// Response of `GET /`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceInfo {
    /// The `--id` the hypervisor was started with.
    pub id: String,
    /// State of the instance.
    #[serde(default)]
    pub state: Option<String>,
}
