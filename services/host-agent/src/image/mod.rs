//! Guest disk images.

mod rootfs;

pub use rootfs::{ProvisionError, ProvisionedDisk, RootfsProvisioner};
