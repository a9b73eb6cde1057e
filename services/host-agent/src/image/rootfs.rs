//! Per-agent root filesystem provisioning.
//!
//! Both base images and agent disks live in one directory:
//!
//! ```text
//! <rootfs_dir>/<image_name>.ext4   shared base image
//! <rootfs_dir>/<agent_id>.ext4     the agent's writable disk
//! ```
//!
//! An agent's disk is cloned from its image once and then reused for the
//! life of the agent, across restarts and moves between slots.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use vmfleet_reconcile::SlotDefinition;

/// File extension of disk images.
const IMAGE_EXTENSION: &str = "ext4";

/// Errors from root filesystem provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("root filesystem directory is not configured")]
    Unconfigured,

    #[error("image file {0} is missing")]
    MissingImage(PathBuf),

    #[error("{0} exists but is not a regular file")]
    NotRegularFile(PathBuf),

    #[error("invalid {kind} name {name:?}")]
    InvalidName { kind: &'static str, name: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A provisioned disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedDisk {
    /// Path of the agent's disk.
    pub path: PathBuf,
    /// True when this call cloned the image.
    pub created: bool,
}

/// Clones base images into per-agent disks.
#[derive(Debug, Clone)]
pub struct RootfsProvisioner {
    rootfs_dir: PathBuf,
}

impl RootfsProvisioner {
    /// Create a provisioner over a rootfs directory.
    pub fn new(rootfs_dir: impl Into<PathBuf>) -> Self {
        Self {
            rootfs_dir: rootfs_dir.into(),
        }
    }

    /// Path of an agent's disk.
    pub fn agent_disk_path(&self, agent_id: &str) -> Result<PathBuf, ProvisionError> {
        self.disk_path("agent", agent_id)
    }

    /// Path of a base image.
    pub fn image_path(&self, image_name: &str) -> Result<PathBuf, ProvisionError> {
        self.disk_path("image", image_name)
    }

    /// Return the agent's disk, cloning it from the slot's image on first use.
    pub fn provision(&self, slot: &SlotDefinition) -> Result<ProvisionedDisk, ProvisionError> {
        let disk = self.agent_disk_path(&slot.agent_id)?;

        match fs::metadata(&disk) {
            Ok(meta) if meta.is_file() => {
                debug!(agent_id = %slot.agent_id, path = %disk.display(), "Agent disk already exists");
                return Ok(ProvisionedDisk {
                    path: disk,
                    created: false,
                });
            }
            Ok(_) => return Err(ProvisionError::NotRegularFile(disk)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ProvisionError::io(&disk, e)),
        }

        let image = self.image_path(&slot.image_name)?;
        match fs::metadata(&image) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Err(ProvisionError::NotRegularFile(image)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ProvisionError::MissingImage(image))
            }
            Err(e) => return Err(ProvisionError::io(&image, e)),
        }

        info!(
            agent_id = %slot.agent_id,
            image = %image.display(),
            path = %disk.display(),
            "Cloning agent disk from image"
        );
        copy_atomically(&image, &disk)?;

        Ok(ProvisionedDisk {
            path: disk,
            created: true,
        })
    }

    fn disk_path(&self, kind: &'static str, name: &str) -> Result<PathBuf, ProvisionError> {
        if self.rootfs_dir.as_os_str().is_empty() {
            return Err(ProvisionError::Unconfigured);
        }
        if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\', '\0']) {
            return Err(ProvisionError::InvalidName {
                kind,
                name: name.to_string(),
            });
        }
        Ok(self
            .rootfs_dir
            .join(format!("{}.{}", name, IMAGE_EXTENSION)))
    }
}

/// Copy `src` to `dst` so that `dst` only ever appears fully written.
///
/// The data goes to a hidden temporary file in the destination directory,
/// is synced, and then renamed into place.
fn copy_atomically(src: &Path, dst: &Path) -> Result<(), ProvisionError> {
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dst.with_file_name(format!(".{}.partial-{}", file_name, std::process::id()));

    let result = (|| {
        fs::copy(src, &tmp).map_err(|e| ProvisionError::io(&tmp, e))?;
        File::open(&tmp)
            .and_then(|f| f.sync_all())
            .map_err(|e| ProvisionError::io(&tmp, e))?;
        fs::rename(&tmp, dst).map_err(|e| ProvisionError::io(dst, e))
    })();

    if result.is_err() {
        fs::remove_file(&tmp).ok();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(agent: &str, image: &str) -> SlotDefinition {
        SlotDefinition {
            agent_id: agent.to_string(),
            slot: 1,
            image_name: image.to_string(),
            enabled: true,
        }
    }

    #[test]
    fn test_clones_image_once() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.ext4"), b"image-bytes").unwrap();
        let provisioner = RootfsProvisioner::new(dir.path());

        let first = provisioner.provision(&slot("agent1", "base")).unwrap();
        assert!(first.created);
        assert_eq!(first.path, dir.path().join("agent1.ext4"));
        assert_eq!(fs::read(&first.path).unwrap(), b"image-bytes");

        // Agent writes to its disk; a second provision must not clobber it.
        fs::write(&first.path, b"agent-state").unwrap();
        let second = provisioner.provision(&slot("agent1", "base")).unwrap();
        assert!(!second.created);
        assert_eq!(second.path, first.path);
        assert_eq!(fs::read(&second.path).unwrap(), b"agent-state");
    }

    #[test]
    fn test_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = RootfsProvisioner::new(dir.path());

        let err = provisioner.provision(&slot("agent1", "absent")).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingImage(_)));
        assert!(!dir.path().join("agent1.ext4").exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_image_must_be_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("base.ext4")).unwrap();
        let provisioner = RootfsProvisioner::new(dir.path());

        let err = provisioner.provision(&slot("agent1", "base")).unwrap_err();
        assert!(matches!(err, ProvisionError::NotRegularFile(_)));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = RootfsProvisioner::new(dir.path());

        assert!(matches!(
            provisioner.provision(&slot("../etc/passwd", "base")),
            Err(ProvisionError::InvalidName { kind: "agent", .. })
        ));
        assert!(matches!(
            provisioner.provision(&slot("agent1", "..")),
            Err(ProvisionError::InvalidName { kind: "image", .. })
        ));
    }

    #[test]
    fn test_unconfigured_dir() {
        let provisioner = RootfsProvisioner::new("");
        assert!(matches!(
            provisioner.provision(&slot("a", "b")),
            Err(ProvisionError::Unconfigured)
        ));
    }

    #[test]
    fn test_no_partial_file_left_on_success() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("base.ext4"), vec![7u8; 64 * 1024]).unwrap();
        let provisioner = RootfsProvisioner::new(dir.path());

        provisioner.provision(&slot("agent1", "base")).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2, "unexpected files: {names:?}");
        assert!(names.iter().all(|n| !n.contains("partial")));
    }
}
