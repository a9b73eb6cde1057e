//! Startup installation checks.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

use crate::config::{socket_dir, Config};

/// A missing or unusable installation component.
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error("{what} {path} does not exist")]
    Missing { what: &'static str, path: PathBuf },

    #[error("{what} {path} is not a regular file")]
    NotAFile { what: &'static str, path: PathBuf },

    #[error("{what} {path} is not a directory")]
    NotADirectory { what: &'static str, path: PathBuf },

    #[error("cannot inspect {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Verify the hypervisor, kernel, rootfs directory and socket directory.
pub fn verify_installation(config: &Config) -> Result<(), PreflightError> {
    require_file("firecracker binary", &config.firecracker_binary)?;
    require_file("kernel image", &config.kernel_path)?;
    require_dir("rootfs directory", &config.rootfs_dir)?;
    require_dir("socket directory", socket_dir(&config.socket_prefix))?;

    info!(
        firecracker = %config.firecracker_binary.display(),
        kernel = %config.kernel_path.display(),
        rootfs_dir = %config.rootfs_dir.display(),
        "Installation verified"
    );
    Ok(())
}

fn metadata(what: &'static str, path: &Path) -> Result<std::fs::Metadata, PreflightError> {
    std::fs::metadata(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            PreflightError::Missing {
                what,
                path: path.to_path_buf(),
            }
        } else {
            PreflightError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn require_file(what: &'static str, path: &Path) -> Result<(), PreflightError> {
    if metadata(what, path)?.is_file() {
        Ok(())
    } else {
        Err(PreflightError::NotAFile {
            what,
            path: path.to_path_buf(),
        })
    }
}

fn require_dir(what: &'static str, path: &Path) -> Result<(), PreflightError> {
    if metadata(what, path)?.is_dir() {
        Ok(())
    } else {
        Err(PreflightError::NotADirectory {
            what,
            path: path.to_path_buf(),
        })
    }
}
