//! FUSE session setup.
//!
//! Translates [`MountOptions`] into `fuser` options and spawns the kernel
//! dispatch loop on a background thread. Dropping the returned
//! [`fuser::BackgroundSession`] unmounts.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{FsError, Result};
use crate::filesystem::DistFs;

/// Mount options.
///
/// The kernel mount itself stays writable: mutating requests must reach
/// [`DistFs`] so they are refused with EPERM, and unlink must get through
/// to drop cached pages for a changed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountOptions {
    /// Filesystem name shown in the mount table.
    pub fsname: String,
    /// Allow other users to access.
    pub allow_other: bool,
    /// Unmount when the daemon exits.
    pub auto_unmount: bool,
    /// Allow mounting over a non-empty directory.
    pub nonempty: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        MountOptions {
            fsname: "distfs".to_string(),
            allow_other: false,
            auto_unmount: false,
            nonempty: true,
        }
    }
}

/// Convert MountOptions to fuser::MountOption vec.
pub fn options_to_fuser(opts: &MountOptions) -> Vec<fuser::MountOption> {
    let mut fuser_opts = vec![fuser::MountOption::FSName(opts.fsname.clone())];

    if opts.allow_other {
        fuser_opts.push(fuser::MountOption::AllowOther);
    }

    if opts.auto_unmount {
        fuser_opts.push(fuser::MountOption::AutoUnmount);
    }

    if opts.nonempty {
        fuser_opts.push(fuser::MountOption::CUSTOM("nonempty".into()));
    }

    fuser_opts
}

/// Validate a mountpoint path.
pub fn validate_mountpoint(path: &Path) -> Result<()> {
    let mountpoint = path.display().to_string();
    if !path.exists() {
        return Err(FsError::MountFailed {
            mountpoint,
            reason: "path not found".into(),
        });
    }

    if !path.is_dir() {
        return Err(FsError::MountFailed {
            mountpoint,
            reason: "not a directory".into(),
        });
    }

    Ok(())
}

/// Mount `fs` at `mountpoint` and serve it from a background thread.
pub fn spawn_session(
    fs: DistFs,
    mountpoint: &Path,
    opts: &MountOptions,
) -> Result<fuser::BackgroundSession> {
    validate_mountpoint(mountpoint)?;
    let options = options_to_fuser(opts);
    let session =
        fuser::spawn_mount2(fs, mountpoint, &options).map_err(|e| FsError::MountFailed {
            mountpoint: mountpoint.display().to_string(),
            reason: e.to_string(),
        })?;
    info!("mounted at {}", mountpoint.display());
    Ok(session)
}
