//! External cache busting.
//!
//! When a file node is invalidated the kernel may still hold its pages and
//! dentry. Unlinking the mounted path makes the kernel drop both; the mount's
//! own `unlink` handler answers success without touching anything, so the
//! request has no effect on the tree.

use std::path::Path;

use tokio::runtime::Handle;
use tracing::debug;

/// Notifies observers outside the mount that a mounted path changed.
pub trait CacheBuster: Send + Sync {
    /// Report that `mount_path` changed.
    fn bust(&self, mount_path: &Path);
}

/// Busts by unlinking the mounted path on the blocking pool.
#[derive(Debug, Clone)]
pub struct UnlinkBuster {
    runtime: Handle,
}

impl UnlinkBuster {
    /// Unlinks are run on the blocking pool of `runtime`.
    pub fn new(runtime: Handle) -> Self {
        UnlinkBuster { runtime }
    }
}

impl CacheBuster for UnlinkBuster {
    fn bust(&self, mount_path: &Path) {
        let path = mount_path.to_path_buf();
        self.runtime.spawn_blocking(move || {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("cache bust unlink {} failed: {}", path.display(), e);
            }
        });
    }
}

/// Does nothing. For mounts that no kernel observes.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBuster;

impl CacheBuster for NoopBuster {
    fn bust(&self, _mount_path: &Path) {}
}
