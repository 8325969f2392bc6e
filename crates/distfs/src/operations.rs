//! Path-based protocol operations on a [`Mount`].
//!
//! Paths are mount-relative (`/`, `/a/b.js`). Every outcome is either a
//! value or an [`FsError`] whose errno is what the kernel gets back.

use futures::future::join_all;
use tracing::{debug, warn};

use crate::attr::{NodeAttr, NodeKind};
use crate::descriptor::FileHandle;
use crate::error::{FsError, Result};
use crate::mount::Mount;
use crate::node::Node;

/// Requests that would modify the mirror. All of them are refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatingOp {
    /// write(2)
    Write,
    /// truncate(2)
    Truncate,
    /// ftruncate(2)
    Ftruncate,
    /// chown(2)
    Chown,
    /// chmod(2)
    Chmod,
    /// mknod(2)
    Mknod,
    /// creat(2), or open with O_CREAT
    Create,
    /// rename(2)
    Rename,
    /// link(2)
    Link,
    /// symlink(2)
    Symlink,
    /// mkdir(2)
    Mkdir,
    /// rmdir(2)
    Rmdir,
    /// Any other attribute change, e.g. utimes(2)
    Setattr,
    /// setxattr(2)
    Setxattr,
    /// removexattr(2)
    Removexattr,
    /// fallocate(2)
    Fallocate,
}

impl MutatingOp {
    /// Every mutating operation.
    pub const ALL: [MutatingOp; 16] = [
        MutatingOp::Write,
        MutatingOp::Truncate,
        MutatingOp::Ftruncate,
        MutatingOp::Chown,
        MutatingOp::Chmod,
        MutatingOp::Mknod,
        MutatingOp::Create,
        MutatingOp::Rename,
        MutatingOp::Link,
        MutatingOp::Symlink,
        MutatingOp::Mkdir,
        MutatingOp::Rmdir,
        MutatingOp::Setattr,
        MutatingOp::Setxattr,
        MutatingOp::Removexattr,
        MutatingOp::Fallocate,
    ];

    /// Name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            MutatingOp::Write => "write",
            MutatingOp::Truncate => "truncate",
            MutatingOp::Ftruncate => "ftruncate",
            MutatingOp::Chown => "chown",
            MutatingOp::Chmod => "chmod",
            MutatingOp::Mknod => "mknod",
            MutatingOp::Create => "create",
            MutatingOp::Rename => "rename",
            MutatingOp::Link => "link",
            MutatingOp::Symlink => "symlink",
            MutatingOp::Mkdir => "mkdir",
            MutatingOp::Rmdir => "rmdir",
            MutatingOp::Setattr => "setattr",
            MutatingOp::Setxattr => "setxattr",
            MutatingOp::Removexattr => "removexattr",
            MutatingOp::Fallocate => "fallocate",
        }
    }
}

/// Number of bytes of a `len`-byte buffer readable at `offset` into a
/// `capacity`-byte destination.
pub fn clamp_read(len: usize, offset: u64, capacity: usize) -> usize {
    let offset = usize::try_from(offset).unwrap_or(usize::MAX);
    len.saturating_sub(offset).min(capacity)
}

impl Mount {
    /// Synthetic attributes. For files this fetches the content, since the
    /// reported size is the transformed length.
    pub async fn getattr(&self, path: &str) -> Result<NodeAttr> {
        debug!("getattr {}", path);
        match self.resolve(path).await? {
            Node::Directory(dir) => Ok(NodeAttr::directory(dir.meta())),
            Node::File(file) => {
                let data = file.content().await?;
                Ok(NodeAttr::file(file.meta(), data.len() as u64, file.mtime()))
            }
        }
    }

    /// Names in the directory at `path`, sorted.
    pub async fn readdir(&self, path: &str) -> Result<Vec<String>> {
        debug!("readdir {}", path);
        match self.resolve(path).await? {
            Node::Directory(dir) => Ok(dir.content().await?.into_keys().collect()),
            Node::File(file) => Err(FsError::NotADirectory {
                path: file.path().display().to_string(),
            }),
        }
    }

    /// Like [`readdir`](Self::readdir), but materializes every entry to learn
    /// its kind. Entries that vanish or are neither file nor directory are
    /// left out.
    pub async fn readdir_entries(&self, path: &str) -> Result<Vec<(String, NodeKind)>> {
        let dir = match self.resolve(path).await? {
            Node::Directory(dir) => dir,
            Node::File(file) => {
                return Err(FsError::NotADirectory {
                    path: file.path().display().to_string(),
                })
            }
        };
        let names: Vec<String> = dir.content().await?.into_keys().collect();
        let children = join_all(names.iter().map(|name| dir.child(name))).await;

        Ok(names
            .into_iter()
            .zip(children)
            .filter_map(|(name, child)| match child {
                Ok(Node::Directory(_)) => Some((name, NodeKind::Directory)),
                Ok(Node::File(_)) => Some((name, NodeKind::File)),
                Err(e) => {
                    debug!("readdir {}: skipping {}: {}", path, name, e);
                    None
                }
            })
            .collect())
    }

    /// Open a file for reading and return its handle.
    pub async fn open(&self, path: &str, flags: i32) -> Result<FileHandle> {
        debug!("open {} flags={:#o}", path, flags);
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(FsError::PermissionDenied {
                path: path.to_string(),
                op: "open for writing",
            });
        }
        match self.resolve(path).await? {
            Node::Directory(dir) => Err(FsError::IsADirectory {
                path: dir.path().display().to_string(),
            }),
            Node::File(file) => Ok(self.descriptors().allocate(file)),
        }
    }

    /// Copy transformed content at `offset` into `buf`, returning the number
    /// of bytes copied. Reads past the end copy nothing.
    pub async fn read(&self, fh: FileHandle, buf: &mut [u8], offset: u64) -> Result<usize> {
        let file = self.descriptors().lookup(fh)?;
        let data = file.content_or_last_known().await?;
        let n = clamp_read(data.len(), offset, buf.len());
        if n > 0 {
            let start = offset as usize;
            buf[..n].copy_from_slice(&data[start..start + n]);
        }
        debug!("read fh={} offset={} -> {} bytes", fh, offset, n);
        Ok(n)
    }

    /// Close `fh`. Releasing an unknown handle is a no-op.
    pub fn release(&self, fh: FileHandle) {
        debug!("release fh={}", fh);
        self.descriptors().release(fh);
    }

    /// Accepted and ignored. Invalidated files are unlinked through the
    /// mount to make the kernel drop its cached pages and dentry.
    pub fn unlink(&self, path: &str) -> Result<()> {
        debug!("unlink {} (ignored)", path);
        Ok(())
    }

    /// Refuse `op` on `path` with `PermissionDenied`.
    pub fn deny(&self, op: MutatingOp, path: &str) -> Result<()> {
        warn!("refusing {} on read-only mirror: {}", op.name(), path);
        Err(FsError::PermissionDenied {
            path: path.to_string(),
            op: op.name(),
        })
    }
}
