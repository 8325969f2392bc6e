//! Access to the real source tree.
//!
//! The node tree never touches the filesystem directly; it goes through
//! [`SourceFs`] so listing, stat and read calls can be counted and gated in
//! tests.

use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

/// Classification of a source entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Directory.
    Directory,
    /// Regular file.
    File,
    /// Symlink targets that are neither, devices, sockets, fifos.
    Other,
}

/// Snapshot of the stat fields the mount exposes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMeta {
    /// Entry type.
    pub kind: SourceKind,
    /// Last access.
    pub atime: SystemTime,
    /// Last modification.
    pub mtime: SystemTime,
    /// Last status change.
    pub ctime: SystemTime,
    /// Creation, or `mtime` where unsupported.
    pub crtime: SystemTime,
}

impl SourceMeta {
    /// Metadata with every timestamp set to `time`.
    pub fn at(kind: SourceKind, time: SystemTime) -> Self {
        SourceMeta {
            kind,
            atime: time,
            mtime: time,
            ctime: time,
            crtime: time,
        }
    }
}

impl From<&std::fs::Metadata> for SourceMeta {
    fn from(meta: &std::fs::Metadata) -> Self {
        let kind = if meta.is_dir() {
            SourceKind::Directory
        } else if meta.is_file() {
            SourceKind::File
        } else {
            SourceKind::Other
        };
        let ctime = if meta.ctime() >= 0 {
            UNIX_EPOCH + Duration::new(meta.ctime() as u64, meta.ctime_nsec() as u32)
        } else {
            UNIX_EPOCH
        };
        SourceMeta {
            kind,
            atime: meta.accessed().unwrap_or(UNIX_EPOCH),
            mtime: meta.modified().unwrap_or(UNIX_EPOCH),
            ctime,
            crtime: meta.created().unwrap_or(UNIX_EPOCH),
        }
    }
}

/// Directory listing, stat and read primitives on the source tree.
#[async_trait]
pub trait SourceFs: Send + Sync {
    /// Names of the entries in `path`, without `.` and `..`.
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Stat `path`, following symlinks.
    async fn stat(&self, path: &Path) -> io::Result<SourceMeta>;

    /// Full raw content of the file at `path`.
    async fn read(&self, path: &Path) -> io::Result<Bytes>;
}

/// [`SourceFs`] over the local filesystem using `tokio::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

#[async_trait]
impl SourceFs for LocalFs {
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => debug!("skipping non UTF-8 entry {:?} in {}", raw, path.display()),
            }
        }
        Ok(names)
    }

    async fn stat(&self, path: &Path) -> io::Result<SourceMeta> {
        let meta = tokio::fs::metadata(path).await?;
        Ok(SourceMeta::from(&meta))
    }

    async fn read(&self, path: &Path) -> io::Result<Bytes> {
        tokio::fs::read(path).await.map(Bytes::from)
    }
}
