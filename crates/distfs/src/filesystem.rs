//! `fuser::Filesystem` adapter.
//!
//! Maps kernel inode numbers to mount-relative paths and forwards each
//! request to the path-based operations on [`Mount`]. Requests that touch the
//! node tree run as tokio tasks; the reply object moves into the task so the
//! FUSE dispatch thread never blocks on a fetch.

use std::ffi::OsStr;
use std::future::Future;
use std::os::raw::c_int;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileType as FuserFileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::debug;

use crate::attr::NodeKind;
use crate::config::DistFsConfig;
use crate::error::FsError;
use crate::inode::{InodeId, InodeTable, ROOT_INODE};
use crate::mount::Mount;
use crate::operations::MutatingOp;

/// [`fuser::Filesystem`] over a [`Mount`]. Each callback runs as a task on
/// the captured runtime and replies from there.
pub struct DistFs {
    mount: Arc<Mount>,
    inodes: Arc<Mutex<InodeTable>>,
    runtime: Handle,
    attr_ttl: Duration,
    entry_ttl: Duration,
}

impl DistFs {
    /// Adapter serving `mount`, spawning requests on `runtime`.
    pub fn new(mount: Arc<Mount>, runtime: Handle, config: &DistFsConfig) -> Self {
        Self {
            mount,
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            runtime,
            attr_ttl: config.attr_timeout(),
            entry_ttl: config.entry_timeout(),
        }
    }

    /// The mirrored tree.
    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    fn path_of(&self, ino: InodeId) -> Option<String> {
        self.inodes.lock().path_of(ino).map(str::to_string)
    }

    fn child_path(&self, parent: InodeId, name: &OsStr) -> Option<String> {
        self.inodes
            .lock()
            .child_path(parent, &name.to_string_lossy())
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(task);
    }

    fn deny(&self, op: MutatingOp, path: Option<String>) -> c_int {
        let path = path.unwrap_or_else(|| "?".to_string());
        match self.mount.deny(op, &path) {
            Ok(()) => 0,
            Err(e) => e.to_errno(),
        }
    }
}

/// Entries of directory `ino` in kernel order: `.`, `..`, then children.
/// Each entry's offset is its index plus one.
pub fn directory_listing(
    ino: InodeId,
    parent_ino: InodeId,
    children: Vec<(InodeId, NodeKind, String)>,
) -> Vec<(InodeId, FuserFileType, String)> {
    let mut entries = vec![
        (ino, FuserFileType::Directory, ".".to_string()),
        (parent_ino, FuserFileType::Directory, "..".to_string()),
    ];
    entries.extend(
        children
            .into_iter()
            .map(|(child_ino, kind, name)| (child_ino, kind.to_fuser(), name)),
    );
    entries
}

/// The most specific operation a setattr request performs.
fn setattr_op(mode: Option<u32>, owner: Option<u32>, size: Option<u64>, fh: Option<u64>) -> MutatingOp {
    match (size, fh) {
        (Some(_), Some(_)) => MutatingOp::Ftruncate,
        (Some(_), None) => MutatingOp::Truncate,
        _ if owner.is_some() => MutatingOp::Chown,
        _ if mode.is_some() => MutatingOp::Chmod,
        _ => MutatingOp::Setattr,
    }
}

fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

impl Filesystem for DistFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        debug!("distfs init");
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("distfs destroy");
        self.mount.shutdown();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup parent={} name={}", parent, name.to_string_lossy());
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mount = self.mount.clone();
        let inodes = self.inodes.clone();
        let ttl = self.entry_ttl;
        self.spawn(async move {
            match mount.getattr(&path).await {
                Ok(attr) => {
                    let ino = inodes.lock().get_or_create(&path);
                    reply.entry(&ttl, &attr.to_fuser(ino), 0);
                }
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        debug!("forget ino={} nlookup={}", ino, nlookup);
        self.inodes.lock().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        debug!("getattr ino={}", ino);
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mount = self.mount.clone();
        let ttl = self.attr_ttl;
        self.spawn(async move {
            match mount.getattr(&path).await {
                Ok(attr) => reply.attr(&ttl, &attr.to_fuser(ino)),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr ino={}", ino);
        let op = setattr_op(mode, uid.or(gid), size, fh);
        reply.error(self.deny(op, self.path_of(ino)));
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.deny(MutatingOp::Mknod, self.child_path(parent, name)));
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(self.deny(MutatingOp::Mkdir, self.child_path(parent, name)));
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = self.child_path(parent, name).unwrap_or_default();
        match self.mount.unlink(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.deny(MutatingOp::Rmdir, self.child_path(parent, name)));
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(self.deny(MutatingOp::Symlink, self.child_path(parent, link_name)));
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _newparent: u64,
        _newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.deny(MutatingOp::Rename, self.child_path(parent, name)));
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(self.deny(MutatingOp::Link, self.path_of(ino)));
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open ino={} flags={}", ino, flags);
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mount = self.mount.clone();
        self.spawn(async move {
            match mount.open(&path, flags).await {
                Ok(fh) => reply.opened(fh, 0),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read ino={} fh={} offset={} size={}", ino, fh, offset, size);
        let Ok(offset) = u64::try_from(offset) else {
            let err = FsError::InvalidArgument {
                msg: format!("negative read offset {}", offset),
            };
            reply.error(err.to_errno());
            return;
        };

        let mount = self.mount.clone();
        self.spawn(async move {
            let mut buf = vec![0u8; size as usize];
            match mount.read(fh, &mut buf, offset).await {
                Ok(n) => reply.data(&buf[..n]),
                Err(e) => reply.error(e.to_errno()),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        reply.error(self.deny(MutatingOp::Write, self.path_of(ino)));
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.mount.release(fh);
        reply.ok();
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir ino={} offset={}", ino, offset);
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let mount = self.mount.clone();
        let inodes = self.inodes.clone();
        self.spawn(async move {
            let entries = match mount.readdir_entries(&path).await {
                Ok(entries) => entries,
                Err(e) => {
                    reply.error(e.to_errno());
                    return;
                }
            };

            let listing = {
                let table = inodes.lock();
                let parent_ino = if ino == ROOT_INODE {
                    ROOT_INODE
                } else {
                    table.ino_of(parent_path(&path)).unwrap_or(ROOT_INODE)
                };
                // Children the kernel has not looked up yet report the
                // directory's own inode; d_ino of zero would hide them.
                let children = entries
                    .into_iter()
                    .map(|(name, kind)| {
                        let child = table.child_path(ino, &name).unwrap_or_default();
                        (table.ino_of(&child).unwrap_or(ino), kind, name)
                    })
                    .collect();
                directory_listing(ino, parent_ino, children)
            };

            let skip = usize::try_from(offset).unwrap_or(0);
            for (idx, (entry_ino, kind, name)) in listing.iter().enumerate().skip(skip) {
                if reply.add(*entry_ino, (idx + 1) as i64, *kind, name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.deny(MutatingOp::Setxattr, self.path_of(ino)));
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(self.deny(MutatingOp::Removexattr, self.path_of(ino)));
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        reply.error(self.deny(MutatingOp::Create, self.child_path(parent, name)));
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        reply.error(self.deny(MutatingOp::Fallocate, self.path_of(ino)));
    }
}
