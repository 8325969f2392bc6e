use std::time::SystemTime;

use crate::source::SourceMeta;

/// Permission bits of every directory.
pub const DIR_PERM: u16 = 0o555;
/// Permission bits of every file.
pub const FILE_PERM: u16 = 0o444;
/// Size reported for directories.
pub const DIR_SIZE: u64 = 4096;
const BLKSIZE: u32 = 4096;

/// Kind of a mirrored node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Directory.
    Directory,
    /// Regular file.
    File,
}

impl NodeKind {
    /// Matching `fuser` file type.
    pub fn to_fuser(self) -> fuser::FileType {
        match self {
            NodeKind::Directory => fuser::FileType::Directory,
            NodeKind::File => fuser::FileType::RegularFile,
        }
    }
}

/// Synthetic, read-only attributes reported for a mirrored node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAttr {
    /// Directory or file.
    pub kind: NodeKind,
    /// Size of the transformed content in bytes.
    pub size: u64,
    /// Permission bits.
    pub perm: u16,
    /// Link count.
    pub nlink: u32,
    /// Owner, always the daemon process.
    pub uid: u32,
    /// Group, always the daemon process.
    pub gid: u32,
    /// Source access time.
    pub atime: SystemTime,
    /// Time of the last content fetch.
    pub mtime: SystemTime,
    /// Source change time.
    pub ctime: SystemTime,
    /// Source creation time.
    pub crtime: SystemTime,
}

impl NodeAttr {
    /// Attributes of a directory with the given source timestamps.
    pub fn directory(meta: &SourceMeta) -> Self {
        let (uid, gid) = process_owner();
        NodeAttr {
            kind: NodeKind::Directory,
            size: DIR_SIZE,
            perm: DIR_PERM,
            nlink: 2,
            uid,
            gid,
            atime: meta.atime,
            mtime: meta.mtime,
            ctime: meta.ctime,
            crtime: meta.crtime,
        }
    }

    /// `size` is the transformed length, `mtime` the last fetch time.
    pub fn file(meta: &SourceMeta, size: u64, mtime: SystemTime) -> Self {
        let (uid, gid) = process_owner();
        NodeAttr {
            kind: NodeKind::File,
            size,
            perm: FILE_PERM,
            nlink: 1,
            uid,
            gid,
            atime: meta.atime,
            mtime,
            ctime: meta.ctime,
            crtime: meta.crtime,
        }
    }

    /// 512-byte blocks covering `size`.
    pub fn blocks(&self) -> u64 {
        self.size.div_ceil(512)
    }

    /// Convert to the `fuser` representation for inode `ino`.
    pub fn to_fuser(&self, ino: u64) -> fuser::FileAttr {
        fuser::FileAttr {
            ino,
            size: self.size,
            blocks: self.blocks(),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
            crtime: self.crtime,
            kind: self.kind.to_fuser(),
            perm: self.perm,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLKSIZE,
            flags: 0,
        }
    }
}

fn process_owner() -> (u32, u32) {
    // SAFETY: getuid and getgid cannot fail and touch no memory.
    unsafe { (libc::getuid(), libc::getgid()) }
}
