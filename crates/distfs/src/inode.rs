use std::collections::HashMap;

/// Inode number.
pub type InodeId = u64;
/// Inode of the mount root.
pub const ROOT_INODE: InodeId = 1;

#[derive(Debug, Clone)]
struct InodeEntry {
    path: String,
    lookup_count: u64,
}

/// Kernel inode numbers for mount-relative paths.
///
/// The root is always present. Other entries live until the kernel forgets
/// every lookup it was given.
pub struct InodeTable {
    entries: HashMap<InodeId, InodeEntry>,
    by_path: HashMap<String, InodeId>,
    next_ino: InodeId,
}

impl InodeTable {
    /// A table holding only the root.
    pub fn new() -> Self {
        let mut table = InodeTable {
            entries: HashMap::new(),
            by_path: HashMap::new(),
            next_ino: ROOT_INODE + 1,
        };
        table.entries.insert(
            ROOT_INODE,
            InodeEntry {
                path: "/".to_string(),
                lookup_count: 1,
            },
        );
        table.by_path.insert("/".to_string(), ROOT_INODE);
        table
    }

    /// Mount-relative path of `ino`.
    pub fn path_of(&self, ino: InodeId) -> Option<&str> {
        self.entries.get(&ino).map(|e| e.path.as_str())
    }

    /// Inode already assigned to `path`, without counting a lookup.
    pub fn ino_of(&self, path: &str) -> Option<InodeId> {
        self.by_path.get(path).copied()
    }

    /// Path of `name` inside directory `parent`.
    pub fn child_path(&self, parent: InodeId, name: &str) -> Option<String> {
        let parent = self.path_of(parent)?;
        if parent == "/" {
            Some(format!("/{}", name))
        } else {
            Some(format!("{}/{}", parent, name))
        }
    }

    /// Inode for `path`, allocating one if needed, and count one lookup.
    pub fn get_or_create(&mut self, path: &str) -> InodeId {
        if let Some(&ino) = self.by_path.get(path) {
            if let Some(entry) = self.entries.get_mut(&ino) {
                entry.lookup_count += 1;
            }
            return ino;
        }

        let ino = self.next_ino;
        self.next_ino += 1;
        self.entries.insert(
            ino,
            InodeEntry {
                path: path.to_string(),
                lookup_count: 1,
            },
        );
        self.by_path.insert(path.to_string(), ino);
        tracing::trace!("inode {} -> {}", ino, path);
        ino
    }

    /// Drop `n` kernel lookups of `ino`; the entry goes away at zero. The
    /// root is never forgotten.
    pub fn forget(&mut self, ino: InodeId, n: u64) {
        if ino == ROOT_INODE {
            return;
        }
        let should_remove = if let Some(entry) = self.entries.get_mut(&ino) {
            entry.lookup_count = entry.lookup_count.saturating_sub(n);
            entry.lookup_count == 0
        } else {
            false
        };
        if should_remove {
            if let Some(entry) = self.entries.remove(&ino) {
                self.by_path.remove(&entry.path);
            }
        }
    }

    /// Number of known inodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty. Never true while the root is present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
