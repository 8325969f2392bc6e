use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{FsError, Result};
use crate::node::FileNode;

/// Handle returned by open and passed back on read and release.
pub type FileHandle = u64;

/// Handles below this value are never issued.
pub const RESERVED_HANDLES: FileHandle = 10;

#[derive(Default)]
struct Slots {
    open: Vec<Option<Arc<FileNode>>>,
    free: BTreeSet<FileHandle>,
}

/// Open file handles. Each handle shares the file node it was opened on.
#[derive(Default)]
pub struct DescriptorTable {
    slots: Mutex<Slots>,
}

impl DescriptorTable {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the lowest free handle for `node`.
    pub fn allocate(&self, node: Arc<FileNode>) -> FileHandle {
        let mut slots = self.slots.lock();
        let fh = match slots.free.pop_first() {
            Some(fh) => {
                slots.open[(fh - RESERVED_HANDLES) as usize] = Some(node);
                fh
            }
            None => {
                slots.open.push(Some(node));
                RESERVED_HANDLES + slots.open.len() as FileHandle - 1
            }
        };
        tracing::debug!("allocated fh={}", fh);
        fh
    }

    /// The file behind `fh`, or `BadDescriptor`.
    pub fn lookup(&self, fh: FileHandle) -> Result<Arc<FileNode>> {
        let slots = self.slots.lock();
        fh.checked_sub(RESERVED_HANDLES)
            .and_then(|idx| slots.open.get(idx as usize))
            .and_then(|slot| slot.clone())
            .ok_or(FsError::BadDescriptor { fh })
    }

    /// Free `fh`. Unknown or already released handles are ignored.
    pub fn release(&self, fh: FileHandle) {
        let mut slots = self.slots.lock();
        let Some(idx) = fh.checked_sub(RESERVED_HANDLES) else {
            return;
        };
        if let Some(slot) = slots.open.get_mut(idx as usize) {
            if slot.take().is_some() {
                slots.free.insert(fh);
                tracing::debug!("released fh={}", fh);
            }
        }
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock();
        slots.open.len() - slots.free.len()
    }

    /// Whether no handle is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
