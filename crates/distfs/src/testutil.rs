//! In-memory collaborators shared by the unit tests.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::cache_bust::CacheBuster;
use crate::filter::{Filter, IdentityFilter};
use crate::mount::{Collaborators, Mount};
use crate::node::Context;
use crate::source::{SourceFs, SourceKind, SourceMeta};
use crate::watch::ManualWatchSource;

pub const SOURCE_ROOT: &str = "/src";
pub const MOUNT_ROOT: &str = "/mnt";

const OPEN: usize = 1_000;

pub fn source_mtime() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_000_000)
}

#[derive(Debug, Clone)]
enum FakeEntry {
    Dir,
    File(Bytes),
    Other,
}

/// Source tree held in memory, counting every primitive call. While gated,
/// calls wait until [`FakeSource::open_gate`].
pub struct FakeSource {
    entries: Mutex<BTreeMap<PathBuf, FakeEntry>>,
    list_gate: Semaphore,
    io_gate: Semaphore,
    pub listings: AtomicUsize,
    pub stats: AtomicUsize,
    pub reads: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Self::with_gates(OPEN, OPEN)
    }

    /// Every primitive waits for the gate.
    pub fn gated() -> Arc<Self> {
        Self::with_gates(0, 0)
    }

    /// Listings pass; stat and read wait for the gate.
    pub fn gated_io() -> Arc<Self> {
        Self::with_gates(OPEN, 0)
    }

    fn with_gates(list_permits: usize, io_permits: usize) -> Arc<Self> {
        let source = FakeSource {
            entries: Mutex::new(BTreeMap::new()),
            list_gate: Semaphore::new(list_permits),
            io_gate: Semaphore::new(io_permits),
            listings: AtomicUsize::new(0),
            stats: AtomicUsize::new(0),
            reads: AtomicUsize::new(0),
        };
        source.add_dir(SOURCE_ROOT);
        Arc::new(source)
    }

    pub fn open_gate(&self) {
        for gate in [&self.list_gate, &self.io_gate] {
            if gate.available_permits() == 0 {
                gate.add_permits(OPEN);
            }
        }
    }

    pub fn add_dir(&self, path: &str) {
        self.entries.lock().insert(PathBuf::from(path), FakeEntry::Dir);
    }

    pub fn add_file(&self, path: &str, content: &str) {
        self.entries.lock().insert(
            PathBuf::from(path),
            FakeEntry::File(Bytes::from(content.to_string())),
        );
    }

    pub fn add_other(&self, path: &str) {
        self.entries.lock().insert(PathBuf::from(path), FakeEntry::Other);
    }

    pub fn remove(&self, path: &str) {
        let prefix = PathBuf::from(path);
        self.entries.lock().retain(|p, _| !p.starts_with(&prefix));
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    async fn pass_gate(gate: &Semaphore) {
        if let Ok(permit) = gate.acquire().await {
            drop(permit);
        }
    }

    fn lookup(&self, path: &Path) -> io::Result<FakeEntry> {
        self.entries
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::ENOENT))
    }
}

#[async_trait]
impl SourceFs for FakeSource {
    async fn read_dir(&self, path: &Path) -> io::Result<Vec<String>> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        Self::pass_gate(&self.list_gate).await;
        match self.lookup(path)? {
            FakeEntry::Dir => {}
            _ => return Err(io::Error::from_raw_os_error(libc::ENOTDIR)),
        }
        let entries = self.entries.lock();
        Ok(entries
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }

    async fn stat(&self, path: &Path) -> io::Result<SourceMeta> {
        self.stats.fetch_add(1, Ordering::SeqCst);
        Self::pass_gate(&self.io_gate).await;
        let kind = match self.lookup(path)? {
            FakeEntry::Dir => SourceKind::Directory,
            FakeEntry::File(_) => SourceKind::File,
            FakeEntry::Other => SourceKind::Other,
        };
        Ok(SourceMeta::at(kind, source_mtime()))
    }

    async fn read(&self, path: &Path) -> io::Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Self::pass_gate(&self.io_gate).await;
        match self.lookup(path)? {
            FakeEntry::File(data) => Ok(data),
            FakeEntry::Dir => Err(io::Error::from_raw_os_error(libc::EISDIR)),
            FakeEntry::Other => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
    }
}

/// Records every busted mount path.
#[derive(Default)]
pub struct RecordingBuster {
    pub busted: Mutex<Vec<PathBuf>>,
}

impl CacheBuster for RecordingBuster {
    fn bust(&self, mount_path: &Path) {
        self.busted.lock().push(mount_path.to_path_buf());
    }
}

pub struct Harness {
    pub source: Arc<FakeSource>,
    pub watcher: Arc<ManualWatchSource>,
    pub buster: Arc<RecordingBuster>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new(source: Arc<FakeSource>) -> Self {
        Self::with_filter(source, Arc::new(IdentityFilter))
    }

    pub fn with_filter(source: Arc<FakeSource>, filter: Arc<dyn Filter>) -> Self {
        let watcher = Arc::new(ManualWatchSource::new());
        let buster = Arc::new(RecordingBuster::default());
        let ctx = Arc::new(Context {
            source: source.clone(),
            watcher: watcher.clone(),
            filter,
            buster: buster.clone(),
            source_root: PathBuf::from(SOURCE_ROOT),
            mount_root: PathBuf::from(MOUNT_ROOT),
        });
        Harness {
            source,
            watcher,
            buster,
            ctx,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            source: self.source.clone(),
            watcher: self.watcher.clone(),
            filter: self.ctx.filter.clone(),
            buster: self.buster.clone(),
        }
    }

    /// A mount of `/src` at `/mnt` sharing this harness's collaborators.
    pub async fn mount(&self) -> Mount {
        match Mount::new(SOURCE_ROOT, MOUNT_ROOT, self.collaborators()).await {
            Ok(mount) => mount,
            Err(e) => panic!("mount failed: {}", e),
        }
    }

    pub fn trigger(&self, path: &str) -> usize {
        self.watcher.trigger(Path::new(path))
    }
}
