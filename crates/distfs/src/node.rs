//! The cached mirror tree.
//!
//! Every directory and file of the source tree that has been looked up is
//! represented by a node holding its cached listing or transformed content.
//! A node fetches lazily, lets concurrent callers join a single in-flight
//! fetch, and subscribes to changes on its source path once the fetch
//! succeeded. A change notification only marks the node stale; the refetch
//! happens on the next access.
//!
//! Lock order is parent before child. No node lock is held across an
//! `.await` or while a subscription is being dropped.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::cache_bust::CacheBuster;
use crate::error::{FsError, Result};
use crate::filter::{apply_or_fallback, Filter};
use crate::source::{SourceFs, SourceKind, SourceMeta};
use crate::watch::{Subscription, WatchSource};

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Collaborators shared by every node of one mount.
pub struct Context {
    /// Source tree access.
    pub source: Arc<dyn SourceFs>,
    /// Change notification.
    pub watcher: Arc<dyn WatchSource>,
    /// Content filter.
    pub filter: Arc<dyn Filter>,
    /// External cache invalidation.
    pub buster: Arc<dyn CacheBuster>,
    /// Source directory mirrored at `mount_root`.
    pub source_root: PathBuf,
    /// Where the source tree is mounted.
    pub mount_root: PathBuf,
}

impl Context {
    /// Path under the mountpoint corresponding to `source_path`.
    pub fn mount_path(&self, source_path: &Path) -> PathBuf {
        match source_path.strip_prefix(&self.source_root) {
            Ok(rel) if rel.as_os_str().is_empty() => self.mount_root.clone(),
            Ok(rel) => self.mount_root.join(rel),
            Err(_) => source_path.to_path_buf(),
        }
    }
}

fn source_error(path: &Path, e: io::Error) -> FsError {
    if e.kind() == io::ErrorKind::NotFound {
        FsError::not_found(path)
    } else {
        FsError::io(path, e)
    }
}

/// A materialized entry of the tree.
#[derive(Clone)]
pub enum Node {
    /// Directory node.
    Directory(Arc<DirNode>),
    /// File node.
    File(Arc<FileNode>),
}

impl Node {
    fn from_meta(path: PathBuf, meta: SourceMeta, ctx: Arc<Context>) -> Option<Node> {
        match meta.kind {
            SourceKind::Directory => Some(Node::Directory(DirNode::new(path, meta, ctx))),
            SourceKind::File => Some(Node::File(FileNode::new(path, meta, ctx))),
            SourceKind::Other => None,
        }
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        match self {
            Node::Directory(dir) => dir.path(),
            Node::File(file) => file.path(),
        }
    }

    /// Source metadata captured when the node was created.
    pub fn meta(&self) -> &SourceMeta {
        match self {
            Node::Directory(dir) => dir.meta(),
            Node::File(file) => file.meta(),
        }
    }

    /// Whether this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Directory(_))
    }

    /// Cancel this node's subscription and, for directories, detach every
    /// materialized descendant.
    pub fn detach(&self) {
        match self {
            Node::Directory(dir) => dir.detach(),
            Node::File(file) => file.detach(),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Directory(dir) => f.debug_tuple("Directory").field(&dir.path).finish(),
            Node::File(file) => f.debug_tuple("File").field(&file.path).finish(),
        }
    }
}

/// Snapshot of one child slot as seen by callers of [`DirNode::content`].
#[derive(Debug, Clone)]
pub enum Child {
    /// Listed but not yet stat-ed.
    Unresolved,
    /// Materialized node.
    Node(Node),
}

impl Child {
    /// The node, if materialized.
    pub fn node(&self) -> Option<&Node> {
        match self {
            Child::Node(node) => Some(node),
            Child::Unresolved => None,
        }
    }
}

/// Children by name.
pub type Listing = BTreeMap<String, Child>;

enum Slot {
    Unresolved,
    Materializing {
        token: u64,
        fetch: SharedFetch<Option<Node>>,
    },
    Materialized(Node),
}

impl Slot {
    fn to_child(&self) -> Child {
        match self {
            Slot::Materialized(node) => Child::Node(node.clone()),
            Slot::Unresolved | Slot::Materializing { .. } => Child::Unresolved,
        }
    }

    fn detach(&self) {
        if let Slot::Materialized(node) = self {
            node.detach();
        }
    }
}

#[derive(Default)]
struct DirState {
    fresh: bool,
    detached: bool,
    children: BTreeMap<String, Slot>,
    fetch: Option<SharedFetch<Listing>>,
    watch: Option<Subscription>,
}

impl DirState {
    fn snapshot(&self) -> Listing {
        self.children
            .iter()
            .map(|(name, slot)| (name.clone(), slot.to_child()))
            .collect()
    }
}

/// Directory node: caches the child-name set and owns materialized children.
pub struct DirNode {
    path: PathBuf,
    meta: SourceMeta,
    ctx: Arc<Context>,
    next_token: AtomicU64,
    state: Mutex<DirState>,
}

impl DirNode {
    /// A node with nothing fetched yet.
    pub fn new(path: PathBuf, meta: SourceMeta, ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(DirNode {
            path,
            meta,
            ctx,
            next_token: AtomicU64::new(0),
            state: Mutex::new(DirState::default()),
        })
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Source metadata captured when the node was created.
    pub fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    /// Whether the listing is cached.
    pub fn is_fresh(&self) -> bool {
        self.state.lock().fresh
    }

    /// Whether a change subscription is live.
    pub fn is_watching(&self) -> bool {
        self.state.lock().watch.is_some()
    }

    /// Whether the node has left the tree.
    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    /// Current listing, fetching it if stale. Concurrent callers share one
    /// fetch.
    pub async fn content(self: &Arc<Self>) -> Result<Listing> {
        let fetch = {
            let mut state = self.state.lock();
            if state.fresh {
                return Ok(state.snapshot());
            }
            match state.fetch.clone() {
                Some(fetch) => fetch,
                None => {
                    let fetch = self.clone().fetch_listing();
                    state.fetch = Some(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    fn fetch_listing(self: Arc<Self>) -> SharedFetch<Listing> {
        async move {
            debug!("listing {}", self.path.display());
            let result = self.ctx.source.read_dir(&self.path).await;
            self.finish_listing(result)
        }
        .boxed()
        .shared()
    }

    fn finish_listing(self: &Arc<Self>, result: io::Result<Vec<String>>) -> Result<Listing> {
        let (listing, old_watch, removed) = {
            let mut state = self.state.lock();
            state.fetch = None;

            let names = match result {
                Ok(names) => names,
                Err(e) => {
                    drop(state);
                    let err = source_error(&self.path, e);
                    warn!("listing failed: {}", err);
                    return Err(err);
                }
            };

            let listed: HashSet<&str> = names.iter().map(String::as_str).collect();
            let gone: Vec<String> = state
                .children
                .keys()
                .filter(|name| !listed.contains(name.as_str()))
                .cloned()
                .collect();
            let removed: Vec<Slot> = gone
                .iter()
                .filter_map(|name| state.children.remove(name))
                .collect();
            for name in &names {
                state
                    .children
                    .entry(name.clone())
                    .or_insert(Slot::Unresolved);
            }

            let old_watch = state.watch.take();
            if !state.detached {
                match self.subscribe() {
                    Ok(sub) => {
                        state.fresh = true;
                        state.watch = Some(sub);
                    }
                    Err(e) => warn!("{}; listing will be refetched on every access", e),
                }
            }

            debug!(
                "listed {}: {} entries, {} removed",
                self.path.display(),
                state.children.len(),
                removed.len()
            );
            (state.snapshot(), old_watch, removed)
        };

        drop(old_watch);
        for slot in &removed {
            slot.detach();
        }
        Ok(listing)
    }

    fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
        let weak = Arc::downgrade(self);
        self.ctx.watcher.subscribe(
            &self.path,
            Box::new(move || {
                if let Some(dir) = weak.upgrade() {
                    dir.invalidate();
                }
            }),
        )
    }

    /// Mark stale and drop the subscription. The next access refetches.
    pub fn invalidate(&self) {
        let watch = {
            let mut state = self.state.lock();
            state.fresh = false;
            state.watch.take()
        };
        drop(watch);
        debug!("listing invalidated: {}", self.path.display());
    }

    /// Stop watching, for good. Called when the node leaves the tree.
    pub fn detach(&self) {
        let (watch, children) = {
            let mut state = self.state.lock();
            state.detached = true;
            state.fresh = false;
            (state.watch.take(), std::mem::take(&mut state.children))
        };
        drop(watch);
        for slot in children.values() {
            slot.detach();
        }
    }

    /// Walk `segments` below this directory. An empty slice resolves to
    /// the directory itself.
    pub async fn resolve(self: &Arc<Self>, segments: &[&str]) -> Result<Node> {
        let Some((last, parents)) = segments.split_last() else {
            return Ok(Node::Directory(self.clone()));
        };

        let mut dir = self.clone();
        for name in parents {
            match dir.child(name).await? {
                Node::Directory(sub) => dir = sub,
                Node::File(file) => {
                    return Err(FsError::NotADirectory {
                        path: file.path().display().to_string(),
                    })
                }
            }
        }
        dir.child(last).await
    }

    /// Look up `name`, materializing it if it is only known by name.
    pub async fn child(self: &Arc<Self>, name: &str) -> Result<Node> {
        let fresh = self.state.lock().fresh;
        if !fresh {
            self.content().await?;
        }

        let fetch = {
            let mut state = self.state.lock();
            let pending = match state.children.get(name) {
                None => return Err(FsError::not_found(&self.path.join(name))),
                Some(Slot::Materialized(node)) => return Ok(node.clone()),
                Some(Slot::Materializing { fetch, .. }) => Some(fetch.clone()),
                Some(Slot::Unresolved) => None,
            };
            match pending {
                Some(fetch) => fetch,
                None => {
                    let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                    let fetch = self.clone().materialize(name.to_string(), token);
                    state.children.insert(
                        name.to_string(),
                        Slot::Materializing {
                            token,
                            fetch: fetch.clone(),
                        },
                    );
                    fetch
                }
            }
        };

        fetch
            .await?
            .ok_or_else(|| FsError::not_found(&self.path.join(name)))
    }

    fn materialize(self: Arc<Self>, name: String, token: u64) -> SharedFetch<Option<Node>> {
        async move {
            let path = self.path.join(&name);
            let result = self.ctx.source.stat(&path).await;
            self.finish_materialize(&name, token, path, result)
        }
        .boxed()
        .shared()
    }

    fn finish_materialize(
        &self,
        name: &str,
        token: u64,
        path: PathBuf,
        result: io::Result<SourceMeta>,
    ) -> Result<Option<Node>> {
        let mut state = self.state.lock();
        // The slot may have been dropped by a newer listing or a detach
        // while the stat was in flight.
        let current = matches!(
            state.children.get(name),
            Some(Slot::Materializing { token: t, .. }) if *t == token
        );

        match result {
            Ok(meta) => {
                let node = Node::from_meta(path, meta, self.ctx.clone());
                match (&node, current) {
                    (Some(node), true) => {
                        debug!("materialized {:?}", node);
                        state
                            .children
                            .insert(name.to_string(), Slot::Materialized(node.clone()));
                    }
                    (None, true) => {
                        debug!("hiding non-regular entry {}/{}", self.path.display(), name);
                        state.children.remove(name);
                    }
                    (Some(node), false) => node.detach(),
                    (None, false) => {}
                }
                Ok(node)
            }
            Err(e) => {
                if current {
                    state.children.remove(name);
                }
                Err(source_error(&self.path.join(name), e))
            }
        }
    }
}

#[derive(Default)]
struct FileState {
    data: Option<Bytes>,
    last_known: Option<Bytes>,
    fetched_at: Option<SystemTime>,
    fetch: Option<SharedFetch<Bytes>>,
    watch: Option<Subscription>,
    detached: bool,
}

/// File node: caches the filtered content of one source file.
pub struct FileNode {
    path: PathBuf,
    mount_path: PathBuf,
    meta: SourceMeta,
    ctx: Arc<Context>,
    state: Mutex<FileState>,
}

impl FileNode {
    /// A file with nothing fetched yet.
    pub fn new(path: PathBuf, meta: SourceMeta, ctx: Arc<Context>) -> Arc<Self> {
        let mount_path = ctx.mount_path(&path);
        Arc::new(FileNode {
            path,
            mount_path,
            meta,
            ctx,
            state: Mutex::new(FileState::default()),
        })
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of this file under the mount root.
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Source metadata captured when the node was created.
    pub fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    /// Whether content is cached.
    pub fn is_cached(&self) -> bool {
        self.state.lock().data.is_some()
    }

    /// Whether a change subscription is live.
    pub fn is_watching(&self) -> bool {
        self.state.lock().watch.is_some()
    }

    /// Time of the last successful fetch, or the source mtime before one.
    pub fn mtime(&self) -> SystemTime {
        self.state.lock().fetched_at.unwrap_or(self.meta.mtime)
    }

    /// Transformed content, fetching it if not cached. Concurrent callers
    /// share one read and one filter run.
    pub async fn content(self: &Arc<Self>) -> Result<Bytes> {
        let fetch = {
            let mut state = self.state.lock();
            if let Some(data) = &state.data {
                return Ok(data.clone());
            }
            match state.fetch.clone() {
                Some(fetch) => fetch,
                None => {
                    let fetch = self.clone().fetch_content();
                    state.fetch = Some(fetch.clone());
                    fetch
                }
            }
        };
        fetch.await
    }

    /// Like [`content`](Self::content), but serves the previously fetched
    /// content if a refetch fails, e.g. because the source was deleted
    /// while a descriptor was open.
    pub async fn content_or_last_known(self: &Arc<Self>) -> Result<Bytes> {
        match self.content().await {
            Ok(data) => Ok(data),
            Err(e) => {
                let last = self.state.lock().last_known.clone();
                match last {
                    Some(data) => {
                        debug!("serving last known content of {}: {}", self.path.display(), e);
                        Ok(data)
                    }
                    None => Err(e),
                }
            }
        }
    }

    fn fetch_content(self: Arc<Self>) -> SharedFetch<Bytes> {
        async move {
            debug!("reading {}", self.path.display());
            let raw = match self.ctx.source.read(&self.path).await {
                Ok(raw) => raw,
                Err(e) => {
                    self.state.lock().fetch = None;
                    let err = source_error(&self.path, e);
                    warn!("read failed: {}", err);
                    return Err(err);
                }
            };

            let filter = self.ctx.filter.clone();
            let path = self.path.clone();
            let data = match tokio::task::spawn_blocking(move || {
                apply_or_fallback(filter.as_ref(), &path, raw)
            })
            .await
            {
                Ok(data) => data,
                Err(e) => {
                    let err = FsError::TransformFailure {
                        path: self.path.display().to_string(),
                        reason: e.to_string(),
                    };
                    warn!("{}", err);
                    self.ctx.filter.fallback(&self.path, &err)
                }
            };

            Ok(self.finish_content(data))
        }
        .boxed()
        .shared()
    }

    fn finish_content(self: &Arc<Self>, data: Bytes) -> Bytes {
        let old_watch = {
            let mut state = self.state.lock();
            state.fetch = None;
            state.fetched_at = Some(SystemTime::now());
            state.last_known = Some(data.clone());
            let old_watch = state.watch.take();

            if state.detached {
                // Only open descriptors can reach a detached node; serve
                // them this snapshot without watching.
                state.data = Some(data.clone());
            } else {
                match self.subscribe() {
                    Ok(sub) => {
                        state.data = Some(data.clone());
                        state.watch = Some(sub);
                    }
                    Err(e) => warn!("{}; content will be refetched on every access", e),
                }
            }
            old_watch
        };
        drop(old_watch);
        debug!("cached {} ({} bytes)", self.path.display(), data.len());
        data
    }

    fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
        let weak = Arc::downgrade(self);
        self.ctx.watcher.subscribe(
            &self.path,
            Box::new(move || {
                if let Some(file) = weak.upgrade() {
                    file.invalidate();
                }
            }),
        )
    }

    /// Drop the cached content and subscription, then tell external caches
    /// that the mounted path changed.
    pub fn invalidate(&self) {
        let watch = {
            let mut state = self.state.lock();
            state.data = None;
            state.watch.take()
        };
        drop(watch);
        debug!("content invalidated: {}", self.path.display());
        self.ctx.buster.bust(&self.mount_path);
    }

    /// Stop watching, for good. Called when the node leaves the tree.
    pub fn detach(&self) {
        let watch = {
            let mut state = self.state.lock();
            state.detached = true;
            state.watch.take()
        };
        drop(watch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{source_mtime, FakeSource, Harness};
    use futures::future::join_all;

    fn root(h: &Harness) -> Arc<DirNode> {
        DirNode::new(
            PathBuf::from("/src"),
            SourceMeta::at(SourceKind::Directory, source_mtime()),
            h.ctx.clone(),
        )
    }

    async fn file(root: &Arc<DirNode>, segments: &[&str]) -> Arc<FileNode> {
        match root.resolve(segments).await.unwrap() {
            Node::File(file) => file,
            other => panic!("expected file, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_file_content_reads_once() {
        let source = FakeSource::gated();
        source.add_file("/src/a.txt", "hi");
        let h = Harness::new(source.clone());
        let node = FileNode::new(
            PathBuf::from("/src/a.txt"),
            SourceMeta::at(SourceKind::File, source_mtime()),
            h.ctx.clone(),
        );

        let readers = join_all((0..8).map(|_| node.content()));
        let (results, _) = tokio::join!(readers, async {
            tokio::task::yield_now().await;
            source.open_gate();
        });

        assert_eq!(FakeSource::count(&source.reads), 1);
        assert_eq!(h.watcher.subscriber_count(Path::new("/src/a.txt")), 1);
        for result in results {
            assert_eq!(&result.unwrap()[..], b"hi");
        }
    }

    #[tokio::test]
    async fn test_joined_readers_share_one_failure() {
        let source = FakeSource::gated();
        let h = Harness::new(source.clone());
        let node = FileNode::new(
            PathBuf::from("/src/late.txt"),
            SourceMeta::at(SourceKind::File, source_mtime()),
            h.ctx.clone(),
        );

        let readers = join_all((0..6).map(|_| node.content()));
        let (results, _) = tokio::join!(readers, async {
            tokio::task::yield_now().await;
            source.open_gate();
        });

        assert_eq!(FakeSource::count(&source.reads), 1);
        for result in results {
            assert_eq!(result.unwrap_err().to_errno(), libc::ENOENT);
        }
        assert!(node.state.lock().fetch.is_none());
        assert!(!node.is_cached());
        assert!(!node.is_watching());

        source.add_file("/src/late.txt", "now");
        assert_eq!(&node.content().await.unwrap()[..], b"now");
        assert_eq!(FakeSource::count(&source.reads), 2);
    }

    #[tokio::test]
    async fn test_joined_listers_share_one_failure() {
        let source = FakeSource::gated();
        let h = Harness::new(source.clone());
        let dir = DirNode::new(
            PathBuf::from("/src/missing"),
            SourceMeta::at(SourceKind::Directory, source_mtime()),
            h.ctx.clone(),
        );

        let listers = join_all((0..4).map(|_| dir.content()));
        let (results, _) = tokio::join!(listers, async {
            tokio::task::yield_now().await;
            source.open_gate();
        });

        assert_eq!(FakeSource::count(&source.listings), 1);
        for result in results {
            assert_eq!(result.unwrap_err().to_errno(), libc::ENOENT);
        }
        assert!(!dir.is_fresh());
        assert!(!dir.is_watching());
    }

    #[tokio::test]
    async fn test_concurrent_listing_fetches_once() {
        let source = FakeSource::gated();
        source.add_file("/src/a", "1");
        source.add_file("/src/b", "2");
        let h = Harness::new(source.clone());
        let root = root(&h);

        let listers = join_all((0..5).map(|_| root.content()));
        let (results, _) = tokio::join!(listers, async {
            tokio::task::yield_now().await;
            source.open_gate();
        });

        assert_eq!(FakeSource::count(&source.listings), 1);
        for result in results {
            let names: Vec<String> = result.unwrap().into_keys().collect();
            assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_concurrent_materialization_stats_once() {
        let source = FakeSource::gated_io();
        source.add_file("/src/a", "1");
        let h = Harness::new(source.clone());
        let root = root(&h);
        root.content().await.unwrap();

        let lookups = join_all((0..6).map(|_| root.resolve(&["a"])));
        let (results, _) = tokio::join!(lookups, async {
            tokio::task::yield_now().await;
            source.open_gate();
        });

        assert_eq!(FakeSource::count(&source.stats), 1);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_cached_listing_does_not_refetch() {
        let source = FakeSource::new();
        source.add_file("/src/a", "1");
        let h = Harness::new(source.clone());
        let root = root(&h);

        root.content().await.unwrap();
        root.content().await.unwrap();
        root.resolve(&["a"]).await.unwrap();

        assert_eq!(FakeSource::count(&source.listings), 1);
        assert!(root.is_fresh());
        assert!(root.is_watching());
    }

    #[tokio::test]
    async fn test_listing_reconciliation() {
        let source = FakeSource::new();
        source.add_dir("/src/a");
        source.add_file("/src/a/inner.txt", "x");
        source.add_file("/src/b", "b");
        source.add_file("/src/c", "c");
        let h = Harness::new(source.clone());
        let root = root(&h);

        let a = match root.resolve(&["a"]).await.unwrap() {
            Node::Directory(dir) => dir,
            other => panic!("expected directory, got {:?}", other),
        };
        let inner = file(&root, &["a", "inner.txt"]).await;
        inner.content().await.unwrap();
        let b = file(&root, &["b"]).await;
        assert_eq!(h.watcher.subscriber_count(Path::new("/src/a")), 1);
        assert_eq!(h.watcher.subscriber_count(Path::new("/src/a/inner.txt")), 1);

        source.remove("/src/a");
        source.add_file("/src/d", "d");
        assert_eq!(h.trigger("/src"), 1);
        assert!(!root.is_fresh());

        let listing = root.content().await.unwrap();
        let names: Vec<&str> = listing.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["b", "c", "d"]);
        assert!(matches!(listing["d"], Child::Unresolved));
        assert!(matches!(&listing["b"], Child::Node(Node::File(f)) if Arc::ptr_eq(f, &b)));

        assert!(a.is_detached());
        assert!(!a.is_watching());
        assert!(!inner.is_watching());
        assert_eq!(h.watcher.subscriber_count(Path::new("/src/a")), 0);
        assert_eq!(h.watcher.subscriber_count(Path::new("/src/a/inner.txt")), 0);
    }

    #[tokio::test]
    async fn test_watch_fire_forces_refetch() {
        let source = FakeSource::new();
        source.add_file("/src/foo.txt", "hi");
        let h = Harness::new(source.clone());
        let root = root(&h);
        let node = file(&root, &["foo.txt"]).await;

        assert_eq!(&node.content().await.unwrap()[..], b"hi");
        source.add_file("/src/foo.txt", "hello");
        assert_eq!(&node.content().await.unwrap()[..], b"hi");

        assert_eq!(h.trigger("/src/foo.txt"), 1);
        assert!(!node.is_cached());
        assert!(!node.is_watching());
        assert_eq!(&node.content().await.unwrap()[..], b"hello");
        assert_eq!(FakeSource::count(&source.reads), 2);
        assert_eq!(
            h.buster.busted.lock().clone(),
            vec![PathBuf::from("/mnt/foo.txt")]
        );
    }

    #[tokio::test]
    async fn test_transform_failure_serves_fallback() {
        let source = FakeSource::new();
        source.add_file("/src/bad.js", "let = ;");
        let failing = |_: &Path, _: Bytes| -> anyhow::Result<Bytes> {
            anyhow::bail!("unexpected token")
        };
        let h = Harness::with_filter(source.clone(), Arc::new(failing));
        let root = root(&h);
        let node = file(&root, &["bad.js"]).await;

        let data = node.content().await.unwrap();
        let text = String::from_utf8(data.to_vec()).unwrap();
        assert!(text.contains("unexpected token"));
        assert!(node.is_watching());
        assert_eq!(node.content().await.unwrap(), data);
        assert_eq!(FakeSource::count(&source.reads), 1);
    }

    #[tokio::test]
    async fn test_filter_sees_source_path() {
        let source = FakeSource::new();
        source.add_file("/src/a.txt", "x");
        let tagging = |path: &Path, raw: Bytes| -> anyhow::Result<Bytes> {
            Ok(Bytes::from(format!(
                "{}:{}",
                path.display(),
                String::from_utf8_lossy(&raw)
            )))
        };
        let h = Harness::with_filter(source, Arc::new(tagging));
        let root = root(&h);
        let node = file(&root, &["a.txt"]).await;
        assert_eq!(&node.content().await.unwrap()[..], b"/src/a.txt:x");
    }

    #[tokio::test]
    async fn test_degraded_watch_refetches_every_access() {
        let source = FakeSource::new();
        source.add_file("/src/a", "1");
        let h = Harness::new(source.clone());
        h.watcher.set_refuse(true);
        let root = root(&h);

        let node = file(&root, &["a"]).await;
        node.content().await.unwrap();
        node.content().await.unwrap();

        assert_eq!(FakeSource::count(&source.reads), 2);
        assert!(!node.is_cached());
        assert!(!root.is_fresh());
    }

    #[tokio::test]
    async fn test_resolve_errors() {
        let source = FakeSource::new();
        source.add_file("/src/file", "x");
        source.add_other("/src/sock");
        let h = Harness::new(source.clone());
        let root = root(&h);

        let err = root.resolve(&["missing"]).await.unwrap_err();
        assert!(matches!(err, FsError::NotFound { .. }));

        let err = root.resolve(&["file", "below"]).await.unwrap_err();
        assert!(matches!(err, FsError::NotADirectory { .. }));

        let err = root.resolve(&["sock"]).await.unwrap_err();
        assert!(matches!(err, FsError::NotFound { .. }));
        assert!(!root.content().await.unwrap().contains_key("sock"));
    }

    #[tokio::test]
    async fn test_entry_vanished_before_stat_is_removed() {
        let source = FakeSource::new();
        source.add_file("/src/gone", "x");
        let h = Harness::new(source.clone());
        let root = root(&h);
        root.content().await.unwrap();

        source.remove("/src/gone");
        let err = root.resolve(&["gone"]).await.unwrap_err();
        assert_eq!(err.to_errno(), libc::ENOENT);
        assert!(!root.content().await.unwrap().contains_key("gone"));
    }

    #[tokio::test]
    async fn test_empty_segments_resolve_to_self() {
        let h = Harness::new(FakeSource::new());
        let root = root(&h);
        assert!(root.resolve(&[]).await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_last_known_content_after_source_removed() {
        let source = FakeSource::new();
        source.add_file("/src/a", "old");
        let h = Harness::new(source.clone());
        let root = root(&h);
        let node = file(&root, &["a"]).await;
        node.content().await.unwrap();

        source.remove("/src/a");
        h.trigger("/src/a");

        assert!(node.content().await.is_err());
        assert_eq!(&node.content_or_last_known().await.unwrap()[..], b"old");
    }

    #[tokio::test]
    async fn test_listing_failure_propagates_and_retries() {
        let source = FakeSource::new();
        let h = Harness::new(source.clone());
        let dir = DirNode::new(
            PathBuf::from("/src/missing"),
            SourceMeta::at(SourceKind::Directory, source_mtime()),
            h.ctx.clone(),
        );

        assert!(dir.content().await.is_err());
        assert!(!dir.is_fresh());
        source.add_dir("/src/missing");
        assert!(dir.content().await.unwrap().is_empty());
        assert_eq!(FakeSource::count(&source.listings), 2);
    }

    #[tokio::test]
    async fn test_detach_cancels_subscriptions_recursively() {
        let source = FakeSource::new();
        source.add_dir("/src/d");
        source.add_file("/src/d/f", "x");
        let h = Harness::new(source.clone());
        let root = root(&h);
        file(&root, &["d", "f"]).await.content().await.unwrap();
        assert_eq!(h.watcher.total_subscriptions(), 3);

        root.detach();
        assert_eq!(h.watcher.total_subscriptions(), 0);
        assert!(root.content().await.unwrap().contains_key("d"));
        assert_eq!(h.watcher.total_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_mtime_tracks_fetch_time() {
        let source = FakeSource::new();
        source.add_file("/src/a", "1");
        let h = Harness::new(source);
        let root = root(&h);
        let node = file(&root, &["a"]).await;

        assert_eq!(node.mtime(), source_mtime());
        node.content().await.unwrap();
        assert!(node.mtime() > source_mtime());
    }

    #[test]
    fn test_mount_path_mapping() {
        let h = Harness::new(FakeSource::new());
        assert_eq!(h.ctx.mount_path(Path::new("/src")), PathBuf::from("/mnt"));
        assert_eq!(
            h.ctx.mount_path(Path::new("/src/a/b.js")),
            PathBuf::from("/mnt/a/b.js")
        );
    }
}
