//! One-shot change subscriptions on source paths.
//!
//! A node subscribes after every successful fetch and the subscription fires
//! at most once. Dropping a [`Subscription`] cancels it.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};

use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FsError, Result};

/// Invoked once when the watched path changes.
pub type ChangeCallback = Box<dyn FnOnce() + Send + 'static>;

/// Source of change notifications.
pub trait WatchSource: Send + Sync {
    /// Register `on_change` for `path`. The callback runs on the source's own
    /// thread and must not block.
    fn subscribe(&self, path: &Path, on_change: ChangeCallback) -> Result<Subscription>;
}

/// Live registration returned by [`WatchSource::subscribe`].
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl Subscription {
    /// A subscription that runs `cancel` once when dropped.
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Subscription {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Cancel explicitly. Equivalent to dropping.
    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_path: HashMap<PathBuf, HashMap<u64, ChangeCallback>>,
}

impl Registry {
    fn insert(&mut self, path: &Path, on_change: ChangeCallback) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.by_path
            .entry(path.to_path_buf())
            .or_default()
            .insert(id, on_change);
        id
    }

    /// Returns true when `id` was live and `path` has no subscribers left.
    fn remove(&mut self, path: &Path, id: u64) -> bool {
        let Some(subs) = self.by_path.get_mut(path) else {
            return false;
        };
        if subs.remove(&id).is_none() {
            return false;
        }
        if subs.is_empty() {
            self.by_path.remove(path);
            return true;
        }
        false
    }

    fn take(&mut self, path: &Path) -> Vec<ChangeCallback> {
        self.by_path
            .remove(path)
            .map(|subs| subs.into_values().collect())
            .unwrap_or_default()
    }

    fn count(&self, path: &Path) -> usize {
        self.by_path.get(path).map(HashMap::len).unwrap_or(0)
    }

    fn total(&self) -> usize {
        self.by_path.values().map(HashMap::len).sum()
    }
}

/// Watch source driven by explicit [`trigger`](ManualWatchSource::trigger)
/// calls. Useful for embedders that learn about changes by other means.
#[derive(Default)]
pub struct ManualWatchSource {
    registry: Arc<Mutex<Registry>>,
    refuse: AtomicBool,
}

impl ManualWatchSource {
    /// An empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire every subscription on `path`. Returns how many fired.
    pub fn trigger(&self, path: &Path) -> usize {
        let callbacks = self.registry.lock().take(path);
        let fired = callbacks.len();
        for callback in callbacks {
            callback();
        }
        debug!("manual trigger on {}: fired={}", path.display(), fired);
        fired
    }

    /// Make subsequent subscriptions fail, simulating an exhausted watch limit.
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Live subscriptions on `path`.
    pub fn subscriber_count(&self, path: &Path) -> usize {
        self.registry.lock().count(path)
    }

    /// Live subscriptions on every path.
    pub fn total_subscriptions(&self) -> usize {
        self.registry.lock().total()
    }
}

impl WatchSource for ManualWatchSource {
    fn subscribe(&self, path: &Path, on_change: ChangeCallback) -> Result<Subscription> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(FsError::Watch {
                path: path.display().to_string(),
                reason: "subscriptions refused".to_string(),
            });
        }
        let id = self.registry.lock().insert(path, on_change);
        let registry: Weak<Mutex<Registry>> = Arc::downgrade(&self.registry);
        let path = path.to_path_buf();
        Ok(Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.lock().remove(&path, id);
            }
        }))
    }
}

struct NotifyState {
    registry: Registry,
    watcher: RecommendedWatcher,
}

struct NotifyShared {
    state: Mutex<NotifyState>,
}

impl NotifyShared {
    fn cancel(&self, path: &Path, id: u64) {
        let mut state = self.state.lock();
        if state.registry.remove(path, id) {
            if let Err(e) = state.watcher.unwatch(path) {
                debug!("unwatch {} failed: {}", path.display(), e);
            }
        }
    }

    /// Fires subscribers of every event path. Entry creation, removal and
    /// renames also fire the parent directory so its listing is refetched.
    fn fire(&self, event: &Event) {
        if matches!(event.kind, EventKind::Access(_)) {
            return;
        }
        let parent_too = changes_entries(&event.kind);

        let mut callbacks = Vec::new();
        {
            let mut state = self.state.lock();
            for path in &event.paths {
                let parent = path.parent().filter(|_| parent_too);
                let targets = std::iter::once(path.as_path()).chain(parent);
                for target in targets {
                    let fired = state.registry.take(target);
                    if fired.is_empty() {
                        continue;
                    }
                    if let Err(e) = state.watcher.unwatch(target) {
                        debug!("unwatch {} failed: {}", target.display(), e);
                    }
                    callbacks.extend(fired);
                }
            }
        }

        debug!("{:?} on {:?}: fired={}", event.kind, event.paths, callbacks.len());
        for callback in callbacks {
            callback();
        }
    }
}

/// Whether an event adds, removes or renames a directory entry.
fn changes_entries(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_))
    )
}

/// Watch source backed by the platform notifier (inotify on Linux).
///
/// One underlying watcher is shared by all subscriptions; each watched path
/// is registered non-recursively while it has at least one subscriber.
/// Events are dispatched from a dedicated thread so callbacks may cancel
/// subscriptions without re-entering the notifier's event loop.
pub struct NotifyWatchSource {
    shared: Arc<NotifyShared>,
}

impl NotifyWatchSource {
    /// Start the watcher and its dispatch thread.
    pub fn new() -> Result<Self> {
        let (tx, rx) = std::sync::mpsc::channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })
        .map_err(|e| FsError::Watch {
            path: String::new(),
            reason: e.to_string(),
        })?;

        let shared = Arc::new(NotifyShared {
            state: Mutex::new(NotifyState {
                registry: Registry::default(),
                watcher,
            }),
        });

        let weak = Arc::downgrade(&shared);
        std::thread::Builder::new()
            .name("distfs-watch".into())
            .spawn(move || dispatch(weak, rx))
            .map_err(|e| FsError::io(Path::new("distfs-watch"), e))?;

        Ok(NotifyWatchSource { shared })
    }

    /// Live subscriptions on every path.
    pub fn total_subscriptions(&self) -> usize {
        self.shared.state.lock().registry.total()
    }
}

fn dispatch(shared: Weak<NotifyShared>, events: Receiver<notify::Result<Event>>) {
    for res in events {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match res {
            Ok(event) => shared.fire(&event),
            Err(e) => warn!("watch error: {}", e),
        }
    }
    debug!("watch dispatcher exiting");
}

impl WatchSource for NotifyWatchSource {
    fn subscribe(&self, path: &Path, on_change: ChangeCallback) -> Result<Subscription> {
        let id = {
            let mut state = self.shared.state.lock();
            if state.registry.count(path) == 0 {
                state
                    .watcher
                    .watch(path, RecursiveMode::NonRecursive)
                    .map_err(|e| FsError::Watch {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    })?;
            }
            state.registry.insert(path, on_change)
        };

        let shared = Arc::downgrade(&self.shared);
        let path = path.to_path_buf();
        Ok(Subscription::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.cancel(&path, id);
            }
        }))
    }
}
