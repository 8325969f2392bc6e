//! A mirrored source tree and its open descriptors.
//!
//! [`Mount`] owns the root directory node, the descriptor table and the
//! collaborators every node shares. The protocol operations on it live in
//! [`crate::operations`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::cache_bust::{CacheBuster, UnlinkBuster};
use crate::descriptor::DescriptorTable;
use crate::error::{FsError, Result};
use crate::filter::Filter;
use crate::node::{Context, DirNode, Node};
use crate::source::{LocalFs, SourceFs, SourceKind};
use crate::watch::{NotifyWatchSource, WatchSource};

/// The pluggable parts of a mount.
pub struct Collaborators {
    /// Source tree access.
    pub source: Arc<dyn SourceFs>,
    /// Change notification.
    pub watcher: Arc<dyn WatchSource>,
    /// Content filter.
    pub filter: Arc<dyn Filter>,
    /// External cache invalidation.
    pub buster: Arc<dyn CacheBuster>,
}

impl Collaborators {
    /// Local filesystem source, inotify-backed watches and unlink busting.
    pub fn local(filter: Arc<dyn Filter>, runtime: Handle) -> Result<Self> {
        Ok(Collaborators {
            source: Arc::new(LocalFs),
            watcher: Arc::new(NotifyWatchSource::new()?),
            filter,
            buster: Arc::new(UnlinkBuster::new(runtime)),
        })
    }
}

/// A source directory mirrored at a mount directory, with its open
/// descriptors.
pub struct Mount {
    root: Arc<DirNode>,
    descriptors: DescriptorTable,
    ctx: Arc<Context>,
}

impl Mount {
    /// Mirror `source_dir` at `mount_dir`. Nothing below the root is read
    /// until it is first accessed.
    pub async fn new(
        source_dir: impl Into<PathBuf>,
        mount_dir: impl Into<PathBuf>,
        collab: Collaborators,
    ) -> Result<Self> {
        let source_root = source_dir.into();
        let mount_root = mount_dir.into();

        let meta = collab
            .source
            .stat(&source_root)
            .await
            .map_err(|e| FsError::io(&source_root, e))?;
        if meta.kind != SourceKind::Directory {
            return Err(FsError::NotADirectory {
                path: source_root.display().to_string(),
            });
        }

        let ctx = Arc::new(Context {
            source: collab.source,
            watcher: collab.watcher,
            filter: collab.filter,
            buster: collab.buster,
            source_root: source_root.clone(),
            mount_root,
        });
        info!(
            "mirroring {} at {}",
            source_root.display(),
            ctx.mount_root.display()
        );

        Ok(Mount {
            root: DirNode::new(source_root, meta, ctx.clone()),
            descriptors: DescriptorTable::new(),
            ctx,
        })
    }

    /// Root directory node.
    pub fn root(&self) -> &Arc<DirNode> {
        &self.root
    }

    /// Open file handles.
    pub fn descriptors(&self) -> &DescriptorTable {
        &self.descriptors
    }

    /// Mirrored source directory.
    pub fn source_root(&self) -> &Path {
        &self.ctx.source_root
    }

    /// Mountpoint.
    pub fn mount_root(&self) -> &Path {
        &self.ctx.mount_root
    }

    /// Resolve a mount-relative path such as `/a/b.js`. `/` and the empty
    /// path are the root.
    pub async fn resolve(&self, path: &str) -> Result<Node> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.root.resolve(&segments).await
    }

    /// Cancel every watch in the tree. In-flight fetches finish without
    /// subscribing.
    pub fn shutdown(&self) {
        info!("unmounting {}", self.ctx.mount_root.display());
        self.root.detach();
    }
}
