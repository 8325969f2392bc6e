#![warn(missing_docs)]

//! distfs: a read-only FUSE mirror of a source directory.
//!
//! File content is passed through a [`filter::Filter`] on first read and
//! cached until a change to the source file is observed.

/// Attributes reported to the kernel.
pub mod attr;
/// Telling external caches that a mounted file changed.
pub mod cache_bust;
/// Command line.
pub mod cli;
/// Daemon configuration.
pub mod config;
/// Open file handles.
pub mod descriptor;
/// Error type.
pub mod error;
/// `fuser` adapter.
pub mod filesystem;
/// Content filters.
pub mod filter;
/// Inode number allocation.
pub mod inode;
/// A mirrored directory tree.
pub mod mount;
/// Cached directory and file nodes.
pub mod node;
/// Path-based protocol operations.
pub mod operations;
/// FUSE session setup.
pub mod session;
/// Access to the mirrored source tree.
pub mod source;
/// Change notification.
pub mod watch;

#[cfg(test)]
mod testutil;

pub use config::DistFsConfig;
pub use error::{FsError, Result};
pub use filesystem::DistFs;
pub use mount::{Collaborators, Mount};
