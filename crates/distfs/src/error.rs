use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by the node tree and the protocol handler layer.
///
/// The type is `Clone` because a single fetch result is handed to every
/// requester joined on it.
#[derive(Debug, Clone, Error)]
pub enum FsError {
    /// The path does not exist in the source.
    #[error("No such file or directory: {path}")]
    NotFound { path: String },

    /// A path component or listed path is not a directory.
    #[error("Not a directory: {path}")]
    NotADirectory { path: String },

    /// File operation on a directory.
    #[error("Is a directory: {path}")]
    IsADirectory { path: String },

    /// A mutating operation was refused.
    #[error("Permission denied for {path}, operation: {op}")]
    PermissionDenied { path: String, op: &'static str },

    /// The handle is not open.
    #[error("Bad file descriptor: {fh}")]
    BadDescriptor { fh: u64 },

    /// The content filter failed or panicked.
    #[error("Transform failed for {path}: {reason}")]
    TransformFailure { path: String, reason: String },

    /// Any other source error, keeping its errno.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// A change subscription could not be set up.
    #[error("Watch failed on {path}: {reason}")]
    Watch { path: String, reason: String },

    /// A request argument is out of range.
    #[error("Invalid argument: {msg}")]
    InvalidArgument { msg: String },

    /// The FUSE session could not be started.
    #[error("Mount failed at {mountpoint}: {reason}")]
    MountFailed { mountpoint: String, reason: String },
}

/// Result with [`FsError`].
pub type Result<T> = std::result::Result<T, FsError>;

impl FsError {
    /// Wrap an I/O error from the source.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        FsError::Io {
            path: path.display().to_string(),
            source: Arc::new(source),
        }
    }

    /// `NotFound` for `path`.
    pub fn not_found(path: &Path) -> Self {
        FsError::NotFound {
            path: path.display().to_string(),
        }
    }

    /// Errno reported to the kernel.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self {
            FsError::NotFound { .. } => ENOENT,
            FsError::NotADirectory { .. } => ENOTDIR,
            FsError::IsADirectory { .. } => EISDIR,
            FsError::PermissionDenied { .. } => EPERM,
            FsError::BadDescriptor { .. } => EBADF,
            FsError::TransformFailure { .. } => EIO,
            FsError::Io { source, .. } => source.raw_os_error().unwrap_or(EIO),
            FsError::Watch { .. } => EIO,
            FsError::InvalidArgument { .. } => EINVAL,
            FsError::MountFailed { .. } => ENOENT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_errno() {
        let err = FsError::not_found(Path::new("/src/missing"));
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_permission_denied_is_eperm() {
        let err = FsError::PermissionDenied {
            path: "/a".to_string(),
            op: "write",
        };
        assert_eq!(err.to_errno(), libc::EPERM);
    }

    #[test]
    fn test_not_directory_errno() {
        let err = FsError::NotADirectory {
            path: "/a/b".to_string(),
        };
        assert_eq!(err.to_errno(), libc::ENOTDIR);
    }

    #[test]
    fn test_is_directory_errno() {
        let err = FsError::IsADirectory {
            path: "/a".to_string(),
        };
        assert_eq!(err.to_errno(), libc::EISDIR);
    }

    #[test]
    fn test_bad_descriptor_errno() {
        assert_eq!(FsError::BadDescriptor { fh: 12 }.to_errno(), libc::EBADF);
    }

    #[test]
    fn test_io_error_keeps_os_errno() {
        let io_err = std::io::Error::from_raw_os_error(libc::EACCES);
        let err = FsError::io(Path::new("/src/locked"), io_err);
        assert!(matches!(err, FsError::Io { .. }));
        assert_eq!(err.to_errno(), libc::EACCES);
    }

    #[test]
    fn test_io_error_without_os_errno_is_eio() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = FsError::io(Path::new("/src/x"), io_err);
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn test_clone_shares_io_source() {
        let err = FsError::io(
            Path::new("/src/x"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            FsError::not_found(Path::new("/a")),
            FsError::NotADirectory {
                path: "/a".to_string(),
            },
            FsError::IsADirectory {
                path: "/a".to_string(),
            },
            FsError::BadDescriptor { fh: 3 },
            FsError::TransformFailure {
                path: "/a.js".to_string(),
                reason: "syntax".to_string(),
            },
            FsError::Watch {
                path: "/a".to_string(),
                reason: "limit".to_string(),
            },
            FsError::InvalidArgument {
                msg: "bad".to_string(),
            },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty(), "Error display should be non-empty");
        }
    }
}
