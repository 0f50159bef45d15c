//! Error types for the layerfs filesystem contract.

use std::fmt;
use std::path::{Path, PathBuf};

/// Backend-agnostic error kinds.
///
/// Every backend translates its native failures into one of these kinds.
/// Composite backends pass kinds through unchanged, and the RPC bridge
/// carries them across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Path does not exist.
    NotFound,
    /// Path exists when it must not.
    AlreadyExists,
    /// A directory was required.
    NotADirectory,
    /// A non-directory was required.
    IsADirectory,
    /// Directory still has entries.
    DirectoryNotEmpty,
    /// Access denied.
    PermissionDenied,
    /// The filesystem refuses mutation.
    ReadOnlyFilesystem,
    /// Malformed argument (bad handle, relative path, bad flags, ...).
    InvalidArgument,
    /// The backend does not implement the operation (or its blocking form).
    UnsupportedOperation,
    /// Catch-all for backend-native transport or storage failures.
    IoFailure,
    /// The backend has not finished initializing.
    NotReady,
}

impl ErrorKind {
    /// POSIX-style code name for this kind.
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::AlreadyExists => "EEXIST",
            ErrorKind::NotADirectory => "ENOTDIR",
            ErrorKind::IsADirectory => "EISDIR",
            ErrorKind::DirectoryNotEmpty => "ENOTEMPTY",
            ErrorKind::PermissionDenied => "EACCES",
            ErrorKind::ReadOnlyFilesystem => "EROFS",
            ErrorKind::InvalidArgument => "EINVAL",
            ErrorKind::UnsupportedOperation => "ENOTSUP",
            ErrorKind::IoFailure => "EIO",
            ErrorKind::NotReady => "EBUSY",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Filesystem error type.
///
/// One variant per [`ErrorKind`], each carrying the context needed to
/// rebuild it on the far side of an RPC boundary.
///
/// # Examples
///
/// ```rust
/// use layerfs::{ErrorKind, FsError};
/// use std::path::PathBuf;
///
/// let err = FsError::NotFound { path: PathBuf::from("/missing") };
/// assert_eq!(err.to_string(), "not found: /missing");
/// assert_eq!(err.kind(), ErrorKind::NotFound);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    /// Path does not exist.
    #[error("not found: {path}")]
    NotFound {
        /// The path that was not found.
        path: PathBuf,
    },

    /// Path already exists.
    #[error("already exists: {path}")]
    AlreadyExists {
        /// The path that already exists.
        path: PathBuf,
    },

    /// Expected a directory.
    #[error("not a directory: {path}")]
    NotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// Expected something other than a directory.
    #[error("is a directory: {path}")]
    IsADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// Directory is not empty.
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty {
        /// The non-empty directory.
        path: PathBuf,
    },

    /// Permission denied.
    #[error("permission denied: {path}")]
    PermissionDenied {
        /// The path where access was denied.
        path: PathBuf,
    },

    /// Filesystem is read-only.
    #[error("read-only filesystem: {path}")]
    ReadOnly {
        /// The path a mutation was attempted on.
        path: PathBuf,
    },

    /// Invalid argument.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong.
        reason: String,
    },

    /// Operation is not supported by this backend.
    #[error("operation not supported: {operation}")]
    NotSupported {
        /// The unsupported operation.
        operation: String,
    },

    /// Backend-native I/O or transport failure.
    #[error("i/o failure: {message}")]
    Io {
        /// Description of the underlying failure.
        message: String,
    },

    /// Backend is not initialized yet (or failed to initialize).
    #[error("filesystem not ready")]
    NotReady,
}

/// Result alias used throughout the crate.
pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    /// The taxonomy kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FsError::NotFound { .. } => ErrorKind::NotFound,
            FsError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            FsError::NotADirectory { .. } => ErrorKind::NotADirectory,
            FsError::IsADirectory { .. } => ErrorKind::IsADirectory,
            FsError::DirectoryNotEmpty { .. } => ErrorKind::DirectoryNotEmpty,
            FsError::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            FsError::ReadOnly { .. } => ErrorKind::ReadOnlyFilesystem,
            FsError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            FsError::NotSupported { .. } => ErrorKind::UnsupportedOperation,
            FsError::Io { .. } => ErrorKind::IoFailure,
            FsError::NotReady => ErrorKind::NotReady,
        }
    }

    /// The path this error refers to, for path-carrying kinds.
    pub fn path(&self) -> Option<&Path> {
        match self {
            FsError::NotFound { path }
            | FsError::AlreadyExists { path }
            | FsError::NotADirectory { path }
            | FsError::IsADirectory { path }
            | FsError::DirectoryNotEmpty { path }
            | FsError::PermissionDenied { path }
            | FsError::ReadOnly { path } => Some(path),
            _ => None,
        }
    }

    /// Free-form detail for kinds that carry a message instead of a path.
    pub fn detail(&self) -> Option<&str> {
        match self {
            FsError::InvalidArgument { reason } => Some(reason),
            FsError::NotSupported { operation } => Some(operation),
            FsError::Io { message } => Some(message),
            _ => None,
        }
    }

    /// Rebuild an error from its kind plus the context returned by
    /// [`path`](Self::path) and [`detail`](Self::detail).
    pub fn from_parts(kind: ErrorKind, path: Option<PathBuf>, detail: Option<String>) -> Self {
        let path = path.unwrap_or_default();
        let detail = detail.unwrap_or_default();
        match kind {
            ErrorKind::NotFound => FsError::NotFound { path },
            ErrorKind::AlreadyExists => FsError::AlreadyExists { path },
            ErrorKind::NotADirectory => FsError::NotADirectory { path },
            ErrorKind::IsADirectory => FsError::IsADirectory { path },
            ErrorKind::DirectoryNotEmpty => FsError::DirectoryNotEmpty { path },
            ErrorKind::PermissionDenied => FsError::PermissionDenied { path },
            ErrorKind::ReadOnlyFilesystem => FsError::ReadOnly { path },
            ErrorKind::InvalidArgument => FsError::InvalidArgument { reason: detail },
            ErrorKind::UnsupportedOperation => FsError::NotSupported { operation: detail },
            ErrorKind::IoFailure => FsError::Io { message: detail },
            ErrorKind::NotReady => FsError::NotReady,
        }
    }

    /// Create a `NotFound` error.
    pub fn not_found(path: impl AsRef<Path>) -> Self {
        FsError::NotFound {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create an `AlreadyExists` error.
    pub fn already_exists(path: impl AsRef<Path>) -> Self {
        FsError::AlreadyExists {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create a `ReadOnly` error.
    pub fn read_only(path: impl AsRef<Path>) -> Self {
        FsError::ReadOnly {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Create an `InvalidArgument` error.
    pub fn invalid(reason: impl Into<String>) -> Self {
        FsError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a `NotSupported` error.
    pub fn not_supported(operation: impl Into<String>) -> Self {
        FsError::NotSupported {
            operation: operation.into(),
        }
    }

    /// Create an `Io` error.
    pub fn io(message: impl Into<String>) -> Self {
        FsError::Io {
            message: message.into(),
        }
    }

    /// `InvalidArgument` for a handle the backend does not know.
    pub fn bad_handle(handle: crate::Handle) -> Self {
        FsError::invalid(format!("bad file handle {}", handle.0))
    }

    /// Returns `true` for [`ErrorKind::NotFound`].
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound { .. })
    }
}

impl From<std::io::Error> for FsError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind as Io;
        let path = PathBuf::new();
        match error.kind() {
            Io::NotFound => FsError::NotFound { path },
            Io::AlreadyExists => FsError::AlreadyExists { path },
            Io::PermissionDenied => FsError::PermissionDenied { path },
            Io::NotADirectory => FsError::NotADirectory { path },
            Io::IsADirectory => FsError::IsADirectory { path },
            Io::DirectoryNotEmpty => FsError::DirectoryNotEmpty { path },
            Io::ReadOnlyFilesystem => FsError::ReadOnly { path },
            Io::InvalidInput => FsError::invalid(error.to_string()),
            Io::Unsupported => FsError::not_supported(error.to_string()),
            _ => FsError::io(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_error_not_found_display() {
        let err = FsError::not_found("/missing");
        assert_eq!(err.to_string(), "not found: /missing");
    }

    #[test]
    fn fs_error_read_only_display() {
        let err = FsError::read_only("/etc/passwd");
        assert_eq!(err.to_string(), "read-only filesystem: /etc/passwd");
        assert_eq!(err.kind(), ErrorKind::ReadOnlyFilesystem);
    }

    #[test]
    fn kinds_have_posix_codes() {
        assert_eq!(ErrorKind::NotFound.code(), "ENOENT");
        assert_eq!(ErrorKind::DirectoryNotEmpty.code(), "ENOTEMPTY");
        assert_eq!(ErrorKind::ReadOnlyFilesystem.to_string(), "EROFS");
    }

    #[test]
    fn from_parts_rebuilds_path_errors() {
        let original = FsError::DirectoryNotEmpty {
            path: PathBuf::from("/full"),
        };
        let rebuilt = FsError::from_parts(
            original.kind(),
            original.path().map(Path::to_path_buf),
            original.detail().map(str::to_owned),
        );
        assert_eq!(rebuilt, original);
        assert_eq!(rebuilt.to_string(), original.to_string());
    }

    #[test]
    fn from_parts_rebuilds_detail_errors() {
        for original in [
            FsError::invalid("bad flags"),
            FsError::not_supported("chown"),
            FsError::io("socket reset"),
            FsError::NotReady,
        ] {
            let rebuilt = FsError::from_parts(
                original.kind(),
                original.path().map(Path::to_path_buf),
                original.detail().map(str::to_owned),
            );
            assert_eq!(rebuilt, original);
        }
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let json = serde_json::to_string(&ErrorKind::ReadOnlyFilesystem).unwrap();
        assert_eq!(json, "\"read-only-filesystem\"");
    }

    #[test]
    fn fs_error_from_io_not_found() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "test");
        assert!(FsError::from(io_err).is_not_found());
    }

    #[test]
    fn fs_error_from_io_permission_denied() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "test");
        let fs_err = FsError::from(io_err);
        assert!(matches!(fs_err, FsError::PermissionDenied { .. }));
    }

    #[test]
    fn fs_error_from_io_other() {
        let io_err = std::io::Error::other("test");
        let fs_err = FsError::from(io_err);
        assert_eq!(fs_err.kind(), ErrorKind::IoFailure);
    }
}
