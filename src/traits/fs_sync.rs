//! Blocking forms of the filesystem contract.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::FsCapabilities;
use crate::{DirEntry, FsError, FsResult, Handle, Metadata, OpenFlags};

/// Chunk size used by the provided whole-file helpers.
pub(crate) const READ_CHUNK: usize = 64 * 1024;

fn unsupported<T>(operation: &str) -> FsResult<T> {
    Err(FsError::not_supported(format!("{operation}_sync")))
}

/// Blocking filesystem operations.
///
/// Every method has a default body that fails with
/// [`FsError::NotSupported`]. Backends advertising
/// [`Capabilities::synchronous`](crate::Capabilities::synchronous) override
/// all of them; asynchronous-only backends leave them alone, so calling a
/// blocking form on such a backend is reported, not undefined.
///
/// The contract never resolves symlinks: `stat_sync` and `lstat_sync` both
/// describe the entry at `path` itself.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync`. Methods use `&self`;
/// backends use interior mutability.
///
/// # Object Safety
///
/// This trait is object-safe and can be used as `dyn FsSync`.
pub trait FsSync: FsCapabilities {
    /// Metadata for `path`.
    ///
    /// # Errors
    ///
    /// - [`FsError::NotFound`] if the path does not exist
    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        let _ = path;
        unsupported("stat")
    }

    /// Metadata for `path` without following a final symlink.
    fn lstat_sync(&self, path: &Path) -> FsResult<Metadata> {
        let _ = path;
        unsupported("lstat")
    }

    /// Check if a path exists.
    ///
    /// Returns `Ok(false)` for missing paths; errors only for unexpected failures.
    fn exists_sync(&self, path: &Path) -> FsResult<bool> {
        let _ = path;
        unsupported("exists")
    }

    /// Open a file and return a handle.
    ///
    /// `mode` is used when the file is created.
    ///
    /// # Errors
    ///
    /// - [`FsError::NotFound`] if the file doesn't exist and `create` is false
    /// - [`FsError::AlreadyExists`] for `create` + `exclusive` on an existing file
    /// - [`FsError::IsADirectory`] if the path is a directory
    fn open_sync(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        let _ = (path, flags, mode);
        unsupported("open")
    }

    /// Read up to `len` bytes through a handle.
    ///
    /// With `position = Some(p)` the read starts at `p` and the handle
    /// position is left alone; with `None` it starts at, and advances, the
    /// handle position. An empty result means end of file.
    fn read_sync(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        let _ = (handle, len, position);
        unsupported("read")
    }

    /// Write `data` through a handle. Returns the number of bytes written.
    ///
    /// Position semantics match [`read_sync`](Self::read_sync); append
    /// handles always write at the end of the file.
    fn write_sync(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        let _ = (handle, data, position);
        unsupported("write")
    }

    /// Push a dirty handle's state back to the file.
    fn flush_sync(&self, handle: Handle) -> FsResult<()> {
        let _ = handle;
        unsupported("flush")
    }

    /// Flush if dirty, then invalidate the handle.
    fn close_sync(&self, handle: Handle) -> FsResult<()> {
        let _ = handle;
        unsupported("close")
    }

    /// Remove a non-directory entry.
    ///
    /// # Errors
    ///
    /// - [`FsError::NotFound`] if the path does not exist
    /// - [`FsError::IsADirectory`] if the path is a directory
    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        let _ = path;
        unsupported("unlink")
    }

    /// Rename/move an entry, replacing a compatible destination.
    fn rename_sync(&self, from: &Path, to: &Path) -> FsResult<()> {
        let _ = (from, to);
        unsupported("rename")
    }

    /// Create a directory. The parent must exist.
    fn mkdir_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        let _ = (path, mode);
        unsupported("mkdir")
    }

    /// Remove an empty directory.
    ///
    /// # Errors
    ///
    /// - [`FsError::DirectoryNotEmpty`] if the directory has entries
    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        let _ = path;
        unsupported("rmdir")
    }

    /// List a directory, sorted by name.
    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let _ = path;
        unsupported("readdir")
    }

    /// Resize a file, zero-filling when it grows.
    fn truncate_sync(&self, path: &Path, len: u64) -> FsResult<()> {
        let _ = (path, len);
        unsupported("truncate")
    }

    /// Set permission bits.
    fn chmod_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        let _ = (path, mode);
        unsupported("chmod")
    }

    /// Set ownership.
    fn chown_sync(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        let _ = (path, uid, gid);
        unsupported("chown")
    }

    /// Set access and modification times.
    fn utimes_sync(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let _ = (path, atime, mtime);
        unsupported("utimes")
    }

    /// Create a hard link `new` to the file at `existing`.
    fn link_sync(&self, existing: &Path, new: &Path) -> FsResult<()> {
        let _ = (existing, new);
        unsupported("link")
    }

    /// Create a symlink at `link` pointing to `target` (which need not exist).
    fn symlink_sync(&self, target: &Path, link: &Path) -> FsResult<()> {
        let _ = (target, link);
        unsupported("symlink")
    }

    /// Raw target of a symlink.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] if `path` is not a symlink
    fn readlink_sync(&self, path: &Path) -> FsResult<PathBuf> {
        let _ = path;
        unsupported("readlink")
    }

    /// Read a whole file.
    fn read_file_sync(&self, path: &Path) -> FsResult<Vec<u8>> {
        let handle = self.open_sync(path, OpenFlags::READ, 0)?;
        let mut data = Vec::new();
        let result = loop {
            match self.read_sync(handle, READ_CHUNK, None) {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        let closed = self.close_sync(handle);
        result?;
        closed?;
        Ok(data)
    }

    /// Replace a file's contents, creating it with `mode` if missing.
    fn write_file_sync(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        let handle = self.open_sync(path, OpenFlags::WRITE, mode)?;
        let written = self.write_sync(handle, data, None);
        let closed = self.close_sync(handle);
        written?;
        closed
    }

    /// Append to a file, creating it with `mode` if missing.
    fn append_file_sync(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        let handle = self.open_sync(path, OpenFlags::APPEND, mode)?;
        let written = self.write_sync(handle, data, None);
        let closed = self.close_sync(handle);
        written?;
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Capabilities;

    struct AsyncOnly;

    impl FsCapabilities for AsyncOnly {
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
    }

    impl FsSync for AsyncOnly {}

    #[test]
    fn fs_sync_is_object_safe() {
        fn _check(_: &dyn FsSync) {}
    }

    #[test]
    fn blocking_forms_default_to_not_supported() {
        let fs = AsyncOnly;
        let err = fs.stat_sync(Path::new("/a")).unwrap_err();
        assert_eq!(err, FsError::not_supported("stat_sync"));

        let err = fs.read_file_sync(Path::new("/a")).unwrap_err();
        assert_eq!(err, FsError::not_supported("open_sync"));
    }
}
