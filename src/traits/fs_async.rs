//! Non-blocking forms of the filesystem contract.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use super::FsSync;
use super::fs_sync::READ_CHUNK;
use crate::{DirEntry, FsResult, Handle, Metadata, OpenFlags};

/// Non-blocking filesystem operations.
///
/// Each method mirrors its `*_sync` counterpart in [`FsSync`] and by default
/// runs it inline. Synchronous backends therefore get the async surface for
/// free; asynchronous-only backends override every method here and leave
/// the blocking forms at their `NotSupported` defaults.
///
/// Every returned future resolves exactly once, with either a value or an
/// [`FsError`](crate::FsError).
///
/// # Object Safety
///
/// Methods are boxed by `async_trait`, so this trait is object-safe and can
/// be used as `dyn FsAsync`.
#[async_trait]
pub trait FsAsync: FsSync {
    /// Metadata for `path`.
    async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        self.stat_sync(path)
    }

    /// Metadata for `path` without following a final symlink.
    async fn lstat(&self, path: &Path) -> FsResult<Metadata> {
        self.lstat_sync(path)
    }

    /// Check if a path exists.
    async fn exists(&self, path: &Path) -> FsResult<bool> {
        self.exists_sync(path)
    }

    /// Open a file and return a handle.
    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        self.open_sync(path, flags, mode)
    }

    /// Read up to `len` bytes through a handle.
    async fn read(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        self.read_sync(handle, len, position)
    }

    /// Write `data` through a handle.
    async fn write(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        self.write_sync(handle, data, position)
    }

    /// Push a dirty handle's state back to the file.
    async fn flush(&self, handle: Handle) -> FsResult<()> {
        self.flush_sync(handle)
    }

    /// Flush if dirty, then invalidate the handle.
    async fn close(&self, handle: Handle) -> FsResult<()> {
        self.close_sync(handle)
    }

    /// Remove a non-directory entry.
    async fn unlink(&self, path: &Path) -> FsResult<()> {
        self.unlink_sync(path)
    }

    /// Rename/move an entry.
    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.rename_sync(from, to)
    }

    /// Create a directory.
    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.mkdir_sync(path, mode)
    }

    /// Remove an empty directory.
    async fn rmdir(&self, path: &Path) -> FsResult<()> {
        self.rmdir_sync(path)
    }

    /// List a directory, sorted by name.
    async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        self.readdir_sync(path)
    }

    /// Resize a file.
    async fn truncate(&self, path: &Path, len: u64) -> FsResult<()> {
        self.truncate_sync(path, len)
    }

    /// Set permission bits.
    async fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.chmod_sync(path, mode)
    }

    /// Set ownership.
    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        self.chown_sync(path, uid, gid)
    }

    /// Set access and modification times.
    async fn utimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.utimes_sync(path, atime, mtime)
    }

    /// Create a hard link.
    async fn link(&self, existing: &Path, new: &Path) -> FsResult<()> {
        self.link_sync(existing, new)
    }

    /// Create a symlink at `link` pointing to `target`.
    async fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        self.symlink_sync(target, link)
    }

    /// Raw target of a symlink.
    async fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        self.readlink_sync(path)
    }

    /// Read a whole file.
    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        let handle = self.open(path, OpenFlags::READ, 0).await?;
        let mut data = Vec::new();
        let result = loop {
            match self.read(handle, READ_CHUNK, None).await {
                Ok(chunk) if chunk.is_empty() => break Ok(()),
                Ok(chunk) => data.extend_from_slice(&chunk),
                Err(e) => break Err(e),
            }
        };
        let closed = self.close(handle).await;
        result?;
        closed?;
        Ok(data)
    }

    /// Replace a file's contents, creating it with `mode` if missing.
    async fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        let handle = self.open(path, OpenFlags::WRITE, mode).await?;
        let written = self.write(handle, data, None).await;
        let closed = self.close(handle).await;
        written?;
        closed
    }

    /// Append to a file, creating it with `mode` if missing.
    async fn append_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        let handle = self.open(path, OpenFlags::APPEND, mode).await?;
        let written = self.write(handle, data, None).await;
        let closed = self.close(handle).await;
        written?;
        closed
    }
}
