//! Read-only middleware.
//!
//! Wraps any backend and rejects every mutation with
//! [`FsError::ReadOnly`]. Reads pass straight through, blocking forms to
//! blocking forms and non-blocking forms to non-blocking forms, so the
//! wrapper keeps the inner backend's synchronous capability.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::{
    Capabilities, DirEntry, FileSystem, FsAsync, FsCapabilities, FsError, FsResult, FsSync,
    Handle, Layer, Metadata, OpenFlags,
};

/// A backend wrapper that refuses all mutation.
///
/// Opening with mutating flags fails up front, so a handle obtained through
/// this wrapper can only ever read.
pub struct ReadOnly<B: ?Sized> {
    inner: Arc<B>,
}

impl<B: FileSystem + ?Sized> ReadOnly<B> {
    /// Wrap `inner`.
    pub fn new(inner: Arc<B>) -> Self {
        Self { inner }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }
}

/// [`Layer`] producing [`ReadOnly`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOnlyLayer;

impl<B: FileSystem + ?Sized> Layer<Arc<B>> for ReadOnlyLayer {
    type Backend = ReadOnly<B>;

    fn layer(self, backend: Arc<B>) -> Self::Backend {
        ReadOnly::new(backend)
    }
}

fn check_flags(path: &Path, flags: OpenFlags) -> FsResult<()> {
    if flags.is_mutating() {
        Err(FsError::read_only(path))
    } else {
        Ok(())
    }
}

impl<B: FileSystem + ?Sized> FsCapabilities for ReadOnly<B> {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            read_only: true,
            ..self.inner.capabilities()
        }
    }
}

impl<B: FileSystem + ?Sized> FsSync for ReadOnly<B> {
    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.inner.stat_sync(path)
    }

    fn lstat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.inner.lstat_sync(path)
    }

    fn exists_sync(&self, path: &Path) -> FsResult<bool> {
        self.inner.exists_sync(path)
    }

    fn open_sync(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        check_flags(path, flags)?;
        self.inner.open_sync(path, flags, mode)
    }

    fn read_sync(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        self.inner.read_sync(handle, len, position)
    }

    fn write_sync(&self, _: Handle, _: &[u8], _: Option<u64>) -> FsResult<usize> {
        // Handles carry no path; report the filesystem root.
        Err(FsError::read_only("/"))
    }

    fn flush_sync(&self, handle: Handle) -> FsResult<()> {
        self.inner.flush_sync(handle)
    }

    fn close_sync(&self, handle: Handle) -> FsResult<()> {
        self.inner.close_sync(handle)
    }

    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        Err(FsError::read_only(path))
    }

    fn rename_sync(&self, from: &Path, _: &Path) -> FsResult<()> {
        Err(FsError::read_only(from))
    }

    fn mkdir_sync(&self, path: &Path, _: u32) -> FsResult<()> {
        Err(FsError::read_only(path))
    }

    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        Err(FsError::read_only(path))
    }

    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        self.inner.readdir_sync(path)
    }

    fn truncate_sync(&self, path: &Path, _: u64) -> FsResult<()> {
        Err(FsError::read_only(path))
    }

    fn chmod_sync(&self, path: &Path, _: u32) -> FsResult<()> {
        Err(FsError::read_only(path))
    }

    fn chown_sync(&self, path: &Path, _: u32, _: u32) -> FsResult<()> {
        Err(FsError::read_only(path))
    }

    fn utimes_sync(&self, path: &Path, _: SystemTime, _: SystemTime) -> FsResult<()> {
        Err(FsError::read_only(path))
    }

    fn link_sync(&self, _: &Path, new: &Path) -> FsResult<()> {
        Err(FsError::read_only(new))
    }

    fn symlink_sync(&self, _: &Path, link: &Path) -> FsResult<()> {
        Err(FsError::read_only(link))
    }

    fn readlink_sync(&self, path: &Path) -> FsResult<PathBuf> {
        self.inner.readlink_sync(path)
    }
}

#[async_trait]
impl<B: FileSystem + ?Sized> FsAsync for ReadOnly<B> {
    async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        self.inner.stat(path).await
    }

    async fn lstat(&self, path: &Path) -> FsResult<Metadata> {
        self.inner.lstat(path).await
    }

    async fn exists(&self, path: &Path) -> FsResult<bool> {
        self.inner.exists(path).await
    }

    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        check_flags(path, flags)?;
        self.inner.open(path, flags, mode).await
    }

    async fn read(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        self.inner.read(handle, len, position).await
    }

    async fn write(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        self.write_sync(handle, data, position)
    }

    async fn flush(&self, handle: Handle) -> FsResult<()> {
        self.inner.flush(handle).await
    }

    async fn close(&self, handle: Handle) -> FsResult<()> {
        self.inner.close(handle).await
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        self.inner.readdir(path).await
    }

    async fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        self.inner.readlink(path).await
    }
}
