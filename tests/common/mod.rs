//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use layerfs::*;
use parking_lot::Mutex;

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

struct Fault {
    op: &'static str,
    path: PathBuf,
    error: FsError,
}

/// An asynchronous-only store standing in for a remote backend.
///
/// Backed by a [`MemoryFs`], it records every operation it receives,
/// can fail chosen operations once, and can delay operations on chosen
/// paths.
pub struct RemoteSim {
    inner: MemoryFs,
    ops: Mutex<Vec<String>>,
    faults: Mutex<Vec<Fault>>,
    delays: Mutex<Vec<(PathBuf, Duration)>>,
}

impl RemoteSim {
    pub fn new() -> Self {
        Self {
            inner: MemoryFs::new(),
            ops: Mutex::new(Vec::new()),
            faults: Mutex::new(Vec::new()),
            delays: Mutex::new(Vec::new()),
        }
    }

    /// Direct access to the backing store, bypassing the log.
    pub fn store(&self) -> &MemoryFs {
        &self.inner
    }

    /// Every operation received so far, as `"op /path"`.
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    /// Operations received whose name is `op`.
    pub fn ops_named(&self, op: &str) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .filter(|entry| entry.split(' ').next() == Some(op))
            .cloned()
            .collect()
    }

    /// Fail the next `op` on `path` with `error`.
    pub fn fail_once(&self, op: &'static str, path: &str, error: FsError) {
        self.faults.lock().push(Fault {
            op,
            path: PathBuf::from(path),
            error,
        });
    }

    /// Delay every operation on `path`.
    pub fn delay(&self, path: &str, by: Duration) {
        self.delays.lock().push((PathBuf::from(path), by));
    }

    async fn enter(&self, op: &'static str, path: &Path) -> FsResult<()> {
        self.ops.lock().push(format!("{op} {}", path.display()));
        let fault = {
            let mut faults = self.faults.lock();
            faults
                .iter()
                .position(|f| f.op == op && f.path == path)
                .map(|i| faults.remove(i).error)
        };
        if let Some(error) = fault {
            return Err(error);
        }
        let delay = self
            .delays
            .lock()
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn enter_handle(&self, op: &'static str, handle: Handle) -> FsResult<()> {
        self.ops.lock().push(format!("{op} #{}", handle.0));
        Ok(())
    }
}

impl FsCapabilities for RemoteSim {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            synchronous: false,
            permissions: true,
            links: true,
            read_only: false,
        }
    }
}

impl FsSync for RemoteSim {}

#[async_trait]
impl FsAsync for RemoteSim {
    async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        self.enter("stat", path).await?;
        self.inner.stat_sync(path)
    }

    async fn lstat(&self, path: &Path) -> FsResult<Metadata> {
        self.enter("lstat", path).await?;
        self.inner.lstat_sync(path)
    }

    async fn exists(&self, path: &Path) -> FsResult<bool> {
        self.enter("exists", path).await?;
        self.inner.exists_sync(path)
    }

    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        self.enter("open", path).await?;
        self.inner.open_sync(path, flags, mode)
    }

    async fn read(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        self.enter_handle("read", handle).await?;
        self.inner.read_sync(handle, len, position)
    }

    async fn write(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        self.enter_handle("write", handle).await?;
        self.inner.write_sync(handle, data, position)
    }

    async fn flush(&self, handle: Handle) -> FsResult<()> {
        self.enter_handle("flush", handle).await?;
        self.inner.flush_sync(handle)
    }

    async fn close(&self, handle: Handle) -> FsResult<()> {
        self.enter_handle("close", handle).await?;
        self.inner.close_sync(handle)
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        self.enter("unlink", path).await?;
        self.inner.unlink_sync(path)
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.enter("rename", from).await?;
        self.inner.rename_sync(from, to)
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.enter("mkdir", path).await?;
        self.inner.mkdir_sync(path, mode)
    }

    async fn rmdir(&self, path: &Path) -> FsResult<()> {
        self.enter("rmdir", path).await?;
        self.inner.rmdir_sync(path)
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        self.enter("readdir", path).await?;
        self.inner.readdir_sync(path)
    }

    async fn truncate(&self, path: &Path, len: u64) -> FsResult<()> {
        self.enter("truncate", path).await?;
        self.inner.truncate_sync(path, len)
    }

    async fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.enter("chmod", path).await?;
        self.inner.chmod_sync(path, mode)
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        self.enter("chown", path).await?;
        self.inner.chown_sync(path, uid, gid)
    }

    async fn utimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.enter("utimes", path).await?;
        self.inner.utimes_sync(path, atime, mtime)
    }

    async fn link(&self, existing: &Path, new: &Path) -> FsResult<()> {
        self.enter("link", new).await?;
        self.inner.link_sync(existing, new)
    }

    async fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        self.enter("symlink", link).await?;
        self.inner.symlink_sync(target, link)
    }

    async fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        self.enter("readlink", path).await?;
        self.inner.readlink_sync(path)
    }

    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        self.enter("read_file", path).await?;
        self.inner.read_file_sync(path)
    }

    async fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        self.enter("write_file", path).await?;
        self.inner.write_file_sync(path, data, mode)
    }

    async fn append_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        self.enter("append_file", path).await?;
        self.inner.append_file_sync(path, data, mode)
    }
}

/// Sorted entry names of `path`.
pub async fn names(fs: &dyn FileSystem, path: &str) -> Vec<String> {
    fs.readdir(Path::new(path))
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect()
}
