use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::replay::{QueueItem, ReplayFailure, ReplayOp, run_worker};
use super::state::{MirrorState, StateCell};
use crate::{
    Capabilities, DirEntry, FileSystem, FsAsync, FsCapabilities, FsError, FsExt, FsResult,
    FsSync, Handle, Metadata, OpenFlags,
};

const FAILURE_CHANNEL_CAPACITY: usize = 64;

struct MirrorHandle {
    path: PathBuf,
    dirty: bool,
}

/// A synchronous local replica kept in step with an asynchronous remote.
///
/// After [`initialize`](Self::initialize) copies the remote into the local
/// replica, reads are served from local only. Each mutation is applied to
/// local immediately and queued for the remote; a single worker task
/// replays the queue in order. Remote failures are published on
/// [`subscribe_failures`](Self::subscribe_failures) and never reach the
/// caller that issued the mutation.
///
/// Every call before the mirror is ready fails with [`FsError::NotReady`].
pub struct AsyncMirror {
    local: Arc<dyn FileSystem>,
    remote: Arc<dyn FileSystem>,
    state: StateCell,
    /// Held across local-apply + enqueue so queue order equals local order.
    queue: Mutex<Option<mpsc::UnboundedSender<QueueItem>>>,
    failures: broadcast::Sender<ReplayFailure>,
    handles: Mutex<HashMap<Handle, MirrorHandle>>,
}

impl AsyncMirror {
    /// Pair a synchronous local replica with a remote.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] if `local` is not synchronous or is read-only
    pub fn new(local: Arc<dyn FileSystem>, remote: Arc<dyn FileSystem>) -> FsResult<Self> {
        if !local.supports_synchronous_ops() {
            return Err(FsError::invalid("mirror local replica must be synchronous"));
        }
        if local.is_read_only() {
            return Err(FsError::invalid("mirror local replica must be writable"));
        }
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Ok(Self {
            local,
            remote,
            state: StateCell::new(MirrorState::Uninitialized),
            queue: Mutex::new(None),
            failures,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// [`new`](Self::new) followed by [`initialize`](Self::initialize).
    pub async fn synced(
        local: Arc<dyn FileSystem>,
        remote: Arc<dyn FileSystem>,
    ) -> FsResult<Self> {
        let mirror = Self::new(local, remote)?;
        mirror.initialize().await?;
        Ok(mirror)
    }

    /// Copy the whole remote into local, start the replay worker and
    /// become ready. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] if called more than once
    /// - the crawl's error, after which the mirror is [`MirrorState::Failed`]
    pub async fn initialize(&self) -> FsResult<()> {
        self.state
            .transition(MirrorState::Uninitialized, MirrorState::Syncing)
            .map_err(|state| FsError::invalid(format!("mirror is already {state}")))?;
        info!("mirror initial sync started");

        let copied = match self.crawl().await {
            Ok(copied) => copied,
            Err(e) => {
                warn!(error = %e, "mirror initial sync failed");
                self.state.set(MirrorState::Failed);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(
            Arc::clone(&self.remote),
            rx,
            self.failures.clone(),
        ));
        *self.queue.lock() = Some(tx);
        self.state.set(MirrorState::Ready);
        info!(entries = copied, "mirror ready");
        Ok(())
    }

    async fn crawl(&self) -> FsResult<usize> {
        let entries = self.remote.walk(Path::new("/")).await?;
        let local = &self.local;
        for (path, meta) in &entries {
            let mode = meta.permissions.mode();
            if meta.is_dir() {
                match local.mkdir_sync(path, mode) {
                    Ok(()) | Err(FsError::AlreadyExists { .. }) => {}
                    Err(e) => return Err(e),
                }
            } else if meta.is_symlink() {
                let target = self.remote.readlink(path).await?;
                local.symlink_sync(&target, path)?;
                continue;
            } else {
                let data = self.remote.read_file(path).await?;
                local.write_file_sync(path, &data, mode)?;
            }
            local.chmod_sync(path, mode)?;
            if local.supports_permissions() {
                if let Err(e) = local.chown_sync(path, meta.uid, meta.gid) {
                    debug!(path = %path.display(), error = %e, "could not copy ownership");
                }
            }
        }
        // Directory times last, after their children stopped touching them.
        for (path, meta) in entries.iter().rev().filter(|(_, m)| !m.is_symlink()) {
            if let Err(e) = local.utimes_sync(path, meta.accessed, meta.modified) {
                debug!(path = %path.display(), error = %e, "could not copy times");
            }
        }
        Ok(entries.len())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MirrorState {
        self.state.get()
    }

    /// The local replica.
    pub fn local(&self) -> &Arc<dyn FileSystem> {
        &self.local
    }

    /// The remote store.
    pub fn remote(&self) -> &Arc<dyn FileSystem> {
        &self.remote
    }

    /// Receive every replay failure from now on.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<ReplayFailure> {
        self.failures.subscribe()
    }

    /// Wait until every mutation queued before this call has been applied
    /// (or has failed) on the remote.
    pub async fn drain(&self) -> FsResult<()> {
        self.ready()?;
        let (done, wait) = oneshot::channel();
        self.queue
            .lock()
            .as_ref()
            .ok_or(FsError::NotReady)?
            .send(QueueItem::Barrier(done))
            .map_err(|_| FsError::io("replay worker stopped"))?;
        wait.await
            .map_err(|_| FsError::io("replay worker stopped"))
    }

    fn ready(&self) -> FsResult<()> {
        match self.state.get() {
            MirrorState::Ready => Ok(()),
            _ => Err(FsError::NotReady),
        }
    }

    fn enqueue(&self, queue: &Option<mpsc::UnboundedSender<QueueItem>>, op: ReplayOp) {
        let Some(tx) = queue else {
            return;
        };
        if let Err(mpsc::error::SendError(QueueItem::Op(op))) = tx.send(QueueItem::Op(op)) {
            warn!(op = op.name(), "replay worker stopped; mutation not replicated");
            let _ = self.failures.send(ReplayFailure {
                op,
                error: FsError::io("replay worker stopped"),
            });
        }
    }

    /// Apply a mutation to local and queue its replay as one step.
    fn mutate<T>(
        &self,
        apply: impl FnOnce(&dyn FileSystem) -> FsResult<T>,
        op: impl FnOnce() -> ReplayOp,
    ) -> FsResult<T> {
        self.ready()?;
        let queue = self.queue.lock();
        let value = apply(&*self.local)?;
        self.enqueue(&queue, op());
        Ok(value)
    }

    /// Queue the full content of a dirty handle's file.
    fn flush_locked(
        &self,
        queue: &Option<mpsc::UnboundedSender<QueueItem>>,
        handle: Handle,
    ) -> FsResult<()> {
        let path = match self.handles.lock().get_mut(&handle) {
            Some(entry) if entry.dirty => {
                entry.dirty = false;
                entry.path.clone()
            }
            Some(_) => return Ok(()),
            None => return Err(FsError::bad_handle(handle)),
        };
        let data = match self.local.read_file_sync(&path) {
            Ok(data) => data,
            Err(FsError::NotFound { .. }) => {
                debug!(path = %path.display(), "flushed file no longer exists locally");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let mode = self.local.stat_sync(&path)?.permissions.mode();
        self.enqueue(queue, ReplayOp::WriteFile { path, data, mode });
        Ok(())
    }
}

impl AsyncMirror {
    /// Point open handles under `from` at the same file under `to`.
    fn repoint_handles(&self, from: &Path, to: &Path) {
        for entry in self.handles.lock().values_mut() {
            if let Ok(rest) = entry.path.strip_prefix(from) {
                entry.path = if rest.as_os_str().is_empty() {
                    to.to_path_buf()
                } else {
                    to.join(rest)
                };
            }
        }
    }
}

impl FsCapabilities for AsyncMirror {
    fn capabilities(&self) -> Capabilities {
        let local = self.local.capabilities();
        let remote = self.remote.capabilities();
        Capabilities {
            synchronous: true,
            permissions: local.permissions && remote.permissions,
            links: local.links && remote.links,
            read_only: false,
        }
    }
}

impl FsSync for AsyncMirror {
    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.ready()?;
        self.local.stat_sync(path)
    }

    fn lstat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.ready()?;
        self.local.lstat_sync(path)
    }

    fn exists_sync(&self, path: &Path) -> FsResult<bool> {
        self.ready()?;
        self.local.exists_sync(path)
    }

    fn open_sync(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        self.ready()?;
        let _queue = self.queue.lock();
        let existed = self.local.exists_sync(path)?;
        let handle = self.local.open_sync(path, flags, mode)?;
        let dirty = (flags.create && !existed) || (flags.truncate && flags.write);
        self.handles.lock().insert(
            handle,
            MirrorHandle {
                path: path.to_path_buf(),
                dirty,
            },
        );
        Ok(handle)
    }

    fn read_sync(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        self.ready()?;
        self.local.read_sync(handle, len, position)
    }

    fn write_sync(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        self.ready()?;
        let written = self.local.write_sync(handle, data, position)?;
        if let Some(entry) = self.handles.lock().get_mut(&handle) {
            entry.dirty = true;
        }
        Ok(written)
    }

    fn flush_sync(&self, handle: Handle) -> FsResult<()> {
        self.ready()?;
        let queue = self.queue.lock();
        self.local.flush_sync(handle)?;
        self.flush_locked(&queue, handle)
    }

    fn close_sync(&self, handle: Handle) -> FsResult<()> {
        self.ready()?;
        let queue = self.queue.lock();
        let flushed = self.flush_locked(&queue, handle);
        self.handles.lock().remove(&handle);
        let closed = self.local.close_sync(handle);
        flushed?;
        closed
    }

    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        self.mutate(
            |local| local.unlink_sync(path),
            || ReplayOp::Unlink {
                path: path.to_path_buf(),
            },
        )
    }

    fn rename_sync(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.mutate(
            |local| {
                local.rename_sync(from, to)?;
                // Under the queue lock, so no flush sees the old name.
                self.repoint_handles(from, to);
                Ok(())
            },
            || ReplayOp::Rename {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            },
        )
    }

    fn mkdir_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.mutate(
            |local| local.mkdir_sync(path, mode),
            || ReplayOp::Mkdir {
                path: path.to_path_buf(),
                mode,
            },
        )
    }

    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        self.mutate(
            |local| local.rmdir_sync(path),
            || ReplayOp::Rmdir {
                path: path.to_path_buf(),
            },
        )
    }

    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        self.ready()?;
        self.local.readdir_sync(path)
    }

    fn truncate_sync(&self, path: &Path, len: u64) -> FsResult<()> {
        self.mutate(
            |local| local.truncate_sync(path, len),
            || ReplayOp::Truncate {
                path: path.to_path_buf(),
                len,
            },
        )
    }

    fn chmod_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.mutate(
            |local| local.chmod_sync(path, mode),
            || ReplayOp::Chmod {
                path: path.to_path_buf(),
                mode,
            },
        )
    }

    fn chown_sync(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        self.mutate(
            |local| local.chown_sync(path, uid, gid),
            || ReplayOp::Chown {
                path: path.to_path_buf(),
                uid,
                gid,
            },
        )
    }

    fn utimes_sync(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.mutate(
            |local| local.utimes_sync(path, atime, mtime),
            || ReplayOp::Utimes {
                path: path.to_path_buf(),
                atime,
                mtime,
            },
        )
    }

    fn link_sync(&self, existing: &Path, new: &Path) -> FsResult<()> {
        self.mutate(
            |local| local.link_sync(existing, new),
            || ReplayOp::Link {
                existing: existing.to_path_buf(),
                new: new.to_path_buf(),
            },
        )
    }

    fn symlink_sync(&self, target: &Path, link: &Path) -> FsResult<()> {
        self.mutate(
            |local| local.symlink_sync(target, link),
            || ReplayOp::Symlink {
                target: target.to_path_buf(),
                link: link.to_path_buf(),
            },
        )
    }

    fn readlink_sync(&self, path: &Path) -> FsResult<PathBuf> {
        self.ready()?;
        self.local.readlink_sync(path)
    }
}

impl FsAsync for AsyncMirror {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryFs;

    fn p(s: &str) -> &Path {
        Path::new(s)
    }

    #[test]
    fn local_must_be_synchronous() {
        struct AsyncOnly;
        impl FsCapabilities for AsyncOnly {
            fn capabilities(&self) -> Capabilities {
                Capabilities::default()
            }
        }
        impl FsSync for AsyncOnly {}
        impl FsAsync for AsyncOnly {}

        let err = AsyncMirror::new(Arc::new(AsyncOnly), Arc::new(MemoryFs::new()))
            .err()
            .unwrap();
        assert!(matches!(err, FsError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn calls_before_ready_fail_not_ready() {
        let mirror =
            AsyncMirror::new(Arc::new(MemoryFs::new()), Arc::new(MemoryFs::new())).unwrap();
        assert_eq!(mirror.state(), MirrorState::Uninitialized);
        assert_eq!(mirror.stat_sync(p("/")).unwrap_err(), FsError::NotReady);
        assert_eq!(
            mirror.write_file_sync(p("/f"), b"x", 0o644).unwrap_err(),
            FsError::NotReady
        );
        assert_eq!(mirror.drain().await.unwrap_err(), FsError::NotReady);

        mirror.initialize().await.unwrap();
        assert_eq!(mirror.state(), MirrorState::Ready);
        assert!(mirror.initialize().await.is_err());
    }

    #[tokio::test]
    async fn crawl_copies_metadata() {
        let remote = Arc::new(MemoryFs::new());
        remote.mkdir(p("/d"), 0o700).await.unwrap();
        remote.write_file(p("/d/f"), b"remote", 0o600).await.unwrap();
        remote.chown(p("/d/f"), 12, 34).await.unwrap();
        remote.symlink(p("/d/f"), p("/ln")).await.unwrap();

        let mirror = AsyncMirror::synced(Arc::new(MemoryFs::new()), remote.clone())
            .await
            .unwrap();
        let local = mirror.local();
        assert_eq!(local.read_file_sync(p("/d/f")).unwrap(), b"remote");
        let meta = local.stat_sync(p("/d/f")).unwrap();
        let source = remote.stat_sync(p("/d/f")).unwrap();
        assert_eq!(meta.permissions.mode(), 0o600);
        assert_eq!((meta.uid, meta.gid), (12, 34));
        assert_eq!(meta.modified, source.modified);
        assert_eq!(local.stat_sync(p("/d")).unwrap().permissions.mode(), 0o700);
        assert_eq!(local.readlink_sync(p("/ln")).unwrap(), PathBuf::from("/d/f"));
    }

    #[tokio::test]
    async fn handle_writes_replay_on_close() {
        let remote = Arc::new(MemoryFs::new());
        let mirror = AsyncMirror::synced(Arc::new(MemoryFs::new()), remote.clone())
            .await
            .unwrap();

        let h = mirror.open_sync(p("/f"), OpenFlags::WRITE, 0o640).unwrap();
        mirror.write_sync(h, b"abc", None).unwrap();
        mirror.flush_sync(h).unwrap();
        mirror.write_sync(h, b"def", None).unwrap();
        mirror.close_sync(h).unwrap();
        mirror.drain().await.unwrap();

        assert_eq!(remote.read_file(p("/f")).await.unwrap(), b"abcdef");
        assert_eq!(remote.stat(p("/f")).await.unwrap().permissions.mode(), 0o640);
    }

    #[tokio::test]
    async fn clean_read_handles_queue_nothing() {
        let remote = Arc::new(MemoryFs::new());
        remote.write_file(p("/f"), b"same", 0o644).await.unwrap();
        let mirror = AsyncMirror::synced(Arc::new(MemoryFs::new()), remote.clone())
            .await
            .unwrap();
        let mut failures = mirror.subscribe_failures();

        let h = mirror.open_sync(p("/f"), OpenFlags::READ, 0).unwrap();
        assert_eq!(mirror.read_sync(h, 16, None).unwrap(), b"same");
        mirror.close_sync(h).unwrap();

        // Remove the remote copy behind the mirror's back: a replayed
        // write would recreate it.
        remote.unlink(p("/f")).await.unwrap();
        mirror.drain().await.unwrap();
        assert!(!remote.exists(p("/f")).await.unwrap());
        assert!(failures.try_recv().is_err());
    }

    #[tokio::test]
    async fn rename_keeps_open_handles_pointing_at_the_file() {
        let remote = Arc::new(MemoryFs::new());
        let mirror = AsyncMirror::synced(Arc::new(MemoryFs::new()), remote.clone())
            .await
            .unwrap();
        let h = mirror.open_sync(p("/old"), OpenFlags::WRITE, 0o644).unwrap();
        mirror.write_sync(h, b"moved", None).unwrap();
        mirror.rename_sync(p("/old"), p("/new")).unwrap();
        mirror.close_sync(h).unwrap();
        mirror.drain().await.unwrap();

        assert!(!remote.exists(p("/old")).await.unwrap());
        assert_eq!(remote.read_file(p("/new")).await.unwrap(), b"moved");
    }
}
