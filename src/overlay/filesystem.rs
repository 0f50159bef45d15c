use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::deletion_log::{DELETION_LOG, DELETION_LOG_NAME, DeletionLog};
use super::path_locks::PathLocks;
use crate::types::{ensure_absolute, parent_of};
use crate::{
    Capabilities, DirEntry, FileSystem, FileType, FsAsync, FsCapabilities, FsError, FsResult,
    FsSync, Handle, Metadata, OpenFlags, Permissions,
};

/// Which layer an entry (or a handle) lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Upper,
    Lower,
}

struct OpenEntry {
    side: Side,
    inner: Handle,
    path: PathBuf,
}

/// Union of a writable upper layer over a lower layer.
///
/// Reads consult the tombstone set, then upper, then lower. Mutations go to
/// upper only, copying lower entries up first. Deleting something that
/// exists in lower records a tombstone in `/.deletedFiles.log` inside upper;
/// that path is never visible through the overlay.
///
/// All logic is written against the layers' non-blocking forms. The
/// blocking forms drive the same logic to completion on the calling thread
/// and are available only when both layers are synchronous.
///
/// # Example
///
/// ```rust
/// use layerfs::{FileSystem, FsAsync, LayerExt, MemoryFs, OverlayFs, ReadOnlyLayer};
/// use std::path::Path;
/// use std::sync::Arc;
///
/// # futures::executor::block_on(async {
/// let base = Arc::new(MemoryFs::new());
/// base.write_file(Path::new("/greeting"), b"hello", 0o644).await?;
/// let lower: Arc<dyn FileSystem> = Arc::new(base.clone().layer(ReadOnlyLayer));
///
/// let overlay = OverlayFs::new(Arc::new(MemoryFs::new()), lower).await?;
/// overlay.write_file(Path::new("/greeting"), b"world", 0o644).await?;
///
/// assert_eq!(overlay.read_file(Path::new("/greeting")).await?, b"world");
/// assert_eq!(base.read_file(Path::new("/greeting")).await?, b"hello");
/// # Ok::<(), layerfs::FsError>(())
/// # }).unwrap();
/// ```
pub struct OverlayFs {
    upper: Arc<dyn FileSystem>,
    lower: Arc<dyn FileSystem>,
    log: tokio::sync::Mutex<DeletionLog>,
    locks: PathLocks,
    handles: Mutex<HashMap<u64, OpenEntry>>,
    next_handle: AtomicU64,
}

fn is_reserved(path: &Path) -> bool {
    path == Path::new(DELETION_LOG)
}

fn reserved_denied(path: &Path) -> FsError {
    FsError::PermissionDenied {
        path: path.to_path_buf(),
    }
}

impl OverlayFs {
    /// Compose `upper` over `lower`, loading the tombstone set from upper.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] if `upper` is read-only
    /// - any error other than not-found while reading the deletion log
    pub async fn new(upper: Arc<dyn FileSystem>, lower: Arc<dyn FileSystem>) -> FsResult<Self> {
        if upper.is_read_only() {
            return Err(FsError::invalid("overlay upper layer must be writable"));
        }
        let log = match upper.read_file(Path::new(DELETION_LOG)).await {
            Ok(data) => DeletionLog::parse(&data),
            Err(FsError::NotFound { .. }) => DeletionLog::default(),
            Err(e) => return Err(e),
        };

        let overlay = Self {
            upper,
            lower,
            log: tokio::sync::Mutex::new(DeletionLog::default()),
            locks: PathLocks::new(),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        };

        // A crash between recreating content and clearing its tombstone
        // leaves a hidden upper copy behind; drop those now.
        for path in log.iter() {
            if let Err(e) = overlay.remove_upper(path).await {
                warn!(path = %path.display(), error = %e, "failed to purge stale upper entry");
            }
        }
        info!(tombstones = log.len(), "overlay ready");
        *overlay.log.lock().await = log;
        Ok(overlay)
    }

    /// Blocking constructor for synchronous layers.
    ///
    /// # Errors
    ///
    /// - [`FsError::NotSupported`] unless both layers are synchronous
    pub fn new_sync(upper: Arc<dyn FileSystem>, lower: Arc<dyn FileSystem>) -> FsResult<Self> {
        if !(upper.supports_synchronous_ops() && lower.supports_synchronous_ops()) {
            return Err(FsError::not_supported("OverlayFs::new_sync"));
        }
        futures::executor::block_on(Self::new(upper, lower))
    }

    /// The writable layer.
    pub fn upper(&self) -> &Arc<dyn FileSystem> {
        &self.upper
    }

    /// The layer beneath.
    pub fn lower(&self) -> &Arc<dyn FileSystem> {
        &self.lower
    }

    /// Snapshot of the tombstoned paths, sorted.
    pub async fn deleted_paths(&self) -> Vec<PathBuf> {
        self.log.lock().await.iter().map(Path::to_path_buf).collect()
    }

    fn run_blocking<T>(&self, op: &str, fut: impl Future<Output = FsResult<T>>) -> FsResult<T> {
        if !self.supports_synchronous_ops() {
            return Err(FsError::not_supported(format!("{op}_sync")));
        }
        futures::executor::block_on(fut)
    }

    // ------------------------------------------------------------------
    // Tombstones
    // ------------------------------------------------------------------

    async fn is_deleted(&self, path: &Path) -> bool {
        self.log.lock().await.contains(path)
    }

    /// Apply `change` to the tombstone set and persist it if it changed.
    /// On a failed write the in-memory set is restored.
    async fn update_log(&self, change: impl FnOnce(&mut DeletionLog) -> bool) -> FsResult<()> {
        let mut log = self.log.lock().await;
        let before = log.clone();
        if !change(&mut *log) {
            return Ok(());
        }
        let data = log.to_bytes();
        match self
            .upper
            .write_file(Path::new(DELETION_LOG), &data, Permissions::default_file().mode())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                *log = before;
                Err(e)
            }
        }
    }

    async fn tombstone(&self, path: &Path) -> FsResult<()> {
        debug!(path = %path.display(), "tombstone");
        self.update_log(|log| log.insert(path)).await
    }

    async fn untombstone(&self, path: &Path) -> FsResult<()> {
        self.update_log(|log| log.remove(path)).await
    }

    // ------------------------------------------------------------------
    // Merged view (callers hold the path lock)
    // ------------------------------------------------------------------

    /// Where `path` is visible from, with its metadata.
    async fn locate(&self, path: &Path) -> FsResult<Option<(Side, Metadata)>> {
        ensure_absolute(path)?;
        if is_reserved(path) || self.is_deleted(path).await {
            return Ok(None);
        }
        match self.upper.lstat(path).await {
            Ok(meta) => return Ok(Some((Side::Upper, meta))),
            Err(FsError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        match self.lower.lstat(path).await {
            Ok(meta) => Ok(Some((Side::Lower, meta))),
            Err(FsError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn lstat_merged(&self, path: &Path) -> FsResult<Metadata> {
        self.locate(path)
            .await?
            .map(|(_, meta)| meta)
            .ok_or_else(|| FsError::not_found(path))
    }

    async fn in_lower(&self, path: &Path) -> FsResult<bool> {
        match self.lower.lstat(path).await {
            Ok(_) => Ok(true),
            Err(FsError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn readdir_merged(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let (side, meta) = self
            .locate(path)
            .await?
            .ok_or_else(|| FsError::not_found(path))?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory {
                path: path.to_path_buf(),
            });
        }

        let mut merged = BTreeMap::new();
        let lower_is_dir = match side {
            Side::Lower => true,
            Side::Upper => match self.lower.lstat(path).await {
                Ok(m) => m.is_dir(),
                Err(FsError::NotFound { .. }) => false,
                Err(e) => return Err(e),
            },
        };
        if lower_is_dir {
            for entry in self.lower.readdir(path).await? {
                merged.insert(entry.name.clone(), entry);
            }
        }
        if side == Side::Upper {
            for entry in self.upper.readdir(path).await? {
                merged.insert(entry.name.clone(), entry);
            }
        }

        let at_root = path == Path::new("/");
        let log = self.log.lock().await;
        Ok(merged
            .into_values()
            .filter(|entry| !(at_root && entry.name == DELETION_LOG_NAME))
            .filter(|entry| !log.contains(&path.join(&entry.name)))
            .collect())
    }

    // ------------------------------------------------------------------
    // Upper-layer preparation
    // ------------------------------------------------------------------

    /// Create any ancestors of `path` that exist in the merged view but not
    /// yet in upper. Returns the directories created, outermost first.
    async fn ensure_upper_parents(&self, path: &Path) -> FsResult<Vec<PathBuf>> {
        let mut missing = Vec::new();
        let mut dir = parent_of(path);
        while dir != Path::new("/") {
            match self.upper.lstat(&dir).await {
                Ok(m) if m.is_dir() => break,
                Ok(_) => return Err(FsError::NotADirectory { path: dir }),
                Err(FsError::NotFound { .. }) => {
                    let next = parent_of(&dir);
                    missing.push(dir);
                    dir = next;
                }
                Err(e) => return Err(e),
            }
        }

        let mut created = Vec::new();
        for dir in missing.into_iter().rev() {
            let result = match self.lstat_merged(&dir).await {
                Ok(meta) if meta.is_dir() => self.upper.mkdir(&dir, meta.permissions.mode()).await,
                Ok(_) => Err(FsError::NotADirectory { path: dir.clone() }),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => created.push(dir),
                Err(FsError::AlreadyExists { .. }) => {}
                Err(e) => {
                    self.remove_created(&created).await;
                    return Err(e);
                }
            }
        }
        Ok(created)
    }

    async fn remove_created(&self, created: &[PathBuf]) {
        for dir in created.iter().rev() {
            if let Err(e) = self.upper.rmdir(dir).await {
                debug!(path = %dir.display(), error = %e, "could not roll back upper directory");
            }
        }
    }

    /// Remove whatever upper holds at `path`. Missing is fine.
    async fn remove_upper(&self, path: &Path) -> FsResult<()> {
        match self.upper.lstat(path).await {
            Ok(meta) if meta.is_dir() => self.upper.rmdir(path).await,
            Ok(_) => self.upper.unlink(path).await,
            Err(FsError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Purge a stale upper copy of a tombstoned path before recreating it.
    async fn clear_stale(&self, path: &Path) -> FsResult<()> {
        if self.is_deleted(path).await {
            self.remove_upper(path).await?;
        }
        Ok(())
    }

    /// Make `path` present in upper, copying it from lower if needed.
    ///
    /// On failure upper is left as it was: any partial copy and any
    /// ancestors created for it are removed, and the original error is
    /// returned.
    async fn copy_up(&self, path: &Path, meta: &Metadata) -> FsResult<()> {
        debug!(path = %path.display(), "copy-up");
        let created = self.ensure_upper_parents(path).await?;
        if let Err(e) = self.copy_entry(path, meta).await {
            if let Err(cleanup) = self.remove_upper(path).await {
                warn!(path = %path.display(), error = %cleanup, "partial copy-up left behind");
            }
            self.remove_created(&created).await;
            return Err(e);
        }
        Ok(())
    }

    async fn copy_entry(&self, path: &Path, meta: &Metadata) -> FsResult<()> {
        let mode = meta.permissions.mode();
        match meta.file_type {
            FileType::Directory => self.upper.mkdir(path, mode).await?,
            FileType::Symlink => {
                let target = self.lower.readlink(path).await?;
                self.upper.symlink(&target, path).await?;
                return Ok(());
            }
            FileType::File => {
                let data = self.lower.read_file(path).await?;
                self.upper.write_file(path, &data, mode).await?;
            }
        }
        if let Err(e) = self.upper.utimes(path, meta.accessed, meta.modified).await {
            debug!(path = %path.display(), error = %e, "copy-up could not preserve times");
        }
        Ok(())
    }

    /// Ensure `path` is visible and in upper, for metadata/content mutation.
    async fn prepare_mutation(&self, path: &Path) -> FsResult<()> {
        match self.locate(path).await? {
            Some((Side::Upper, _)) => Ok(()),
            Some((Side::Lower, meta)) => self.copy_up(path, &meta).await,
            None => Err(FsError::not_found(path)),
        }
    }

    // ------------------------------------------------------------------
    // Operations (callers hold the path lock)
    // ------------------------------------------------------------------

    async fn open_locked(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<OpenEntry> {
        let (side, inner) = match self.locate(path).await? {
            Some(_) if flags.create && flags.exclusive => {
                return Err(FsError::already_exists(path));
            }
            Some((_, meta)) if meta.is_dir() && flags.is_mutating() => {
                return Err(FsError::IsADirectory {
                    path: path.to_path_buf(),
                });
            }
            Some((Side::Upper, _)) => (Side::Upper, self.upper.open(path, flags, mode).await?),
            Some((Side::Lower, _)) if !flags.is_mutating() => {
                (Side::Lower, self.lower.open(path, flags, mode).await?)
            }
            Some((Side::Lower, meta)) => {
                self.copy_up(path, &meta).await?;
                (Side::Upper, self.upper.open(path, flags, mode).await?)
            }
            None if flags.create => {
                self.ensure_upper_parents(path).await?;
                self.clear_stale(path).await?;
                let handle = self.upper.open(path, flags, mode).await?;
                if let Err(e) = self.untombstone(path).await {
                    let _ = self.upper.close(handle).await;
                    return Err(e);
                }
                (Side::Upper, handle)
            }
            None => return Err(FsError::not_found(path)),
        };
        Ok(OpenEntry {
            side,
            inner,
            path: path.to_path_buf(),
        })
    }

    /// Delete a visible non-reserved entry (file or empty directory).
    async fn remove_locked(&self, path: &Path, meta: &Metadata) -> FsResult<()> {
        let in_upper = match self.upper.lstat(path).await {
            Ok(_) => true,
            Err(FsError::NotFound { .. }) => false,
            Err(e) => return Err(e),
        };
        if !self.in_lower(path).await? {
            return if meta.is_dir() {
                self.upper.rmdir(path).await
            } else {
                self.upper.unlink(path).await
            };
        }

        // Tombstone first: once it is written the path is gone from the
        // merged view, and a leftover upper copy is purged on next load.
        self.tombstone(path).await?;
        if in_upper {
            if let Err(e) = self.remove_upper(path).await {
                warn!(path = %path.display(), error = %e, "tombstoned path kept its upper copy");
            }
        }
        Ok(())
    }

    async fn mkdir_locked(&self, path: &Path, mode: u32) -> FsResult<()> {
        if self.locate(path).await?.is_some() {
            return Err(FsError::already_exists(path));
        }
        let created = self.ensure_upper_parents(path).await?;
        self.clear_stale(path).await?;
        if let Err(e) = self.upper.mkdir(path, mode).await {
            self.remove_created(&created).await;
            return Err(e);
        }
        self.untombstone(path).await
    }

    async fn symlink_locked(&self, target: &Path, link: &Path) -> FsResult<()> {
        if self.locate(link).await?.is_some() {
            return Err(FsError::already_exists(link));
        }
        self.ensure_upper_parents(link).await?;
        self.clear_stale(link).await?;
        self.upper.symlink(target, link).await?;
        self.untombstone(link).await
    }

    async fn link_locked(&self, existing: &Path, new: &Path) -> FsResult<()> {
        let meta = self.lstat_merged(existing).await?;
        if meta.is_dir() {
            return Err(FsError::PermissionDenied {
                path: existing.to_path_buf(),
            });
        }
        if self.locate(new).await?.is_some() {
            return Err(FsError::already_exists(new));
        }
        self.prepare_mutation(existing).await?;
        self.ensure_upper_parents(new).await?;
        self.clear_stale(new).await?;
        self.upper.link(existing, new).await?;
        self.untombstone(new).await
    }

    async fn rename_entry_locked(&self, from: &Path, to: &Path) -> FsResult<()> {
        if let Some((_, target)) = self.locate(to).await? {
            if target.is_dir() {
                return Err(FsError::IsADirectory {
                    path: to.to_path_buf(),
                });
            }
        }
        let from_in_lower = self.in_lower(from).await?;
        self.prepare_mutation(from).await?;
        self.ensure_upper_parents(to).await?;
        self.clear_stale(to).await?;
        self.upper.rename(from, to).await?;
        self.update_log(|log| {
            let hidden = from_in_lower && log.insert(from);
            let revealed = log.remove(to);
            hidden || revealed
        })
        .await
    }

    /// Directory rename: create the target, move every child through the
    /// overlay, then remove the source. Each step is atomic; the whole is
    /// not.
    async fn rename_dir(&self, from: &Path, to: &Path, meta: &Metadata) -> FsResult<()> {
        if to.starts_with(from) {
            return Err(FsError::invalid(format!(
                "cannot move {} into itself",
                from.display()
            )));
        }
        match self.stat(to).await {
            Ok(target) if !target.is_dir() => {
                return Err(FsError::NotADirectory {
                    path: to.to_path_buf(),
                });
            }
            Ok(_) => {
                if !self.readdir(to).await?.is_empty() {
                    return Err(FsError::DirectoryNotEmpty {
                        path: to.to_path_buf(),
                    });
                }
            }
            Err(FsError::NotFound { .. }) => self.mkdir(to, meta.permissions.mode()).await?,
            Err(e) => return Err(e),
        }
        for entry in self.readdir(from).await? {
            self.rename(&from.join(&entry.name), &to.join(&entry.name))
                .await?;
        }
        self.rmdir(from).await
    }

    fn handle_entry(&self, handle: Handle) -> FsResult<(Side, Handle, PathBuf)> {
        self.handles
            .lock()
            .get(&handle.0)
            .map(|e| (e.side, e.inner, e.path.clone()))
            .ok_or_else(|| FsError::bad_handle(handle))
    }

    fn layer(&self, side: Side) -> &Arc<dyn FileSystem> {
        match side {
            Side::Upper => &self.upper,
            Side::Lower => &self.lower,
        }
    }
}

impl FsCapabilities for OverlayFs {
    fn capabilities(&self) -> Capabilities {
        let upper = self.upper.capabilities();
        Capabilities {
            synchronous: upper.synchronous && self.lower.supports_synchronous_ops(),
            permissions: upper.permissions,
            links: upper.links,
            read_only: false,
        }
    }
}

impl FsSync for OverlayFs {
    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.run_blocking("stat", self.stat(path))
    }

    fn lstat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.run_blocking("lstat", self.lstat(path))
    }

    fn exists_sync(&self, path: &Path) -> FsResult<bool> {
        self.run_blocking("exists", self.exists(path))
    }

    fn open_sync(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        self.run_blocking("open", self.open(path, flags, mode))
    }

    fn read_sync(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        self.run_blocking("read", self.read(handle, len, position))
    }

    fn write_sync(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        self.run_blocking("write", self.write(handle, data, position))
    }

    fn flush_sync(&self, handle: Handle) -> FsResult<()> {
        self.run_blocking("flush", self.flush(handle))
    }

    fn close_sync(&self, handle: Handle) -> FsResult<()> {
        self.run_blocking("close", self.close(handle))
    }

    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        self.run_blocking("unlink", self.unlink(path))
    }

    fn rename_sync(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.run_blocking("rename", self.rename(from, to))
    }

    fn mkdir_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.run_blocking("mkdir", self.mkdir(path, mode))
    }

    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        self.run_blocking("rmdir", self.rmdir(path))
    }

    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        self.run_blocking("readdir", self.readdir(path))
    }

    fn truncate_sync(&self, path: &Path, len: u64) -> FsResult<()> {
        self.run_blocking("truncate", self.truncate(path, len))
    }

    fn chmod_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.run_blocking("chmod", self.chmod(path, mode))
    }

    fn chown_sync(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        self.run_blocking("chown", self.chown(path, uid, gid))
    }

    fn utimes_sync(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.run_blocking("utimes", self.utimes(path, atime, mtime))
    }

    fn link_sync(&self, existing: &Path, new: &Path) -> FsResult<()> {
        self.run_blocking("link", self.link(existing, new))
    }

    fn symlink_sync(&self, target: &Path, link: &Path) -> FsResult<()> {
        self.run_blocking("symlink", self.symlink(target, link))
    }

    fn readlink_sync(&self, path: &Path) -> FsResult<PathBuf> {
        self.run_blocking("readlink", self.readlink(path))
    }
}

#[async_trait]
impl FsAsync for OverlayFs {
    async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        let _guard = self.locks.read(path).await;
        self.lstat_merged(path).await
    }

    async fn lstat(&self, path: &Path) -> FsResult<Metadata> {
        self.stat(path).await
    }

    async fn exists(&self, path: &Path) -> FsResult<bool> {
        let _guard = self.locks.read(path).await;
        Ok(self.locate(path).await?.is_some())
    }

    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        if is_reserved(path) {
            return Err(if flags.is_mutating() {
                reserved_denied(path)
            } else {
                FsError::not_found(path)
            });
        }
        let entry = if flags.is_mutating() {
            let _guard = self.locks.write(path).await;
            self.open_locked(path, flags, mode).await?
        } else {
            let _guard = self.locks.read(path).await;
            self.open_locked(path, flags, mode).await?
        };
        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.handles.lock().insert(id, entry);
        Ok(Handle(id))
    }

    async fn read(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        let (side, inner, _) = self.handle_entry(handle)?;
        self.layer(side).read(inner, len, position).await
    }

    async fn write(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        let (side, inner, path) = self.handle_entry(handle)?;
        match side {
            Side::Upper => self.upper.write(inner, data, position).await,
            Side::Lower if self.lower.is_read_only() => Err(FsError::read_only(path)),
            Side::Lower => Err(FsError::invalid(format!(
                "handle {} not open for writing",
                handle.0
            ))),
        }
    }

    async fn flush(&self, handle: Handle) -> FsResult<()> {
        let (side, inner, _) = self.handle_entry(handle)?;
        self.layer(side).flush(inner).await
    }

    async fn close(&self, handle: Handle) -> FsResult<()> {
        let entry = self
            .handles
            .lock()
            .remove(&handle.0)
            .ok_or_else(|| FsError::bad_handle(handle))?;
        self.layer(entry.side).close(entry.inner).await
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        if is_reserved(path) {
            return Err(reserved_denied(path));
        }
        let _guard = self.locks.write(path).await;
        let meta = self.lstat_merged(path).await?;
        if meta.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.to_path_buf(),
            });
        }
        self.remove_locked(path, &meta).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        if is_reserved(from) || is_reserved(to) {
            return Err(reserved_denied(if is_reserved(from) { from } else { to }));
        }
        ensure_absolute(to)?;
        debug!(from = %from.display(), to = %to.display(), "rename");
        let guards = self.locks.write_pair(from, to).await;
        let meta = self.lstat_merged(from).await?;
        if from == to {
            return Ok(());
        }
        if meta.is_dir() {
            drop(guards);
            return self.rename_dir(from, to, &meta).await;
        }
        self.rename_entry_locked(from, to).await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        if is_reserved(path) {
            return Err(reserved_denied(path));
        }
        let _guard = self.locks.write(path).await;
        self.mkdir_locked(path, mode).await
    }

    async fn rmdir(&self, path: &Path) -> FsResult<()> {
        if is_reserved(path) {
            return Err(reserved_denied(path));
        }
        let _guard = self.locks.write(path).await;
        let meta = self.lstat_merged(path).await?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        if path == Path::new("/") {
            return Err(reserved_denied(path));
        }
        if !self.readdir_merged(path).await?.is_empty() {
            return Err(FsError::DirectoryNotEmpty {
                path: path.to_path_buf(),
            });
        }
        self.remove_locked(path, &meta).await
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let _guard = self.locks.read(path).await;
        self.readdir_merged(path).await
    }

    async fn truncate(&self, path: &Path, len: u64) -> FsResult<()> {
        if is_reserved(path) {
            return Err(reserved_denied(path));
        }
        let _guard = self.locks.write(path).await;
        self.prepare_mutation(path).await?;
        self.upper.truncate(path, len).await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        if is_reserved(path) {
            return Err(reserved_denied(path));
        }
        let _guard = self.locks.write(path).await;
        self.prepare_mutation(path).await?;
        self.upper.chmod(path, mode).await
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        if is_reserved(path) {
            return Err(reserved_denied(path));
        }
        let _guard = self.locks.write(path).await;
        self.prepare_mutation(path).await?;
        self.upper.chown(path, uid, gid).await
    }

    async fn utimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        if is_reserved(path) {
            return Err(reserved_denied(path));
        }
        let _guard = self.locks.write(path).await;
        self.prepare_mutation(path).await?;
        self.upper.utimes(path, atime, mtime).await
    }

    async fn link(&self, existing: &Path, new: &Path) -> FsResult<()> {
        if is_reserved(existing) || is_reserved(new) {
            return Err(reserved_denied(new));
        }
        ensure_absolute(new)?;
        let _guards = self.locks.write_pair(existing, new).await;
        self.link_locked(existing, new).await
    }

    async fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        if is_reserved(link) {
            return Err(reserved_denied(link));
        }
        let _guard = self.locks.write(link).await;
        self.symlink_locked(target, link).await
    }

    async fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        let _guard = self.locks.read(path).await;
        match self.locate(path).await? {
            Some((side, _)) => self.layer(side).readlink(path).await,
            None => Err(FsError::not_found(path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LayerExt, MemoryFs, ReadOnlyLayer};

    fn p(s: &str) -> &Path {
        Path::new(s)
    }

    async fn fixture() -> (OverlayFs, Arc<MemoryFs>, Arc<MemoryFs>) {
        let base = Arc::new(MemoryFs::new());
        base.mkdir(p("/dir"), 0o750).await.unwrap();
        base.write_file(p("/dir/a"), b"lower-a", 0o640).await.unwrap();
        base.write_file(p("/top"), b"hello", 0o644).await.unwrap();
        let upper = Arc::new(MemoryFs::new());
        let lower: Arc<dyn FileSystem> = Arc::new(base.clone().layer(ReadOnlyLayer));
        let overlay = OverlayFs::new(upper.clone(), lower).await.unwrap();
        (overlay, upper, base)
    }

    #[tokio::test]
    async fn read_only_upper_is_rejected() {
        let ro: Arc<dyn FileSystem> = Arc::new(Arc::new(MemoryFs::new()).layer(ReadOnlyLayer));
        let err = OverlayFs::new(ro, Arc::new(MemoryFs::new()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FsError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn copy_up_preserves_mode_and_parents() {
        let (overlay, upper, base) = fixture().await;
        overlay.append_file(p("/dir/a"), b"+", 0o600).await.unwrap();

        assert_eq!(overlay.read_file(p("/dir/a")).await.unwrap(), b"lower-a+");
        assert_eq!(base.read_file(p("/dir/a")).await.unwrap(), b"lower-a");
        assert_eq!(upper.stat(p("/dir")).await.unwrap().permissions.mode(), 0o750);
        assert_eq!(upper.stat(p("/dir/a")).await.unwrap().permissions.mode(), 0o640);
    }

    #[tokio::test]
    async fn reserved_log_is_invisible_and_protected() {
        let (overlay, upper, _) = fixture().await;
        overlay.unlink(p("/top")).await.unwrap();
        assert!(upper.exists(p(DELETION_LOG)).await.unwrap());

        assert!(!overlay.exists(p(DELETION_LOG)).await.unwrap());
        assert!(overlay.stat(p(DELETION_LOG)).await.unwrap_err().is_not_found());
        assert!(overlay.read_file(p(DELETION_LOG)).await.unwrap_err().is_not_found());
        let names: Vec<_> = overlay
            .readdir(p("/"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert!(!names.iter().any(|n| n == DELETION_LOG_NAME));

        for err in [
            overlay.write_file(p(DELETION_LOG), b"", 0o644).await.unwrap_err(),
            overlay.unlink(p(DELETION_LOG)).await.unwrap_err(),
            overlay.rename(p("/dir/a"), p(DELETION_LOG)).await.unwrap_err(),
        ] {
            assert!(matches!(err, FsError::PermissionDenied { .. }), "{err}");
        }
    }

    #[tokio::test]
    async fn write_through_lower_handle_is_read_only() {
        let (overlay, _, _) = fixture().await;
        let h = overlay.open(p("/top"), OpenFlags::READ, 0).await.unwrap();
        let err = overlay.write(h, b"x", None).await.unwrap_err();
        assert!(matches!(err, FsError::ReadOnly { .. }));
        overlay.close(h).await.unwrap();
    }

    #[tokio::test]
    async fn rmdir_needs_merged_emptiness() {
        let (overlay, _, base) = fixture().await;
        let err = overlay.rmdir(p("/dir")).await.unwrap_err();
        assert!(matches!(err, FsError::DirectoryNotEmpty { .. }));

        overlay.unlink(p("/dir/a")).await.unwrap();
        overlay.rmdir(p("/dir")).await.unwrap();
        assert!(!overlay.exists(p("/dir")).await.unwrap());
        assert!(base.exists(p("/dir/a")).await.unwrap());
        assert_eq!(
            overlay.deleted_paths().await,
            vec![PathBuf::from("/dir"), PathBuf::from("/dir/a")]
        );
    }

    #[tokio::test]
    async fn rename_file_tombstones_lower_source() {
        let (overlay, _, _) = fixture().await;
        overlay.rename(p("/top"), p("/moved")).await.unwrap();
        assert!(!overlay.exists(p("/top")).await.unwrap());
        assert_eq!(overlay.read_file(p("/moved")).await.unwrap(), b"hello");
        assert_eq!(overlay.deleted_paths().await, vec![PathBuf::from("/top")]);

        overlay.rename(p("/moved"), p("/top")).await.unwrap();
        assert_eq!(overlay.read_file(p("/top")).await.unwrap(), b"hello");
        assert!(overlay.deleted_paths().await.is_empty());
    }

    #[tokio::test]
    async fn rename_directory_moves_merged_children() {
        let (overlay, _, _) = fixture().await;
        overlay.write_file(p("/dir/b"), b"upper-b", 0o644).await.unwrap();
        overlay.rename(p("/dir"), p("/renamed")).await.unwrap();

        assert!(!overlay.exists(p("/dir")).await.unwrap());
        assert_eq!(overlay.read_file(p("/renamed/a")).await.unwrap(), b"lower-a");
        assert_eq!(overlay.read_file(p("/renamed/b")).await.unwrap(), b"upper-b");
        assert_eq!(overlay.stat(p("/renamed")).await.unwrap().permissions.mode(), 0o750);
    }

    #[tokio::test]
    async fn symlinks_copy_up_as_symlinks() {
        let base = Arc::new(MemoryFs::new());
        base.symlink(p("/target"), p("/ln")).await.unwrap();
        let overlay = OverlayFs::new(Arc::new(MemoryFs::new()), base)
            .await
            .unwrap();
        overlay.chown(p("/ln"), 7, 7).await.unwrap();
        assert!(overlay.upper().lstat(p("/ln")).await.unwrap().is_symlink());
        assert_eq!(overlay.readlink(p("/ln")).await.unwrap(), PathBuf::from("/target"));
    }

    #[tokio::test]
    async fn hard_link_copies_up_source() {
        let (overlay, upper, _) = fixture().await;
        overlay.link(p("/top"), p("/alias")).await.unwrap();
        assert_eq!(upper.stat(p("/top")).await.unwrap().nlink, 2);
        assert_eq!(overlay.read_file(p("/alias")).await.unwrap(), b"hello");
    }

    #[test]
    fn blocking_forms_work_over_synchronous_layers() {
        let lower = Arc::new(MemoryFs::new());
        lower.write_file_sync(p("/f"), b"lower", 0o644).unwrap();
        let overlay = OverlayFs::new_sync(Arc::new(MemoryFs::new()), lower.clone()).unwrap();
        assert!(overlay.supports_synchronous_ops());

        overlay.write_file_sync(p("/f"), b"upper", 0o644).unwrap();
        assert_eq!(overlay.read_file_sync(p("/f")).unwrap(), b"upper");
        overlay.unlink_sync(p("/f")).unwrap();
        assert!(!overlay.exists_sync(p("/f")).unwrap());
        assert_eq!(lower.read_file_sync(p("/f")).unwrap(), b"lower");
    }
}
