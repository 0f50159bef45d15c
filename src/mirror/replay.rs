//! The replay queue and its single worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{FileSystem, FsError, FsResult};

/// One mutation already applied to the local replica, waiting to be
/// applied to the remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOp {
    /// Replace a file's whole content.
    WriteFile {
        /// Target file.
        path: PathBuf,
        /// Content at flush time.
        data: Vec<u8>,
        /// Mode used if the file is created.
        mode: u32,
    },
    /// Remove a file.
    Unlink {
        /// Removed path.
        path: PathBuf,
    },
    /// Rename an entry.
    Rename {
        /// Source path.
        from: PathBuf,
        /// Destination path.
        to: PathBuf,
    },
    /// Create a directory.
    Mkdir {
        /// New directory.
        path: PathBuf,
        /// Directory mode.
        mode: u32,
    },
    /// Remove a directory.
    Rmdir {
        /// Removed directory.
        path: PathBuf,
    },
    /// Resize a file.
    Truncate {
        /// Target file.
        path: PathBuf,
        /// New length.
        len: u64,
    },
    /// Change permission bits.
    Chmod {
        /// Target path.
        path: PathBuf,
        /// New mode.
        mode: u32,
    },
    /// Change ownership.
    Chown {
        /// Target path.
        path: PathBuf,
        /// New owner.
        uid: u32,
        /// New group.
        gid: u32,
    },
    /// Change times.
    Utimes {
        /// Target path.
        path: PathBuf,
        /// Access time.
        atime: SystemTime,
        /// Modification time.
        mtime: SystemTime,
    },
    /// Create a hard link.
    Link {
        /// Existing file.
        existing: PathBuf,
        /// New name.
        new: PathBuf,
    },
    /// Create a symlink.
    Symlink {
        /// Link target.
        target: PathBuf,
        /// Link path.
        link: PathBuf,
    },
}

impl ReplayOp {
    /// Operation name, for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ReplayOp::WriteFile { .. } => "write_file",
            ReplayOp::Unlink { .. } => "unlink",
            ReplayOp::Rename { .. } => "rename",
            ReplayOp::Mkdir { .. } => "mkdir",
            ReplayOp::Rmdir { .. } => "rmdir",
            ReplayOp::Truncate { .. } => "truncate",
            ReplayOp::Chmod { .. } => "chmod",
            ReplayOp::Chown { .. } => "chown",
            ReplayOp::Utimes { .. } => "utimes",
            ReplayOp::Link { .. } => "link",
            ReplayOp::Symlink { .. } => "symlink",
        }
    }

    /// The primary path the operation touches.
    pub fn path(&self) -> &Path {
        match self {
            ReplayOp::WriteFile { path, .. }
            | ReplayOp::Unlink { path }
            | ReplayOp::Mkdir { path, .. }
            | ReplayOp::Rmdir { path }
            | ReplayOp::Truncate { path, .. }
            | ReplayOp::Chmod { path, .. }
            | ReplayOp::Chown { path, .. }
            | ReplayOp::Utimes { path, .. } => path,
            ReplayOp::Rename { from, .. } => from,
            ReplayOp::Link { new, .. } => new,
            ReplayOp::Symlink { link, .. } => link,
        }
    }

    async fn apply(&self, remote: &dyn FileSystem) -> FsResult<()> {
        match self {
            ReplayOp::WriteFile { path, data, mode } => remote.write_file(path, data, *mode).await,
            ReplayOp::Unlink { path } => remote.unlink(path).await,
            ReplayOp::Rename { from, to } => remote.rename(from, to).await,
            ReplayOp::Mkdir { path, mode } => remote.mkdir(path, *mode).await,
            ReplayOp::Rmdir { path } => remote.rmdir(path).await,
            ReplayOp::Truncate { path, len } => remote.truncate(path, *len).await,
            ReplayOp::Chmod { path, mode } => remote.chmod(path, *mode).await,
            ReplayOp::Chown { path, uid, gid } => remote.chown(path, *uid, *gid).await,
            ReplayOp::Utimes { path, atime, mtime } => remote.utimes(path, *atime, *mtime).await,
            ReplayOp::Link { existing, new } => remote.link(existing, new).await,
            ReplayOp::Symlink { target, link } => remote.symlink(target, link).await,
        }
    }
}

/// A queued mutation the remote rejected.
///
/// Published on the mirror's failure channel; the entry is not retried.
#[derive(Debug, Clone)]
pub struct ReplayFailure {
    /// The mutation that failed.
    pub op: ReplayOp,
    /// Why the remote rejected it.
    pub error: FsError,
}

pub(crate) enum QueueItem {
    Op(ReplayOp),
    /// Resolved once every item queued before it has been applied.
    Barrier(oneshot::Sender<()>),
}

/// Drain `queue` in order, one remote application at a time.
///
/// Runs until every sender is dropped.
pub(crate) async fn run_worker(
    remote: Arc<dyn FileSystem>,
    mut queue: mpsc::UnboundedReceiver<QueueItem>,
    failures: broadcast::Sender<ReplayFailure>,
) {
    while let Some(item) = queue.recv().await {
        match item {
            QueueItem::Op(op) => {
                debug!(op = op.name(), path = %op.path().display(), "replaying");
                if let Err(error) = op.apply(&*remote).await {
                    warn!(op = op.name(), path = %op.path().display(), %error, "replay failed");
                    let _ = failures.send(ReplayFailure { op, error });
                }
            }
            QueueItem::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    info!("replay worker stopped");
}
