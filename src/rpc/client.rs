use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{Call, Reply, Request, Response, salvage_id};
use super::transport::{FrameReceiver, FrameSender, Transport};
use crate::{
    Capabilities, DirEntry, FsAsync, FsCapabilities, FsError, FsResult, FsSync, Handle, Metadata,
    OpenFlags,
};

type Slot = oneshot::Sender<FsResult<Reply>>;

struct Pending {
    slots: HashMap<u64, Slot>,
    closed: bool,
}

struct Shared {
    tx: FrameSender,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
}

/// Removes a call's pending slot when the call's future goes away, however
/// it goes away.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.lock().slots.remove(&self.id);
    }
}

fn connection_closed() -> FsError {
    FsError::io("rpc connection closed")
}

/// The contract, forwarded over a [`Transport`] to an
/// [`RpcServer`](super::RpcServer).
///
/// Only the non-blocking forms are available; every `*_sync` call fails
/// with [`FsError::NotSupported`]. Calls may be issued concurrently and
/// complete in whatever order the server answers them. Errors arrive with
/// their original kind.
///
/// Dropping a call's future forgets the call locally; the server still
/// performs it.
pub struct RpcClient {
    shared: Arc<Shared>,
    capabilities: Capabilities,
    reader: JoinHandle<()>,
}

impl RpcClient {
    /// Connect over `transport` and fetch the server's capabilities.
    ///
    /// Must be called within a tokio runtime.
    pub async fn connect(transport: Transport) -> FsResult<Self> {
        let mut client = Self::with_capabilities(transport, Capabilities::default());
        let remote = match client.call(Call::Capabilities).await? {
            Reply::Capabilities(caps) => caps,
            other => return Err(other.mismatch("capabilities")),
        };
        client.capabilities = Capabilities {
            synchronous: false,
            ..remote
        };
        debug!(capabilities = ?client.capabilities, "rpc client connected");
        Ok(client)
    }

    /// Connect without a handshake, advertising `capabilities`
    /// (with `synchronous` forced off).
    ///
    /// Must be called within a tokio runtime.
    pub fn with_capabilities(transport: Transport, capabilities: Capabilities) -> Self {
        let (tx, rx) = transport.split();
        let shared = Arc::new(Shared {
            tx,
            pending: Mutex::new(Pending {
                slots: HashMap::new(),
                closed: false,
            }),
            next_id: AtomicU64::new(1),
        });
        let reader = tokio::spawn(route_responses(Arc::clone(&shared), rx));
        Self {
            shared,
            capabilities: Capabilities {
                synchronous: false,
                ..capabilities
            },
            reader,
        }
    }

    /// Number of calls still waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.shared.pending.lock().slots.len()
    }

    async fn call(&self, call: Call) -> FsResult<Reply> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let method = call.name();
        let frame = serde_json::to_string(&Request { id, call })
            .map_err(|e| FsError::io(format!("encode {method} request: {e}")))?;

        let (slot, response) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock();
            if pending.closed {
                return Err(connection_closed());
            }
            pending.slots.insert(id, slot);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        debug!(id, method, "rpc call");
        if !self.shared.tx.send(frame) {
            return Err(connection_closed());
        }
        response.await.map_err(|_| connection_closed())?
    }

    async fn unit(&self, call: Call) -> FsResult<()> {
        match self.call(call).await? {
            Reply::Unit => Ok(()),
            other => Err(other.mismatch("unit")),
        }
    }

    async fn metadata(&self, call: Call) -> FsResult<Metadata> {
        match self.call(call).await? {
            Reply::Metadata(meta) => Ok(meta),
            other => Err(other.mismatch("metadata")),
        }
    }

    async fn bytes(&self, call: Call) -> FsResult<Vec<u8>> {
        match self.call(call).await? {
            Reply::Bytes(data) => Ok(data),
            other => Err(other.mismatch("bytes")),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Deliver each response to the call with the same id.
async fn route_responses(shared: Arc<Shared>, mut rx: FrameReceiver) {
    while let Some(frame) = rx.recv().await {
        let (id, outcome) = match serde_json::from_str::<Response>(&frame) {
            Ok(response) => (response.id, response.into_result()),
            Err(e) => match salvage_id(&frame) {
                Some(id) => {
                    warn!(id, error = %e, "malformed rpc response");
                    let error = FsError::invalid(format!("malformed response: {e}"));
                    (id, Err(error))
                }
                None => {
                    warn!(error = %e, "dropping malformed rpc response without an id");
                    continue;
                }
            },
        };
        let slot = shared.pending.lock().slots.remove(&id);
        match slot {
            Some(slot) => {
                let _ = slot.send(outcome);
            }
            None => debug!(id, "discarding response for unknown call"),
        }
    }

    let orphaned: Vec<Slot> = {
        let mut pending = shared.pending.lock();
        pending.closed = true;
        pending.slots.drain().map(|(_, slot)| slot).collect()
    };
    debug!(failed = orphaned.len(), "rpc connection closed");
    for slot in orphaned {
        let _ = slot.send(Err(connection_closed()));
    }
}

impl FsCapabilities for RpcClient {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl FsSync for RpcClient {}

#[async_trait]
impl FsAsync for RpcClient {
    async fn stat(&self, path: &Path) -> FsResult<Metadata> {
        self.metadata(Call::Stat {
            path: path.to_path_buf(),
        })
        .await
    }

    async fn lstat(&self, path: &Path) -> FsResult<Metadata> {
        self.metadata(Call::Lstat {
            path: path.to_path_buf(),
        })
        .await
    }

    async fn exists(&self, path: &Path) -> FsResult<bool> {
        match self
            .call(Call::Exists {
                path: path.to_path_buf(),
            })
            .await?
        {
            Reply::Bool(exists) => Ok(exists),
            other => Err(other.mismatch("bool")),
        }
    }

    async fn open(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        match self
            .call(Call::Open {
                path: path.to_path_buf(),
                flags,
                mode,
            })
            .await?
        {
            Reply::Handle(id) => Ok(Handle(id)),
            other => Err(other.mismatch("handle")),
        }
    }

    async fn read(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        self.bytes(Call::Read {
            handle: handle.0,
            len,
            position,
        })
        .await
    }

    async fn write(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        match self
            .call(Call::Write {
                handle: handle.0,
                data: data.to_vec(),
                position,
            })
            .await?
        {
            Reply::Count(written) => Ok(written),
            other => Err(other.mismatch("count")),
        }
    }

    async fn flush(&self, handle: Handle) -> FsResult<()> {
        self.unit(Call::Flush { handle: handle.0 }).await
    }

    async fn close(&self, handle: Handle) -> FsResult<()> {
        self.unit(Call::Close { handle: handle.0 }).await
    }

    async fn unlink(&self, path: &Path) -> FsResult<()> {
        self.unit(Call::Unlink {
            path: path.to_path_buf(),
        })
        .await
    }

    async fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        self.unit(Call::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        })
        .await
    }

    async fn mkdir(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.unit(Call::Mkdir {
            path: path.to_path_buf(),
            mode,
        })
        .await
    }

    async fn rmdir(&self, path: &Path) -> FsResult<()> {
        self.unit(Call::Rmdir {
            path: path.to_path_buf(),
        })
        .await
    }

    async fn readdir(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        match self
            .call(Call::Readdir {
                path: path.to_path_buf(),
            })
            .await?
        {
            Reply::Entries(entries) => Ok(entries),
            other => Err(other.mismatch("entries")),
        }
    }

    async fn truncate(&self, path: &Path, len: u64) -> FsResult<()> {
        self.unit(Call::Truncate {
            path: path.to_path_buf(),
            len,
        })
        .await
    }

    async fn chmod(&self, path: &Path, mode: u32) -> FsResult<()> {
        self.unit(Call::Chmod {
            path: path.to_path_buf(),
            mode,
        })
        .await
    }

    async fn chown(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        self.unit(Call::Chown {
            path: path.to_path_buf(),
            uid,
            gid,
        })
        .await
    }

    async fn utimes(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        self.unit(Call::Utimes {
            path: path.to_path_buf(),
            atime,
            mtime,
        })
        .await
    }

    async fn link(&self, existing: &Path, new: &Path) -> FsResult<()> {
        self.unit(Call::Link {
            existing: existing.to_path_buf(),
            new: new.to_path_buf(),
        })
        .await
    }

    async fn symlink(&self, target: &Path, link: &Path) -> FsResult<()> {
        self.unit(Call::Symlink {
            target: target.to_path_buf(),
            link: link.to_path_buf(),
        })
        .await
    }

    async fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        match self
            .call(Call::Readlink {
                path: path.to_path_buf(),
            })
            .await?
        {
            Reply::Path(target) => Ok(target),
            other => Err(other.mismatch("path")),
        }
    }

    async fn read_file(&self, path: &Path) -> FsResult<Vec<u8>> {
        self.bytes(Call::ReadFile {
            path: path.to_path_buf(),
        })
        .await
    }

    async fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        self.unit(Call::WriteFile {
            path: path.to_path_buf(),
            data: data.to_vec(),
            mode,
        })
        .await
    }

    async fn append_file(&self, path: &Path, data: &[u8], mode: u32) -> FsResult<()> {
        self.unit(Call::AppendFile {
            path: path.to_path_buf(),
            data: data.to_vec(),
            mode,
        })
        .await
    }
}
