use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::protocol::{Call, Reply, Request, Response, salvage_id};
use super::transport::{FrameSender, Transport};
use crate::{FileSystem, FsError, FsResult, Handle};

/// Opaque handle ids handed to the client, mapped to the backend's handles.
#[derive(Default)]
struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, Handle>>,
}

impl HandleTable {
    fn insert(&self, handle: Handle) -> u64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.lock().insert(id, handle);
        id
    }

    fn get(&self, id: u64) -> FsResult<Handle> {
        self.open
            .lock()
            .get(&id)
            .copied()
            .ok_or_else(|| FsError::bad_handle(Handle(id)))
    }

    fn remove(&self, id: u64) -> FsResult<Handle> {
        self.open
            .lock()
            .remove(&id)
            .ok_or_else(|| FsError::bad_handle(Handle(id)))
    }

    fn drain(&self) -> Vec<Handle> {
        self.open.lock().drain().map(|(_, handle)| handle).collect()
    }
}

/// Serves a backend's contract to an [`RpcClient`](super::RpcClient).
///
/// Each request runs on its own task, so a slow call does not hold up the
/// ones behind it and responses may leave in a different order than the
/// requests arrived.
pub struct RpcServer {
    fs: Arc<dyn FileSystem>,
    handles: Arc<HandleTable>,
}

impl RpcServer {
    /// Serve `fs`.
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            handles: Arc::new(HandleTable::default()),
        }
    }

    /// Answer requests until the peer goes away, then close every handle
    /// the client left open.
    pub async fn serve(self, transport: Transport) {
        let (tx, mut rx) = transport.split();
        let mut tasks = JoinSet::new();
        info!("rpc server started");

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => self.accept(&frame, &tx, &mut tasks),
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "rpc task ended abnormally");
                    }
                }
            }
        }
        while tasks.join_next().await.is_some() {}

        let leftovers = self.handles.drain();
        let closed = leftovers.len();
        for handle in leftovers {
            if let Err(e) = self.fs.close(handle).await {
                debug!(handle = handle.0, error = %e, "closing abandoned handle failed");
            }
        }
        info!(closed, "rpc server stopped");
    }

    fn accept(&self, frame: &str, tx: &FrameSender, tasks: &mut JoinSet<()>) {
        let request: Request = match serde_json::from_str(frame) {
            Ok(request) => request,
            Err(e) => {
                match salvage_id(frame) {
                    Some(id) => {
                        debug!(id, error = %e, "rejecting malformed request");
                        let error = FsError::invalid(format!("malformed request: {e}"));
                        respond(tx, Response::new(id, Err(error)));
                    }
                    None => warn!(error = %e, "dropping malformed request without an id"),
                }
                return;
            }
        };

        let fs = Arc::clone(&self.fs);
        let handles = Arc::clone(&self.handles);
        let tx = tx.clone();
        tasks.spawn(async move {
            let method = request.call.name();
            let outcome = AssertUnwindSafe(dispatch(&*fs, &handles, request.call))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    warn!(id = request.id, method, "backend panicked while serving call");
                    Err(FsError::io(format!("backend panicked during {method}")))
                });
            if let Err(e) = &outcome {
                debug!(id = request.id, method, error = %e, "rpc call failed");
            }
            respond(&tx, Response::new(request.id, outcome));
        });
    }
}

fn respond(tx: &FrameSender, response: Response) {
    let id = response.id;
    match serde_json::to_string(&response) {
        Ok(frame) => {
            if !tx.send(frame) {
                debug!(id, "client gone; response dropped");
            }
        }
        Err(e) => warn!(id, error = %e, "could not encode rpc response"),
    }
}

async fn dispatch(fs: &dyn FileSystem, handles: &HandleTable, call: Call) -> FsResult<Reply> {
    Ok(match call {
        Call::Capabilities => Reply::Capabilities(fs.capabilities()),
        Call::Stat { path } => Reply::Metadata(fs.stat(&path).await?),
        Call::Lstat { path } => Reply::Metadata(fs.lstat(&path).await?),
        Call::Exists { path } => Reply::Bool(fs.exists(&path).await?),
        Call::Open { path, flags, mode } => {
            let handle = fs.open(&path, flags, mode).await?;
            Reply::Handle(handles.insert(handle))
        }
        Call::Read {
            handle,
            len,
            position,
        } => Reply::Bytes(fs.read(handles.get(handle)?, len, position).await?),
        Call::Write {
            handle,
            data,
            position,
        } => Reply::Count(fs.write(handles.get(handle)?, &data, position).await?),
        Call::Flush { handle } => {
            fs.flush(handles.get(handle)?).await?;
            Reply::Unit
        }
        Call::Close { handle } => {
            fs.close(handles.remove(handle)?).await?;
            Reply::Unit
        }
        Call::Unlink { path } => {
            fs.unlink(&path).await?;
            Reply::Unit
        }
        Call::Rename { from, to } => {
            fs.rename(&from, &to).await?;
            Reply::Unit
        }
        Call::Mkdir { path, mode } => {
            fs.mkdir(&path, mode).await?;
            Reply::Unit
        }
        Call::Rmdir { path } => {
            fs.rmdir(&path).await?;
            Reply::Unit
        }
        Call::Readdir { path } => Reply::Entries(fs.readdir(&path).await?),
        Call::Truncate { path, len } => {
            fs.truncate(&path, len).await?;
            Reply::Unit
        }
        Call::Chmod { path, mode } => {
            fs.chmod(&path, mode).await?;
            Reply::Unit
        }
        Call::Chown { path, uid, gid } => {
            fs.chown(&path, uid, gid).await?;
            Reply::Unit
        }
        Call::Utimes { path, atime, mtime } => {
            fs.utimes(&path, atime, mtime).await?;
            Reply::Unit
        }
        Call::Link { existing, new } => {
            fs.link(&existing, &new).await?;
            Reply::Unit
        }
        Call::Symlink { target, link } => {
            fs.symlink(&target, &link).await?;
            Reply::Unit
        }
        Call::Readlink { path } => Reply::Path(fs.readlink(&path).await?),
        Call::ReadFile { path } => Reply::Bytes(fs.read_file(&path).await?),
        Call::WriteFile { path, data, mode } => {
            fs.write_file(&path, &data, mode).await?;
            Reply::Unit
        }
        Call::AppendFile { path, data, mode } => {
            fs.append_file(&path, &data, mode).await?;
            Reply::Unit
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{FrameReceiver, duplex};
    use crate::{Capabilities, ErrorKind, FsAsync, FsCapabilities, FsSync, MemoryFs, Metadata};
    use std::path::Path;

    /// Panics on `stat`; everything else is the default contract.
    struct Explodes;

    impl FsCapabilities for Explodes {
        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }
    }

    impl FsSync for Explodes {}

    #[async_trait::async_trait]
    impl FsAsync for Explodes {
        async fn stat(&self, path: &Path) -> FsResult<Metadata> {
            panic!("stat blew up on {}", path.display());
        }
    }

    async fn exchange(tx: &FrameSender, rx: &mut FrameReceiver, frame: &str) -> Response {
        assert!(tx.send(frame.into()));
        serde_json::from_str(&rx.recv().await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn malformed_requests_with_an_id_get_an_error() {
        let (client_end, server_end) = duplex();
        let server = tokio::spawn(RpcServer::new(Arc::new(MemoryFs::new())).serve(server_end));
        let (tx, mut rx) = client_end.split();

        assert!(tx.send("garbage".into()));
        assert!(tx.send(r#"{"id": 4, "method": "teleport"}"#.into()));
        let response: Response = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(response.id, 4);
        assert_eq!(
            response.into_result().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        drop(tx);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_handles_are_rejected() {
        let (client_end, server_end) = duplex();
        let server = tokio::spawn(RpcServer::new(Arc::new(MemoryFs::new())).serve(server_end));
        let (tx, mut rx) = client_end.split();

        let request = Request {
            id: 1,
            call: Call::Close { handle: 42 },
        };
        assert!(tx.send(serde_json::to_string(&request).unwrap()));
        let response: Response = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(
            response.into_result().unwrap_err(),
            FsError::bad_handle(Handle(42))
        );

        drop(tx);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn leftover_handles_are_closed_on_disconnect() {
        let fs = Arc::new(MemoryFs::new());
        fs.write_file_sync(Path::new("/f"), b"x", 0o644).unwrap();
        let (client_end, server_end) = duplex();
        let server = tokio::spawn(RpcServer::new(fs.clone()).serve(server_end));
        let (tx, mut rx) = client_end.split();

        let request = Request {
            id: 1,
            call: Call::Open {
                path: "/f".into(),
                flags: crate::OpenFlags::READ,
                mode: 0,
            },
        };
        assert!(tx.send(serde_json::to_string(&request).unwrap()));
        let response: Response = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert!(matches!(response.into_result(), Ok(Reply::Handle(_))));
        assert_eq!(fs.open_handles(), 1);

        drop(tx);
        server.await.unwrap();
        assert_eq!(fs.open_handles(), 0);
    }

    #[tokio::test]
    async fn flat_request_frames_are_served() {
        let (client_end, server_end) = duplex();
        let server = tokio::spawn(RpcServer::new(Arc::new(MemoryFs::new())).serve(server_end));
        let (tx, mut rx) = client_end.split();

        let frame = r#"{"id": 1, "method": "exists", "args": {"path": "/"}}"#;
        let response = exchange(&tx, &mut rx, frame).await;
        assert_eq!(response.id, 1);
        assert_eq!(response.into_result(), Ok(Reply::Bool(true)));

        drop(tx);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn panicking_backend_still_answers() {
        let (client_end, server_end) = duplex();
        let server = tokio::spawn(RpcServer::new(Arc::new(Explodes)).serve(server_end));
        let (tx, mut rx) = client_end.split();

        let frame = r#"{"id": 9, "method": "stat", "args": {"path": "/a"}}"#;
        let response = exchange(&tx, &mut rx, frame).await;
        assert_eq!(response.id, 9);
        let err = response.into_result().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(err.to_string().contains("stat"));

        // The server keeps serving after the panic.
        let frame = r#"{"id": 10, "method": "capabilities"}"#;
        let response = exchange(&tx, &mut rx, frame).await;
        assert_eq!(
            response.into_result(),
            Ok(Reply::Capabilities(Capabilities::default()))
        );

        drop(tx);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn oversized_writes_answer_with_an_error() {
        let (client_end, server_end) = duplex();
        let server = tokio::spawn(RpcServer::new(Arc::new(MemoryFs::new())).serve(server_end));
        let (tx, mut rx) = client_end.split();

        let open = Request {
            id: 1,
            call: Call::Open {
                path: "/f".into(),
                flags: crate::OpenFlags::parse("w").unwrap(),
                mode: 0o644,
            },
        };
        let frame = serde_json::to_string(&open).unwrap();
        let Ok(Reply::Handle(handle)) = exchange(&tx, &mut rx, &frame).await.into_result() else {
            panic!("open failed");
        };
        let request = Request {
            id: 2,
            call: Call::Write {
                handle,
                data: b"x".to_vec(),
                position: Some(u64::MAX),
            },
        };
        let response = exchange(&tx, &mut rx, &serde_json::to_string(&request).unwrap()).await;
        assert_eq!(response.id, 2);
        assert_eq!(
            response.into_result().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        drop(tx);
        server.await.unwrap();
    }
}
