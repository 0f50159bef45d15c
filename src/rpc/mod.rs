//! # RPC Bridge
//!
//! Exposes a backend across a message channel as an asynchronous-only
//! backend.
//!
//! ```text
//!   RpcClient (FileSystem)          Transport          RpcServer
//!   ┌──────────────────────┐   JSON request frames   ┌───────────────┐
//!   │ id counter           │ ──────────────────────▶ │ task per call │
//!   │ pending: id → slot   │                         │ handle table  │
//!   │ reader task          │ ◀────────────────────── │ Arc<dyn FS>   │
//!   └──────────────────────┘   JSON response frames  └───────────────┘
//! ```
//!
//! Responses are matched to calls by id only, so the server is free to
//! answer out of order.
//!
//! ```rust
//! use layerfs::rpc::{RpcClient, RpcServer, duplex};
//! use layerfs::{FsAsync, MemoryFs};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> layerfs::FsResult<()> {
//! let (client_end, server_end) = duplex();
//! tokio::spawn(RpcServer::new(Arc::new(MemoryFs::new())).serve(server_end));
//!
//! let remote = RpcClient::connect(client_end).await?;
//! remote.write_file(Path::new("/hello"), b"hi", 0o644).await?;
//! assert_eq!(remote.read_file(Path::new("/hello")).await?, b"hi");
//! # Ok(())
//! # }
//! ```

mod client;
mod protocol;
mod server;
mod transport;

pub use client::RpcClient;
pub use server::RpcServer;
pub use transport::{FrameReceiver, FrameSender, Transport, duplex};
