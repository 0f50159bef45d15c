//! # layerfs
//!
//! Composable virtual filesystems behind one contract.
//!
//! Every backend implements the same [`FileSystem`] contract, with blocking
//! (`*_sync`) and non-blocking forms of each operation. Composite backends
//! hold their children as `Arc<dyn FileSystem>` and are themselves
//! backends, so they stack freely.
//!
//! ---
//!
//! ## Quick Start
//!
//! ```rust
//! use layerfs::{FsAsync, MemoryFs, OverlayFs, ReadOnly};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> layerfs::FsResult<()> {
//! let base = Arc::new(MemoryFs::new());
//! base.write_file(Path::new("/config"), b"defaults", 0o644).await?;
//!
//! let overlay = OverlayFs::new(
//!     Arc::new(MemoryFs::new()),
//!     Arc::new(ReadOnly::new(base.clone())),
//! )
//! .await?;
//! overlay.write_file(Path::new("/config"), b"mine", 0o644).await?;
//!
//! assert_eq!(overlay.read_file(Path::new("/config")).await?, b"mine");
//! assert_eq!(base.read_file(Path::new("/config")).await?, b"defaults");
//! # Ok(())
//! # }
//! ```
//!
//! ---
//!
//! ## Backends
//!
//! | Backend | Sync | Purpose |
//! |---------|------|---------|
//! | [`MemoryFs`] | yes | in-process storage |
//! | [`ReadOnly`] | as inner | rejects mutation |
//! | [`OverlayFs`] | if both layers are | writable upper over a lower, copy-up and tombstones |
//! | [`AsyncMirror`] | yes | synchronous local replica replaying into an asynchronous remote |
//! | [`RpcClient`](rpc::RpcClient) | no | the contract over a message channel |
//!
//! [`registry::BackendRegistry`] builds any nesting of these from
//! JSON configuration.
//!
//! ---
//!
//! ## Trait Hierarchy
//!
//! ```text
//! FsCapabilities → FsSync → FsAsync → FileSystem (blanket)
//!                                         ↓
//!                                       FsExt (blanket helpers)
//! ```
//!
//! ---
//!
//! ## Error Handling
//!
//! All operations return [`FsResult<T>`]. Each [`FsError`] belongs to one
//! [`ErrorKind`]; composites and the RPC bridge pass kinds through unchanged.
//!
//! ```rust
//! use layerfs::{ErrorKind, FsError};
//!
//! let err = FsError::not_found("/missing.txt");
//! assert_eq!(err.to_string(), "not found: /missing.txt");
//! assert_eq!(err.kind().code(), "ENOENT");
//! ```
//!
//! ---
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`. Methods take `&self`; backends use
//! interior mutability. Share a backend across tasks with `Arc`.
//!
//! ---
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events (`debug` per composite operation,
//! `info` for lifecycle, `warn` for replay failures and malformed frames)
//! and installs no subscriber.

// Private modules
mod backends;
mod error;
mod ext;
mod layer;
mod mirror;
mod overlay;
mod traits;
mod types;

// Public modules
pub mod registry;
pub mod rpc;

// Public re-exports - error types
pub use error::{ErrorKind, FsError, FsResult};

// Public re-exports - core types
pub use types::{Capabilities, DirEntry, FileType, Handle, Metadata, OpenFlags, Permissions};

// Public re-exports - contract
pub use traits::{FileSystem, FsAsync, FsCapabilities, FsSync};

// Public re-exports - infrastructure
pub use ext::FsExt;
pub use layer::{Layer, LayerExt};

// Public re-exports - backends
pub use backends::{MemoryFs, ReadOnly, ReadOnlyLayer};
pub use mirror::{AsyncMirror, MirrorState, ReplayFailure, ReplayOp};
pub use overlay::{DELETION_LOG, OverlayFs};
