//! # Filesystem Traits
//!
//! The contract every backend implements.
//!
//! ## Trait Layers
//!
//! ```text
//! FsCapabilities          capability queries
//!       ↓
//! FsSync                  blocking forms (`stat_sync`, `open_sync`, ...)
//!       ↓
//! FsAsync                 non-blocking forms (`stat`, `open`, ...)
//!       ↓
//! FileSystem              composite, blanket-implemented
//! ```
//!
//! | Trait | Provides | Defaults |
//! |-------|----------|----------|
//! | [`FsCapabilities`] | `capabilities()` + helper queries | helpers read `capabilities()` |
//! | [`FsSync`] | `*_sync` operations | `NotSupported` |
//! | [`FsAsync`] | `async fn` operations | run the `*_sync` form inline |
//! | [`FileSystem`] | everything above | blanket impl |
//!
//! A synchronous backend implements [`FsSync`] and writes an empty
//! `impl FsAsync`. An asynchronous-only backend writes an empty
//! `impl FsSync` and overrides every [`FsAsync`] method.
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync`. Methods take `&self` to enable concurrent
//! access. Backends use interior mutability for thread-safe state management.
//!
//! ## Object Safety
//!
//! All traits are object-safe. Composite backends hold their children as
//! `Arc<dyn FileSystem>`:
//!
//! ```rust
//! use layerfs::{FileSystem, FsResult};
//! use std::path::Path;
//!
//! async fn count_entries(fs: &dyn FileSystem) -> FsResult<usize> {
//!     Ok(fs.readdir(Path::new("/")).await?.len())
//! }
//! ```

mod fs_async;
mod fs_capabilities;
mod fs_sync;

pub use fs_async::FsAsync;
pub use fs_capabilities::FsCapabilities;
pub use fs_sync::FsSync;

/// The full filesystem contract: capabilities plus blocking and
/// non-blocking operations.
///
/// Automatically implemented for any type implementing [`FsAsync`] (and
/// therefore [`FsSync`] and [`FsCapabilities`]).
pub trait FileSystem: FsAsync {}

impl<T: FsAsync + ?Sized> FileSystem for T {}
