//! # Layer Trait
//!
//! Tower-style middleware composition for filesystem backends.
//!
//! ## Overview
//!
//! The [`Layer`] trait wraps a shared backend (`Arc<B>`) into another
//! backend. Layers are compile-time composition; the wrapped result is a
//! [`FileSystem`] again, so it can be layered further or handed to a
//! composite such as [`OverlayFs`](crate::OverlayFs) as `Arc<dyn FileSystem>`.
//!
//! ```text
//! Arc<Backend> ──▶ Layer::layer() ──▶ Wrapped Backend
//! ```
//!
//! ## Example
//!
//! ```rust
//! use layerfs::{FileSystem, FsCapabilities, LayerExt, MemoryFs, ReadOnlyLayer};
//! use std::sync::Arc;
//!
//! let lower = Arc::new(MemoryFs::new()).layer(ReadOnlyLayer);
//! assert!(lower.is_read_only());
//! let _shared: Arc<dyn FileSystem> = Arc::new(lower);
//! ```

use std::sync::Arc;

use crate::FileSystem;

/// A layer that wraps a backend to add functionality.
///
/// Inspired by Tower's `Layer` trait. Each middleware provides a
/// corresponding `Layer` implementation.
///
/// # Design Notes
///
/// - `layer(self, backend)` consumes both the layer and the backend handle
/// - The resulting `Backend` type should implement [`FileSystem`]
pub trait Layer<B> {
    /// The resulting backend type after applying this layer.
    type Backend;

    /// Wrap the given backend with this layer's functionality.
    fn layer(self, backend: B) -> Self::Backend;
}

/// Extension trait for fluent layer composition.
///
/// Provides `.layer()` on any shared backend (`Arc<B>`, including
/// `Arc<dyn FileSystem>`).
pub trait LayerExt: Sized {
    /// Apply a layer to this backend.
    fn layer<L: Layer<Self>>(self, layer: L) -> L::Backend {
        layer.layer(self)
    }
}

// Blanket implementation - any shared FileSystem gets LayerExt for free
impl<B: FileSystem + ?Sized> LayerExt for Arc<B> {}
