//! Overlay (union) filesystem.
//!
//! A writable upper layer over a lower layer, with copy-up on write and
//! tombstoned deletion. See [`OverlayFs`].

mod deletion_log;
mod filesystem;
mod path_locks;

pub use deletion_log::DELETION_LOG;
pub use filesystem::OverlayFs;
