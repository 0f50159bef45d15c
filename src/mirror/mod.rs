//! Sync-over-async mirror.
//!
//! Pairs a synchronous local replica with an asynchronous remote and
//! replays every local mutation on the remote in issue order. See
//! [`AsyncMirror`].

mod filesystem;
mod replay;
mod state;

pub use filesystem::AsyncMirror;
pub use replay::{ReplayFailure, ReplayOp};
pub use state::MirrorState;
