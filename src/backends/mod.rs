//! Concrete backends.
//!
//! | Backend | Sync | Notes |
//! |---------|------|-------|
//! | [`MemoryFs`] | yes | full contract, hard links, inode-backed handles |
//! | [`ReadOnly`] | as inner | rejects every mutation |

mod memory;
mod readonly;

pub use memory::MemoryFs;
pub use readonly::{ReadOnly, ReadOnlyLayer};
