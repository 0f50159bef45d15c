//! Capability queries.

use crate::Capabilities;

/// Capability queries every backend answers.
///
/// # Thread Safety
///
/// All implementations must be `Send + Sync`. Methods use `&self` to allow
/// concurrent access.
///
/// # Object Safety
///
/// This trait is object-safe and can be used as `dyn FsCapabilities`.
pub trait FsCapabilities: Send + Sync {
    /// The full capability set of this backend.
    fn capabilities(&self) -> Capabilities;

    /// Blocking (`*_sync`) forms are available.
    fn supports_synchronous_ops(&self) -> bool {
        self.capabilities().synchronous
    }

    /// Permission bits and ownership are stored.
    fn supports_permissions(&self) -> bool {
        self.capabilities().permissions
    }

    /// Hard and symbolic links are supported.
    fn supports_links(&self) -> bool {
        self.capabilities().links
    }

    /// Every mutation fails with `ReadOnly`.
    fn is_read_only(&self) -> bool {
        self.capabilities().read_only
    }
}
