//! The overlay's tombstone set and its on-disk form.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Reserved upper-layer path holding the serialized tombstone set.
pub const DELETION_LOG: &str = "/.deletedFiles.log";

/// Name of the log file as it appears in a listing of `/`.
pub(crate) const DELETION_LOG_NAME: &str = ".deletedFiles.log";

/// Ordered set of lower-layer paths hidden by deletion through the overlay.
///
/// Serialized as one absolute path per line, always rewritten whole.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct DeletionLog {
    entries: BTreeSet<PathBuf>,
}

impl DeletionLog {
    /// Parse the log file. Blank and relative lines are skipped.
    pub(crate) fn parse(data: &[u8]) -> Self {
        let entries = String::from_utf8_lossy(data)
            .lines()
            .map(str::trim_end)
            .filter(|line| line.starts_with('/'))
            .map(PathBuf::from)
            .collect();
        Self { entries }
    }

    pub(crate) fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for path in &self.entries {
            out.push_str(&path.to_string_lossy());
            out.push('\n');
        }
        out.into_bytes()
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.entries.contains(path)
    }

    /// Returns `true` if the set changed.
    pub(crate) fn insert(&mut self, path: &Path) -> bool {
        self.entries.insert(path.to_path_buf())
    }

    /// Returns `true` if the set changed.
    pub(crate) fn remove(&mut self, path: &Path) -> bool {
        self.entries.remove(path)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(PathBuf::as_path)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
