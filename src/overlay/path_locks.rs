//! Per-path async read/write locks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// A map of per-path locks, created on demand and dropped when idle.
///
/// Locks are keyed by exact path; `/a` and `/a/b` do not exclude each
/// other. Locks are not re-entrant, so code holding a guard must not call
/// back into an operation that locks the same path.
#[derive(Default)]
pub(crate) struct PathLocks {
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

enum Held {
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
}

/// Guard over one path. Dropping it releases the lock and prunes the map
/// entry if no one else is holding or waiting on it.
pub(crate) struct PathGuard<'a> {
    owner: &'a PathLocks,
    path: PathBuf,
    held: Option<Held>,
}

impl PathLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &Path) -> Arc<RwLock<()>> {
        self.locks
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    /// Shared lock for readers.
    pub(crate) async fn read(&self, path: &Path) -> PathGuard<'_> {
        let guard = self.entry(path).read_owned().await;
        PathGuard {
            owner: self,
            path: path.to_path_buf(),
            held: Some(Held::Shared(guard)),
        }
    }

    /// Exclusive lock for mutators.
    pub(crate) async fn write(&self, path: &Path) -> PathGuard<'_> {
        let guard = self.entry(path).write_owned().await;
        PathGuard {
            owner: self,
            path: path.to_path_buf(),
            held: Some(Held::Exclusive(guard)),
        }
    }

    /// Exclusive locks on two paths, taken in sorted order so that
    /// concurrent two-path operations cannot deadlock.
    pub(crate) async fn write_pair(&self, a: &Path, b: &Path) -> Vec<PathGuard<'_>> {
        if a == b {
            return vec![self.write(a).await];
        }
        let (first, second) = if a < b { (a, b) } else { (b, a) };
        let first = self.write(first).await;
        let second = self.write(second).await;
        vec![first, second]
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        let mut locks = self.owner.locks.lock();
        if locks
            .get(&self.path)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = PathLocks::new();
        {
            let _a = locks.read(Path::new("/a")).await;
            let _b = locks.read(Path::new("/a")).await;
            assert_eq!(locks.len(), 1);
        }
        assert_eq!(locks.len(), 0);
        drop(locks.write_pair(Path::new("/x"), Path::new("/y")).await);
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let locks = Arc::new(PathLocks::new());
        let guard = locks.write(Path::new("/f")).await;

        let reader = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.read(Path::new("/f")).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        drop(guard);
        reader.await.unwrap();
        assert_eq!(locks.len(), 0);
    }

    #[tokio::test]
    async fn pair_of_same_path_locks_once() {
        let locks = PathLocks::new();
        let guards = locks.write_pair(Path::new("/same"), Path::new("/same")).await;
        assert_eq!(guards.len(), 1);
    }
}
