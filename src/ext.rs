//! # Extension Traits
//!
//! Convenience methods for filesystem backends.
//!
//! ## Overview
//!
//! [`FsExt`] provides commonly-needed utility methods that aren't part of
//! the contract itself. They are built on the non-blocking forms and
//! blanket-implemented, so any [`FileSystem`] (including `dyn FileSystem`)
//! gets them for free.
//!
//! ## Available Methods
//!
//! | Method | Description |
//! |--------|-------------|
//! | [`is_file`](FsExt::is_file) | Check if path is a regular file |
//! | [`is_dir`](FsExt::is_dir) | Check if path is a directory |
//! | [`is_symlink`](FsExt::is_symlink) | Check if path is a symbolic link |
//! | [`file_size`](FsExt::file_size) | Size of a file in bytes |
//! | [`walk`](FsExt::walk) | Every entry below a directory, parents first |
//! | [`read_json`](FsExt::read_json) | Read and deserialize a JSON file |
//! | [`write_json`](FsExt::write_json) | Serialize and write a JSON file |

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::{FileSystem, FsError, FsResult, Metadata, Permissions};

/// Extension methods for any filesystem backend.
///
/// # Example
///
/// ```rust
/// use layerfs::{FileSystem, FsExt, FsError};
/// use std::path::Path;
///
/// async fn check_paths(backend: &dyn FileSystem) -> Result<(), FsError> {
///     if backend.is_file(Path::new("/config.json")).await? {
///         println!("Config exists!");
///     }
///     if backend.is_dir(Path::new("/data")).await? {
///         println!("Data directory exists!");
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait FsExt: FileSystem {
    /// Check if the path points to a regular file.
    ///
    /// Returns `Ok(false)` if the path doesn't exist (not an error).
    async fn is_file(&self, path: &Path) -> FsResult<bool> {
        match self.stat(path).await {
            Ok(m) => Ok(m.is_file()),
            Err(FsError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check if the path points to a directory.
    ///
    /// Returns `Ok(false)` if the path doesn't exist (not an error).
    async fn is_dir(&self, path: &Path) -> FsResult<bool> {
        match self.stat(path).await {
            Ok(m) => Ok(m.is_dir()),
            Err(FsError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check if the path points to a symbolic link.
    ///
    /// The contract never follows links, so this is exact.
    async fn is_symlink(&self, path: &Path) -> FsResult<bool> {
        match self.lstat(path).await {
            Ok(m) => Ok(m.is_symlink()),
            Err(FsError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Size of a file in bytes.
    async fn file_size(&self, path: &Path) -> FsResult<u64> {
        Ok(self.stat(path).await?.size)
    }

    /// Create `path` and any missing ancestors with `mode`.
    async fn create_dir_all(&self, path: &Path, mode: u32) -> FsResult<()> {
        let mut missing = Vec::new();
        let mut current = Some(path);
        while let Some(dir) = current {
            match self.stat(dir).await {
                Ok(m) if m.is_dir() => break,
                Ok(_) => {
                    return Err(FsError::NotADirectory {
                        path: dir.to_path_buf(),
                    });
                }
                Err(FsError::NotFound { .. }) => missing.push(dir.to_path_buf()),
                Err(e) => return Err(e),
            }
            current = dir.parent();
        }
        for dir in missing.iter().rev() {
            match self.mkdir(dir, mode).await {
                Ok(()) | Err(FsError::AlreadyExists { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Every entry below `root` with its metadata, breadth-first, so each
    /// directory precedes its children. `root` itself is not included.
    async fn walk(&self, root: &Path) -> FsResult<Vec<(PathBuf, Metadata)>> {
        let mut found = Vec::new();
        let mut pending = VecDeque::from([root.to_path_buf()]);
        while let Some(dir) = pending.pop_front() {
            for entry in self.readdir(&dir).await? {
                let path = dir.join(&entry.name);
                let meta = self.lstat(&path).await?;
                if meta.is_dir() {
                    pending.push_back(path.clone());
                }
                found.push((path, meta));
            }
        }
        Ok(found)
    }

    /// Read and deserialize a JSON file.
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] if the content is not valid JSON for `T`
    async fn read_json<T: DeserializeOwned + Send>(&self, path: &Path) -> FsResult<T> {
        let data = self.read_file(path).await?;
        serde_json::from_slice(&data)
            .map_err(|e| FsError::invalid(format!("{}: {e}", path.display())))
    }

    /// Serialize `value` as pretty JSON and write it to `path`.
    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> FsResult<()> {
        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| FsError::invalid(format!("{}: {e}", path.display())))?;
        self.write_file(path, &json, Permissions::default_file().mode())
            .await
    }
}

// Blanket implementation - any FileSystem gets FsExt for free
impl<T: FileSystem + ?Sized> FsExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FsAsync, MemoryFs};
    use std::sync::Arc;

    async fn sample() -> Arc<dyn FileSystem> {
        let fs = MemoryFs::new();
        fs.mkdir(Path::new("/data"), 0o755).await.unwrap();
        fs.mkdir(Path::new("/data/nested"), 0o755).await.unwrap();
        fs.write_file(Path::new("/data/a.txt"), b"hello", 0o644)
            .await
            .unwrap();
        fs.write_file(Path::new("/data/nested/b.txt"), b"hi", 0o644)
            .await
            .unwrap();
        fs.symlink(Path::new("/data/a.txt"), Path::new("/link"))
            .await
            .unwrap();
        Arc::new(fs)
    }

    #[tokio::test]
    async fn type_predicates() {
        let fs = sample().await;
        assert!(fs.is_file(Path::new("/data/a.txt")).await.unwrap());
        assert!(!fs.is_file(Path::new("/data")).await.unwrap());
        assert!(fs.is_dir(Path::new("/data")).await.unwrap());
        assert!(!fs.is_dir(Path::new("/missing")).await.unwrap());
        assert!(fs.is_symlink(Path::new("/link")).await.unwrap());
        assert!(!fs.is_symlink(Path::new("/data/a.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn file_size_returns_size() {
        let fs = sample().await;
        assert_eq!(fs.file_size(Path::new("/data/a.txt")).await.unwrap(), 5);
        assert!(fs.file_size(Path::new("/nope")).await.is_err());
    }

    #[tokio::test]
    async fn walk_lists_parents_before_children() {
        let fs = sample().await;
        let paths: Vec<PathBuf> = fs
            .walk(Path::new("/"))
            .await
            .unwrap()
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        let pos = |p: &str| paths.iter().position(|x| x == Path::new(p)).unwrap();
        assert_eq!(paths.len(), 5);
        assert!(pos("/data") < pos("/data/nested"));
        assert!(pos("/data/nested") < pos("/data/nested/b.txt"));
    }

    #[tokio::test]
    async fn create_dir_all_builds_missing_ancestors() {
        let fs = sample().await;
        fs.create_dir_all(Path::new("/data/x/y/z"), 0o700)
            .await
            .unwrap();
        assert!(fs.is_dir(Path::new("/data/x/y/z")).await.unwrap());

        let err = fs
            .create_dir_all(Path::new("/data/a.txt/sub"), 0o700)
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::NotADirectory { .. }));
    }

    #[tokio::test]
    async fn json_helpers() {
        let fs = sample().await;
        let value = serde_json::json!({"backend": "InMemory"});
        fs.write_json(Path::new("/cfg.json"), &value).await.unwrap();
        let back: serde_json::Value = fs.read_json(Path::new("/cfg.json")).await.unwrap();
        assert_eq!(back, value);

        let err = fs
            .read_json::<serde_json::Value>(Path::new("/data/a.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument { .. }));
    }
}
