//! Core types for the layerfs filesystem contract.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::FsError;

/// Type of a filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

/// Capability set advertised by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct Capabilities {
    /// Blocking (`*_sync`) forms are available.
    pub synchronous: bool,
    /// Permission bits and ownership are stored.
    pub permissions: bool,
    /// Hard and symbolic links are supported.
    pub links: bool,
    /// Every mutation fails with `ReadOnly`.
    pub read_only: bool,
}

/// Metadata for a filesystem entry (the stat record).
///
/// The contract never follows symlinks, so a symlink's metadata describes
/// the link itself; its target is obtained with `readlink`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Metadata {
    /// Type of the entry (file, directory, symlink).
    pub file_type: FileType,
    /// Size in bytes. Carries no meaning for directories.
    pub size: u64,
    /// Permission bits.
    pub permissions: Permissions,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
    /// Last access time.
    #[serde(with = "system_time_serde")]
    pub accessed: SystemTime,
    /// Last content modification time.
    #[serde(with = "system_time_serde")]
    pub modified: SystemTime,
    /// Last metadata change time.
    #[serde(with = "system_time_serde")]
    pub changed: SystemTime,
    /// Number of hard links.
    pub nlink: u64,
}

impl Metadata {
    /// Fresh metadata for a new entry of `file_type`, stamped with the current time.
    pub fn new(file_type: FileType, permissions: Permissions) -> Self {
        let now = SystemTime::now();
        Self {
            file_type,
            size: 0,
            permissions,
            uid: 0,
            gid: 0,
            accessed: now,
            modified: now,
            changed: now,
            nlink: 1,
        }
    }

    /// Returns `true` if this is a regular file.
    #[inline]
    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }

    /// Returns `true` if this is a directory.
    #[inline]
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Directory
    }

    /// Returns `true` if this is a symbolic link.
    #[inline]
    pub fn is_symlink(&self) -> bool {
        self.file_type == FileType::Symlink
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            file_type: FileType::File,
            size: 0,
            permissions: Permissions::default_file(),
            uid: 0,
            gid: 0,
            accessed: SystemTime::UNIX_EPOCH,
            modified: SystemTime::UNIX_EPOCH,
            changed: SystemTime::UNIX_EPOCH,
            nlink: 1,
        }
    }
}

/// A directory entry returned from `readdir`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DirEntry {
    /// Name of the entry (filename only, not full path).
    pub name: String,
    /// Type of the entry.
    pub file_type: FileType,
}

/// Unix-style permissions stored as a mode bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Permissions(u32);

impl Permissions {
    /// Create permissions from a Unix mode (e.g., 0o755).
    #[inline]
    pub const fn from_mode(mode: u32) -> Self {
        Self(mode & 0o7777)
    }

    /// Get the raw mode value.
    #[inline]
    pub const fn mode(&self) -> u32 {
        self.0
    }

    /// Returns `true` if these permissions deny writing.
    #[inline]
    pub const fn readonly(&self) -> bool {
        (self.0 & 0o222) == 0
    }

    /// Default permissions for a new file (0o644 = rw-r--r--).
    #[inline]
    pub const fn default_file() -> Self {
        Self(0o644)
    }

    /// Default permissions for a new directory (0o755 = rwxr-xr-x).
    #[inline]
    pub const fn default_dir() -> Self {
        Self(0o755)
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::default_file()
    }
}

/// Opaque file handle returned by `open`.
///
/// The value is meaningful only to the backend that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Handle(pub u64);

/// Flags for opening a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OpenFlags {
    /// Open for reading.
    pub read: bool,
    /// Open for writing.
    pub write: bool,
    /// Create file if it doesn't exist.
    pub create: bool,
    /// With `create`: fail if the file already exists.
    pub exclusive: bool,
    /// Truncate file to zero length.
    pub truncate: bool,
    /// Every write goes to the end of the file.
    pub append: bool,
}

impl OpenFlags {
    /// Read-only access (`r`).
    pub const READ: Self = Self {
        read: true,
        write: false,
        create: false,
        exclusive: false,
        truncate: false,
        append: false,
    };

    /// Write access with create and truncate (`w`).
    pub const WRITE: Self = Self {
        read: false,
        write: true,
        create: true,
        exclusive: false,
        truncate: true,
        append: false,
    };

    /// Read and write access to an existing file (`r+`).
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        create: false,
        exclusive: false,
        truncate: false,
        append: false,
    };

    /// Append mode, creating the file if needed (`a`).
    pub const APPEND: Self = Self {
        read: false,
        write: true,
        create: true,
        exclusive: false,
        truncate: false,
        append: true,
    };

    /// Parse a Node-style flag string (`r`, `r+`, `w`, `wx`, `a+`, ...).
    ///
    /// # Errors
    ///
    /// - [`FsError::InvalidArgument`] for unknown flag strings
    pub fn parse(flags: &str) -> Result<Self, FsError> {
        let (base, exclusive, plus) = match flags {
            "r" | "rs" | "sr" => ('r', false, false),
            "r+" | "rs+" | "sr+" => ('r', false, true),
            "w" => ('w', false, false),
            "wx" | "xw" => ('w', true, false),
            "w+" => ('w', false, true),
            "wx+" | "xw+" => ('w', true, true),
            "a" | "as" | "sa" => ('a', false, false),
            "ax" | "xa" => ('a', true, false),
            "a+" | "as+" | "sa+" => ('a', false, true),
            "ax+" | "xa+" => ('a', true, true),
            other => return Err(FsError::invalid(format!("unknown open flags {other:?}"))),
        };
        Ok(match base {
            'r' => Self {
                read: true,
                write: plus,
                ..Self::default()
            },
            'w' => Self {
                read: plus,
                write: true,
                create: true,
                exclusive,
                truncate: true,
                append: false,
            },
            _ => Self {
                read: plus,
                write: true,
                create: true,
                exclusive,
                truncate: false,
                append: true,
            },
        })
    }

    /// Returns `true` if opening with these flags can modify the file.
    #[inline]
    pub const fn is_mutating(&self) -> bool {
        self.write || self.create || self.truncate || self.append
    }
}

/// Reject relative paths; the contract only accepts absolute ones.
pub(crate) fn ensure_absolute(path: &Path) -> Result<(), FsError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(FsError::invalid(format!(
            "relative path not accepted: {}",
            path.display()
        )))
    }
}

/// Parent of an absolute path; the root is its own parent.
pub(crate) fn parent_of(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Serde support for `SystemTime` as `(secs, nanos)` since the epoch.
pub(crate) mod system_time_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let duration = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        (duration.as_secs(), duration.subsec_nanos()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let (secs, nanos): (u64, u32) = Deserialize::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + Duration::new(secs, nanos))
    }
}
