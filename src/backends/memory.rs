//! Complete in-memory filesystem.
//!
//! Implements every blocking form of the contract; the non-blocking forms
//! come from the [`FsAsync`] defaults. Entries live in an inode table so
//! hard links share content, and handles point at inodes so an unlinked
//! file stays readable through handles opened before the unlink.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::types::{ensure_absolute, parent_of};
use crate::{
    Capabilities, DirEntry, FileType, FsAsync, FsCapabilities, FsError, FsResult, FsSync, Handle,
    Metadata, OpenFlags, Permissions,
};

const ROOT_INODE: u64 = 1;

/// An in-memory filesystem implementing the full contract.
///
/// ## Thread Safety
///
/// All state sits behind one `parking_lot::RwLock`, so every operation is
/// atomic with respect to every other. All methods take `&self`.
///
/// ## Example
///
/// ```rust
/// use layerfs::{FsSync, MemoryFs};
/// use std::path::Path;
///
/// let fs = MemoryFs::new();
/// fs.mkdir_sync(Path::new("/docs"), 0o755).unwrap();
/// fs.write_file_sync(Path::new("/docs/a.txt"), b"hello", 0o644).unwrap();
/// assert_eq!(fs.read_file_sync(Path::new("/docs/a.txt")).unwrap(), b"hello");
/// ```
pub struct MemoryFs {
    state: RwLock<State>,
}

struct State {
    /// Inode number -> node
    nodes: HashMap<u64, Node>,
    /// Path -> inode number (several paths may share an inode)
    paths: HashMap<PathBuf, u64>,
    /// Open handles
    handles: HashMap<u64, OpenFile>,
    next_inode: u64,
    next_handle: u64,
}

struct Node {
    kind: NodeKind,
    meta: Metadata,
}

enum NodeKind {
    File(Vec<u8>),
    Directory,
    Symlink(PathBuf),
}

/// Per-handle state.
struct OpenFile {
    path: PathBuf,
    inode: u64,
    flags: OpenFlags,
    position: u64,
}

impl MemoryFs {
    /// Largest file the store will grow to. Writes or truncates past it
    /// fail with [`FsError::InvalidArgument`].
    pub const MAX_FILE_SIZE: u64 = 1 << 32;

    /// Create a new empty in-memory filesystem.
    ///
    /// The root directory `/` is created automatically.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            ROOT_INODE,
            Node {
                kind: NodeKind::Directory,
                meta: Metadata::new(FileType::Directory, Permissions::default_dir()),
            },
        );
        let mut paths = HashMap::new();
        paths.insert(PathBuf::from("/"), ROOT_INODE);
        Self {
            state: RwLock::new(State {
                nodes,
                paths,
                handles: HashMap::new(),
                next_inode: ROOT_INODE + 1,
                next_handle: 1,
            }),
        }
    }

    /// Number of currently open handles.
    pub fn open_handles(&self) -> usize {
        self.state.read().handles.len()
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    fn inode(&self, path: &Path) -> FsResult<u64> {
        ensure_absolute(path)?;
        self.paths
            .get(path)
            .copied()
            .ok_or_else(|| FsError::not_found(path))
    }

    fn node(&self, path: &Path) -> FsResult<&Node> {
        let ino = self.inode(path)?;
        self.nodes.get(&ino).ok_or_else(|| FsError::not_found(path))
    }

    fn node_mut(&mut self, path: &Path) -> FsResult<&mut Node> {
        let ino = self.inode(path)?;
        self.nodes
            .get_mut(&ino)
            .ok_or_else(|| FsError::not_found(path))
    }

    /// The parent of `path` must exist and be a directory.
    fn check_parent(&self, path: &Path) -> FsResult<()> {
        let parent = parent_of(path);
        match self.node(&parent)?.kind {
            NodeKind::Directory => Ok(()),
            _ => Err(FsError::NotADirectory { path: parent }),
        }
    }

    fn create(&mut self, path: &Path, kind: NodeKind, mode: u32) -> u64 {
        let (file_type, size) = match &kind {
            NodeKind::File(data) => (FileType::File, data.len() as u64),
            NodeKind::Directory => (FileType::Directory, 0),
            NodeKind::Symlink(target) => (FileType::Symlink, target.as_os_str().len() as u64),
        };
        let mut meta = Metadata::new(file_type, Permissions::from_mode(mode));
        meta.size = size;
        let ino = self.next_inode;
        self.next_inode += 1;
        self.nodes.insert(ino, Node { kind, meta });
        self.paths.insert(path.to_path_buf(), ino);
        self.touch_parent(path);
        ino
    }

    fn touch_parent(&mut self, path: &Path) {
        let parent = parent_of(path);
        if let Some(node) = self
            .paths
            .get(&parent)
            .and_then(|ino| self.nodes.get_mut(ino))
        {
            let now = SystemTime::now();
            node.meta.modified = now;
            node.meta.changed = now;
        }
    }

    fn has_children(&self, dir: &Path) -> bool {
        self.paths
            .keys()
            .any(|p| p.parent() == Some(dir) && p.as_path() != dir)
    }

    /// Remove one path -> inode link, dropping the inode once nothing
    /// references it.
    fn unlink_path(&mut self, path: &Path) {
        let Some(ino) = self.paths.remove(path) else {
            return;
        };
        self.touch_parent(path);
        let orphaned = match self.nodes.get_mut(&ino) {
            Some(node) => {
                node.meta.nlink = node.meta.nlink.saturating_sub(1);
                node.meta.changed = SystemTime::now();
                node.meta.nlink == 0
            }
            None => false,
        };
        if orphaned && !self.handles.values().any(|h| h.inode == ino) {
            self.nodes.remove(&ino);
        }
    }

    fn handle(&self, handle: Handle) -> FsResult<&OpenFile> {
        self.handles
            .get(&handle.0)
            .ok_or_else(|| FsError::bad_handle(handle))
    }
}

fn not_a_symlink(path: &Path) -> FsError {
    FsError::invalid(format!("not a symbolic link: {}", path.display()))
}

/// End offset of `len` bytes at `offset`, if it stays within
/// [`MemoryFs::MAX_FILE_SIZE`].
fn file_extent(path: &Path, offset: u64, len: usize) -> FsResult<usize> {
    u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .filter(|end| *end <= MemoryFs::MAX_FILE_SIZE)
        .and_then(|end| usize::try_from(end).ok())
        .ok_or_else(|| {
            FsError::invalid(format!(
                "file would exceed {} bytes: {}",
                MemoryFs::MAX_FILE_SIZE,
                path.display()
            ))
        })
}

fn resize(node: &mut Node, path: &Path, len: u64) -> FsResult<()> {
    let end = file_extent(path, len, 0)?;
    if let NodeKind::File(data) = &mut node.kind {
        data.resize(end, 0);
        node.meta.size = len;
        let now = SystemTime::now();
        node.meta.modified = now;
        node.meta.changed = now;
    }
    Ok(())
}

impl FsCapabilities for MemoryFs {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            synchronous: true,
            permissions: true,
            links: true,
            read_only: false,
        }
    }
}

impl FsSync for MemoryFs {
    fn stat_sync(&self, path: &Path) -> FsResult<Metadata> {
        Ok(self.state.read().node(path)?.meta.clone())
    }

    fn lstat_sync(&self, path: &Path) -> FsResult<Metadata> {
        self.stat_sync(path)
    }

    fn exists_sync(&self, path: &Path) -> FsResult<bool> {
        ensure_absolute(path)?;
        Ok(self.state.read().paths.contains_key(path))
    }

    fn open_sync(&self, path: &Path, flags: OpenFlags, mode: u32) -> FsResult<Handle> {
        ensure_absolute(path)?;
        let mut state = self.state.write();
        let inode = match state.paths.get(path).copied() {
            Some(ino) => {
                if flags.create && flags.exclusive {
                    return Err(FsError::already_exists(path));
                }
                let node = state
                    .nodes
                    .get_mut(&ino)
                    .ok_or_else(|| FsError::not_found(path))?;
                match node.kind {
                    NodeKind::File(_) => {}
                    NodeKind::Directory => {
                        return Err(FsError::IsADirectory {
                            path: path.to_path_buf(),
                        });
                    }
                    NodeKind::Symlink(_) => {
                        return Err(FsError::invalid(format!(
                            "cannot open symbolic link: {}",
                            path.display()
                        )));
                    }
                }
                if flags.truncate && flags.write {
                    resize(node, path, 0)?;
                }
                ino
            }
            None if flags.create => {
                state.check_parent(path)?;
                state.create(path, NodeKind::File(Vec::new()), mode)
            }
            None => return Err(FsError::not_found(path)),
        };

        let id = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(
            id,
            OpenFile {
                path: path.to_path_buf(),
                inode,
                flags,
                position: 0,
            },
        );
        Ok(Handle(id))
    }

    fn read_sync(&self, handle: Handle, len: usize, position: Option<u64>) -> FsResult<Vec<u8>> {
        let mut state = self.state.write();
        let open = state.handle(handle)?;
        if open.flags.write && !open.flags.read {
            return Err(FsError::invalid(format!(
                "handle {} not open for reading",
                handle.0
            )));
        }
        let start = position.unwrap_or(open.position);
        let data = match state.nodes.get(&open.inode).map(|n| &n.kind) {
            Some(NodeKind::File(data)) => data,
            _ => return Err(FsError::not_found(&open.path)),
        };
        let begin = usize::try_from(start).map_or(data.len(), |s| s.min(data.len()));
        let end = begin.saturating_add(len).min(data.len());
        let chunk = data[begin..end].to_vec();
        if position.is_none() {
            if let Some(open) = state.handles.get_mut(&handle.0) {
                open.position = start + chunk.len() as u64;
            }
        }
        Ok(chunk)
    }

    fn write_sync(&self, handle: Handle, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        let mut state = self.state.write();
        let open = state.handle(handle)?;
        if !open.flags.write {
            return Err(FsError::invalid(format!(
                "handle {} not open for writing",
                handle.0
            )));
        }
        let (inode, append, current) = (open.inode, open.flags.append, open.position);
        let path = open.path.clone();
        let node = state
            .nodes
            .get_mut(&inode)
            .ok_or_else(|| FsError::not_found(&path))?;
        let NodeKind::File(content) = &mut node.kind else {
            return Err(FsError::IsADirectory { path });
        };
        let offset = if append {
            content.len() as u64
        } else {
            position.unwrap_or(current)
        };
        let end = file_extent(&path, offset, data.len())?;
        let start = end - data.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        node.meta.size = content.len() as u64;
        let now = SystemTime::now();
        node.meta.modified = now;
        node.meta.changed = now;
        if position.is_none() || append {
            if let Some(open) = state.handles.get_mut(&handle.0) {
                open.position = end as u64;
            }
        }
        Ok(data.len())
    }

    fn flush_sync(&self, handle: Handle) -> FsResult<()> {
        // Writes go straight to the inode; nothing is buffered.
        self.state.read().handle(handle).map(|_| ())
    }

    fn close_sync(&self, handle: Handle) -> FsResult<()> {
        let mut state = self.state.write();
        let open = state
            .handles
            .remove(&handle.0)
            .ok_or_else(|| FsError::bad_handle(handle))?;
        let orphaned = state
            .nodes
            .get(&open.inode)
            .is_some_and(|n| n.meta.nlink == 0);
        if orphaned && !state.handles.values().any(|h| h.inode == open.inode) {
            state.nodes.remove(&open.inode);
        }
        Ok(())
    }

    fn unlink_sync(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.write();
        if let NodeKind::Directory = state.node(path)?.kind {
            return Err(FsError::IsADirectory {
                path: path.to_path_buf(),
            });
        }
        state.unlink_path(path);
        Ok(())
    }

    fn rename_sync(&self, from: &Path, to: &Path) -> FsResult<()> {
        ensure_absolute(to)?;
        let mut state = self.state.write();
        let source_is_dir = matches!(state.node(from)?.kind, NodeKind::Directory);
        if from == Path::new("/") {
            return Err(FsError::invalid("cannot rename the root directory"));
        }
        if from == to {
            return Ok(());
        }
        if source_is_dir && to.starts_with(from) {
            return Err(FsError::invalid(format!(
                "cannot move {} into itself",
                from.display()
            )));
        }
        state.check_parent(to)?;

        if let Ok(existing) = state.node(to) {
            match (&existing.kind, source_is_dir) {
                (NodeKind::Directory, true) => {
                    if state.has_children(to) {
                        return Err(FsError::DirectoryNotEmpty {
                            path: to.to_path_buf(),
                        });
                    }
                }
                (NodeKind::Directory, false) => {
                    return Err(FsError::IsADirectory {
                        path: to.to_path_buf(),
                    });
                }
                (_, true) => {
                    return Err(FsError::NotADirectory {
                        path: to.to_path_buf(),
                    });
                }
                (_, false) => {}
            }
            state.unlink_path(to);
        }

        let moved: Vec<PathBuf> = state
            .paths
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(ino) = state.paths.remove(&old) {
                let new = match old.strip_prefix(from) {
                    Ok(rest) if !rest.as_os_str().is_empty() => to.join(rest),
                    _ => to.to_path_buf(),
                };
                state.paths.insert(new, ino);
            }
        }
        state.touch_parent(from);
        state.touch_parent(to);
        if let Ok(node) = state.node_mut(to) {
            node.meta.changed = SystemTime::now();
        }
        Ok(())
    }

    fn mkdir_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        ensure_absolute(path)?;
        let mut state = self.state.write();
        if state.paths.contains_key(path) {
            return Err(FsError::already_exists(path));
        }
        state.check_parent(path)?;
        state.create(path, NodeKind::Directory, mode);
        Ok(())
    }

    fn rmdir_sync(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.write();
        if !matches!(state.node(path)?.kind, NodeKind::Directory) {
            return Err(FsError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        if path == Path::new("/") {
            return Err(FsError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        if state.has_children(path) {
            return Err(FsError::DirectoryNotEmpty {
                path: path.to_path_buf(),
            });
        }
        state.unlink_path(path);
        Ok(())
    }

    fn readdir_sync(&self, path: &Path) -> FsResult<Vec<DirEntry>> {
        let state = self.state.read();
        if !matches!(state.node(path)?.kind, NodeKind::Directory) {
            return Err(FsError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        let mut entries: Vec<DirEntry> = state
            .paths
            .iter()
            .filter(|(p, _)| p.parent() == Some(path) && p.as_path() != path)
            .filter_map(|(p, ino)| {
                let node = state.nodes.get(ino)?;
                Some(DirEntry {
                    name: p.file_name()?.to_string_lossy().into_owned(),
                    file_type: node.meta.file_type,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn truncate_sync(&self, path: &Path, len: u64) -> FsResult<()> {
        let mut state = self.state.write();
        let node = state.node_mut(path)?;
        match node.kind {
            NodeKind::File(_) => resize(node, path, len),
            NodeKind::Directory => Err(FsError::IsADirectory {
                path: path.to_path_buf(),
            }),
            NodeKind::Symlink(_) => Err(FsError::invalid(format!(
                "cannot truncate symbolic link: {}",
                path.display()
            ))),
        }
    }

    fn chmod_sync(&self, path: &Path, mode: u32) -> FsResult<()> {
        let mut state = self.state.write();
        let node = state.node_mut(path)?;
        node.meta.permissions = Permissions::from_mode(mode);
        node.meta.changed = SystemTime::now();
        Ok(())
    }

    fn chown_sync(&self, path: &Path, uid: u32, gid: u32) -> FsResult<()> {
        let mut state = self.state.write();
        let node = state.node_mut(path)?;
        node.meta.uid = uid;
        node.meta.gid = gid;
        node.meta.changed = SystemTime::now();
        Ok(())
    }

    fn utimes_sync(&self, path: &Path, atime: SystemTime, mtime: SystemTime) -> FsResult<()> {
        let mut state = self.state.write();
        let node = state.node_mut(path)?;
        node.meta.accessed = atime;
        node.meta.modified = mtime;
        node.meta.changed = SystemTime::now();
        Ok(())
    }

    fn link_sync(&self, existing: &Path, new: &Path) -> FsResult<()> {
        ensure_absolute(new)?;
        let mut state = self.state.write();
        let ino = state.inode(existing)?;
        if let Some(Node {
            kind: NodeKind::Directory,
            ..
        }) = state.nodes.get(&ino)
        {
            return Err(FsError::PermissionDenied {
                path: existing.to_path_buf(),
            });
        }
        if state.paths.contains_key(new) {
            return Err(FsError::already_exists(new));
        }
        state.check_parent(new)?;
        state.paths.insert(new.to_path_buf(), ino);
        state.touch_parent(new);
        if let Some(node) = state.nodes.get_mut(&ino) {
            node.meta.nlink += 1;
            node.meta.changed = SystemTime::now();
        }
        Ok(())
    }

    fn symlink_sync(&self, target: &Path, link: &Path) -> FsResult<()> {
        ensure_absolute(link)?;
        let mut state = self.state.write();
        if state.paths.contains_key(link) {
            return Err(FsError::already_exists(link));
        }
        state.check_parent(link)?;
        state.create(link, NodeKind::Symlink(target.to_path_buf()), 0o777);
        Ok(())
    }

    fn readlink_sync(&self, path: &Path) -> FsResult<PathBuf> {
        match &self.state.read().node(path)?.kind {
            NodeKind::Symlink(target) => Ok(target.clone()),
            _ => Err(not_a_symlink(path)),
        }
    }
}

impl FsAsync for MemoryFs {}
