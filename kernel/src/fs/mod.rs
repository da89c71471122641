//! Virtual filesystem layer.
//!
//! Filesystems expose trees of [`VfsNode`] trait objects; the dispatcher
//! resolves paths against the root tree and the mount table and forwards
//! each operation to the resolved node. A lookup that lands on a mount
//! point transparently continues into the mounted filesystem's root, so
//! `/mnt/x` names `x` inside whatever is mounted at `/mnt`.

pub mod blockdev;
pub mod fat32;
pub mod file;
pub mod ramfs;

use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::RwLock;

use crate::error::{FsError, KernelResult};
pub use file::{FdTable, OpenFlags, SeekFrom, MAX_FDS};

/// Maximum path length accepted by the dispatcher.
pub const PATH_MAX: usize = 1024;

/// Maximum length of one path component.
pub const NAME_MAX: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    CharDevice,
}

/// Unix-style permission bits. Maintained for presentation; the core does
/// not enforce them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(pub u16);

impl Permissions {
    /// rwxr-xr-x
    pub const DIR_DEFAULT: Permissions = Permissions(0o755);
    /// rw-r--r--
    pub const FILE_DEFAULT: Permissions = Permissions(0o644);

    pub fn mode(&self) -> u16 {
        self.0
    }
}

/// Node metadata returned by [`VfsNode::metadata`].
#[derive(Debug, Clone)]
pub struct Metadata {
    pub node_type: NodeType,
    pub size: usize,
    pub inode: u64,
    pub permissions: Permissions,
    pub uid: u32,
    pub gid: u32,
    pub created: u64,
    pub modified: u64,
    pub accessed: u64,
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub node_type: NodeType,
    pub inode: u64,
}

/// The closed set of operations a filesystem node can support. Nodes
/// return `FsError::NotSupported` for operations outside their type.
pub trait VfsNode: Send + Sync {
    fn node_type(&self) -> NodeType;

    fn metadata(&self) -> KernelResult<Metadata>;

    /// Copy out of `[offset, offset + buf.len())`, clipped to the node's
    /// length. Reads at or past EOF return 0.
    fn read(&self, offset: usize, buf: &mut [u8]) -> KernelResult<usize>;

    fn write(&self, offset: usize, data: &[u8]) -> KernelResult<usize>;

    fn truncate(&self, size: usize) -> KernelResult<()>;

    fn readdir(&self) -> KernelResult<Vec<DirEntry>>;

    /// Look up a direct child by name.
    fn finddir(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>>;

    fn create(
        &self,
        name: &str,
        node_type: NodeType,
        permissions: Permissions,
    ) -> KernelResult<Arc<dyn VfsNode>>;

    fn unlink(&self, name: &str) -> KernelResult<()>;

    fn open(&self, _flags: &OpenFlags) -> KernelResult<()> {
        Ok(())
    }

    fn close(&self) -> KernelResult<()> {
        Ok(())
    }
}

struct MountPoint {
    /// Canonical path of the mount point
    path: String,
    fs_root: Arc<dyn VfsNode>,
}

/// The dispatcher: one root tree plus the mount table.
pub struct Vfs {
    root: Option<Arc<dyn VfsNode>>,
    mounts: Vec<MountPoint>,
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            root: None,
            mounts: Vec::new(),
        }
    }

    pub fn set_root(&mut self, node: Arc<dyn VfsNode>) {
        self.root = Some(node);
    }

    /// Split a path into canonical components, honoring `.` and `..`
    /// without crossing the root upward.
    fn canonicalize(path: &str) -> KernelResult<Vec<&str>> {
        if path.len() > PATH_MAX {
            return Err(FsError::NotFound.into());
        }
        let mut components: Vec<&str> = Vec::new();
        for comp in path.split('/') {
            match comp {
                "" | "." => {}
                ".." => {
                    components.pop();
                }
                name => {
                    if name.len() > NAME_MAX {
                        return Err(FsError::NotFound.into());
                    }
                    components.push(name);
                }
            }
        }
        Ok(components)
    }

    fn mounted_at(&self, path: &str) -> Option<Arc<dyn VfsNode>> {
        self.mounts
            .iter()
            .find(|m| m.path == path)
            .map(|m| m.fs_root.clone())
    }

    /// Resolve a path to a node, descending through mount points.
    pub fn lookup(&self, path: &str) -> KernelResult<Arc<dyn VfsNode>> {
        let root = self.root.as_ref().ok_or(FsError::NoRootFs)?;
        let components = Self::canonicalize(path)?;

        let mut node = root.clone();
        let mut walked = String::new();

        for comp in components {
            if node.node_type() != NodeType::Directory {
                return Err(FsError::NotADirectory.into());
            }
            walked = format!("{}/{}", walked, comp);
            // A mounted filesystem shadows whatever the directory itself
            // would resolve.
            node = match self.mounted_at(&walked) {
                Some(fs_root) => fs_root,
                None => node.finddir(comp)?,
            };
        }
        Ok(node)
    }

    /// Attach a filesystem root at `path`. The path must resolve to a
    /// directory and carry no other mount.
    pub fn mount(&mut self, path: &str, fs_root: Arc<dyn VfsNode>) -> KernelResult<()> {
        let canonical = Self::canonicalize(path)?
            .iter()
            .fold(String::new(), |acc, c| format!("{}/{}", acc, c));
        if canonical.is_empty() {
            // The root is installed with set_root, never mounted over.
            return Err(FsError::AlreadyMounted.into());
        }
        if self.mounts.iter().any(|m| m.path == canonical) {
            return Err(FsError::AlreadyMounted.into());
        }

        let mount_point = self.lookup(&canonical)?;
        if mount_point.node_type() != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }

        self.mounts.push(MountPoint {
            path: canonical,
            fs_root,
        });
        Ok(())
    }

    /// Detach the filesystem mounted at `path`.
    pub fn unmount(&mut self, path: &str) -> KernelResult<()> {
        let canonical = Self::canonicalize(path)?
            .iter()
            .fold(String::new(), |acc, c| format!("{}/{}", acc, c));
        let index = self
            .mounts
            .iter()
            .position(|m| m.path == canonical)
            .ok_or(FsError::NotMounted)?;
        self.mounts.remove(index);
        Ok(())
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.len()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref VFS: RwLock<Vfs> = RwLock::new(Vfs::new());
}

/// Install the root filesystem.
pub fn set_root(node: Arc<dyn VfsNode>) {
    VFS.write().set_root(node);
}

pub fn mount(path: &str, fs_root: Arc<dyn VfsNode>) -> KernelResult<()> {
    VFS.write().mount(path, fs_root)
}

pub fn unmount(path: &str) -> KernelResult<()> {
    VFS.write().unmount(path)
}

pub fn lookup(path: &str) -> KernelResult<Arc<dyn VfsNode>> {
    VFS.read().lookup(path)
}

/// Read from a resolved node.
pub fn read(node: &Arc<dyn VfsNode>, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
    node.read(offset, buf)
}

pub fn write(node: &Arc<dyn VfsNode>, offset: usize, data: &[u8]) -> KernelResult<usize> {
    node.write(offset, data)
}

/// Write at end of file.
pub fn append(node: &Arc<dyn VfsNode>, data: &[u8]) -> KernelResult<usize> {
    let len = node.metadata()?.size;
    node.write(len, data)
}

pub fn truncate(node: &Arc<dyn VfsNode>, size: usize) -> KernelResult<()> {
    node.truncate(size)
}

/// Resolve and open a node in one step.
pub fn open(path: &str, flags: &OpenFlags) -> KernelResult<Arc<dyn VfsNode>> {
    let node = lookup(path)?;
    node.open(flags)?;
    Ok(node)
}

pub fn close(node: &Arc<dyn VfsNode>) -> KernelResult<()> {
    node.close()
}

pub fn readdir(node: &Arc<dyn VfsNode>) -> KernelResult<Vec<DirEntry>> {
    node.readdir()
}

pub fn finddir(node: &Arc<dyn VfsNode>, name: &str) -> KernelResult<Arc<dyn VfsNode>> {
    node.finddir(name)
}

/// Create a node at an absolute path.
pub fn create(path: &str, node_type: NodeType, perm: Permissions) -> KernelResult<Arc<dyn VfsNode>> {
    let (parent, name) = split_parent(path)?;
    let dir = lookup(&parent)?;
    dir.create(name, node_type, perm)
}

/// Remove the node at an absolute path.
pub fn unlink(path: &str) -> KernelResult<()> {
    let (parent, name) = split_parent(path)?;
    let dir = lookup(&parent)?;
    dir.unlink(name)
}

fn split_parent(path: &str) -> KernelResult<(String, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Ok(("/".to_string(), &trimmed[1..])),
        Some(pos) => Ok((trimmed[..pos].to_string(), &trimmed[pos + 1..])),
        None => Err(FsError::NotFound.into()),
    }
}
