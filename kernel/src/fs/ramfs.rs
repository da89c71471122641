//! RAM-backed filesystem.
//!
//! The reference implementation of the VFS operations: files are
//! growable byte buffers, directories are name -> node maps. Backs `/`
//! and `/tmp`, and carries the scaffolding other pseudo-filesystems hang
//! their nodes on.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::RwLock;

use super::{DirEntry, Metadata, NodeType, Permissions, VfsNode};
use crate::error::{FsError, KernelResult};
use crate::timer;

/// Per-file size cap.
pub const MAX_FILE_SIZE: usize = 1024 * 1024;

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

fn next_inode() -> u64 {
    NEXT_INODE.fetch_add(1, Ordering::Relaxed)
}

struct RamNode {
    node_type: NodeType,
    inode: u64,
    data: RwLock<Vec<u8>>,
    children: RwLock<BTreeMap<String, Arc<RamNode>>>,
    metadata: RwLock<Metadata>,
}

impl RamNode {
    fn new(node_type: NodeType, permissions: Permissions) -> Self {
        let inode = next_inode();
        let now = timer::uptime_ms();
        Self {
            node_type,
            inode,
            data: RwLock::new(Vec::new()),
            children: RwLock::new(BTreeMap::new()),
            metadata: RwLock::new(Metadata {
                node_type,
                size: 0,
                inode,
                permissions,
                uid: 0,
                gid: 0,
                created: now,
                modified: now,
                accessed: now,
            }),
        }
    }
}

impl VfsNode for RamNode {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        Ok(self.metadata.read().clone())
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
        if self.node_type != NodeType::File {
            return Err(FsError::IsADirectory.into());
        }
        let data = self.data.read();
        if offset >= data.len() {
            return Ok(0);
        }
        let count = buf.len().min(data.len() - offset);
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        self.metadata.write().accessed = timer::uptime_ms();
        Ok(count)
    }

    fn write(&self, offset: usize, data: &[u8]) -> KernelResult<usize> {
        if self.node_type != NodeType::File {
            return Err(FsError::IsADirectory.into());
        }
        let end = offset
            .checked_add(data.len())
            .ok_or(FsError::FileTooLarge)?;
        if end > MAX_FILE_SIZE {
            return Err(FsError::FileTooLarge.into());
        }

        let mut file = self.data.write();
        if end > file.len() {
            file.resize(end, 0);
        }
        file[offset..end].copy_from_slice(data);

        let mut meta = self.metadata.write();
        meta.size = file.len();
        meta.modified = timer::uptime_ms();
        Ok(data.len())
    }

    fn truncate(&self, size: usize) -> KernelResult<()> {
        if self.node_type != NodeType::File {
            return Err(FsError::IsADirectory.into());
        }
        let mut file = self.data.write();
        file.resize(size, 0);
        let mut meta = self.metadata.write();
        meta.size = size;
        meta.modified = timer::uptime_ms();
        Ok(())
    }

    fn readdir(&self) -> KernelResult<Vec<DirEntry>> {
        if self.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let children = self.children.read();
        Ok(children
            .iter()
            .map(|(name, child)| DirEntry {
                name: name.clone(),
                node_type: child.node_type,
                inode: child.inode,
            })
            .collect())
    }

    fn finddir(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>> {
        if self.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        self.children
            .read()
            .get(name)
            .cloned()
            .map(|node| node as Arc<dyn VfsNode>)
            .ok_or_else(|| FsError::NotFound.into())
    }

    fn create(
        &self,
        name: &str,
        node_type: NodeType,
        permissions: Permissions,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        if self.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let mut children = self.children.write();
        if children.contains_key(name) {
            return Err(FsError::AlreadyExists.into());
        }
        let child = Arc::new(RamNode::new(node_type, permissions));
        children.insert(name.to_string(), child.clone());
        self.metadata.write().modified = timer::uptime_ms();
        Ok(child)
    }

    fn unlink(&self, name: &str) -> KernelResult<()> {
        if self.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let mut children = self.children.write();
        let child = children.get(name).ok_or(FsError::NotFound)?;
        if child.node_type == NodeType::Directory && !child.children.read().is_empty() {
            return Err(FsError::DirectoryNotEmpty.into());
        }
        children.remove(name);
        self.metadata.write().modified = timer::uptime_ms();
        Ok(())
    }
}

/// A RAM filesystem instance: just its root directory.
pub struct RamFs {
    root: Arc<RamNode>,
}

impl RamFs {
    pub fn new() -> Self {
        Self {
            root: Arc::new(RamNode::new(NodeType::Directory, Permissions::DIR_DEFAULT)),
        }
    }

    pub fn root(&self) -> Arc<dyn VfsNode> {
        self.root.clone()
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}
