//! VFS adaptation for FAT32 volumes.
//!
//! Each node carries its volume, the directory cluster its entry lives
//! in, and its current `{first_cluster, size}`. Directory listings go
//! through a one-slot cache keyed by `(volume, cluster)`; any write to a
//! volume invalidates that volume's cached listing.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use super::dir::{Attributes, Fat32DirEntry};
use super::Fat32Volume;
use crate::error::{FsError, KernelResult};
use crate::fs::{DirEntry, Metadata, NodeType, Permissions, VfsNode};

struct DirCacheSlot {
    volume_id: u64,
    cluster: u32,
    entries: Vec<Fat32DirEntry>,
}

static DIR_CACHE: Mutex<Option<DirCacheSlot>> = Mutex::new(None);
static CACHE_HITS: AtomicU64 = AtomicU64::new(0);

/// Drop any cached listing for the volume. Called on every write.
fn invalidate_cache(volume_id: u64) {
    let mut cache = DIR_CACHE.lock();
    if matches!(&*cache, Some(slot) if slot.volume_id == volume_id) {
        *cache = None;
    }
}

fn cached_read_dir(volume: &Fat32Volume, cluster: u32) -> KernelResult<Vec<Fat32DirEntry>> {
    {
        let cache = DIR_CACHE.lock();
        if let Some(slot) = &*cache {
            if slot.volume_id == volume.volume_id && slot.cluster == cluster {
                CACHE_HITS.fetch_add(1, Ordering::Relaxed);
                return Ok(slot.entries.clone());
            }
        }
    }

    let entries = volume.read_dir(cluster)?;
    *DIR_CACHE.lock() = Some(DirCacheSlot {
        volume_id: volume.volume_id,
        cluster,
        entries: entries.clone(),
    });
    Ok(entries)
}

struct NodeState {
    first_cluster: u32,
    size: u32,
}

struct Fat32Node {
    volume: Arc<Fat32Volume>,
    /// Cluster of the directory holding this node's entry; `None` for
    /// the volume root, which has no entry of its own.
    parent_cluster: Option<u32>,
    /// 8.3 name as stored on disk
    name: String,
    node_type: NodeType,
    attr: Attributes,
    state: Mutex<NodeState>,
}

impl Fat32Node {
    fn root(volume: Arc<Fat32Volume>) -> Self {
        let root_cluster = volume.root_cluster;
        Self {
            volume,
            parent_cluster: None,
            name: String::new(),
            node_type: NodeType::Directory,
            attr: Attributes::DIRECTORY,
            state: Mutex::new(NodeState {
                first_cluster: root_cluster,
                size: 0,
            }),
        }
    }

    fn from_entry(volume: Arc<Fat32Volume>, parent_cluster: u32, entry: &Fat32DirEntry) -> Self {
        Self {
            volume,
            parent_cluster: Some(parent_cluster),
            name: entry.name.clone(),
            node_type: if entry.is_directory() {
                NodeType::Directory
            } else {
                NodeType::File
            },
            attr: entry.attr,
            state: Mutex::new(NodeState {
                first_cluster: entry.first_cluster,
                size: entry.size,
            }),
        }
    }

    /// Push `{size, first_cluster}` back into the directory entry.
    fn flush_entry(&self, state: &NodeState) -> KernelResult<()> {
        match self.parent_cluster {
            Some(parent) => self
                .volume
                .update_entry(parent, &self.name, state.size, state.first_cluster),
            None => Ok(()),
        }
    }
}

impl VfsNode for Fat32Node {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn metadata(&self) -> KernelResult<Metadata> {
        let state = self.state.lock();
        Ok(Metadata {
            node_type: self.node_type,
            size: state.size as usize,
            inode: state.first_cluster as u64,
            permissions: if self.node_type == NodeType::Directory {
                Permissions::DIR_DEFAULT
            } else {
                Permissions::FILE_DEFAULT
            },
            uid: 0,
            gid: 0,
            created: 0,
            modified: 0,
            accessed: 0,
        })
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> KernelResult<usize> {
        if self.node_type != NodeType::File {
            return Err(FsError::IsADirectory.into());
        }
        let state = self.state.lock();
        self.volume
            .read_file(state.first_cluster, state.size, offset as u32, buf)
    }

    fn write(&self, offset: usize, data: &[u8]) -> KernelResult<usize> {
        if self.node_type != NodeType::File {
            return Err(FsError::IsADirectory.into());
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let written = self.volume.write_file(
            &mut state.first_cluster,
            &mut state.size,
            offset as u32,
            data,
        )?;
        self.flush_entry(state)?;
        invalidate_cache(self.volume.volume_id);
        Ok(written)
    }

    fn truncate(&self, size: usize) -> KernelResult<()> {
        if self.node_type != NodeType::File {
            return Err(FsError::IsADirectory.into());
        }
        let mut state = self.state.lock();
        let size = size as u32;

        if size == 0 {
            if state.first_cluster >= 2 {
                self.volume.free_cluster_chain(state.first_cluster)?;
            }
            state.first_cluster = 0;
        } else if size < state.size {
            // Trim the chain past the last surviving cluster.
            let cluster_bytes = self.volume.cluster_bytes() as u32;
            let keep = size.div_ceil(cluster_bytes);
            let mut cluster = state.first_cluster;
            for _ in 1..keep {
                match self.volume.next_cluster(cluster)? {
                    Some(next) => cluster = next,
                    None => break,
                }
            }
            if let Some(excess) = self.volume.next_cluster(cluster)? {
                self.volume.free_cluster_chain(excess)?;
            }
            self.volume.set_cluster(cluster, super::CLUSTER_END)?;
        } else if size > state.size {
            return Err(FsError::NotSupported.into());
        }

        state.size = size;
        self.flush_entry(&state)?;
        invalidate_cache(self.volume.volume_id);
        Ok(())
    }

    fn readdir(&self) -> KernelResult<Vec<DirEntry>> {
        if self.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let cluster = self.state.lock().first_cluster;
        let entries = cached_read_dir(&self.volume, cluster)?;
        Ok(entries
            .iter()
            .map(|e| DirEntry {
                name: e.name.clone(),
                node_type: if e.is_directory() {
                    NodeType::Directory
                } else {
                    NodeType::File
                },
                inode: e.first_cluster as u64,
            })
            .collect())
    }

    fn finddir(&self, name: &str) -> KernelResult<Arc<dyn VfsNode>> {
        if self.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let cluster = self.state.lock().first_cluster;
        let (entry, _) = self
            .volume
            .find_entry(cluster, name)?
            .ok_or(FsError::NotFound)?;
        Ok(Arc::new(Fat32Node::from_entry(
            self.volume.clone(),
            cluster,
            &entry,
        )))
    }

    fn create(
        &self,
        name: &str,
        node_type: NodeType,
        _permissions: Permissions,
    ) -> KernelResult<Arc<dyn VfsNode>> {
        if self.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let attr = match node_type {
            NodeType::Directory => Attributes::DIRECTORY,
            _ => Attributes::ARCHIVE,
        };

        let cluster = self.state.lock().first_cluster;
        self.volume.create_entry(cluster, name, attr)?;
        invalidate_cache(self.volume.volume_id);

        self.finddir(name)
    }

    fn unlink(&self, name: &str) -> KernelResult<()> {
        if self.node_type != NodeType::Directory {
            return Err(FsError::NotADirectory.into());
        }
        let cluster = self.state.lock().first_cluster;
        let (entry, _) = self
            .volume
            .find_entry(cluster, name)?
            .ok_or(FsError::NotFound)?;

        if entry.is_directory() && entry.first_cluster >= 2 {
            let children = self.volume.read_dir(entry.first_cluster)?;
            if !children.is_empty() {
                return Err(FsError::DirectoryNotEmpty.into());
            }
        }

        self.volume.remove_entry(cluster, name)?;
        invalidate_cache(self.volume.volume_id);
        Ok(())
    }
}

/// A mounted FAT32 filesystem, VFS-facing.
pub struct Fat32Fs {
    volume: Arc<Fat32Volume>,
}

impl Fat32Fs {
    pub fn new(volume: Fat32Volume) -> Self {
        Self {
            volume: Arc::new(volume),
        }
    }

    pub fn root(&self) -> Arc<dyn VfsNode> {
        Arc::new(Fat32Node::root(self.volume.clone()))
    }
}
