//! FAT32 directory operations: 8.3 entries, enumeration, lookup,
//! creation, and removal.

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use super::Fat32Volume;
use crate::error::{FsError, KernelResult};

/// Bytes per raw directory entry.
pub const DIRENT_SIZE: usize = 32;

const NAME_FREE: u8 = 0x00;
const NAME_DELETED: u8 = 0xE5;

bitflags! {
    /// Directory entry attribute bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN    = 0x02;
        const SYSTEM    = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE   = 0x20;
    }
}

/// The attribute combination marking a long-filename fragment.
pub const ATTR_LFN: u8 = 0x0F;

/// A decoded directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fat32DirEntry {
    pub name: String,
    pub attr: Attributes,
    pub first_cluster: u32,
    pub size: u32,
}

impl Fat32DirEntry {
    pub fn is_directory(&self) -> bool {
        self.attr.contains(Attributes::DIRECTORY)
    }
}

/// Where an entry lives on disk, for in-place updates.
#[derive(Debug, Clone, Copy)]
pub struct EntrySlot {
    pub cluster: u32,
    pub index: usize,
}

/// Render the 11-byte on-disk name as `NAME.EXT`.
fn format_83(raw: &[u8]) -> String {
    let mut name = String::new();
    for &b in raw[..8].iter().take_while(|&&b| b != b' ') {
        name.push(b as char);
    }
    if raw[8] != b' ' {
        name.push('.');
        for &b in raw[8..11].iter().take_while(|&&b| b != b' ') {
            name.push(b as char);
        }
    }
    name
}

/// Pack a `name.ext` string into the 11-byte on-disk form, upper-cased
/// and space-padded.
pub fn name_to_83(name: &str) -> [u8; 11] {
    let mut packed = [b' '; 11];
    let mut chars = name.bytes();

    let mut i = 0;
    for b in chars.by_ref() {
        if b == b'.' {
            break;
        }
        if i < 8 {
            packed[i] = b.to_ascii_uppercase();
            i += 1;
        }
    }
    let mut j = 8;
    for b in chars {
        if b == b'.' {
            continue;
        }
        if j < 11 {
            packed[j] = b.to_ascii_uppercase();
            j += 1;
        }
    }
    packed
}

fn decode(raw: &[u8]) -> Fat32DirEntry {
    let cluster_hi = u16::from_le_bytes([raw[20], raw[21]]) as u32;
    let cluster_lo = u16::from_le_bytes([raw[26], raw[27]]) as u32;
    Fat32DirEntry {
        name: format_83(raw),
        attr: Attributes::from_bits_truncate(raw[11]),
        first_cluster: (cluster_hi << 16) | cluster_lo,
        size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
    }
}

impl Fat32Volume {
    /// Walk a directory chain, handing every live 8.3 entry to `visit`.
    /// Deleted slots, long-filename fragments, and the volume label are
    /// skipped. Returns the number of entries delivered.
    pub fn list_dir(
        &self,
        dir_cluster: u32,
        mut visit: impl FnMut(&Fat32DirEntry),
    ) -> KernelResult<usize> {
        let mut count = 0;
        self.walk_dir(dir_cluster, |entry, _slot| {
            visit(entry);
            count += 1;
            false
        })?;
        Ok(count)
    }

    /// Collecting form of [`list_dir`](Self::list_dir).
    pub fn read_dir(&self, dir_cluster: u32) -> KernelResult<Vec<Fat32DirEntry>> {
        let mut entries = Vec::new();
        self.list_dir(dir_cluster, |entry| entries.push(entry.clone()))?;
        Ok(entries)
    }

    /// Find an entry by name, case-insensitively.
    pub fn find_entry(
        &self,
        dir_cluster: u32,
        name: &str,
    ) -> KernelResult<Option<(Fat32DirEntry, EntrySlot)>> {
        let mut found = None;
        self.walk_dir(dir_cluster, |entry, slot| {
            if entry.name.eq_ignore_ascii_case(name) {
                found = Some((entry.clone(), slot));
                true
            } else {
                false
            }
        })?;
        Ok(found)
    }

    /// Shared directory walk. `visit` returns true to stop early.
    fn walk_dir(
        &self,
        dir_cluster: u32,
        mut visit: impl FnMut(&Fat32DirEntry, EntrySlot) -> bool,
    ) -> KernelResult<()> {
        let mut buf = self.cluster_buf();
        let entries_per_cluster = self.cluster_bytes() / DIRENT_SIZE;

        let mut cluster = Some(dir_cluster);
        while let Some(current) = cluster {
            self.read_cluster(current, &mut buf)?;

            for i in 0..entries_per_cluster {
                let raw = &buf[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE];
                match raw[0] {
                    NAME_FREE => return Ok(()),
                    NAME_DELETED => continue,
                    _ => {}
                }
                if raw[11] == ATTR_LFN {
                    continue;
                }
                if raw[11] & Attributes::VOLUME_ID.bits() != 0 {
                    continue;
                }

                let entry = decode(raw);
                if visit(&entry, EntrySlot { cluster: current, index: i }) {
                    return Ok(());
                }
            }
            cluster = self.next_cluster(current)?;
        }
        Ok(())
    }

    /// Create a fresh 8.3 entry in a directory, extending the directory
    /// chain when every slot is taken. For directories one cluster is
    /// allocated and zeroed. Returns the new entry's first cluster
    /// (0 for an empty file).
    pub fn create_entry(
        &self,
        dir_cluster: u32,
        name: &str,
        attr: Attributes,
    ) -> KernelResult<u32> {
        if self.find_entry(dir_cluster, name)?.is_some() {
            return Err(FsError::AlreadyExists.into());
        }

        let mut buf = self.cluster_buf();
        let entries_per_cluster = self.cluster_bytes() / DIRENT_SIZE;
        let name83 = name_to_83(name);

        let mut cluster = dir_cluster;
        loop {
            self.read_cluster(cluster, &mut buf)?;

            for i in 0..entries_per_cluster {
                let offset = i * DIRENT_SIZE;
                let lead = buf[offset];
                if lead != NAME_FREE && lead != NAME_DELETED {
                    continue;
                }

                let new_cluster = if attr.contains(Attributes::DIRECTORY) {
                    let c = self.alloc_cluster()?;
                    let zero = self.cluster_buf();
                    self.write_cluster(c, &zero)?;
                    c
                } else {
                    0
                };

                let raw = &mut buf[offset..offset + DIRENT_SIZE];
                raw.fill(0);
                raw[..11].copy_from_slice(&name83);
                raw[11] = attr.bits();
                raw[20..22].copy_from_slice(&(((new_cluster >> 16) & 0xFFFF) as u16).to_le_bytes());
                raw[26..28].copy_from_slice(&((new_cluster & 0xFFFF) as u16).to_le_bytes());
                raw[28..32].copy_from_slice(&0u32.to_le_bytes());

                self.write_cluster(cluster, &buf)?;
                return Ok(new_cluster);
            }

            // Directory full: extend the chain with a zeroed cluster.
            cluster = match self.next_cluster(cluster)? {
                Some(next) => next,
                None => {
                    let next = self.alloc_cluster()?;
                    self.set_cluster(cluster, next)?;
                    let zero = self.cluster_buf();
                    self.write_cluster(next, &zero)?;
                    next
                }
            };
        }
    }

    /// Rewrite an entry's size (and first cluster, when it gained one).
    pub fn update_entry(
        &self,
        dir_cluster: u32,
        name: &str,
        new_size: u32,
        new_cluster: u32,
    ) -> KernelResult<()> {
        let (_, slot) = self
            .find_entry(dir_cluster, name)?
            .ok_or(FsError::NotFound)?;

        let mut buf = self.cluster_buf();
        self.read_cluster(slot.cluster, &mut buf)?;
        let raw = &mut buf[slot.index * DIRENT_SIZE..(slot.index + 1) * DIRENT_SIZE];
        raw[28..32].copy_from_slice(&new_size.to_le_bytes());
        if new_cluster != 0 {
            raw[20..22].copy_from_slice(&(((new_cluster >> 16) & 0xFFFF) as u16).to_le_bytes());
            raw[26..28].copy_from_slice(&((new_cluster & 0xFFFF) as u16).to_le_bytes());
        }
        self.write_cluster(slot.cluster, &buf)
    }

    /// Remove an entry: free its chain, then mark the slot deleted.
    pub fn remove_entry(&self, dir_cluster: u32, name: &str) -> KernelResult<()> {
        let (entry, slot) = self
            .find_entry(dir_cluster, name)?
            .ok_or(FsError::NotFound)?;

        if entry.first_cluster >= 2 {
            self.free_cluster_chain(entry.first_cluster)?;
        }

        let mut buf = self.cluster_buf();
        self.read_cluster(slot.cluster, &mut buf)?;
        buf[slot.index * DIRENT_SIZE] = NAME_DELETED;
        self.write_cluster(slot.cluster, &buf)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::super::testing::fresh_volume;
    use super::*;

    #[test]
    fn names_pack_and_format() {
        assert_eq!(&name_to_83("test.txt"), b"TEST    TXT");
        assert_eq!(&name_to_83("A.B"), b"A       B  ");
        assert_eq!(&name_to_83("NOEXT"), b"NOEXT      ");
        assert_eq!(&name_to_83("longfilename.text"), b"LONGFILETEX");

        assert_eq!(format_83(b"TEST    TXT"), "TEST.TXT");
        assert_eq!(format_83(b"NOEXT      "), "NOEXT");
    }

    #[test]
    fn created_entries_are_listed_and_found() {
        let (_disk, volume) = fresh_volume();
        let root = volume.root_cluster;

        volume
            .create_entry(root, "hello.txt", Attributes::ARCHIVE)
            .expect("create file entry");
        volume
            .create_entry(root, "data", Attributes::DIRECTORY)
            .expect("create directory entry");

        let entries = volume.read_dir(root).expect("read dir");
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().any(|e| e.name == "HELLO.TXT"));
        let dir = entries.iter().find(|e| e.name == "DATA").expect("dir entry");
        assert!(dir.is_directory());
        assert!(dir.first_cluster >= 2, "directories get a cluster");

        // Lookup is case-insensitive.
        let (found, _) = volume
            .find_entry(root, "HeLLo.TxT")
            .expect("walk succeeds")
            .expect("entry exists");
        assert_eq!(found.size, 0);
        assert_eq!(found.first_cluster, 0, "empty files start chainless");

        assert!(volume
            .find_entry(root, "missing.txt")
            .expect("walk succeeds")
            .is_none());
    }

    #[test]
    fn duplicate_names_are_refused() {
        let (_disk, volume) = fresh_volume();
        let root = volume.root_cluster;
        volume
            .create_entry(root, "dup", Attributes::ARCHIVE)
            .expect("first create");
        assert!(volume.create_entry(root, "DUP", Attributes::ARCHIVE).is_err());
    }

    #[test]
    fn remove_marks_deleted_and_frees_chain() {
        let (_disk, volume) = fresh_volume();
        let root = volume.root_cluster;
        let dir_cluster = volume
            .create_entry(root, "victim", Attributes::DIRECTORY)
            .expect("create");

        volume.remove_entry(root, "victim").expect("remove");
        assert!(volume
            .find_entry(root, "victim")
            .expect("walk succeeds")
            .is_none());
        // The directory's cluster returned to the free pool.
        assert_eq!(volume.alloc_cluster().expect("realloc"), dir_cluster);
    }

    #[test]
    fn directory_grows_past_one_cluster() {
        let (_disk, volume) = fresh_volume();
        let root = volume.root_cluster;
        // One cluster holds 16 entries at 512 bytes; create more.
        for i in 0..20 {
            let name = alloc::format!("F{}.DAT", i);
            volume
                .create_entry(root, &name, Attributes::ARCHIVE)
                .expect("create");
        }
        assert_eq!(volume.read_dir(root).expect("read").len(), 20);
        assert!(volume.chain_length(root).expect("chain") >= 2);
    }

    #[test]
    fn update_entry_rewrites_size_and_cluster() {
        let (_disk, volume) = fresh_volume();
        let root = volume.root_cluster;
        volume
            .create_entry(root, "grow.bin", Attributes::ARCHIVE)
            .expect("create");

        volume
            .update_entry(root, "grow.bin", 3000, 7)
            .expect("update");
        let (entry, _) = volume
            .find_entry(root, "grow.bin")
            .expect("walk")
            .expect("exists");
        assert_eq!(entry.size, 3000);
        assert_eq!(entry.first_cluster, 7);
    }
}
