//! Open-file bookkeeping: per-process descriptor tables, open flags, and
//! seek origins.

use alloc::sync::Arc;

use super::VfsNode;
use crate::error::{KernelError, KernelResult};

/// Descriptors per process. 0/1/2 are reserved for the standard streams.
pub const MAX_FDS: usize = 16;

/// Open flags, decoded from the classic numeric form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub create: bool,
    pub truncate: bool,
    pub close_on_exec: bool,
}

impl OpenFlags {
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            close_on_exec: false,
        }
    }

    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            append: false,
            create: false,
            truncate: false,
            close_on_exec: false,
        }
    }

    /// Decode the numeric flags user code passes to `open`.
    pub fn from_bits(bits: u32) -> Self {
        let accmode = bits & 0x3;
        Self {
            read: accmode == 0 || accmode == 2,
            write: accmode == 1 || accmode == 2,
            create: bits & 0x40 != 0,
            truncate: bits & 0x200 != 0,
            append: bits & 0x400 != 0,
            close_on_exec: bits & 0x8_0000 != 0,
        }
    }
}

/// Seek origin for `lseek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Set(i64),
    Current(i64),
    End(i64),
}

/// One descriptor slot: a VFS node or a pipe end, with a file offset.
#[derive(Clone)]
pub struct FdEntry {
    pub in_use: bool,
    pub node: Option<Arc<dyn VfsNode>>,
    /// Pipe table index, when this fd is a pipe end
    pub pipe: Option<usize>,
    pub offset: usize,
    pub flags: OpenFlags,
}

impl FdEntry {
    pub const fn empty() -> Self {
        Self {
            in_use: false,
            node: None,
            pipe: None,
            offset: 0,
            flags: OpenFlags::read_only(),
        }
    }
}

/// Per-process descriptor table.
#[derive(Clone)]
pub struct FdTable {
    entries: [FdEntry; MAX_FDS],
}

impl FdTable {
    pub const fn new() -> Self {
        let mut table = Self {
            entries: [const { FdEntry::empty() }; MAX_FDS],
        };
        // The standard streams exist from birth; their backing nodes are
        // wired by the console layer outside the core.
        table.entries[0].in_use = true;
        table.entries[1].in_use = true;
        table.entries[2].in_use = true;
        table
    }

    /// Claim the lowest free descriptor at or above 3.
    pub fn alloc(&mut self) -> KernelResult<usize> {
        for (fd, entry) in self.entries.iter_mut().enumerate().skip(3) {
            if !entry.in_use {
                *entry = FdEntry::empty();
                entry.in_use = true;
                return Ok(fd);
            }
        }
        Err(KernelError::BadDescriptor)
    }

    pub fn get(&self, fd: usize) -> KernelResult<&FdEntry> {
        self.entries
            .get(fd)
            .filter(|e| e.in_use)
            .ok_or(KernelError::BadDescriptor)
    }

    pub fn get_mut(&mut self, fd: usize) -> KernelResult<&mut FdEntry> {
        self.entries
            .get_mut(fd)
            .filter(|e| e.in_use)
            .ok_or(KernelError::BadDescriptor)
    }

    pub fn close(&mut self, fd: usize) -> KernelResult<()> {
        let entry = self.get_mut(fd)?;
        if let Some(node) = entry.node.take() {
            let _ = node.close();
        }
        *entry = FdEntry::empty();
        Ok(())
    }

    /// Drop every descriptor marked close-on-exec. Called by exec.
    pub fn close_cloexec(&mut self) {
        for entry in self.entries.iter_mut().skip(3) {
            if entry.in_use && entry.flags.close_on_exec {
                if let Some(node) = entry.node.take() {
                    let _ = node.close();
                }
                *entry = FdEntry::empty();
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &FdEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.in_use)
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn standard_streams_are_reserved() {
        let table = FdTable::new();
        assert!(table.get(0).is_ok());
        assert!(table.get(1).is_ok());
        assert!(table.get(2).is_ok());
        assert!(table.get(3).is_err());
    }

    #[test]
    fn alloc_starts_at_three_and_close_releases() {
        let mut table = FdTable::new();
        let fd = table.alloc().expect("free descriptors exist");
        assert_eq!(fd, 3);
        let fd2 = table.alloc().expect("free descriptors exist");
        assert_eq!(fd2, 4);

        table.close(fd).expect("closing an open fd succeeds");
        assert!(table.get(fd).is_err());
        // Lowest-free policy hands the slot out again.
        assert_eq!(table.alloc().expect("slot reusable"), 3);
    }

    #[test]
    fn table_exhaustion_is_reported() {
        let mut table = FdTable::new();
        for _ in 3..MAX_FDS {
            table.alloc().expect("filling the table");
        }
        assert_eq!(table.alloc(), Err(KernelError::BadDescriptor));
    }

    #[test]
    fn cloexec_entries_are_dropped_together() {
        let mut table = FdTable::new();
        let keep = table.alloc().expect("fd");
        let drop_fd = table.alloc().expect("fd");
        table.get_mut(drop_fd).unwrap().flags.close_on_exec = true;

        table.close_cloexec();
        assert!(table.get(keep).is_ok());
        assert!(table.get(drop_fd).is_err());
    }

    #[test]
    fn open_flags_decode() {
        let flags = OpenFlags::from_bits(0x2 | 0x40 | 0x400);
        assert!(flags.read && flags.write && flags.create && flags.append);
        assert!(!flags.truncate);

        let ro = OpenFlags::from_bits(0);
        assert!(ro.read && !ro.write);

        let wo = OpenFlags::from_bits(1 | 0x8_0000);
        assert!(!wo.read && wo.write && wo.close_on_exec);
    }
}
