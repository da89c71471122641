//! i386 two-level page table structures.
//!
//! A page directory holds 1024 entries, each naming a page table of 1024
//! entries, each mapping one 4 KiB page. The last directory slot is the
//! recursive slot: it points back at the directory's own frame, which makes
//! every page table visible at `PT_WINDOW_BASE + pde_index * 4096` and the
//! directory itself visible at `PD_WINDOW` without any temporary mapping.

use bitflags::bitflags;

use super::{PhysicalAddress, VirtualAddress, PAGE_SIZE};

/// Entries per page directory / page table.
pub const PAGE_TABLE_ENTRIES: usize = 1024;

/// Directory slot reserved for the recursive mapping.
pub const RECURSIVE_INDEX: usize = 1023;

/// Base of the 4 MiB window through which all page tables are addressable.
pub const PT_WINDOW_BASE: u32 = 0xFFC0_0000;

/// Virtual address of the page directory itself (the recursive slot taken
/// twice).
pub const PD_WINDOW: u32 = 0xFFFF_F000;

/// One page held aside in kernel space for short-lived mappings (the
/// copy-on-write duplication path).
pub const TEMP_MAP_WINDOW: u32 = 0xFFBF_F000;

bitflags! {
    /// Architectural page entry flags (PDE and PTE share the low bits).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
    }
}

impl PageFlags {
    /// Flags for kernel-owned mappings.
    pub const KERNEL: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITABLE);

    /// Flags for a read-only user mapping.
    pub const USER_RO: PageFlags = PageFlags::PRESENT.union(PageFlags::USER);

    /// Flags for a writable user mapping.
    pub const USER_RW: PageFlags = Self::USER_RO.union(PageFlags::WRITABLE);
}

/// A single page directory or page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(frame: PhysicalAddress, flags: PageFlags) -> Self {
        Self((frame.as_u32() & !(PAGE_SIZE - 1)) | flags.bits())
    }

    pub fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & !(PAGE_SIZE - 1))
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// A page-aligned table of 1024 entries.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }
}

/// Directory index for a virtual address (top ten bits).
pub const fn pde_index(virt: VirtualAddress) -> usize {
    (virt.as_u32() >> 22) as usize
}

/// Table index for a virtual address (next ten bits).
pub const fn pte_index(virt: VirtualAddress) -> usize {
    ((virt.as_u32() >> 12) & 0x3FF) as usize
}

/// Virtual address of the page table covering `virt`, as seen through the
/// recursive window.
pub const fn table_window(virt: VirtualAddress) -> u32 {
    PT_WINDOW_BASE + (pde_index(virt) as u32) * PAGE_SIZE
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn index_split() {
        let v = VirtualAddress::new(0xE000_1234);
        assert_eq!(pde_index(v), 0xE00 >> 2); // 0x380
        assert_eq!(pte_index(v), 0x001);
        assert_eq!(pde_index(VirtualAddress::new(0)), 0);
        assert_eq!(pde_index(VirtualAddress::new(0xFFFF_FFFF)), 1023);
    }

    #[test]
    fn recursive_window_math() {
        // The table for address 0 sits at the base of the window; the table
        // for the recursive slot itself is the directory window.
        assert_eq!(table_window(VirtualAddress::new(0)), PT_WINDOW_BASE);
        assert_eq!(table_window(VirtualAddress::new(0xFFC0_0000)), PD_WINDOW);
    }

    #[test]
    fn entry_packs_frame_and_flags() {
        let e = PageTableEntry::new(PhysicalAddress::new(0x1234_5000), PageFlags::USER_RW);
        assert!(e.is_present());
        assert_eq!(e.frame(), PhysicalAddress::new(0x1234_5000));
        assert!(e.flags().contains(PageFlags::USER | PageFlags::WRITABLE));

        let mut e = e;
        e.clear();
        assert!(!e.is_present());
    }
}
