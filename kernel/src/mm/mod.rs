//! Memory management for the CinderOS kernel.
//!
//! Layered bottom-up: the physical frame allocator owns all RAM, the
//! virtual memory manager owns the two-level i386 page tables (reached
//! through the recursive directory slot), the kernel heap carves
//! variable-size blocks out of a reserved virtual region, and the VMA
//! layer gives each process its demand-paged, copy-on-write view.

pub mod frame_allocator;
pub mod heap;
pub mod page_fault;
pub mod page_table;
pub mod user_validation;
pub mod vma;
pub mod vmm;

pub use frame_allocator::{FrameNumber, PhysicalAddress, FRAME_SIZE};
pub use page_table::PageFlags;

/// Size of a virtual page, equal to the physical frame size.
pub const PAGE_SIZE: u32 = FRAME_SIZE;

/// Everything at or above this virtual address belongs to the kernel and is
/// present in every address space. User mappings live strictly below it.
pub const KERNEL_SPLIT: u32 = 0xC000_0000;

/// Kernel heap virtual region, above the kernel image mapping.
pub const KERNEL_HEAP_START: u32 = 0xD000_0000;
/// Maximum bytes the kernel heap may grow to.
pub const KERNEL_HEAP_MAX: u32 = 0x0400_0000; // 64 MiB

/// User mmap region handed out by the VMA layer.
pub const USER_MMAP_START: u32 = 0x4000_0000;
pub const USER_MMAP_END: u32 = 0x8000_0000;

/// User stack window. Faults inside it grow the stack downward.
pub const USER_STACK_TOP: u32 = 0xBFFF_F000;
pub const USER_STACK_BOTTOM: u32 = 0xBF80_0000;

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u32);

impl VirtualAddress {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Round down to the containing page boundary.
    pub const fn page_base(&self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    pub const fn is_user(&self) -> bool {
        self.0 < KERNEL_SPLIT
    }

    pub const fn offset(&self, delta: u32) -> Self {
        Self(self.0.wrapping_add(delta))
    }
}

/// Round a byte count up to a whole number of pages.
pub const fn page_align_up(len: u32) -> u32 {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}


#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn page_rounding() {
        assert_eq!(page_align_up(0), 0);
        assert_eq!(page_align_up(1), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE + 1), 2 * PAGE_SIZE);
    }

    #[test]
    fn address_classification() {
        assert!(VirtualAddress::new(0x4000_0000).is_user());
        assert!(!VirtualAddress::new(KERNEL_SPLIT).is_user());
        assert_eq!(
            VirtualAddress::new(0x4000_0123).page_base(),
            VirtualAddress::new(0x4000_0000)
        );
    }
}
