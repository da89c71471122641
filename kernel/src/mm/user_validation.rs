//! User-space pointer validation for the syscall gate.
//!
//! Every pointer argument crossing the trap boundary is checked before the
//! kernel dereferences it: the whole range must sit below the user/kernel
//! split and every page in it must currently be mapped. Strings are
//! additionally walked to a NUL terminator without leaving mapped user
//! pages.

use super::{vmm, VirtualAddress, KERNEL_SPLIT, PAGE_SIZE};
use crate::error::{KernelResult, SyscallError};

/// Validate that `[ptr, ptr + size)` lies in mapped user memory.
pub fn validate_user_ptr(ptr: u32, size: u32) -> KernelResult<()> {
    if size == 0 {
        return Ok(());
    }
    let end = ptr
        .checked_add(size)
        .ok_or(SyscallError::InvalidPointer { addr: ptr })?;
    if ptr >= KERNEL_SPLIT || end > KERNEL_SPLIT {
        return Err(SyscallError::InvalidPointer { addr: ptr }.into());
    }

    let mut page = VirtualAddress::new(ptr).page_base().as_u32();
    while page < end {
        if !vmm::is_mapped(VirtualAddress::new(page)) {
            return Err(SyscallError::InvalidPointer { addr: page }.into());
        }
        match page.checked_add(PAGE_SIZE) {
            Some(next) => page = next,
            None => break,
        }
    }
    Ok(())
}

/// Validate a NUL-terminated user string of at most `max_len` bytes and
/// return its length (excluding the terminator).
pub fn validate_user_string(ptr: u32, max_len: u32) -> KernelResult<u32> {
    if ptr >= KERNEL_SPLIT {
        return Err(SyscallError::InvalidString { addr: ptr }.into());
    }

    let mut addr = ptr;
    let mut len = 0;
    while len < max_len {
        if addr >= KERNEL_SPLIT {
            return Err(SyscallError::InvalidString { addr }.into());
        }
        // Page-granular mapping check; bytes within one page share it.
        if addr == ptr || addr % PAGE_SIZE == 0 {
            if !vmm::is_mapped(VirtualAddress::new(addr)) {
                return Err(SyscallError::InvalidString { addr }.into());
            }
        }
        if read_user_byte(addr) == 0 {
            return Ok(len);
        }
        addr = addr
            .checked_add(1)
            .ok_or(SyscallError::InvalidString { addr: ptr })?;
        len += 1;
    }
    Err(SyscallError::InvalidString { addr: ptr }.into())
}

/// Read one byte of user memory. The page was checked as mapped.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn read_user_byte(addr: u32) -> u8 {
    // SAFETY: the caller verified the containing page is user-mapped, and
    // the kernel shares the user address space on this architecture.
    unsafe { core::ptr::read_volatile(addr as *const u8) }
}

/// Hosted double: user addresses are not real memory here; report NUL so
/// validation exercises only the mapping walk.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn read_user_byte(_addr: u32) -> u8 {
    0
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::PageFlags;

    #[test]
    fn kernel_range_pointers_are_rejected() {
        assert!(validate_user_ptr(KERNEL_SPLIT, 4).is_err());
        assert!(validate_user_ptr(KERNEL_SPLIT - 4, 16).is_err());
        assert!(validate_user_ptr(0xFFFF_FFF0, 0x20).is_err(), "wrapping range");
    }

    #[test]
    fn unmapped_pages_are_rejected_mapped_accepted() {
        let base = 0x3000_0000;
        assert!(validate_user_ptr(base, 4).is_err(), "nothing mapped yet");

        vmm::map_page(
            VirtualAddress::new(base),
            crate::mm::PhysicalAddress::new(0x9_0000),
            PageFlags::USER_RW,
        )
        .expect("map succeeds");
        assert!(validate_user_ptr(base, PAGE_SIZE).is_ok());
        // Range spilling into the next (unmapped) page fails.
        assert!(validate_user_ptr(base + PAGE_SIZE - 2, 4).is_err());

        vmm::unmap_page(VirtualAddress::new(base));
    }

    #[test]
    fn zero_size_is_trivially_valid() {
        assert!(validate_user_ptr(0x1000, 0).is_ok());
    }

    #[test]
    fn string_validation_needs_mapped_start() {
        let base = 0x3100_0000;
        assert!(validate_user_string(base, 64).is_err());
        assert!(validate_user_string(KERNEL_SPLIT + 1, 64).is_err());

        vmm::map_page(
            VirtualAddress::new(base),
            crate::mm::PhysicalAddress::new(0xA_0000),
            PageFlags::USER_RO,
        )
        .expect("map succeeds");
        // The hosted double reads NUL immediately: a zero-length string.
        assert_eq!(validate_user_string(base, 64).expect("valid string"), 0);
        vmm::unmap_page(VirtualAddress::new(base));
    }
}
