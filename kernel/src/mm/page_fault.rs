//! Page-fault resolution.
//!
//! Called from the exception path with the faulting address and the
//! architectural error code. Resolution order: copy-on-write duplication
//! for writes to present pages in a COW area, demand allocation for lazy
//! areas, then downward user-stack growth. Anything else is fatal for the
//! faulting process.

use super::{
    frame_allocator, vma, vmm, PageFlags, VirtualAddress, USER_STACK_BOTTOM, USER_STACK_TOP,
};
use crate::error::{KernelError, KernelResult};

/// Page-fault error code bits pushed by the CPU.
pub const FAULT_PRESENT: u32 = 1 << 0;
pub const FAULT_WRITE: u32 = 1 << 1;
pub const FAULT_USER: u32 = 1 << 2;

/// Resolve a page fault for `pid`. `Ok(())` means the access should be
/// retried; an error means the process must be terminated.
pub fn handle_page_fault(pid: u32, fault_addr: u32, error_code: u32) -> KernelResult<()> {
    log::trace!(
        "page fault: pid {} addr {:#010x} err {:#x}",
        pid,
        fault_addr,
        error_code
    );

    // Write to a present page: the only legitimate cause is copy-on-write.
    if error_code & FAULT_PRESENT != 0 && error_code & FAULT_WRITE != 0 {
        if resolve_cow(pid, fault_addr)? {
            return Ok(());
        }
    }

    // Absent page inside a lazy area: materialize it.
    if resolve_demand(pid, fault_addr)? {
        return Ok(());
    }

    // Absent page in the stack window: grow the stack one page.
    if resolve_stack_growth(fault_addr)? {
        return Ok(());
    }

    Err(KernelError::BadAddress { addr: fault_addr })
}

/// Duplicate a copy-on-write page for the faulting process. Returns
/// `Ok(false)` when the address is not governed by a COW area.
fn resolve_cow(pid: u32, fault_addr: u32) -> KernelResult<bool> {
    let page = VirtualAddress::new(fault_addr).page_base();

    let governed = vma::with_table(pid, |table| {
        matches!(
            table.find(fault_addr),
            Some(vma) if vma.cow && vma.prot.contains(vma::Prot::WRITE)
        )
    })?;
    if !governed {
        return Ok(false);
    }

    let old_phys = match vmm::get_physical(page) {
        Some(p) => p,
        None => return Ok(false),
    };

    let new_phys = frame_allocator::alloc_frame()?;
    if let Err(e) = vmm::copy_page(page, new_phys) {
        frame_allocator::free_frame(new_phys);
        return Err(e);
    }

    // The old frame may still back another address space; the sharer that
    // faults last keeps it, so only the mapping moves here.
    vmm::unmap_page(page);
    if let Err(e) = vmm::map_page(page, new_phys, PageFlags::USER_RW) {
        frame_allocator::free_frame(new_phys);
        return Err(e);
    }
    let _ = old_phys;

    log::debug!("cow: pid {} copied page {:#010x}", pid, page.as_u32());
    Ok(true)
}

/// Materialize a page of a lazy area. Returns `Ok(false)` when no lazy
/// area covers the address.
fn resolve_demand(pid: u32, fault_addr: u32) -> KernelResult<bool> {
    let page = VirtualAddress::new(fault_addr).page_base();

    let area = vma::with_table(pid, |table| table.find(fault_addr).copied())?;
    let Some(area) = area else {
        return Ok(false);
    };
    if !area.lazy || vmm::is_mapped(page) {
        return Ok(false);
    }

    let phys = frame_allocator::alloc_frame()?;
    if let Err(e) = vmm::map_page(page, phys, area.page_flags()) {
        frame_allocator::free_frame(phys);
        return Err(e);
    }
    if area.flags.contains(vma::VmaFlags::ANONYMOUS) {
        vmm::zero_page(page);
    }

    log::debug!("demand: pid {} mapped page {:#010x}", pid, page.as_u32());
    Ok(true)
}

/// Grow the user stack downward by one page. Returns `Ok(false)` when the
/// address is outside the stack window.
fn resolve_stack_growth(fault_addr: u32) -> KernelResult<bool> {
    if !(USER_STACK_BOTTOM..USER_STACK_TOP).contains(&fault_addr) {
        return Ok(false);
    }

    let page = VirtualAddress::new(fault_addr).page_base();
    if vmm::is_mapped(page) {
        return Ok(false);
    }

    let phys = frame_allocator::alloc_frame()?;
    if let Err(e) = vmm::map_page(page, phys, PageFlags::USER_RW) {
        frame_allocator::free_frame(phys);
        return Err(e);
    }
    vmm::zero_page(page);

    log::debug!("stack: grew to {:#010x}", page.as_u32());
    Ok(true)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testing::ensure_frame_pool;
    use crate::mm::vma::{Prot, VmaBacking, VmaFlags};
    use crate::mm::PAGE_SIZE;

    #[test]
    fn lazy_area_faults_in_with_area_protection() {
        ensure_frame_pool();
        let pid = 50;
        let base = 0x4100_0000;
        vma::with_table(pid, |t| {
            t.create(
                base,
                base + 2 * PAGE_SIZE,
                Prot::READ,
                VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
                VmaBacking::Anonymous,
            )
            .map(|_| ())
        })
        .unwrap()
        .expect("area fits");

        assert!(!vmm::is_mapped(VirtualAddress::new(base)));
        handle_page_fault(pid, base + 0x10, FAULT_USER).expect("lazy fault resolves");
        assert!(vmm::is_mapped(VirtualAddress::new(base)));

        let flags = vmm::entry_flags(VirtualAddress::new(base)).expect("page mapped");
        assert!(flags.contains(PageFlags::USER));
        assert!(!flags.contains(PageFlags::WRITABLE), "read-only area");

        vma::release_process(pid);
    }

    #[test]
    fn cow_write_gets_private_writable_page() {
        ensure_frame_pool();
        let pid = 51;
        let base = 0x4200_0000;
        vma::with_table(pid, |t| {
            let area = t
                .create(
                    base,
                    base + PAGE_SIZE,
                    Prot::READ | Prot::WRITE,
                    VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
                    VmaBacking::Anonymous,
                )
                .expect("area fits");
            area.cow = true;
        })
        .unwrap();

        // Simulate the shared read-only page left behind by fork.
        let shared = frame_allocator::alloc_frame().expect("frame available");
        vmm::map_page(VirtualAddress::new(base), shared, PageFlags::USER_RO)
            .expect("mapping succeeds");

        handle_page_fault(pid, base + 4, FAULT_PRESENT | FAULT_WRITE | FAULT_USER)
            .expect("cow fault resolves");

        let now = vmm::get_physical(VirtualAddress::new(base)).expect("still mapped");
        assert_ne!(now, shared, "fault installed a private copy");
        let flags = vmm::entry_flags(VirtualAddress::new(base)).expect("mapped");
        assert!(flags.contains(PageFlags::WRITABLE));

        frame_allocator::free_frame(shared);
        vma::release_process(pid);
    }

    #[test]
    fn stack_window_grows_on_fault() {
        ensure_frame_pool();
        // Deep in the window, clear of the eagerly-mapped pages at the top.
        let addr = USER_STACK_BOTTOM + 16 * PAGE_SIZE + 8;
        let page = VirtualAddress::new(addr).page_base();
        assert!(!vmm::is_mapped(page));

        handle_page_fault(52, addr, FAULT_USER | FAULT_WRITE).expect("stack growth resolves");
        assert!(vmm::is_mapped(page));
        let flags = vmm::entry_flags(page).expect("mapped");
        assert!(flags.contains(PageFlags::USER | PageFlags::WRITABLE));

        // Cleanup so other tests see a pristine window.
        if let Some(p) = vmm::get_physical(page) {
            vmm::unmap_page(page);
            frame_allocator::free_frame(p);
        }
    }

    #[test]
    fn marked_cow_area_write_protects_then_duplicates() {
        ensure_frame_pool();
        let pid = 54;
        let base = 0x4300_0000;
        vma::with_table(pid, |t| {
            t.create(
                base,
                base + PAGE_SIZE,
                Prot::READ | Prot::WRITE,
                VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
                VmaBacking::Anonymous,
            )
            .map(|_| ())
        })
        .unwrap()
        .expect("area fits");

        let frame = frame_allocator::alloc_frame().expect("frame");
        vmm::map_page(VirtualAddress::new(base), frame, PageFlags::USER_RW).expect("map");

        vma::mark_cow(pid, base).expect("mark");
        let flags = vmm::entry_flags(VirtualAddress::new(base)).expect("mapped");
        assert!(!flags.contains(PageFlags::WRITABLE), "write bit withdrawn");

        handle_page_fault(pid, base, FAULT_PRESENT | FAULT_WRITE | FAULT_USER)
            .expect("duplication resolves the write");
        let flags = vmm::entry_flags(VirtualAddress::new(base)).expect("mapped");
        assert!(flags.contains(PageFlags::WRITABLE), "private copy is writable");

        frame_allocator::free_frame(frame);
        vma::release_process(pid);
    }

    #[test]
    fn unresolvable_fault_is_fatal() {
        ensure_frame_pool();
        let err = handle_page_fault(53, 0x2000_0000, FAULT_USER).expect_err("no area covers this");
        assert_eq!(err, KernelError::BadAddress { addr: 0x2000_0000 });
    }
}
