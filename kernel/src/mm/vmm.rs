//! Virtual memory manager.
//!
//! Owns the active address space's page tables. All structural access goes
//! through the recursive directory slot, so mapping or unmapping a page
//! never needs a temporary mapping of the tables themselves.
//!
//! On hosted builds (test runs) the same API is backed by a software page
//! map so the layers above (heap growth, VMA bookkeeping, fault
//! resolution, user pointer validation) run unmodified under the standard
//! test harness.

use super::{PageFlags, PhysicalAddress, VirtualAddress};
use crate::error::KernelResult;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    use super::*;
    use crate::arch;
    use crate::error::KernelError;
    use crate::mm::frame_allocator;
    use crate::mm::page_table::{
        pde_index, pte_index, table_window, PageTable, PageTableEntry, PD_WINDOW,
        RECURSIVE_INDEX, TEMP_MAP_WINDOW,
    };
    use crate::mm::PAGE_SIZE;

    /// The page directory of the running address space, reached through the
    /// recursive slot.
    ///
    /// # Safety
    ///
    /// Paging must be enabled with the recursive slot installed. The caller
    /// must hold off interrupts while the reference is alive.
    unsafe fn directory() -> &'static mut PageTable {
        // SAFETY: PD_WINDOW is the recursive slot applied twice; it resolves
        // to the directory frame in every address space we build.
        unsafe { &mut *(PD_WINDOW as *mut PageTable) }
    }

    /// The page table covering `virt`, reached through the recursive window.
    ///
    /// # Safety
    ///
    /// The covering PDE must be present.
    unsafe fn table_for(virt: VirtualAddress) -> &'static mut PageTable {
        // SAFETY: with the PDE present, the recursive window exposes the
        // table frame at this fixed location.
        unsafe { &mut *(table_window(virt) as *mut PageTable) }
    }

    pub fn map_page(
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        let virt = virt.page_base();
        let pde = pde_index(virt);
        if pde == RECURSIVE_INDEX {
            return Err(KernelError::BadArgument);
        }

        arch::without_interrupts(|| {
            // SAFETY: interrupts are off; the recursive slot is installed in
            // every directory this kernel builds.
            let dir = unsafe { directory() };

            if !dir.entries[pde].is_present() {
                let table_frame = frame_allocator::alloc_frame()?;
                // Directory entries stay USER so user-level PTE flags are
                // effective; the PTE is what actually gates access.
                dir.entries[pde] = PageTableEntry::new(
                    table_frame,
                    PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
                );
                arch::flush_tlb_page(table_window(virt));
                // SAFETY: the PDE was just installed, so the window now
                // exposes the fresh frame. It must be cleared before use.
                unsafe { table_for(virt).zero() };
            }

            // SAFETY: PDE is present (checked or just created).
            let table = unsafe { table_for(virt) };
            table.entries[pte_index(virt)] = PageTableEntry::new(phys, flags);
            arch::flush_tlb_page(virt.as_u32());
            Ok(())
        })
    }

    pub fn unmap_page(virt: VirtualAddress) {
        let virt = virt.page_base();
        arch::without_interrupts(|| {
            // SAFETY: interrupts are off; recursive slot installed.
            let dir = unsafe { directory() };
            if !dir.entries[pde_index(virt)].is_present() {
                return;
            }
            // SAFETY: PDE present.
            let table = unsafe { table_for(virt) };
            table.entries[pte_index(virt)].clear();
            arch::flush_tlb_page(virt.as_u32());
        });
    }

    pub fn is_mapped(virt: VirtualAddress) -> bool {
        get_physical(virt).is_some()
    }

    pub fn get_physical(virt: VirtualAddress) -> Option<PhysicalAddress> {
        let page = virt.page_base();
        arch::without_interrupts(|| {
            // SAFETY: interrupts are off; recursive slot installed.
            let dir = unsafe { directory() };
            if !dir.entries[pde_index(page)].is_present() {
                return None;
            }
            // SAFETY: PDE present.
            let entry = unsafe { table_for(page) }.entries[pte_index(page)];
            entry.is_present().then(|| entry.frame())
        })
    }

    pub fn entry_flags(virt: VirtualAddress) -> Option<PageFlags> {
        let page = virt.page_base();
        arch::without_interrupts(|| {
            // SAFETY: interrupts are off; recursive slot installed.
            let dir = unsafe { directory() };
            if !dir.entries[pde_index(page)].is_present() {
                return None;
            }
            // SAFETY: PDE present.
            let entry = unsafe { table_for(page) }.entries[pte_index(page)];
            entry.is_present().then(|| entry.flags())
        })
    }

    pub fn current_page_directory() -> PhysicalAddress {
        PhysicalAddress::new(arch::read_page_directory_base())
    }

    /// Copy one page of memory from a mapped source page to an unmapped
    /// destination frame, through the temporary kernel window.
    pub fn copy_page(src: VirtualAddress, dst_frame: PhysicalAddress) -> KernelResult<()> {
        let src = src.page_base();
        map_page(
            VirtualAddress::new(TEMP_MAP_WINDOW),
            dst_frame,
            PageFlags::KERNEL,
        )?;
        // SAFETY: src is a mapped page (the caller resolved it), and the
        // temp window was just mapped to dst_frame for exactly PAGE_SIZE
        // bytes. The regions cannot overlap: the window is kernel-reserved.
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.as_u32() as *const u8,
                TEMP_MAP_WINDOW as *mut u8,
                PAGE_SIZE as usize,
            );
        }
        unmap_page(VirtualAddress::new(TEMP_MAP_WINDOW));
        Ok(())
    }

    /// Zero-fill one mapped page.
    pub fn zero_page(virt: VirtualAddress) {
        let page = virt.page_base();
        // SAFETY: the caller just mapped this page writable.
        unsafe {
            core::ptr::write_bytes(page.as_u32() as *mut u8, 0, PAGE_SIZE as usize);
        }
    }

    /// Build the boot address space and turn paging on.
    ///
    /// The first 16 MiB are mapped twice: identity (the kernel executes
    /// from its load address) and at the kernel split as the
    /// identity-offset alias. The last directory slot points back at the
    /// directory itself, establishing the recursive window every later
    /// operation relies on.
    pub fn init_paging() -> KernelResult<()> {
        use crate::mm::page_table::pde_index;
        use crate::mm::KERNEL_SPLIT;

        let dir_frame = frame_allocator::alloc_frame()?;
        // SAFETY: paging is off; physical addresses are the address
        // space.
        let dir = unsafe { &mut *(dir_frame.as_u32() as *mut PageTable) };
        dir.zero();

        for mib4 in 0..4u32 {
            let table_frame = frame_allocator::alloc_frame()?;
            // SAFETY: as above, identity access with paging off.
            let table = unsafe { &mut *(table_frame.as_u32() as *mut PageTable) };
            for i in 0..1024u32 {
                let phys = PhysicalAddress::new((mib4 * 1024 + i) * PAGE_SIZE);
                table.entries[i as usize] = PageTableEntry::new(phys, PageFlags::KERNEL);
            }

            let entry = PageTableEntry::new(
                table_frame,
                PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::USER,
            );
            dir.entries[mib4 as usize] = entry;
            dir.entries[pde_index(VirtualAddress::new(KERNEL_SPLIT)) + mib4 as usize] = entry;
        }

        dir.entries[RECURSIVE_INDEX] =
            PageTableEntry::new(dir_frame, PageFlags::PRESENT | PageFlags::WRITABLE);

        // SAFETY: the directory is complete; enabling CR0.PG with CR3
        // pointed at it keeps the executing code mapped (identity).
        unsafe {
            ::x86::controlregs::cr3_write(dir_frame.as_u32() as u64);
            let cr0 = ::x86::controlregs::cr0();
            ::x86::controlregs::cr0_write(cr0 | ::x86::controlregs::Cr0::CR0_ENABLE_PAGING);
        }

        log::info!("vmm: paging enabled, recursive slot installed");
        Ok(())
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    //! Software double of the paging hardware for hosted test builds.
    //! Keeps a map of page -> (frame, flags) with the same observable
    //! behavior as the recursive-window implementation.

    use alloc::collections::BTreeMap;

    use spin::Mutex;

    use super::*;

    static PAGE_MAP: Mutex<BTreeMap<u32, (u32, PageFlags)>> = Mutex::new(BTreeMap::new());

    pub fn map_page(
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
    ) -> KernelResult<()> {
        PAGE_MAP
            .lock()
            .insert(virt.page_base().as_u32(), (phys.as_u32(), flags));
        Ok(())
    }

    pub fn unmap_page(virt: VirtualAddress) {
        PAGE_MAP.lock().remove(&virt.page_base().as_u32());
    }

    pub fn is_mapped(virt: VirtualAddress) -> bool {
        PAGE_MAP.lock().contains_key(&virt.page_base().as_u32())
    }

    pub fn get_physical(virt: VirtualAddress) -> Option<PhysicalAddress> {
        PAGE_MAP
            .lock()
            .get(&virt.page_base().as_u32())
            .map(|&(phys, _)| PhysicalAddress::new(phys))
    }

    pub fn entry_flags(virt: VirtualAddress) -> Option<PageFlags> {
        PAGE_MAP
            .lock()
            .get(&virt.page_base().as_u32())
            .map(|&(_, flags)| flags)
    }

    pub fn current_page_directory() -> PhysicalAddress {
        PhysicalAddress::new(0)
    }

    pub fn copy_page(_src: VirtualAddress, _dst_frame: PhysicalAddress) -> KernelResult<()> {
        Ok(())
    }

    pub fn zero_page(_virt: VirtualAddress) {}

    /// Drop every mapping. Test isolation only.
    pub fn reset() {
        PAGE_MAP.lock().clear();
    }
}

pub use imp::{
    copy_page, current_page_directory, entry_flags, get_physical, is_mapped, map_page,
    unmap_page, zero_page,
};

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use imp::reset;

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use imp::init_paging;

/// Remap an existing page with new flags, keeping its frame.
pub fn protect_page(virt: VirtualAddress, flags: PageFlags) -> KernelResult<()> {
    if let Some(phys) = get_physical(virt) {
        unmap_page(virt);
        map_page(virt, phys, flags)?;
    }
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::PAGE_SIZE;

    // The software double shares one page map across the test binary, so
    // each test works in its own distinct address range.

    #[test]
    fn map_then_unmap_round_trips() {
        let v = VirtualAddress::new(0xE000_0000);
        let p = PhysicalAddress::new(0x0010_0000);

        map_page(v, p, PageFlags::KERNEL).expect("mapping an unused page succeeds");
        assert!(is_mapped(v));
        assert_eq!(get_physical(v), Some(p));
        // Any address inside the page resolves to the same frame.
        assert_eq!(get_physical(v.offset(0x123)), Some(p));

        unmap_page(v);
        assert!(!is_mapped(v));
        assert_eq!(get_physical(v), None);
    }

    #[test]
    fn mapping_over_existing_entry_overwrites() {
        let v = VirtualAddress::new(0xE010_0000);
        map_page(v, PhysicalAddress::new(0x0020_0000), PageFlags::KERNEL)
            .expect("first mapping succeeds");
        map_page(v, PhysicalAddress::new(0x0030_0000), PageFlags::USER_RW)
            .expect("remapping the same page succeeds");
        assert_eq!(get_physical(v), Some(PhysicalAddress::new(0x0030_0000)));
        assert_eq!(entry_flags(v), Some(PageFlags::USER_RW));
    }

    #[test]
    fn protect_keeps_frame_changes_flags() {
        let v = VirtualAddress::new(0xE020_0000);
        let p = PhysicalAddress::new(0x0040_0000);
        map_page(v, p, PageFlags::USER_RW).expect("mapping succeeds");

        protect_page(v, PageFlags::USER_RO).expect("re-flagging a mapped page succeeds");
        assert_eq!(get_physical(v), Some(p));
        assert_eq!(entry_flags(v), Some(PageFlags::USER_RO));

        // Protecting an unmapped page is a no-op, not an error.
        protect_page(VirtualAddress::new(0xE020_0000 + 64 * PAGE_SIZE), PageFlags::USER_RO)
            .expect("no-op protect succeeds");
    }
}
