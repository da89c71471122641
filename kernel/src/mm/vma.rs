//! Virtual memory areas.
//!
//! Each process owns a bounded table of non-overlapping regions describing
//! what its lower-half address space means: protection, sharing, backing,
//! and whether pages appear eagerly or on first touch. `mmap`, `munmap`,
//! `mprotect`, and `brk` operate on this table; the page-fault path
//! consults it to resolve lazy and copy-on-write accesses.

use bitflags::bitflags;
use spin::Mutex;

use super::{
    frame_allocator, page_align_up, vmm, PageFlags, VirtualAddress, PAGE_SIZE,
    USER_MMAP_END, USER_MMAP_START,
};
use crate::error::{KernelError, KernelResult};
use crate::process::MAX_PROCESSES;

/// VMAs per process.
pub const MAX_VMAS_PER_PROC: usize = 32;

bitflags! {
    /// Page protection requested by user code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

bitflags! {
    /// Mapping flags, numbered as user code passes them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const SHARED    = 0x01;
        const PRIVATE   = 0x02;
        const FIXED     = 0x10;
        const ANONYMOUS = 0x20;
    }
}

/// What supplies a region's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmaBacking {
    Anonymous,
    /// File-backed at the given offset. Accepted in the table so `exec`
    /// and future file mapping can record it; `mmap` itself rejects it.
    File { offset: u32 },
}

/// One virtual memory area. `start < end`, both page-aligned.
#[derive(Debug, Clone, Copy)]
pub struct Vma {
    pub start: u32,
    pub end: u32,
    pub prot: Prot,
    pub flags: VmaFlags,
    pub backing: VmaBacking,
    /// Writes fault and duplicate the page first
    pub cow: bool,
    /// Pages materialize on first touch
    pub lazy: bool,
}

impl Vma {
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Page flags corresponding to this area's protection.
    pub fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::USER_RO;
        if self.prot.contains(Prot::WRITE) && !self.cow {
            flags |= PageFlags::WRITABLE;
        }
        flags
    }
}

/// Per-process VMA table plus the program-break bookkeeping.
pub struct VmaTable {
    vmas: [Option<Vma>; MAX_VMAS_PER_PROC],
    /// Base of the brk region, set when an image is loaded
    brk_base: u32,
    /// Current program break
    brk: u32,
    /// Next address the non-FIXED mmap path will try
    mmap_cursor: u32,
}

impl VmaTable {
    pub const fn new() -> Self {
        Self {
            vmas: [None; MAX_VMAS_PER_PROC],
            brk_base: 0,
            brk: 0,
            mmap_cursor: USER_MMAP_START,
        }
    }

    pub fn clear(&mut self) {
        self.vmas = [None; MAX_VMAS_PER_PROC];
        self.brk_base = 0;
        self.brk = 0;
        self.mmap_cursor = USER_MMAP_START;
    }

    pub fn find(&self, addr: u32) -> Option<&Vma> {
        self.vmas
            .iter()
            .flatten()
            .find(|vma| vma.contains(addr))
    }

    pub fn find_mut(&mut self, addr: u32) -> Option<&mut Vma> {
        self.vmas
            .iter_mut()
            .flatten()
            .find(|vma| vma.contains(addr))
    }

    pub fn overlaps(&self, start: u32, end: u32) -> bool {
        self.vmas
            .iter()
            .flatten()
            .any(|vma| start < vma.end && end > vma.start)
    }

    /// Insert a new area. Rejects unaligned or empty ranges and any overlap
    /// with an existing area.
    pub fn create(
        &mut self,
        start: u32,
        end: u32,
        prot: Prot,
        flags: VmaFlags,
        backing: VmaBacking,
    ) -> KernelResult<&mut Vma> {
        if start >= end || start % PAGE_SIZE != 0 || end % PAGE_SIZE != 0 {
            return Err(KernelError::BadArgument);
        }
        if self.overlaps(start, end) {
            return Err(KernelError::BadArgument);
        }

        let slot = self
            .vmas
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(KernelError::NoMemory)?;

        Ok(slot.insert(Vma {
            start,
            end,
            prot,
            flags,
            backing,
            cow: false,
            lazy: flags.contains(VmaFlags::ANONYMOUS),
        }))
    }

    pub fn destroy(&mut self, start: u32) -> KernelResult<()> {
        for slot in self.vmas.iter_mut() {
            if matches!(slot, Some(vma) if vma.start == start) {
                *slot = None;
                return Ok(());
            }
        }
        Err(KernelError::NotFound)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.vmas.iter().flatten()
    }

    pub fn count(&self) -> usize {
        self.vmas.iter().flatten().count()
    }
}

impl Default for VmaTable {
    fn default() -> Self {
        Self::new()
    }
}

/// All per-process tables, indexed by pid.
static TABLES: Mutex<[VmaTable; MAX_PROCESSES]> =
    Mutex::new([const { VmaTable::new() }; MAX_PROCESSES]);

/// Run `f` against one process's VMA table.
pub fn with_table<R>(pid: u32, f: impl FnOnce(&mut VmaTable) -> R) -> KernelResult<R> {
    let mut tables = TABLES.lock();
    let table = tables
        .get_mut(pid as usize)
        .ok_or(KernelError::NoSuchProcess)?;
    Ok(f(table))
}

/// Reset a process's address-space map (process creation and exec).
pub fn init_process(pid: u32) {
    let _ = with_table(pid, |table| table.clear());
}

/// `mmap`: establish a new user mapping.
pub fn mmap(
    pid: u32,
    addr: u32,
    length: u32,
    prot: Prot,
    flags: VmaFlags,
    _fd: i32,
    offset: u32,
) -> KernelResult<u32> {
    if length == 0 {
        return Err(KernelError::BadArgument);
    }
    let length = page_align_up(length);

    if !flags.contains(VmaFlags::ANONYMOUS) {
        // File mappings are carried in the data model but not materialized
        // by this path.
        let _ = offset;
        return Err(KernelError::NotSupported);
    }

    with_table(pid, |table| {
        let vaddr = if flags.contains(VmaFlags::FIXED) {
            if addr % PAGE_SIZE != 0 {
                return Err(KernelError::BadArgument);
            }
            if addr < USER_MMAP_START || addr.saturating_add(length) > USER_MMAP_END {
                return Err(KernelError::BadArgument);
            }
            addr
        } else {
            let base = table.mmap_cursor;
            if base.saturating_add(length) > USER_MMAP_END {
                return Err(KernelError::NoMemory);
            }
            table.mmap_cursor = base + length;
            base
        };

        table.create(vaddr, vaddr + length, prot, flags, VmaBacking::Anonymous)?;

        // Anonymous mappings are populated immediately; the lazy flag keeps
        // the fault path willing to re-materialize pages dropped later.
        let mut page = vaddr;
        while page < vaddr + length {
            let phys = match frame_allocator::alloc_frame() {
                Ok(p) => p,
                Err(e) => {
                    unmap_range(vaddr, page, false);
                    let _ = table.destroy(vaddr);
                    return Err(e);
                }
            };
            let mut page_flags = PageFlags::USER_RO;
            if prot.contains(Prot::WRITE) {
                page_flags |= PageFlags::WRITABLE;
            }
            if let Err(e) = vmm::map_page(VirtualAddress::new(page), phys, page_flags) {
                frame_allocator::free_frame(phys);
                unmap_range(vaddr, page, false);
                let _ = table.destroy(vaddr);
                return Err(e);
            }
            vmm::zero_page(VirtualAddress::new(page));
            page += PAGE_SIZE;
        }

        log::debug!(
            "mmap: pid {} mapped {:#010x}..{:#010x} prot {:?}",
            pid,
            vaddr,
            vaddr + length,
            prot
        );
        Ok(vaddr)
    })?
}

/// Unmap every mapped page in `[start, end)`, freeing frames unless the
/// region is shared.
fn unmap_range(start: u32, end: u32, shared: bool) {
    let mut page = start;
    while page < end {
        let v = VirtualAddress::new(page);
        if let Some(phys) = vmm::get_physical(v) {
            vmm::unmap_page(v);
            if !shared {
                frame_allocator::free_frame(phys);
            }
        }
        page += PAGE_SIZE;
    }
}

/// `munmap`: drop a user mapping.
pub fn munmap(pid: u32, addr: u32, length: u32) -> KernelResult<()> {
    if addr % PAGE_SIZE != 0 || length == 0 {
        return Err(KernelError::BadArgument);
    }
    let length = page_align_up(length);

    with_table(pid, |table| {
        let vma = *table.find(addr).ok_or(KernelError::BadArgument)?;
        let end = addr + length;

        unmap_range(addr, end, vma.flags.contains(VmaFlags::SHARED));

        if addr == vma.start && end >= vma.end {
            table.destroy(vma.start)?;
        } else if let Some(vma) = table.find_mut(addr) {
            if addr == vma.start {
                vma.start = end;
            } else if end >= vma.end {
                vma.end = addr;
            }
            // A hole in the middle leaves the area in place; the freed
            // pages fault back in lazily if touched again.
        }
        Ok(())
    })?
}

/// `mprotect`: change a region protection and re-flag its live pages.
pub fn mprotect(pid: u32, addr: u32, length: u32, prot: Prot) -> KernelResult<()> {
    if addr % PAGE_SIZE != 0 || length == 0 {
        return Err(KernelError::BadArgument);
    }
    let length = page_align_up(length);

    with_table(pid, |table| {
        let vma = table.find_mut(addr).ok_or(KernelError::BadArgument)?;
        vma.prot = prot;
        let page_flags = vma.page_flags();

        let mut page = addr;
        while page < addr + length {
            vmm::protect_page(VirtualAddress::new(page), page_flags)?;
            page += PAGE_SIZE;
        }
        Ok(())
    })?
}

/// Record the end of a loaded image as the base of the brk region.
pub fn set_brk_base(pid: u32, base: u32) {
    let base = page_align_up(base);
    let _ = with_table(pid, |table| {
        table.brk_base = base;
        table.brk = base;
    });
}

/// `brk`: move the program break. `None` queries the current break.
pub fn brk(pid: u32, new_break: Option<u32>) -> KernelResult<u32> {
    with_table(pid, |table| {
        let Some(target) = new_break else {
            return Ok(table.brk);
        };
        if table.brk_base == 0 || target < table.brk_base {
            return Err(KernelError::BadArgument);
        }

        let old_end = page_align_up(table.brk);
        let new_end = page_align_up(target);

        if new_end > old_end {
            // Grow: extend (or create) the lazy anonymous heap area and let
            // the fault path materialize pages.
            if table.overlaps(old_end, new_end) {
                return Err(KernelError::NoMemory);
            }
            match table.find_mut(table.brk_base) {
                Some(vma) => vma.end = new_end,
                None => {
                    table.create(
                        table.brk_base,
                        new_end,
                        Prot::READ | Prot::WRITE,
                        VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
                        VmaBacking::Anonymous,
                    )?;
                }
            }
        } else if new_end < old_end {
            unmap_range(new_end, old_end, false);
            if new_end == page_align_up(table.brk_base) {
                let _ = table.destroy(table.brk_base);
            } else if let Some(vma) = table.find_mut(table.brk_base) {
                vma.end = new_end;
            }
        }

        table.brk = target;
        Ok(target)
    })?
}

/// Turn the area containing `addr` copy-on-write: live pages lose their
/// write permission so the first store faults into the duplication path.
pub fn mark_cow(pid: u32, addr: u32) -> KernelResult<()> {
    with_table(pid, |table| {
        let vma = table.find_mut(addr).ok_or(KernelError::BadArgument)?;
        vma.cow = true;
        let (start, end) = (vma.start, vma.end);

        let mut page = start;
        while page < end {
            vmm::protect_page(VirtualAddress::new(page), PageFlags::USER_RO)?;
            page += PAGE_SIZE;
        }
        Ok(())
    })?
}

/// Tear down every mapping a process owns (exit, exec).
pub fn release_process(pid: u32) {
    let _ = with_table(pid, |table| {
        let mut areas = [(0u32, 0u32, false); MAX_VMAS_PER_PROC];
        let mut count = 0;
        for vma in table.iter() {
            areas[count] = (vma.start, vma.end, vma.flags.contains(VmaFlags::SHARED));
            count += 1;
        }
        for &(start, end, shared) in &areas[..count] {
            unmap_range(start, end, shared);
        }
        table.clear();
    });
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testing::ensure_frame_pool;

    // Serializes tests that assert on global frame-pool deltas.
    static POOL_METER: Mutex<()> = Mutex::new(());

    #[test]
    fn table_rejects_overlap_and_finds_by_address() {
        let mut table = VmaTable::new();
        table
            .create(
                0x4000_0000,
                0x4000_2000,
                Prot::READ,
                VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
                VmaBacking::Anonymous,
            )
            .expect("first area fits");

        assert!(table
            .create(
                0x4000_1000,
                0x4000_3000,
                Prot::READ,
                VmaFlags::PRIVATE,
                VmaBacking::Anonymous,
            )
            .is_err());

        assert!(table.find(0x4000_1FFF).is_some());
        assert!(table.find(0x4000_2000).is_none());

        table.destroy(0x4000_0000).expect("area exists");
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn table_rejects_unaligned_and_empty() {
        let mut table = VmaTable::new();
        assert!(table
            .create(0x123, 0x2000, Prot::READ, VmaFlags::PRIVATE, VmaBacking::Anonymous)
            .is_err());
        assert!(table
            .create(0x2000, 0x2000, Prot::READ, VmaFlags::PRIVATE, VmaBacking::Anonymous)
            .is_err());
    }

    #[test]
    fn mmap_round_trips_and_frees_frames() {
        ensure_frame_pool();
        let _meter = POOL_METER.lock();
        let pid = 40;

        let addr = mmap(
            pid,
            0,
            2 * PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
            -1,
            0,
        )
        .expect("anonymous mmap succeeds");

        assert_eq!(addr % PAGE_SIZE, 0, "mmap result is page-aligned");
        let first = vmm::get_physical(VirtualAddress::new(addr)).expect("first page mapped");
        let second =
            vmm::get_physical(VirtualAddress::new(addr + PAGE_SIZE)).expect("second page mapped");
        assert_ne!(first, second, "each page gets its own frame");

        munmap(pid, addr, 2 * PAGE_SIZE).expect("munmap of a live mapping succeeds");
        assert!(!vmm::is_mapped(VirtualAddress::new(addr)));
        assert!(!vmm::is_mapped(VirtualAddress::new(addr + PAGE_SIZE)));
        assert!(with_table(pid, |t| t.count()).unwrap() == 0);

        // The frames went back to the pool and can be handed out again.
        let reused = frame_allocator::alloc_frame().expect("pool still serves");
        frame_allocator::free_frame(reused);
    }

    #[test]
    fn mmap_zero_length_fails() {
        assert_eq!(
            mmap(41, 0, 0, Prot::READ, VmaFlags::ANONYMOUS, -1, 0),
            Err(KernelError::BadArgument)
        );
    }

    #[test]
    fn mmap_fixed_outside_window_fails() {
        ensure_frame_pool();
        assert!(mmap(
            42,
            0x1000, // below the mmap window
            PAGE_SIZE,
            Prot::READ,
            VmaFlags::ANONYMOUS | VmaFlags::FIXED,
            -1,
            0,
        )
        .is_err());

        let addr = mmap(
            42,
            0x5000_0000,
            PAGE_SIZE,
            Prot::READ,
            VmaFlags::ANONYMOUS | VmaFlags::FIXED,
            -1,
            0,
        )
        .expect("fixed mapping inside the window succeeds");
        assert_eq!(addr, 0x5000_0000);
        munmap(42, addr, PAGE_SIZE).expect("cleanup");
    }

    #[test]
    fn length_rounds_up_to_pages() {
        ensure_frame_pool();
        let _meter = POOL_METER.lock();
        let pid = 43;
        let addr = mmap(
            pid,
            0,
            100,
            Prot::READ,
            VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
            -1,
            0,
        )
        .expect("sub-page mmap succeeds");
        let vma = with_table(pid, |t| *t.find(addr).expect("area recorded")).unwrap();
        assert_eq!(vma.end - vma.start, PAGE_SIZE);
        munmap(pid, addr, 100).expect("cleanup");
    }

    #[test]
    fn munmap_requires_alignment_and_known_region() {
        assert_eq!(munmap(44, 0x123, 100), Err(KernelError::BadArgument));
        assert_eq!(
            munmap(44, 0x7000_0000, PAGE_SIZE),
            Err(KernelError::BadArgument)
        );
    }

    #[test]
    fn mprotect_updates_area_and_pages() {
        ensure_frame_pool();
        let _meter = POOL_METER.lock();
        let pid = 45;
        let addr = mmap(
            pid,
            0,
            PAGE_SIZE,
            Prot::READ | Prot::WRITE,
            VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
            -1,
            0,
        )
        .expect("mmap succeeds");

        mprotect(pid, addr, PAGE_SIZE, Prot::READ).expect("mprotect succeeds");
        let vma = with_table(pid, |t| *t.find(addr).expect("area present")).unwrap();
        assert_eq!(vma.prot, Prot::READ);
        let flags = vmm::entry_flags(VirtualAddress::new(addr)).expect("page still mapped");
        assert!(!flags.contains(PageFlags::WRITABLE));

        munmap(pid, addr, PAGE_SIZE).expect("cleanup");
    }

    #[test]
    fn brk_grows_and_shrinks() {
        ensure_frame_pool();
        let pid = 46;
        set_brk_base(pid, 0x0900_0000);

        assert_eq!(brk(pid, None).unwrap(), 0x0900_0000);
        let new = brk(pid, Some(0x0900_3000)).expect("grow succeeds");
        assert_eq!(new, 0x0900_3000);
        let vma = with_table(pid, |t| *t.find(0x0900_0000).expect("heap area exists")).unwrap();
        assert_eq!(vma.end, 0x0900_3000);
        assert!(vma.lazy, "brk pages materialize on fault");

        brk(pid, Some(0x0900_0000)).expect("shrink succeeds");
        assert!(with_table(pid, |t| t.find(0x0900_0000).is_none()).unwrap());

        assert_eq!(brk(pid, Some(0x0800_0000)), Err(KernelError::BadArgument));
    }
}
