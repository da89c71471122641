//! ELF loader for 32-bit user executables.
//!
//! Accepts an in-memory image, validates it is a little-endian i386
//! `ET_EXEC`, maps each `PT_LOAD` segment into the lower half, records
//! the constructor/destructor arrays, and sets up the fixed user stack.
//! `execute` runs the constructors and drops to user ring at the entry
//! point.

use crate::error::{KernelError, KernelResult};
use crate::mm::vma::{Prot, VmaBacking, VmaFlags};
use crate::mm::{
    frame_allocator, page_align_up, vma, vmm, PageFlags, VirtualAddress, KERNEL_SPLIT, PAGE_SIZE,
    USER_STACK_TOP,
};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
const PT_LOAD: u32 = 1;

const PF_W: u32 = 2;
const PF_X: u32 = 1;

/// Pages of user stack mapped eagerly; the rest of the window grows on
/// fault.
const INITIAL_STACK_PAGES: u32 = 4;

fn read_u16(image: &[u8], offset: usize) -> KernelResult<u16> {
    let bytes = image
        .get(offset..offset + 2)
        .ok_or(KernelError::BadArgument)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(image: &[u8], offset: usize) -> KernelResult<u32> {
    let bytes = image
        .get(offset..offset + 4)
        .ok_or(KernelError::BadArgument)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// The validated fixed-size header fields the loader consumes.
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub entry: u32,
    pub phoff: u32,
    pub phentsize: u16,
    pub phnum: u16,
    pub shoff: u32,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// One loadable segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSegment {
    pub vaddr: u32,
    pub offset: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
}

/// The loaded user image, ready for [`execute`].
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub pid: u32,
    pub entry: u32,
    pub init_array: (u32, u32),
    pub fini_array: (u32, u32),
    pub stack_top: u32,
    pub page_dir: u32,
    /// First address past the loaded segments; seeds the program break
    pub brk_base: u32,
}

/// Validate the identification and machine fields.
pub fn validate(image: &[u8]) -> KernelResult<ElfHeader> {
    if image.len() < 52 {
        return Err(KernelError::BadArgument);
    }
    if image[0..4] != ELF_MAGIC {
        return Err(KernelError::BadArgument);
    }
    if image[4] != ELFCLASS32 || image[5] != ELFDATA2LSB {
        return Err(KernelError::BadArgument);
    }
    if read_u16(image, 16)? != ET_EXEC || read_u16(image, 18)? != EM_386 {
        return Err(KernelError::BadArgument);
    }

    Ok(ElfHeader {
        entry: read_u32(image, 24)?,
        phoff: read_u32(image, 28)?,
        phentsize: read_u16(image, 42)?,
        phnum: read_u16(image, 44)?,
        shoff: read_u32(image, 32)?,
        shentsize: read_u16(image, 46)?,
        shnum: read_u16(image, 48)?,
        shstrndx: read_u16(image, 50)?,
    })
}

/// Iterate the `PT_LOAD` program headers.
pub fn load_segments(image: &[u8], header: &ElfHeader) -> KernelResult<impl Iterator<Item = LoadSegment>> {
    let mut segments = alloc::vec::Vec::new();
    for i in 0..header.phnum {
        let base = header.phoff as usize + i as usize * header.phentsize as usize;
        if read_u32(image, base)? != PT_LOAD {
            continue;
        }
        segments.push(LoadSegment {
            offset: read_u32(image, base + 4)?,
            vaddr: read_u32(image, base + 8)?,
            filesz: read_u32(image, base + 16)?,
            memsz: read_u32(image, base + 20)?,
            flags: read_u32(image, base + 24)?,
        });
    }
    Ok(segments.into_iter())
}

/// Find `.init_array`/`.fini_array` (or the older `.ctors`/`.dtors`) by
/// section name. Returns `(addr, size)` pairs, zero when absent.
fn scan_ctor_sections(image: &[u8], header: &ElfHeader) -> KernelResult<((u32, u32), (u32, u32))> {
    let mut init = (0, 0);
    let mut fini = (0, 0);
    if header.shnum == 0 || header.shstrndx as usize >= header.shnum as usize {
        return Ok((init, fini));
    }

    let strtab_base =
        header.shoff as usize + header.shstrndx as usize * header.shentsize as usize;
    let strtab_off = read_u32(image, strtab_base + 16)? as usize;

    for i in 0..header.shnum {
        let base = header.shoff as usize + i as usize * header.shentsize as usize;
        let name_off = strtab_off + read_u32(image, base)? as usize;
        let name_bytes = image.get(name_off..).unwrap_or(&[]);
        let end = name_bytes
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(name_bytes.len());
        let name = core::str::from_utf8(&name_bytes[..end]).unwrap_or("");

        let addr = read_u32(image, base + 12)?;
        let size = read_u32(image, base + 20)?;
        match name {
            ".init_array" | ".ctors" => init = (addr, size),
            ".fini_array" | ".dtors" => fini = (addr, size),
            _ => {}
        }
    }
    Ok((init, fini))
}

/// Copy segment bytes into freshly mapped user pages.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn copy_to_user(vaddr: u32, data: &[u8]) {
    // SAFETY: the destination pages were just mapped writable in the
    // current address space and cover [vaddr, vaddr + data.len()).
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), vaddr as *mut u8, data.len());
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn copy_to_user(_vaddr: u32, _data: &[u8]) {}

/// Map one segment's pages and fill them.
fn map_segment(image: &[u8], pid: u32, segment: &LoadSegment) -> KernelResult<()> {
    if segment.memsz == 0 {
        return Ok(());
    }
    let end = segment
        .vaddr
        .checked_add(segment.memsz)
        .ok_or(KernelError::BadArgument)?;
    if end > KERNEL_SPLIT {
        return Err(KernelError::BadAddress { addr: segment.vaddr });
    }
    if segment.filesz > segment.memsz {
        return Err(KernelError::BadArgument);
    }
    let file_end = segment.offset as usize + segment.filesz as usize;
    if file_end > image.len() {
        return Err(KernelError::BadArgument);
    }

    let mut prot = Prot::READ;
    if segment.flags & PF_W != 0 {
        prot |= Prot::WRITE;
    }
    if segment.flags & PF_X != 0 {
        prot |= Prot::EXEC;
    }

    let start_page = segment.vaddr & !(PAGE_SIZE - 1);
    let end_page = page_align_up(end);

    vma::with_table(pid, |table| {
        table
            .create(
                start_page,
                end_page,
                prot,
                VmaFlags::PRIVATE,
                VmaBacking::File {
                    offset: segment.offset,
                },
            )
            .map(|_| ())
    })??;

    let mut page = start_page;
    while page < end_page {
        let phys = frame_allocator::alloc_frame()?;
        // Segments are mapped writable for the copy; the recorded VMA
        // protection is what a later mprotect pass enforces.
        vmm::map_page(VirtualAddress::new(page), phys, PageFlags::USER_RW)?;
        vmm::zero_page(VirtualAddress::new(page));
        page += PAGE_SIZE;
    }

    copy_to_user(
        segment.vaddr,
        &image[segment.offset as usize..file_end],
    );
    Ok(())
}

/// Load a validated image into `pid`'s address space.
pub fn load(image: &[u8], pid: u32) -> KernelResult<LoadedImage> {
    let header = validate(image)?;
    let (init_array, fini_array) = scan_ctor_sections(image, &header)?;

    let mut brk_base = 0;
    let mut mapped = 0;
    for segment in load_segments(image, &header)? {
        map_segment(image, pid, &segment)?;
        brk_base = brk_base.max(page_align_up(segment.vaddr + segment.memsz));
        mapped += 1;
    }
    if mapped == 0 {
        return Err(KernelError::BadArgument);
    }

    // Eager stack pages just below the top of the stack window; deeper
    // use faults in through the growth path.
    let stack_base = USER_STACK_TOP - INITIAL_STACK_PAGES * PAGE_SIZE;
    vma::with_table(pid, |table| {
        table
            .create(
                stack_base,
                USER_STACK_TOP,
                Prot::READ | Prot::WRITE,
                VmaFlags::PRIVATE | VmaFlags::ANONYMOUS,
                VmaBacking::Anonymous,
            )
            .map(|_| ())
    })??;
    let mut page = stack_base;
    while page < USER_STACK_TOP {
        let phys = frame_allocator::alloc_frame()?;
        vmm::map_page(VirtualAddress::new(page), phys, PageFlags::USER_RW)?;
        vmm::zero_page(VirtualAddress::new(page));
        page += PAGE_SIZE;
    }

    Ok(LoadedImage {
        pid,
        entry: header.entry,
        init_array,
        fini_array,
        stack_top: USER_STACK_TOP - 16,
        page_dir: vmm::current_page_directory().as_u32(),
        brk_base,
    })
}

/// Run the image: call its constructors, then transfer to the entry
/// point in user ring. On bare metal this does not return on success.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn execute(image: &LoadedImage) -> KernelResult<()> {
    use alloc::alloc::{alloc, Layout};

    use crate::arch;

    // A dedicated kernel stack for this process: a future user -> kernel
    // crossing must land on it.
    let layout = Layout::from_size_align(16 * 1024, 16).map_err(|_| KernelError::NoMemory)?;
    // SAFETY: non-zero layout.
    let stack = unsafe { alloc(layout) };
    if stack.is_null() {
        return Err(KernelError::NoMemory);
    }
    arch::set_kernel_stack(stack as u32 + 16 * 1024);

    // Constructors run in order before main.
    let (init_base, init_size) = image.init_array;
    let mut addr = init_base;
    while addr + 4 <= init_base + init_size {
        // SAFETY: the array was loaded as part of the image and holds
        // function pointers into mapped user text.
        unsafe {
            let ctor_addr = core::ptr::read(addr as *const u32);
            if ctor_addr != 0 && ctor_addr != u32::MAX {
                let ctor: extern "C" fn() = core::mem::transmute(ctor_addr as usize);
                ctor();
            }
        }
        addr += 4;
    }

    log::debug!(
        "elf: entering user mode at {:#010x}, stack {:#010x}",
        image.entry,
        image.stack_top
    );
    // SAFETY: entry and stack_top were produced by load() over mapped
    // user memory.
    unsafe { arch::x86::ring::enter_user_mode(image.entry, image.stack_top) }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn execute(image: &LoadedImage) -> KernelResult<()> {
    log::debug!(
        "elf: would enter user mode at {:#010x} (pid {})",
        image.entry,
        image.pid
    );
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;
    use crate::mm::testing::ensure_frame_pool;

    const PH_OFF: usize = 52;
    const PH_SIZE: usize = 32;

    /// Build a minimal valid ELF with one PT_LOAD segment.
    fn tiny_elf(vaddr: u32, filesz: u32, memsz: u32) -> Vec<u8> {
        let payload_off = PH_OFF + PH_SIZE;
        let mut image = vec![0u8; payload_off + filesz as usize];
        image[0..4].copy_from_slice(&ELF_MAGIC);
        image[4] = ELFCLASS32;
        image[5] = ELFDATA2LSB;
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&ET_EXEC.to_le_bytes());
        image[18..20].copy_from_slice(&EM_386.to_le_bytes());
        image[24..28].copy_from_slice(&vaddr.to_le_bytes()); // entry
        image[28..32].copy_from_slice(&(PH_OFF as u32).to_le_bytes());
        image[42..44].copy_from_slice(&(PH_SIZE as u16).to_le_bytes());
        image[44..46].copy_from_slice(&1u16.to_le_bytes());

        let ph = PH_OFF;
        image[ph..ph + 4].copy_from_slice(&PT_LOAD.to_le_bytes());
        image[ph + 4..ph + 8].copy_from_slice(&(payload_off as u32).to_le_bytes());
        image[ph + 8..ph + 12].copy_from_slice(&vaddr.to_le_bytes());
        image[ph + 16..ph + 20].copy_from_slice(&filesz.to_le_bytes());
        image[ph + 20..ph + 24].copy_from_slice(&memsz.to_le_bytes());
        image[ph + 24..ph + 28].copy_from_slice(&(PF_W | PF_X | 4).to_le_bytes());
        image
    }

    #[test]
    fn validation_accepts_only_i386_exec() {
        let good = tiny_elf(0x0804_8000, 64, 64);
        let header = validate(&good).expect("well-formed image validates");
        assert_eq!(header.entry, 0x0804_8000);
        assert_eq!(header.phnum, 1);

        let mut bad_magic = good.clone();
        bad_magic[0] = 0x7E;
        assert!(validate(&bad_magic).is_err());

        let mut bad_class = good.clone();
        bad_class[4] = 2; // 64-bit
        assert!(validate(&bad_class).is_err());

        let mut bad_endian = good.clone();
        bad_endian[5] = 2; // big-endian
        assert!(validate(&bad_endian).is_err());

        let mut bad_type = good.clone();
        bad_type[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
        assert!(validate(&bad_type).is_err());

        let mut bad_machine = good.clone();
        bad_machine[18..20].copy_from_slice(&62u16.to_le_bytes()); // x86-64
        assert!(validate(&bad_machine).is_err());

        assert!(validate(&[0u8; 10]).is_err(), "truncated image");
    }

    #[test]
    fn segments_are_enumerated() {
        let image = tiny_elf(0x0804_8000, 100, 300);
        let header = validate(&image).expect("validates");
        let segments: Vec<_> = load_segments(&image, &header).expect("parses").collect();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].vaddr, 0x0804_8000);
        assert_eq!(segments[0].filesz, 100);
        assert_eq!(segments[0].memsz, 300);
    }

    #[test]
    fn load_maps_segments_and_stack() {
        // Serialized with the exec path test: both stage images into the
        // same address space model.
        let _guard = crate::process::table::testing::lock();
        ensure_frame_pool();
        let pid = 60;
        let image = tiny_elf(0x0804_8000, 64, 5000);

        let loaded = load(&image, pid).expect("load succeeds");
        assert_eq!(loaded.entry, 0x0804_8000);
        assert_eq!(loaded.brk_base, page_align_up(0x0804_8000 + 5000));
        assert!(loaded.stack_top < USER_STACK_TOP);

        // Segment pages present.
        assert!(vmm::is_mapped(VirtualAddress::new(0x0804_8000)));
        assert!(vmm::is_mapped(VirtualAddress::new(0x0804_8000 + 4096)));
        // Stack pages present.
        assert!(vmm::is_mapped(VirtualAddress::new(USER_STACK_TOP - PAGE_SIZE)));

        // The address-space map recorded both areas.
        let areas = vma::with_table(pid, |t| t.count()).unwrap();
        assert_eq!(areas, 2);

        vma::release_process(pid);
    }

    #[test]
    fn load_rejects_kernel_range_segments() {
        ensure_frame_pool();
        let image = tiny_elf(KERNEL_SPLIT - 0x1000, 64, 0x3000);
        assert!(load(&image, 61).is_err());
        vma::release_process(61);
    }

    #[test]
    fn load_rejects_images_without_segments() {
        ensure_frame_pool();
        let mut image = tiny_elf(0x0804_8000, 16, 16);
        // Flip the segment type away from PT_LOAD.
        image[PH_OFF..PH_OFF + 4].copy_from_slice(&2u32.to_le_bytes());
        assert!(load(&image, 62).is_err());
    }

    #[test]
    fn load_rejects_truncated_file_data() {
        ensure_frame_pool();
        let mut image = tiny_elf(0x0804_8000, 64, 64);
        image.truncate(60); // file data cut off
        assert!(load(&image, 63).is_err());
        vma::release_process(63);
    }
}
