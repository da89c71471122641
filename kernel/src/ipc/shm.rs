//! System V-style shared memory segments.
//!
//! A segment is a run of physical frames created under a key. Attaching
//! maps those frames into the caller at an address vetted by the VMA
//! layer, so a caller-chosen address can never overlap an existing area.

use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{IpcError, KernelError, KernelResult};
use crate::mm::vma::{Prot, VmaBacking, VmaFlags};
use crate::mm::{
    frame_allocator, page_align_up, vma, vmm, PageFlags, PhysicalAddress, VirtualAddress,
    PAGE_SIZE, USER_MMAP_END, USER_MMAP_START,
};

/// Segments available system-wide.
pub const MAX_SHM_SEGMENTS: usize = 16;

/// Largest segment accepted.
pub const MAX_SHM_SIZE: u32 = 4 * 1024 * 1024;

struct Segment {
    in_use: bool,
    key: u32,
    size: u32,
    frames: Vec<PhysicalAddress>,
    attach_count: u32,
}

impl Segment {
    const fn empty() -> Self {
        Self {
            in_use: false,
            key: 0,
            size: 0,
            frames: Vec::new(),
            attach_count: 0,
        }
    }
}

static SEGMENTS: Mutex<[Segment; MAX_SHM_SEGMENTS]> =
    Mutex::new([const { Segment::empty() }; MAX_SHM_SEGMENTS]);

/// `shmget`: find the segment with `key`, or create it sized `size`.
pub fn shmget(key: u32, size: u32) -> KernelResult<usize> {
    let mut segments = SEGMENTS.lock();

    if let Some(id) = segments.iter().position(|s| s.in_use && s.key == key) {
        return Ok(id);
    }

    if size == 0 || size > MAX_SHM_SIZE {
        return Err(KernelError::BadArgument);
    }
    let id = segments
        .iter()
        .position(|s| !s.in_use)
        .ok_or(IpcError::TableFull)?;

    let frame_count = page_align_up(size) / PAGE_SIZE;
    let mut frames = Vec::new();
    for _ in 0..frame_count {
        match frame_allocator::alloc_frame() {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                for frame in frames {
                    frame_allocator::free_frame(frame);
                }
                return Err(e);
            }
        }
    }

    segments[id] = Segment {
        in_use: true,
        key,
        size,
        frames,
        attach_count: 0,
    };
    log::debug!("shm: created segment {} key {:#x} ({} bytes)", id, key, size);
    Ok(id)
}

/// `shmat`: map the segment into `pid` at `addr` (0 = kernel-chosen).
/// The address goes through the VMA layer, which rejects overlaps.
pub fn shmat(pid: u32, id: usize, addr: u32) -> KernelResult<u32> {
    let (frames, length) = {
        let segments = SEGMENTS.lock();
        let segment = segments
            .get(id)
            .filter(|s| s.in_use)
            .ok_or(IpcError::NotFound)?;
        (segment.frames.clone(), page_align_up(segment.size))
    };

    let base = vma::with_table(pid, |table| {
        let base = if addr == 0 {
            // Kernel-chosen: first hole in the mmap window large enough.
            let mut candidate = USER_MMAP_START;
            while candidate.saturating_add(length) <= USER_MMAP_END {
                if !table.overlaps(candidate, candidate + length) {
                    break;
                }
                candidate += PAGE_SIZE;
            }
            candidate
        } else {
            if addr % PAGE_SIZE != 0 {
                return Err(KernelError::BadArgument);
            }
            addr
        };
        if base < USER_MMAP_START || base.saturating_add(length) > USER_MMAP_END {
            return Err(KernelError::BadArgument);
        }

        table
            .create(
                base,
                base + length,
                Prot::READ | Prot::WRITE,
                VmaFlags::SHARED,
                VmaBacking::Anonymous,
            )
            .map(|vma| vma.start)
    })??;

    for (i, frame) in frames.iter().enumerate() {
        let page = VirtualAddress::new(base + i as u32 * PAGE_SIZE);
        if let Err(e) = vmm::map_page(page, *frame, PageFlags::USER_RW) {
            // Unwind the partial attach.
            for j in 0..i {
                vmm::unmap_page(VirtualAddress::new(base + j as u32 * PAGE_SIZE));
            }
            let _ = vma::with_table(pid, |table| table.destroy(base));
            return Err(e);
        }
    }

    SEGMENTS.lock()[id].attach_count += 1;
    Ok(base)
}

/// `shmdt`: unmap the segment attached at `addr`. The frames stay with
/// the segment.
pub fn shmdt(pid: u32, id: usize, addr: u32) -> KernelResult<()> {
    let length = {
        let segments = SEGMENTS.lock();
        let segment = segments
            .get(id)
            .filter(|s| s.in_use)
            .ok_or(IpcError::NotFound)?;
        page_align_up(segment.size)
    };

    vma::with_table(pid, |table| {
        if table.find(addr).is_none() {
            return Err(KernelError::BadArgument);
        }
        let mut page = addr;
        while page < addr + length {
            vmm::unmap_page(VirtualAddress::new(page));
            page += PAGE_SIZE;
        }
        table.destroy(addr)
    })??;

    let mut segments = SEGMENTS.lock();
    segments[id].attach_count = segments[id].attach_count.saturating_sub(1);
    Ok(())
}

/// Destroy a segment with no attachments, returning its frames.
pub fn shm_remove(id: usize) -> KernelResult<()> {
    let mut segments = SEGMENTS.lock();
    let segment = segments
        .get_mut(id)
        .filter(|s| s.in_use)
        .ok_or(IpcError::NotFound)?;
    if segment.attach_count > 0 {
        return Err(KernelError::TryAgain);
    }
    for frame in segment.frames.drain(..) {
        frame_allocator::free_frame(frame);
    }
    *segment = Segment::empty();
    Ok(())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::testing::ensure_frame_pool;

    #[test]
    fn get_creates_then_finds_by_key() {
        ensure_frame_pool();
        let a = shmget(0xBEEF, 8192).expect("create");
        let b = shmget(0xBEEF, 1).expect("lookup ignores size");
        assert_eq!(a, b);
        shm_remove(a).expect("cleanup");
    }

    #[test]
    fn attach_maps_shared_frames_and_detach_keeps_them() {
        ensure_frame_pool();
        let pid = 55;
        let id = shmget(0xA11C, 2 * PAGE_SIZE).expect("create");

        let base = shmat(pid, id, 0x6000_0000).expect("attach at chosen address");
        assert_eq!(base, 0x6000_0000);
        assert!(vmm::is_mapped(VirtualAddress::new(base)));
        assert!(vmm::is_mapped(VirtualAddress::new(base + PAGE_SIZE)));

        // A second attach in another process sees the same frames.
        let other = 56;
        let other_base = shmat(other, id, 0x6000_0000).expect("attach elsewhere");
        assert_eq!(
            vmm::get_physical(VirtualAddress::new(base)),
            vmm::get_physical(VirtualAddress::new(other_base)),
            "both attachments share physical frames"
        );

        shmdt(pid, id, base).expect("detach");
        shmdt(other, id, other_base).expect("detach other");
        assert!(!vmm::is_mapped(VirtualAddress::new(base)));

        shm_remove(id).expect("destroy after detach");
    }

    #[test]
    fn attach_rejects_overlap_with_existing_area() {
        ensure_frame_pool();
        let pid = 57;
        let id = shmget(0xD00D, PAGE_SIZE).expect("create");

        let first = shmat(pid, id, 0x6100_0000).expect("first attach");
        // Attaching the same (or any overlapping) address must fail
        // through the VMA layer rather than silently stacking mappings.
        assert!(shmat(pid, id, 0x6100_0000).is_err());

        shmdt(pid, id, first).expect("detach");
        shm_remove(id).expect("cleanup");
    }

    #[test]
    fn remove_refuses_while_attached() {
        ensure_frame_pool();
        let pid = 58;
        let id = shmget(0xFACE, PAGE_SIZE).expect("create");
        let base = shmat(pid, id, 0x6200_0000).expect("attach");

        assert_eq!(shm_remove(id), Err(KernelError::TryAgain));
        shmdt(pid, id, base).expect("detach");
        shm_remove(id).expect("now removable");
    }

    #[test]
    fn bad_sizes_and_ids_are_rejected() {
        ensure_frame_pool();
        assert!(shmget(0xE111, 0).is_err());
        assert!(shmget(0xE112, MAX_SHM_SIZE + 1).is_err());
        assert!(shmat(1, 999, 0).is_err());
        assert!(shm_remove(999).is_err());
    }
}
