//! Multiboot boot-information ingestion.
//!
//! The loader leaves a magic value and a pointer to its information
//! structure in registers. Anything but the expected magic is a
//! mis-boot and panics; otherwise the memory map feeds the frame
//! allocator before anything else allocates.

use bitflags::bitflags;

#[cfg(all(target_arch = "x86", target_os = "none"))]
use crate::mm::frame_allocator::{self, PhysicalAddress};

/// Value a compliant loader leaves in the magic register.
pub const MULTIBOOT_BOOTLOADER_MAGIC: u32 = 0x2BAD_B002;

/// Memory-map entry type for usable RAM.
pub const MEMORY_AVAILABLE: u32 = 1;

bitflags! {
    /// Which [`MultibootInfo`] fields the loader filled in.
    #[derive(Debug, Clone, Copy)]
    pub struct InfoFlags: u32 {
        const MEMORY   = 1 << 0;
        const BOOTDEV  = 1 << 1;
        const CMDLINE  = 1 << 2;
        const MODULES  = 1 << 3;
        const MMAP     = 1 << 6;
    }
}

/// The multiboot information structure, as the loader lays it out.
#[repr(C)]
pub struct MultibootInfo {
    pub flags: u32,
    pub mem_lower: u32,
    pub mem_upper: u32,
    pub boot_device: u32,
    pub cmdline: u32,
    pub mods_count: u32,
    pub mods_addr: u32,
    pub syms: [u32; 4],
    pub mmap_length: u32,
    pub mmap_addr: u32,
}

impl MultibootInfo {
    pub fn flags(&self) -> InfoFlags {
        InfoFlags::from_bits_truncate(self.flags)
    }
}

/// One parsed memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: u64,
    pub length: u64,
    pub region_type: u32,
}

/// Panic unless the loader identified itself correctly.
pub fn check_magic(magic: u32) {
    if magic != MULTIBOOT_BOOTLOADER_MAGIC {
        panic!(
            "not booted by a multiboot loader (magic {:#010x}, expected {:#010x})",
            magic, MULTIBOOT_BOOTLOADER_MAGIC
        );
    }
}

/// Decode the variable-size memory-map entries. Each entry starts with
/// its own size field, which does not count itself.
pub fn parse_memory_map(raw: &[u8]) -> impl Iterator<Item = MemoryRegion> + '_ {
    let mut offset = 0usize;
    core::iter::from_fn(move || {
        // size(4) + base(8) + length(8) + type(4)
        if offset + 24 > raw.len() {
            return None;
        }
        let size = u32::from_le_bytes([
            raw[offset],
            raw[offset + 1],
            raw[offset + 2],
            raw[offset + 3],
        ]);
        let at = |o: usize| raw[offset + 4 + o];
        let base = u64::from_le_bytes([at(0), at(1), at(2), at(3), at(4), at(5), at(6), at(7)]);
        let length =
            u64::from_le_bytes([at(8), at(9), at(10), at(11), at(12), at(13), at(14), at(15)]);
        let region_type = u32::from_le_bytes([at(16), at(17), at(18), at(19)]);

        offset += size as usize + 4;
        Some(MemoryRegion {
            base,
            length,
            region_type,
        })
    })
}

/// Feed every usable region to the frame pool, then carve out the
/// kernel image and the low first megabyte.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn ingest_memory_map(info: &MultibootInfo) {
    extern "C" {
        static __kernel_start: u8;
        static __kernel_end: u8;
    }

    if !info.flags().contains(InfoFlags::MMAP) {
        // Fall back to the basic mem_lower/mem_upper pair.
        frame_allocator::with_pool(|pool| {
            pool.add_region(PhysicalAddress::new(0x10_0000), info.mem_upper * 1024);
        });
    } else {
        // SAFETY: the loader's map is identity-accessible at this point.
        let raw = unsafe {
            core::slice::from_raw_parts(info.mmap_addr as *const u8, info.mmap_length as usize)
        };
        frame_allocator::with_pool(|pool| {
            for region in parse_memory_map(raw) {
                if region.region_type == MEMORY_AVAILABLE && region.base < u32::MAX as u64 {
                    let length = region.length.min(u32::MAX as u64 - region.base);
                    pool.add_region(PhysicalAddress::new(region.base as u32), length as u32);
                }
            }
        });
    }

    // The kernel image and everything below 1 MiB stay out of the pool.
    // SAFETY: linker-provided symbols delimit the loaded image.
    let (kernel_start, kernel_end) = unsafe {
        (
            &__kernel_start as *const u8 as u32,
            &__kernel_end as *const u8 as u32,
        )
    };
    frame_allocator::with_pool(|pool| {
        pool.mark_region_used(PhysicalAddress::new(0), 0x10_0000);
        pool.mark_region_used(
            PhysicalAddress::new(kernel_start),
            kernel_end - kernel_start,
        );
    });

    log::info!(
        "boot: {} KiB RAM usable, kernel image {:#010x}..{:#010x}",
        frame_allocator::free_memory() / 1024,
        kernel_start,
        kernel_end
    );
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn entry(size: u32, base: u64, length: u64, ty: u32) -> Vec<u8> {
        let mut raw = Vec::new();
        raw.extend_from_slice(&size.to_le_bytes());
        raw.extend_from_slice(&base.to_le_bytes());
        raw.extend_from_slice(&length.to_le_bytes());
        raw.extend_from_slice(&ty.to_le_bytes());
        raw
    }

    #[test]
    fn memory_map_entries_parse_with_self_sized_stride() {
        let mut raw = Vec::new();
        raw.extend(entry(20, 0, 0x9F000, MEMORY_AVAILABLE));
        raw.extend(entry(20, 0x10_0000, 0x3FF0_0000, MEMORY_AVAILABLE));
        raw.extend(entry(20, 0xFFFC_0000, 0x4_0000, 2));

        let regions: Vec<_> = parse_memory_map(&raw).collect();
        assert_eq!(regions.len(), 3);
        assert_eq!(
            regions[1],
            MemoryRegion {
                base: 0x10_0000,
                length: 0x3FF0_0000,
                region_type: MEMORY_AVAILABLE
            }
        );
        assert_eq!(regions[2].region_type, 2);
    }

    #[test]
    fn truncated_map_stops_cleanly() {
        let mut raw = entry(20, 0, 0x1000, MEMORY_AVAILABLE);
        raw.extend_from_slice(&[0u8; 10]); // half an entry
        assert_eq!(parse_memory_map(&raw).count(), 1);
    }

    #[test]
    #[should_panic(expected = "not booted by a multiboot loader")]
    fn wrong_magic_panics() {
        check_magic(0xDEAD_BEEF);
    }

    #[test]
    fn right_magic_passes() {
        check_magic(MULTIBOOT_BOOTLOADER_MAGIC);
    }

    #[test]
    fn info_flags_decode() {
        let info = MultibootInfo {
            flags: 0b100_0001,
            mem_lower: 640,
            mem_upper: 0,
            boot_device: 0,
            cmdline: 0,
            mods_count: 0,
            mods_addr: 0,
            syms: [0; 4],
            mmap_length: 0,
            mmap_addr: 0,
        };
        assert!(info.flags().contains(InfoFlags::MEMORY));
        assert!(info.flags().contains(InfoFlags::MMAP));
        assert!(!info.flags().contains(InfoFlags::MODULES));
    }
}
