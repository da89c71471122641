//! Global descriptor table and the task-state segment.
//!
//! Four privilege rings are populated: kernel (0), driver (1), and user
//! (3) each get a code and a data descriptor. One 32-bit TSS carries the
//! ring-0 and ring-1 stack pointers used on inward ring transitions plus
//! the I/O-permission bitmap consulted for `in`/`out` at CPL > IOPL.

use core::mem::size_of;

use lazy_static::lazy_static;
use spin::Mutex;

use super::{DRIVER_DATA_SELECTOR, KERNEL_DATA_SELECTOR, TSS_SELECTOR};

/// Bytes in the I/O-permission bitmap: one bit per port, 65536 ports.
pub const IOPB_SIZE: usize = 8192;

const GDT_ENTRIES: usize = 8;

/// One segment descriptor, packed as the CPU reads it.
#[derive(Clone, Copy)]
#[repr(C, packed)]
struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_mid: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_mid: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    fn new(base: u32, limit: u32, access: u8, granularity: u8) -> Self {
        Self {
            limit_low: (limit & 0xFFFF) as u16,
            base_low: (base & 0xFFFF) as u16,
            base_mid: ((base >> 16) & 0xFF) as u8,
            access,
            granularity: (granularity & 0xF0) | (((limit >> 16) & 0x0F) as u8),
            base_high: ((base >> 24) & 0xFF) as u8,
        }
    }
}

/// 32-bit TSS followed immediately by the IOPB so `iomap_base` can point
/// past the fixed fields. The trailing 0xFF terminator byte is
/// architectural.
#[repr(C, packed)]
pub struct TssBlock {
    prev_task: u32,
    esp0: u32,
    ss0: u32,
    esp1: u32,
    ss1: u32,
    esp2: u32,
    ss2: u32,
    cr3: u32,
    eip: u32,
    eflags: u32,
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    es: u32,
    cs: u32,
    ss: u32,
    ds: u32,
    fs: u32,
    gs: u32,
    ldt: u32,
    trap: u16,
    iomap_base: u16,
    iopb: [u8; IOPB_SIZE],
    terminator: u8,
}

impl TssBlock {
    const fn new() -> Self {
        Self {
            prev_task: 0,
            esp0: 0,
            ss0: KERNEL_DATA_SELECTOR as u32,
            esp1: 0,
            ss1: DRIVER_DATA_SELECTOR as u32,
            esp2: 0,
            ss2: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            fs: 0,
            gs: 0,
            ldt: 0,
            trap: 0,
            iomap_base: (size_of::<TssBlock>() - IOPB_SIZE - 1) as u16,
            // Deny every port until a domain is activated.
            iopb: [0xFF; IOPB_SIZE],
            terminator: 0xFF,
        }
    }
}

static TSS: Mutex<TssBlock> = Mutex::new(TssBlock::new());

lazy_static! {
    static ref GDT: Mutex<[GdtEntry; GDT_ENTRIES]> = {
        let tss_base = { &raw const *TSS.lock() } as u32;
        let tss_limit = size_of::<TssBlock>() as u32 - 1;
        Mutex::new([
            GdtEntry::null(),
            // Kernel code / data: ring 0, flat 4 GiB.
            GdtEntry::new(0, 0xFFFFF, 0x9A, 0xC0),
            GdtEntry::new(0, 0xFFFFF, 0x92, 0xC0),
            // User code / data: ring 3.
            GdtEntry::new(0, 0xFFFFF, 0xFA, 0xC0),
            GdtEntry::new(0, 0xFFFFF, 0xF2, 0xC0),
            // Driver code / data: ring 1, between kernel and user.
            GdtEntry::new(0, 0xFFFFF, 0xBA, 0xC0),
            GdtEntry::new(0, 0xFFFFF, 0xB2, 0xC0),
            // 32-bit available TSS.
            GdtEntry::new(tss_base, tss_limit, 0x89, 0x00),
        ])
    };
}

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

/// Load the GDT, reload segment registers, and load the task register.
pub fn init() {
    let gdt = GDT.lock();
    let pointer = DescriptorPointer {
        limit: (GDT_ENTRIES * size_of::<GdtEntry>() - 1) as u16,
        base: gdt.as_ptr() as u32,
    };

    // SAFETY: the GDT is a live static and the descriptor layout above
    // follows the architectural format; the selector constants match the
    // table indices.
    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            "mov ax, {data}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "mov ss, ax",
            // Far jump to reload CS.
            "push {code}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            "mov ax, {tss}",
            "ltr ax",
            ptr = in(reg) &pointer,
            data = const KERNEL_DATA_SELECTOR as u32,
            code = const super::KERNEL_CODE_SELECTOR as u32,
            tss = const TSS_SELECTOR as u32,
            out("eax") _,
        );
    }

    log::info!("gdt: 4-ring segmentation loaded, IOPB deny-all");
}

/// Install the ring-0 stack used on user/driver -> kernel transitions.
pub fn set_kernel_stack(top: u32) {
    TSS.lock().esp0 = top;
}

/// Install the ring-1 stack used when entering the driver ring.
pub fn set_driver_stack(top: u32) {
    TSS.lock().esp1 = top;
}

/// Copy a domain's IOPB into the TSS.
pub fn set_iopb(iopb: &[u8; IOPB_SIZE]) {
    TSS.lock().iopb.copy_from_slice(iopb);
}

/// Restore the deny-everything IOPB.
pub fn clear_iopb() {
    TSS.lock().iopb.fill(0xFF);
}
