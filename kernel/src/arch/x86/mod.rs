//! i386 support: segmentation, interrupt plumbing, context switching, and
//! the ring-transition primitives the driver-isolation layer builds on.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod ring;

/// Selectors fixed by the GDT layout (low two bits carry the RPL).
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
pub const USER_CODE_SELECTOR: u16 = 0x18 | 3;
pub const USER_DATA_SELECTOR: u16 = 0x20 | 3;
pub const DRIVER_CODE_SELECTOR: u16 = 0x28 | 1;
pub const DRIVER_DATA_SELECTOR: u16 = 0x30 | 1;
pub const TSS_SELECTOR: u16 = 0x38;

/// Bring up segmentation and the interrupt table.
pub fn init() {
    gdt::init();
    idt::init();
}
