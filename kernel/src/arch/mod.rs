//! Architecture layer.
//!
//! The i386 implementation lives in [`x86`]; every primitive the portable
//! kernel consumes is re-exported from here. Hosted builds (the unit-test
//! harness) get inert software doubles instead, so the portable layers
//! compile and run everywhere while the hardware-touching code is only
//! built for the bare-metal target.

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub mod x86;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    pub use super::x86::context::{context_switch, prepare_task_stack};
    pub use super::x86::gdt::set_kernel_stack;

    /// Halt the CPU until the next interrupt, forever.
    pub fn halt() -> ! {
        loop {
            // SAFETY: hlt with interrupts enabled just idles the CPU.
            unsafe {
                ::x86::irq::enable();
                ::x86::halt();
            }
        }
    }

    pub fn enable_interrupts() {
        // SAFETY: sti in kernel context.
        unsafe { ::x86::irq::enable() }
    }

    pub fn disable_interrupts() {
        // SAFETY: cli in kernel context.
        unsafe { ::x86::irq::disable() }
    }

    pub fn interrupts_enabled() -> bool {
        // SAFETY: reading EFLAGS has no side effects.
        let flags = unsafe { ::x86::bits32::eflags::read() };
        flags.contains(::x86::bits32::eflags::EFlags::FLAGS_IF)
    }

    /// Run `f` with interrupts disabled, restoring the prior state after.
    pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
        let were_enabled = interrupts_enabled();
        disable_interrupts();
        let result = f();
        if were_enabled {
            enable_interrupts();
        }
        result
    }

    pub fn flush_tlb_page(addr: u32) {
        // SAFETY: invlpg on any address is harmless.
        unsafe { ::x86::tlb::flush(addr as usize) }
    }

    pub fn read_page_directory_base() -> u32 {
        // SAFETY: reading CR3 has no side effects.
        (unsafe { ::x86::controlregs::cr3() }) as u32
    }

    pub fn read_fault_address() -> u32 {
        // SAFETY: reading CR2 has no side effects.
        (unsafe { ::x86::controlregs::cr2() }) as u32
    }

    pub fn inb(port: u16) -> u8 {
        // SAFETY: port reads are gated by the caller's IOPB policy.
        unsafe { ::x86::io::inb(port) }
    }

    pub fn inw(port: u16) -> u16 {
        // SAFETY: as inb.
        unsafe { ::x86::io::inw(port) }
    }

    pub fn inl(port: u16) -> u32 {
        // SAFETY: as inb.
        unsafe { ::x86::io::inl(port) }
    }

    pub fn outb(port: u16, value: u8) {
        // SAFETY: port writes are gated by the caller's IOPB policy.
        unsafe { ::x86::io::outb(port, value) }
    }

    pub fn outw(port: u16, value: u16) {
        // SAFETY: as outb.
        unsafe { ::x86::io::outw(port, value) }
    }

    pub fn outl(port: u16, value: u32) {
        // SAFETY: as outb.
        unsafe { ::x86::io::outl(port, value) }
    }

    /// Install a domain's I/O-permission bitmap in the TSS.
    pub fn install_iopb(iopb: &[u8; 8192]) {
        super::x86::gdt::set_iopb(iopb);
    }

    /// Revert the installed IOPB to deny-everything.
    pub fn clear_iopb() {
        super::x86::gdt::clear_iopb();
    }

    /// Install the stack used on transitions into the driver ring.
    pub fn set_driver_stack(top: u32) {
        super::x86::gdt::set_driver_stack(top);
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    //! Inert doubles for hosted builds. Port reads return the bus-idle
    //! pattern so "no device" paths behave as on real hardware.

    pub fn halt() -> ! {
        unreachable!("halt is only meaningful on the bare-metal target")
    }

    pub fn enable_interrupts() {}

    pub fn disable_interrupts() {}

    pub fn interrupts_enabled() -> bool {
        false
    }

    pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
        f()
    }

    pub fn flush_tlb_page(_addr: u32) {}

    pub fn read_page_directory_base() -> u32 {
        0
    }

    pub fn read_fault_address() -> u32 {
        0
    }

    pub fn inb(_port: u16) -> u8 {
        0xFF
    }

    pub fn inw(_port: u16) -> u16 {
        0xFFFF
    }

    pub fn inl(_port: u16) -> u32 {
        0xFFFF_FFFF
    }

    pub fn outb(_port: u16, _value: u8) {}

    pub fn outw(_port: u16, _value: u16) {}

    pub fn outl(_port: u16, _value: u32) {}

    pub fn install_iopb(_iopb: &[u8; 8192]) {}

    pub fn clear_iopb() {}

    pub fn set_driver_stack(_top: u32) {}

    /// Context switches cannot happen on the host; the scheduler logic
    /// around them is what the test suite exercises.
    ///
    /// # Safety
    ///
    /// No-op; present to mirror the bare-metal signature.
    pub unsafe fn context_switch(_prev_esp: *mut u32, _next_esp: u32) {}

    /// On the host a task's stack is never actually entered, so the seeded
    /// frame is just the stack top.
    pub fn prepare_task_stack(stack_top: usize, _entry: fn(), _exit: fn()) -> usize {
        stack_top
    }

    pub fn set_kernel_stack(_top: u32) {}
}

pub use imp::*;
