//! Ring-transition primitives for driver isolation.
//!
//! Entering the driver ring is a synthesized `iretd` to ring-1 selectors;
//! leaving it bypasses the normal trap return entirely. The hardware
//! return instruction insists on either a same-privilege or a
//! cross-privilege stack layout, and the frame present at that point
//! encodes the wrong one, so the return path repoints the stack at the
//! saved kernel context and executes a plain `ret` instead. Everything
//! above these two functions is ordinary portable code.

use core::arch::asm;

use super::{
    DRIVER_CODE_SELECTOR, DRIVER_DATA_SELECTOR, KERNEL_DATA_SELECTOR, USER_CODE_SELECTOR,
    USER_DATA_SELECTOR,
};

/// Drop to the driver ring at `eip` on the domain stack `esp`.
///
/// Control does not come back through this call: the trampoline running in
/// the driver ring raises the driver-return interrupt, whose handler
/// resumes the saved kernel context via [`resume_kernel_context`].
///
/// # Safety
///
/// `eip` must point at the driver trampoline and `esp` at the top of a
/// mapped driver stack. The caller must have saved its ESP/EBP for the
/// return handler first.
pub unsafe fn enter_driver_ring(esp: u32, eip: u32) {
    // SAFETY: the synthesized frame carries valid ring-1 selectors; data
    // segments are switched before the iretd so the trampoline starts on
    // consistent segments.
    unsafe {
        asm!(
            "mov ax, {ds}",
            "mov ds, ax",
            "mov es, ax",
            "mov fs, ax",
            "mov gs, ax",
            "push {ds}",    // ss
            "push {esp_v}", // esp
            "pushfd",       // eflags (interrupts stay as they are)
            "push {cs}",    // cs
            "push {eip_v}", // eip
            "iretd",
            ds = const DRIVER_DATA_SELECTOR as u32,
            cs = const DRIVER_CODE_SELECTOR as u32,
            esp_v = in(reg) esp,
            eip_v = in(reg) eip,
            out("eax") _,
        );
    }
}

/// Drop to user ring at `entry` with the user stack pointer `esp`. The
/// synthesized frame enables interrupts for user execution.
///
/// # Safety
///
/// `entry` and `esp` must reference mapped user memory in the current
/// address space.
pub unsafe fn enter_user_mode(entry: u32, esp: u32) -> ! {
    // SAFETY: the frame carries ring-3 selectors; EFLAGS sets IF and the
    // architectural reserved bit.
    unsafe {
        asm!(
            "mov cx, {ds}",
            "mov ds, cx",
            "mov es, cx",
            "mov fs, cx",
            "mov gs, cx",
            "push {ds}",     // ss
            "push {esp_v}",  // esp
            "push 0x202",    // eflags: IF | reserved
            "push {cs}",     // cs
            "push {eip_v}",  // eip
            "iretd",
            ds = const USER_DATA_SELECTOR as u32,
            cs = const USER_CODE_SELECTOR as u32,
            esp_v = in(reg) esp,
            eip_v = in(reg) entry,
            out("ecx") _,
            options(noreturn),
        );
    }
}

/// Abandon the current interrupt stack and resume the kernel context that
/// initiated the driver-ring call: restore kernel data segments, adopt the
/// saved ESP/EBP, place the driver's return value in EAX, and `ret` to the
/// address the dispatch helper left on its stack.
///
/// # Safety
///
/// `saved_esp`/`saved_ebp` must be the values captured immediately before
/// [`enter_driver_ring`], with the dispatch helper's return address still
/// on that stack.
pub unsafe fn resume_kernel_context(saved_esp: u32, saved_ebp: u32, return_value: i32) -> ! {
    // SAFETY: the caller guarantees the saved stack is intact; after the
    // stack switch the pending `ret` pops the dispatch helper's return
    // address, unwinding the abandoned trap frame implicitly.
    unsafe {
        asm!(
            "mov cx, {ds}",
            "mov ds, cx",
            "mov es, cx",
            "mov fs, cx",
            "mov gs, cx",
            "mov ss, cx",
            "mov esp, {esp_v}",
            "mov ebp, {ebp_v}",
            "sti",
            "ret",
            ds = const KERNEL_DATA_SELECTOR as u32,
            esp_v = in(reg) saved_esp,
            ebp_v = in(reg) saved_ebp,
            in("eax") return_value,
            out("ecx") _,
            options(noreturn),
        );
    }
}
