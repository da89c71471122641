//! Interrupt and trap dispatch.
//!
//! The architecture stubs deliver every trap here with a saved register
//! frame. Vectors 0..=31 are CPU exceptions: unhandled ones panic with a
//! full register dump. Vectors 32..=47 are hardware IRQs behind the
//! remapped legacy PIC: unhandled ones are acknowledged silently.
//! Software vectors carry the syscall gate and the two driver-isolation
//! gates; they dispatch like any other registered handler.

use spin::RwLock;

use crate::arch;

/// Software-trap vector numbers.
pub const SYSCALL_VECTOR: u8 = 0x80;
pub const DRIVER_SERVICE_VECTOR: u8 = 0x81;
pub const DRIVER_RETURN_VECTOR: u8 = 0x82;

/// First vector the remapped PIC delivers IRQs on.
pub const IRQ_BASE: u8 = 32;

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;
const PIC_EOI: u8 = 0x20;

/// Saved register frame, in the exact order the common stub pushes it.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub int_no: u32,
    pub err_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub user_esp: u32,
    pub ss: u32,
}

impl TrapFrame {
    /// A zeroed frame for hosted tests exercising the dispatch paths.
    #[cfg(not(all(target_arch = "x86", target_os = "none")))]
    pub fn empty(int_no: u32) -> Self {
        Self {
            gs: 0,
            fs: 0,
            es: 0,
            ds: 0,
            edi: 0,
            esi: 0,
            ebp: 0,
            esp_dummy: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            int_no,
            err_code: 0,
            eip: 0,
            cs: 0,
            eflags: 0,
            user_esp: 0,
            ss: 0,
        }
    }
}

/// Trap handlers are plain functions over the saved frame.
pub type TrapHandler = fn(&mut TrapFrame);

static HANDLERS: RwLock<[Option<TrapHandler>; 256]> = RwLock::new([None; 256]);

static EXCEPTION_NAMES: [&str; 32] = [
    "divide error",
    "debug",
    "non-maskable interrupt",
    "breakpoint",
    "overflow",
    "bound range exceeded",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor segment overrun",
    "invalid TSS",
    "segment not present",
    "stack-segment fault",
    "general protection fault",
    "page fault",
    "reserved",
    "x87 floating-point error",
    "alignment check",
    "machine check",
    "SIMD floating-point error",
    "virtualization error",
    "control protection",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
    "reserved",
];

/// Register a handler for a trap vector, displacing any previous one.
pub fn register_handler(vector: u8, handler: TrapHandler) {
    HANDLERS.write()[vector as usize] = Some(handler);
}

/// Remove a vector's handler.
pub fn unregister_handler(vector: u8) {
    HANDLERS.write()[vector as usize] = None;
}

/// Demultiplex one trap. Called by the architecture stub with interrupts
/// disabled.
pub fn dispatch(frame: &mut TrapFrame) {
    let vector = frame.int_no as usize;
    let handler = HANDLERS.read()[vector];

    match vector {
        0..=31 => match handler {
            Some(h) => h(frame),
            None => panic_on_exception(frame),
        },
        32..=47 => {
            if let Some(h) = handler {
                h(frame);
            }
            send_eoi((vector - IRQ_BASE as usize) as u8);
        }
        _ => match handler {
            Some(h) => h(frame),
            None => log::warn!("irq: spurious trap on vector {}", vector),
        },
    }
}

fn panic_on_exception(frame: &TrapFrame) -> ! {
    let name = EXCEPTION_NAMES
        .get(frame.int_no as usize)
        .copied()
        .unwrap_or("unknown");
    panic!(
        "unhandled exception {} ({}) err={:#x}\n\
         eax={:#010x} ebx={:#010x} ecx={:#010x} edx={:#010x}\n\
         esi={:#010x} edi={:#010x} ebp={:#010x}\n\
         eip={:#010x} cs={:#06x} eflags={:#010x}",
        frame.int_no,
        name,
        frame.err_code,
        frame.eax,
        frame.ebx,
        frame.ecx,
        frame.edx,
        frame.esi,
        frame.edi,
        frame.ebp,
        frame.eip,
        frame.cs,
        frame.eflags,
    );
}

/// Remap the two cascaded 8259s so IRQs 0..=15 land on vectors 32..=47,
/// clear of the CPU exception range.
pub fn remap_pic() {
    // ICW1: begin initialization, expect ICW4.
    arch::outb(PIC1_COMMAND, 0x11);
    arch::outb(PIC2_COMMAND, 0x11);
    // ICW2: vector offsets.
    arch::outb(PIC1_DATA, IRQ_BASE);
    arch::outb(PIC2_DATA, IRQ_BASE + 8);
    // ICW3: cascade wiring (slave on IRQ 2).
    arch::outb(PIC1_DATA, 0x04);
    arch::outb(PIC2_DATA, 0x02);
    // ICW4: 8086 mode.
    arch::outb(PIC1_DATA, 0x01);
    arch::outb(PIC2_DATA, 0x01);
    // Unmask everything; handlers decide what they care about.
    arch::outb(PIC1_DATA, 0x00);
    arch::outb(PIC2_DATA, 0x00);
}

/// Acknowledge an IRQ at the controller. IRQs behind the slave need the
/// acknowledgment at both chips.
pub fn send_eoi(irq: u8) {
    if irq >= 8 {
        arch::outb(PIC2_COMMAND, PIC_EOI);
    }
    arch::outb(PIC1_COMMAND, PIC_EOI);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use core::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    static SEEN: AtomicU32 = AtomicU32::new(0);

    fn recording_handler(frame: &mut TrapFrame) {
        SEEN.store(frame.int_no, Ordering::SeqCst);
        frame.eax = 0x1234;
    }

    #[test]
    fn registered_handler_receives_frame_and_may_mutate_it() {
        register_handler(200, recording_handler);
        let mut frame = TrapFrame::empty(200);
        dispatch(&mut frame);
        assert_eq!(SEEN.load(Ordering::SeqCst), 200);
        assert_eq!(frame.eax, 0x1234, "handlers write results into the frame");
        unregister_handler(200);
    }

    #[test]
    fn unregistered_irq_is_silently_acknowledged() {
        // Must not panic: IRQ range traps without handlers are just EOI'd.
        let mut frame = TrapFrame::empty(IRQ_BASE as u32 + 5);
        dispatch(&mut frame);
    }

    #[test]
    #[should_panic(expected = "unhandled exception")]
    fn unregistered_exception_panics_with_dump() {
        let mut frame = TrapFrame::empty(6);
        dispatch(&mut frame);
    }
}
