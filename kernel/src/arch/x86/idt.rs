//! Interrupt descriptor table and the low-level trap stubs.
//!
//! Every populated vector funnels through one common stub that saves the
//! general-purpose registers and segment selectors into a [`TrapFrame`]
//! and calls into the portable dispatch layer. Software vectors: 0x80 is
//! the syscall gate (callable from ring 3), 0x81 and 0x82 are the
//! driver-isolation service and return gates (callable from ring 1).

use core::arch::global_asm;
use core::mem::size_of;

use lazy_static::lazy_static;
use spin::Mutex;

use super::KERNEL_CODE_SELECTOR;
use crate::irq::{self, TrapFrame, DRIVER_RETURN_VECTOR, DRIVER_SERVICE_VECTOR, SYSCALL_VECTOR};

const IDT_ENTRIES: usize = 256;

/// Hardware vectors with stubs: 32 exceptions, 16 remapped IRQs.
const STUB_COUNT: usize = 51;

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    /// 32-bit interrupt gate with the given descriptor privilege level.
    fn interrupt_gate(handler: u32, dpl: u8) -> Self {
        Self {
            offset_low: (handler & 0xFFFF) as u16,
            selector: KERNEL_CODE_SELECTOR,
            zero: 0,
            type_attr: 0x8E | (dpl << 5),
            offset_high: ((handler >> 16) & 0xFFFF) as u16,
        }
    }
}

#[repr(C, packed)]
struct DescriptorPointer {
    limit: u16,
    base: u32,
}

lazy_static! {
    static ref IDT: Mutex<[IdtEntry; IDT_ENTRIES]> = Mutex::new([IdtEntry::missing(); IDT_ENTRIES]);
}

extern "C" {
    /// Stub addresses in vector order: 0..=31, 32..=47, 0x80, 0x81, 0x82.
    static trap_vector_table: [u32; STUB_COUNT];
}

/// Populate and load the IDT, then remap the legacy PIC so IRQs land on
/// vectors 32..=47.
pub fn init() {
    {
        let mut idt = IDT.lock();
        // SAFETY: the table is emitted by the global_asm! block below with
        // exactly STUB_COUNT entries.
        let stubs = unsafe { &trap_vector_table };

        for (i, &stub) in stubs.iter().enumerate().take(48) {
            idt[i] = IdtEntry::interrupt_gate(stub, 0);
        }
        // Syscall gate reachable from user ring.
        idt[SYSCALL_VECTOR as usize] = IdtEntry::interrupt_gate(stubs[48], 3);
        // Driver service + return gates reachable from the driver ring.
        idt[DRIVER_SERVICE_VECTOR as usize] = IdtEntry::interrupt_gate(stubs[49], 1);
        idt[DRIVER_RETURN_VECTOR as usize] = IdtEntry::interrupt_gate(stubs[50], 1);

        let pointer = DescriptorPointer {
            limit: (IDT_ENTRIES * size_of::<IdtEntry>() - 1) as u16,
            base: idt.as_ptr() as u32,
        };
        // SAFETY: the IDT is a live static; the pointer describes it.
        unsafe {
            core::arch::asm!("lidt [{0}]", in(reg) &pointer);
        }
    }

    irq::remap_pic();
    log::info!("idt: {} vectors populated, PIC remapped", STUB_COUNT);
}

/// Rust-side landing point for the common stub.
#[no_mangle]
extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    irq::dispatch(frame);
}

// Trap stubs. Exceptions that push an architectural error code skip the
// dummy push; everything else keeps the frame layout uniform.
global_asm!(
    r#"
.macro TRAP_NOERR n
trap_stub_\n:
    push 0
    push \n
    jmp trap_common
.endm

.macro TRAP_ERR n
trap_stub_\n:
    push \n
    jmp trap_common
.endm

.section .text

TRAP_NOERR 0
TRAP_NOERR 1
TRAP_NOERR 2
TRAP_NOERR 3
TRAP_NOERR 4
TRAP_NOERR 5
TRAP_NOERR 6
TRAP_NOERR 7
TRAP_ERR   8
TRAP_NOERR 9
TRAP_ERR   10
TRAP_ERR   11
TRAP_ERR   12
TRAP_ERR   13
TRAP_ERR   14
TRAP_NOERR 15
TRAP_NOERR 16
TRAP_ERR   17
TRAP_NOERR 18
TRAP_NOERR 19
TRAP_NOERR 20
TRAP_NOERR 21
TRAP_NOERR 22
TRAP_NOERR 23
TRAP_NOERR 24
TRAP_NOERR 25
TRAP_NOERR 26
TRAP_NOERR 27
TRAP_NOERR 28
TRAP_NOERR 29
TRAP_NOERR 30
TRAP_NOERR 31
TRAP_NOERR 32
TRAP_NOERR 33
TRAP_NOERR 34
TRAP_NOERR 35
TRAP_NOERR 36
TRAP_NOERR 37
TRAP_NOERR 38
TRAP_NOERR 39
TRAP_NOERR 40
TRAP_NOERR 41
TRAP_NOERR 42
TRAP_NOERR 43
TRAP_NOERR 44
TRAP_NOERR 45
TRAP_NOERR 46
TRAP_NOERR 47
TRAP_NOERR 128
TRAP_NOERR 129
TRAP_NOERR 130

trap_common:
    pusha
    push ds
    push es
    push fs
    push gs
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov fs, ax
    mov gs, ax
    push esp
    call trap_dispatch
    add esp, 4
    pop gs
    pop fs
    pop es
    pop ds
    popa
    add esp, 8
    iretd

.section .rodata
.global trap_vector_table
trap_vector_table:
    .long trap_stub_0,  trap_stub_1,  trap_stub_2,  trap_stub_3
    .long trap_stub_4,  trap_stub_5,  trap_stub_6,  trap_stub_7
    .long trap_stub_8,  trap_stub_9,  trap_stub_10, trap_stub_11
    .long trap_stub_12, trap_stub_13, trap_stub_14, trap_stub_15
    .long trap_stub_16, trap_stub_17, trap_stub_18, trap_stub_19
    .long trap_stub_20, trap_stub_21, trap_stub_22, trap_stub_23
    .long trap_stub_24, trap_stub_25, trap_stub_26, trap_stub_27
    .long trap_stub_28, trap_stub_29, trap_stub_30, trap_stub_31
    .long trap_stub_32, trap_stub_33, trap_stub_34, trap_stub_35
    .long trap_stub_36, trap_stub_37, trap_stub_38, trap_stub_39
    .long trap_stub_40, trap_stub_41, trap_stub_42, trap_stub_43
    .long trap_stub_44, trap_stub_45, trap_stub_46, trap_stub_47
    .long trap_stub_128, trap_stub_129, trap_stub_130
"#
);
