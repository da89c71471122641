//! 16550 UART console on COM1.
//!
//! The kernel's log sink and panic channel. Written against the arch
//! port primitives, so hosted builds compile the same code with the
//! ports stubbed out.

use core::fmt;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::arch;

const COM1: u16 = 0x3F8;

pub struct SerialPort {
    base: u16,
}

impl SerialPort {
    const fn new(base: u16) -> Self {
        Self { base }
    }

    /// Program 115200 8N1 with FIFOs enabled.
    pub fn init(&mut self) {
        arch::outb(self.base + 1, 0x00); // disable interrupts
        arch::outb(self.base + 3, 0x80); // DLAB on
        arch::outb(self.base, 0x01); // divisor 1 = 115200
        arch::outb(self.base + 1, 0x00);
        arch::outb(self.base + 3, 0x03); // 8N1, DLAB off
        arch::outb(self.base + 2, 0xC7); // FIFO on, clear, 14-byte trigger
        arch::outb(self.base + 4, 0x0B); // DTR | RTS | OUT2
    }

    fn transmit_ready(&self) -> bool {
        arch::inb(self.base + 5) & 0x20 != 0
    }

    pub fn write_byte(&mut self, byte: u8) {
        let mut spins = 0u32;
        while !self.transmit_ready() {
            spins += 1;
            if spins > 100_000 {
                // Dead UART; drop the byte rather than hang the kernel.
                return;
            }
        }
        arch::outb(self.base, byte);
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.write_byte(b'\r');
            }
            self.write_byte(byte);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref SERIAL1: Mutex<SerialPort> = Mutex::new(SerialPort::new(COM1));
}

/// Bring the console up. Called before anything logs.
pub fn init() {
    SERIAL1.lock().init();
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    arch::without_interrupts(|| {
        let _ = SERIAL1.lock().write_fmt(args);
    });
}
