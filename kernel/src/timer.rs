//! System tick counter.
//!
//! The timer interrupt advances a monotonic tick count (one tick per
//! millisecond at the programmed rate). Sleep deadlines and process
//! accounting consume it; hosted tests advance it by hand.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::arch;

/// Programmed timer interrupt rate.
pub const TICK_HZ: u64 = 1000;

const PIT_COMMAND: u16 = 0x43;
const PIT_CHANNEL0: u16 = 0x40;
const PIT_INPUT_HZ: u64 = 1_193_182;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
    ticks() * 1000 / TICK_HZ
}

/// Called by the timer interrupt handler on every tick.
pub fn on_tick() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    crate::sched::scheduler_tick();
}

/// Program channel 0 of the PIT for periodic interrupts at [`TICK_HZ`].
pub fn init() {
    let divisor = (PIT_INPUT_HZ / TICK_HZ) as u16;
    // Channel 0, lobyte/hibyte access, square-wave mode.
    arch::outb(PIT_COMMAND, 0x36);
    arch::outb(PIT_CHANNEL0, (divisor & 0xFF) as u8);
    arch::outb(PIT_CHANNEL0, (divisor >> 8) as u8);
    log::info!("timer: PIT programmed for {} Hz", TICK_HZ);
}

/// Advance time without a hardware interrupt. Hosted tests only.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn advance_for_test(ticks: u64) {
    TICKS.fetch_add(ticks, Ordering::Relaxed);
}
