//! CinderOS kernel library.
//!
//! A 32-bit protected-mode monolithic kernel for the i386: paged virtual
//! memory behind a recursively-mapped page directory, a preemptive
//! round-robin scheduler with priority inheritance, UNIX-like processes
//! with signals and file descriptors, ring-1 driver isolation gated by
//! per-domain I/O-port bitmaps, and a VFS carrying an in-memory
//! filesystem and FAT32.
//!
//! Everything above the architecture line also builds for the host,
//! where the unit-test suite runs under the standard harness against
//! software doubles of the paging and ring-transition hardware.

#![no_std]

extern crate alloc;

// Host builds link std so the test harness and its allocator exist.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod boot;
pub mod elf;
pub mod error;
pub mod fs;
pub mod ipc;
pub mod irq;
pub mod isolation;
pub mod logger;
pub mod mm;
pub mod net;
pub mod process;
pub mod sched;
pub mod serial;
pub mod syscall;
pub mod timer;

// Re-exports for the boot binary and external collaborators.
pub use error::{KernelError, KernelResult};
pub use mm::{FrameNumber, PhysicalAddress, VirtualAddress, FRAME_SIZE, PAGE_SIZE};
