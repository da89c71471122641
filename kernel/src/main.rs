//! CinderOS boot binary.
//!
//! Multiboot entry, the boot-time initialization sequence, and the glue
//! handlers wiring the timer and page-fault vectors into their
//! subsystems. Built only for the bare-metal target; the hosted build
//! is a stub so the workspace compiles everywhere.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod kernel_entry {
    use core::panic::PanicInfo;

    use cinder_kernel::irq::TrapFrame;
    use cinder_kernel::process::pcb::SIGSEGV;
    use cinder_kernel::{
        arch, boot, fs, ipc, irq, isolation, logger, mm, println, process, sched, serial,
        syscall, timer,
    };

    // Multiboot header: magic, flags (page-align modules + memory info),
    // checksum. Must sit in the first 8 KiB of the image.
    core::arch::global_asm!(
        r#"
.section .multiboot
.align 4
.long 0x1BADB002
.long 0x00000003
.long -(0x1BADB002 + 0x00000003)

.section .bss
.align 16
boot_stack_bottom:
.skip 65536
boot_stack_top:

.section .text
.global _start
_start:
    mov esp, offset boot_stack_top
    push ebx
    push eax
    call kernel_main
1:  hlt
    jmp 1b
"#
    );

    #[no_mangle]
    extern "C" fn kernel_main(magic: u32, info: *const boot::MultibootInfo) -> ! {
        serial::init();
        logger::init();
        println!("CinderOS v{}", env!("CARGO_PKG_VERSION"));

        boot::check_magic(magic);
        // SAFETY: the loader's info structure is identity-accessible and
        // outlives boot.
        let info = unsafe { &*info };

        arch::x86::init();
        boot::ingest_memory_map(info);
        if let Err(e) = mm::vmm::init_paging() {
            panic!("paging bring-up failed: {}", e);
        }

        irq::register_handler(14, page_fault_trap);
        irq::register_handler(32, timer_trap);

        process::init();
        sched::init();
        isolation::init();

        let root_fs = fs::ramfs::RamFs::new();
        fs::set_root(root_fs.root());
        if let Ok(root) = fs::lookup("/") {
            let _ = root.create("tmp", fs::NodeType::Directory, fs::Permissions::DIR_DEFAULT);
            let _ = root.create("mnt", fs::NodeType::Directory, fs::Permissions::DIR_DEFAULT);
        }
        if let Err(e) = fs::mount("/tmp", fs::ramfs::RamFs::new().root()) {
            log::warn!("boot: /tmp mount failed: {}", e);
        }

        ipc::init();
        syscall::init();
        timer::init();

        sched::enable();
        arch::enable_interrupts();
        log::info!("boot: kernel up, waiting for work");

        arch::halt();
    }

    /// Timer interrupt: advance the tick counter, which drives the
    /// scheduler.
    fn timer_trap(_frame: &mut TrapFrame) {
        timer::on_tick();
    }

    /// Page faults go to the VMA layer; what it cannot satisfy kills the
    /// faulting user process or panics the kernel.
    fn page_fault_trap(frame: &mut TrapFrame) {
        let fault_addr = arch::read_fault_address();
        let pid = sched::current_pid();

        match mm::page_fault::handle_page_fault(pid, fault_addr, frame.err_code) {
            Ok(()) => {}
            Err(e) => {
                if frame.err_code & mm::page_fault::FAULT_USER != 0 {
                    log::error!(
                        "page fault: pid {} at {:#010x} unresolvable ({}), killing",
                        pid,
                        fault_addr,
                        e
                    );
                    let _ = process::signal::send(pid, SIGSEGV);
                    process::signal::check_pending();
                } else {
                    panic!(
                        "kernel page fault at {:#010x} (eip {:#010x}, err {:#x})",
                        fault_addr, frame.eip, frame.err_code
                    );
                }
            }
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        arch::disable_interrupts();
        println!("[KERNEL PANIC] {}", info);
        loop {
            // Interrupts are off; spin in place forever.
            core::hint::spin_loop();
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("cinder-kernel is a bare-metal image; boot it under a multiboot loader");
}
