//! Driver domains: creation, port permissions, activation, and the
//! driver-ring call path.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, KernelResult};

/// Domain slots available.
pub const MAX_DRIVER_DOMAINS: usize = 8;

/// Bytes in one I/O-permission bitmap: one bit per port, set = deny.
pub const IOPB_SIZE: usize = 8192;

/// Stack handed to driver-ring execution.
pub const DRIVER_STACK_SIZE: usize = 16 * 1024;

pub type DomainId = u32;

/// Which ring a domain's driver code executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Full kernel privilege; `domain_exec` is a plain call
    KernelRing,
    /// The intermediate driver ring, gated by the IOPB
    DriverRing,
}

/// Counters exposed per domain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainStats {
    pub kernel_call_count: u64,
    /// Violations detected by the software check in the service gate.
    /// Direct `in`/`out` attempts that the hardware IOPB faults never
    /// reach this counter; the software count is the authoritative one.
    pub io_violation_count: u64,
    pub io_op_count: u64,
}

pub struct Domain {
    pub id: DomainId,
    pub name: String,
    pub level: IsolationLevel,
    /// Set bit = port denied, matching the hardware convention
    iopb: Box<[u8; IOPB_SIZE]>,
    /// Backing for the driver-ring stack; empty for kernel-ring domains
    stack: Vec<u8>,
    pub stats: DomainStats,
}

impl Domain {
    fn port_denied(&self, port: u16) -> bool {
        self.iopb[port as usize / 8] & (1 << (port % 8)) != 0
    }

    fn stack_top(&self) -> u32 {
        (self.stack.as_ptr() as usize + self.stack.len()) as u32
    }
}

struct DomainTable {
    domains: [Option<Box<Domain>>; MAX_DRIVER_DOMAINS],
    next_id: DomainId,
    /// Slot of the activated domain, if any
    current: Option<usize>,
}

static DOMAINS: Mutex<DomainTable> = Mutex::new(DomainTable {
    domains: [const { None }; MAX_DRIVER_DOMAINS],
    next_id: 1,
    current: None,
});

fn slot_of(table: &DomainTable, id: DomainId) -> KernelResult<usize> {
    table
        .domains
        .iter()
        .position(|d| matches!(d, Some(d) if d.id == id))
        .ok_or(KernelError::NotFound)
}

/// Create a domain with a deny-everything IOPB. Driver-ring domains get
/// a dedicated stack.
pub fn domain_create(name: &str, level: IsolationLevel) -> KernelResult<DomainId> {
    let mut table = DOMAINS.lock();
    let slot = table
        .domains
        .iter()
        .position(|d| d.is_none())
        .ok_or(KernelError::TryAgain)?;

    let id = table.next_id;
    table.next_id += 1;

    let stack = match level {
        IsolationLevel::DriverRing => vec![0u8; DRIVER_STACK_SIZE],
        IsolationLevel::KernelRing => Vec::new(),
    };

    table.domains[slot] = Some(Box::new(Domain {
        id,
        name: String::from(name),
        level,
        iopb: Box::new([0xFF; IOPB_SIZE]),
        stack,
        stats: DomainStats::default(),
    }));

    log::info!(
        "isolation: created domain '{}' id={} [{}]",
        name,
        id,
        match level {
            IsolationLevel::DriverRing => "driver ring",
            IsolationLevel::KernelRing => "kernel ring",
        }
    );
    Ok(id)
}

/// Tear a domain down, deactivating it first if needed.
pub fn domain_destroy(id: DomainId) -> KernelResult<()> {
    let mut table = DOMAINS.lock();
    let slot = slot_of(&table, id)?;
    if table.current == Some(slot) {
        table.current = None;
        arch::clear_iopb();
    }
    table.domains[slot] = None;
    Ok(())
}

fn flip_ports(id: DomainId, base: u16, count: u16, deny: bool) -> KernelResult<()> {
    let mut table = DOMAINS.lock();
    let slot = slot_of(&table, id)?;
    let active = table.current == Some(slot);
    let domain = table.domains[slot].as_mut().expect("slot checked live");

    for i in 0..count {
        let port = base.saturating_add(i);
        let byte = port as usize / 8;
        let bit = 1 << (port % 8);
        if deny {
            domain.iopb[byte] |= bit;
        } else {
            domain.iopb[byte] &= !bit;
        }
    }

    // Keep the installed bitmap in sync while the domain is active.
    if active {
        arch::install_iopb(&domain.iopb);
    }
    Ok(())
}

/// Permit `count` ports starting at `base`.
pub fn domain_allow_port(id: DomainId, base: u16, count: u16) -> KernelResult<()> {
    flip_ports(id, base, count, false)
}

/// Deny `count` ports starting at `base`.
pub fn domain_deny_port(id: DomainId, base: u16, count: u16) -> KernelResult<()> {
    flip_ports(id, base, count, true)
}

/// Make `id` the active domain: its IOPB goes into the TSS and the
/// driver-ring stack is installed for inward transitions.
pub fn domain_activate(id: DomainId) -> KernelResult<()> {
    let mut table = DOMAINS.lock();
    let slot = slot_of(&table, id)?;
    table.current = Some(slot);

    let domain = table.domains[slot].as_ref().expect("slot checked live");
    if domain.level == IsolationLevel::DriverRing {
        arch::set_driver_stack(domain.stack_top());
        arch::install_iopb(&domain.iopb);
    }
    Ok(())
}

/// Deactivate whatever domain is active; the installed IOPB reverts to
/// deny-everything.
pub fn domain_deactivate() {
    DOMAINS.lock().current = None;
    arch::clear_iopb();
}

/// Run `f` against the active domain's record.
pub(super) fn with_current_domain<R>(f: impl FnOnce(&mut Domain) -> R) -> Option<R> {
    let mut table = DOMAINS.lock();
    let slot = table.current?;
    table.domains[slot].as_mut().map(|d| f(d))
}

/// Run `f` against a domain by id.
pub fn with_domain<R>(id: DomainId, f: impl FnOnce(&Domain) -> R) -> KernelResult<R> {
    let table = DOMAINS.lock();
    let slot = slot_of(&table, id)?;
    Ok(f(table.domains[slot].as_ref().expect("slot checked live")))
}

pub fn domain_stats(id: DomainId) -> KernelResult<DomainStats> {
    with_domain(id, |d| d.stats)
}

/// Whether the active domain (if any) denies `port`. Used by the service
/// gate's software check.
pub(super) fn current_denies_port(port: u16) -> Option<bool> {
    with_current_domain(|d| d.level == IsolationLevel::DriverRing && d.port_denied(port))
}

/// The function shape drivers hand to [`domain_exec`].
pub type DriverFn = fn(usize) -> i32;

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod ring_call {
    //! The driver-ring call path. The kernel stack pointer and base
    //! pointer are saved, an interrupt-return frame targeting the
    //! trampoline on the domain stack is synthesized, and control drops
    //! to the driver ring. The trampoline calls the driver function and
    //! raises the driver-return interrupt; its handler repoints the
    //! stack at the saved kernel context and plain-returns, bypassing
    //! the trap-frame epilogue entirely.

    use core::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::arch::x86::ring;
    use crate::irq::TrapFrame;

    struct RingContext {
        esp: u32,
        ebp: u32,
        return_value: i32,
    }

    static CONTEXT: Mutex<RingContext> = Mutex::new(RingContext {
        esp: 0,
        ebp: 0,
        return_value: -1,
    });
    static CONTEXT_VALID: AtomicBool = AtomicBool::new(false);

    static PENDING: Mutex<Option<(DriverFn, usize)>> = Mutex::new(None);

    /// Runs in the driver ring. Calls the driver function and traps back.
    extern "C" fn trampoline() -> ! {
        let (func, arg) = PENDING.lock().take().expect("driver call pending");
        let ret = func(arg);
        // SAFETY: int 0x82 is the driver-return gate, DPL 1.
        unsafe {
            core::arch::asm!("int 0x82", in("eax") ret, options(noreturn));
        }
    }

    /// Handler for the driver-return vector.
    pub fn driver_return_trap_handler(frame: &mut TrapFrame) {
        if !CONTEXT_VALID.swap(false, Ordering::AcqRel) {
            log::error!("isolation: driver return with no saved context");
            return;
        }
        let (esp, ebp) = {
            let ctx = CONTEXT.lock();
            (ctx.esp, ctx.ebp)
        };
        domain_deactivate();
        // SAFETY: esp/ebp were captured by dispatch() just before the
        // ring transition and that frame is still live beneath us.
        unsafe { ring::resume_kernel_context(esp, ebp, frame.eax as i32) };
    }

    /// Perform one driver-ring call.
    #[inline(never)]
    pub(super) fn dispatch(stack_top: u32, func: DriverFn, arg: usize) -> i32 {
        *PENDING.lock() = Some((func, arg));
        CONTEXT_VALID.store(true, Ordering::Release);

        {
            let mut ctx = CONTEXT.lock();
            ctx.return_value = -1;
            // SAFETY: reading our own stack and frame pointers.
            unsafe {
                core::arch::asm!(
                    "mov {esp_out}, esp",
                    "mov {ebp_out}, ebp",
                    esp_out = out(reg) ctx.esp,
                    ebp_out = out(reg) ctx.ebp,
                );
            }
        }

        // SAFETY: the trampoline and the domain stack are mapped; the
        // return handler restores the context saved above. EAX carries
        // the driver's return value when control resumes here.
        unsafe {
            ring::enter_driver_ring(stack_top, trampoline as usize as u32);
            let ret: i32;
            core::arch::asm!("", out("eax") ret);
            ret
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use ring_call::driver_return_trap_handler;

/// Execute `func(arg)` under a domain. Kernel-ring domains run it as a
/// plain call; driver-ring domains go through the ring transition.
pub fn domain_exec(id: DomainId, func: DriverFn, arg: usize) -> KernelResult<i32> {
    let level = with_domain(id, |d| d.level)?;
    domain_activate(id)?;

    let result = match level {
        IsolationLevel::KernelRing => func(arg),
        IsolationLevel::DriverRing => {
            #[cfg(all(target_arch = "x86", target_os = "none"))]
            {
                let stack_top = with_domain(id, |d| d.stack_top())?;
                ring_call::dispatch(stack_top, func, arg)
            }
            #[cfg(not(all(target_arch = "x86", target_os = "none")))]
            {
                // Hosted double: no lower ring exists, but the domain is
                // active so the service gate's software checks apply.
                func(arg)
            }
        }
    };

    domain_deactivate();
    Ok(result)
}


#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn iopb_bits_flip_per_port() {
        let id = domain_create("iopb-test", IsolationLevel::DriverRing).expect("slot");

        with_domain(id, |d| {
            assert!(d.port_denied(0x60), "fresh domain denies everything");
        })
        .unwrap();

        domain_allow_port(id, 0x60, 1).expect("allow");
        with_domain(id, |d| {
            assert!(!d.port_denied(0x60));
            assert!(d.port_denied(0x61), "only the allowed port opened");
        })
        .unwrap();

        domain_allow_port(id, 0x3F8, 8).expect("allow range");
        with_domain(id, |d| {
            for port in 0x3F8..0x400 {
                assert!(!d.port_denied(port));
            }
        })
        .unwrap();

        domain_deny_port(id, 0x3F8, 8).expect("deny range");
        with_domain(id, |d| assert!(d.port_denied(0x3F8))).unwrap();

        domain_destroy(id).expect("cleanup");
    }

    #[test]
    fn kernel_ring_exec_is_a_plain_call() {
        let _guard = testing::lock();
        let id = domain_create("k-exec", IsolationLevel::KernelRing).expect("slot");
        fn double(arg: usize) -> i32 {
            (arg * 2) as i32
        }
        assert_eq!(domain_exec(id, double, 21).expect("exec"), 42);
        domain_destroy(id).expect("cleanup");
    }

    #[test]
    fn unknown_domain_is_reported() {
        assert!(domain_activate(9999).is_err());
        assert!(domain_allow_port(9999, 0, 1).is_err());
        assert!(domain_stats(9999).is_err());
    }
}
