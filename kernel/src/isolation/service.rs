//! The kernel-service gate for driver-ring code.
//!
//! A driver in the lower ring asks for privileged work by raising the
//! service vector with a service id and up to three arguments in
//! registers. The whitelist is small: memory, logging, and guarded port
//! I/O. Port operations are checked against the active domain's IOPB in
//! software as well, so a violation is counted and reported even though
//! the hardware bitmap would already fault a direct access.

use super::domain::{self, IsolationLevel};
use crate::arch;

/// Whitelisted service ids.
pub const SVC_ALLOC_MEM: u32 = 1;
pub const SVC_FREE_MEM: u32 = 2;
pub const SVC_LOG: u32 = 3;
pub const SVC_PORT_IN: u32 = 4;
pub const SVC_PORT_OUT: u32 = 5;

/// Sentinel returned for a denied or malformed port operation.
pub const SVC_DENIED: u32 = 0xFFFF_FFFF;

/// Dispatch one service request. Returns the value for the caller's
/// return register.
pub fn kernel_service(service_id: u32, arg1: u32, arg2: u32, arg3: u32) -> u32 {
    domain::with_current_domain(|d| d.stats.kernel_call_count += 1);

    match service_id {
        SVC_ALLOC_MEM => service_alloc(arg1),
        SVC_FREE_MEM => service_free(arg1),
        SVC_LOG => service_log(arg1),
        SVC_PORT_IN => service_port_in(arg1 as u16, arg2),
        SVC_PORT_OUT => service_port_out(arg1 as u16, arg2, arg3),
        _ => {
            log::warn!("isolation: unknown kernel service {}", service_id);
            SVC_DENIED
        }
    }
}

/// Software IOPB check for the active domain. Kernel-ring domains are
/// not port-restricted.
fn port_allowed(port: u16) -> bool {
    match domain::current_denies_port(port) {
        Some(denied) => !denied,
        // No active domain: the service gate should not be reachable,
        // refuse.
        None => false,
    }
}

fn service_port_in(port: u16, width: u32) -> u32 {
    domain::with_current_domain(|d| d.stats.io_op_count += 1);

    if !port_allowed(port) {
        domain::with_current_domain(|d| {
            if d.level == IsolationLevel::DriverRing {
                d.stats.io_violation_count += 1;
            }
        });
        log::warn!("isolation: denied port read of {:#06x}", port);
        return SVC_DENIED;
    }

    match width {
        1 => arch::inb(port) as u32,
        2 => arch::inw(port) as u32,
        4 => arch::inl(port),
        _ => SVC_DENIED,
    }
}

fn service_port_out(port: u16, value: u32, width: u32) -> u32 {
    domain::with_current_domain(|d| d.stats.io_op_count += 1);

    if !port_allowed(port) {
        domain::with_current_domain(|d| {
            if d.level == IsolationLevel::DriverRing {
                d.stats.io_violation_count += 1;
            }
        });
        log::warn!("isolation: denied port write of {:#06x}", port);
        return SVC_DENIED;
    }

    match width {
        1 => arch::outb(port, value as u8),
        2 => arch::outw(port, value as u16),
        4 => arch::outl(port, value),
        _ => return SVC_DENIED,
    }
    0
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn service_alloc(size: u32) -> u32 {
    use crate::mm::heap::KERNEL_HEAP;
    match KERNEL_HEAP.lock().alloc(size as usize) {
        Ok(ptr) => ptr as u32,
        Err(_) => 0,
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn service_alloc(_size: u32) -> u32 {
    // Hosted double: driver-owned kernel memory is not modeled.
    0
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn service_free(ptr: u32) -> u32 {
    use crate::mm::heap::KERNEL_HEAP;
    KERNEL_HEAP.lock().free(ptr as *mut u8);
    0
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn service_free(_ptr: u32) -> u32 {
    0
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn service_log(ptr: u32) -> u32 {
    if ptr == 0 {
        return SVC_DENIED;
    }
    // SAFETY: the driver passes a pointer into kernel-mapped memory; the
    // scan is bounded and stops at NUL.
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, 256) };
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    if let Ok(message) = core::str::from_utf8(&bytes[..len]) {
        let name = domain::with_current_domain(|d| d.name.clone());
        log::info!("drv:{}: {}", name.as_deref().unwrap_or("?"), message);
    }
    0
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn service_log(ptr: u32) -> u32 {
    if ptr == 0 {
        return SVC_DENIED;
    }
    0
}

/// Trap-side entry: decode registers, dispatch, put the result back in
/// the frame's return register.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn service_trap_handler(frame: &mut crate::irq::TrapFrame) {
    frame.eax = kernel_service(frame.eax, frame.ebx, frame.ecx, frame.edx);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::isolation::domain::{
        domain_allow_port, domain_create, domain_destroy, domain_exec, domain_stats, testing,
        IsolationLevel,
    };

    fn port_probe(arg: usize) -> i32 {
        // Read the allowed port, then the denied one; report how many
        // came back as the denied sentinel.
        let allowed = kernel_service(SVC_PORT_IN, arg as u32, 1, 0);
        let denied = kernel_service(SVC_PORT_IN, 0x70, 1, 0);
        let mut sentinels = 0;
        if allowed == SVC_DENIED {
            sentinels += 1;
        }
        if denied == SVC_DENIED {
            sentinels += 1;
        }
        sentinels
    }

    #[test]
    fn violation_is_counted_exactly_once_and_denied_read_is_all_ones() {
        let _guard = testing::lock();
        let id = domain_create("kbd-probe", IsolationLevel::DriverRing).expect("slot");
        domain_allow_port(id, 0x60, 1).expect("allow port 0x60");

        let sentinels = domain_exec(id, port_probe, 0x60).expect("exec");
        // The allowed read returns a bus value, the denied one the
        // sentinel.
        assert_eq!(sentinels, 1);

        let stats = domain_stats(id).expect("stats");
        assert_eq!(stats.io_violation_count, 1, "exactly one violation");
        assert_eq!(stats.io_op_count, 2);
        assert_eq!(stats.kernel_call_count, 2);

        domain_destroy(id).expect("cleanup");
    }

    #[test]
    fn violations_only_accumulate() {
        let _guard = testing::lock();
        let id = domain_create("deny-all", IsolationLevel::DriverRing).expect("slot");

        fn hammer(_: usize) -> i32 {
            for _ in 0..3 {
                let _ = kernel_service(SVC_PORT_IN, 0x2F8, 1, 0);
            }
            0
        }
        domain_exec(id, hammer, 0).expect("exec");
        let first = domain_stats(id).expect("stats").io_violation_count;
        assert_eq!(first, 3);

        domain_exec(id, hammer, 0).expect("exec again");
        let second = domain_stats(id).expect("stats").io_violation_count;
        assert_eq!(second, 6, "the counter never decreases");

        domain_destroy(id).expect("cleanup");
    }

    #[test]
    fn port_write_respects_the_bitmap() {
        let _guard = testing::lock();
        let id = domain_create("writer", IsolationLevel::DriverRing).expect("slot");
        domain_allow_port(id, 0x80, 1).expect("allow");

        fn writes(_: usize) -> i32 {
            let ok = kernel_service(SVC_PORT_OUT, 0x80, 0xAB, 1);
            let bad = kernel_service(SVC_PORT_OUT, 0x81, 0xAB, 1);
            (ok == 0 && bad == SVC_DENIED) as i32
        }
        assert_eq!(domain_exec(id, writes, 0).expect("exec"), 1);

        domain_destroy(id).expect("cleanup");
    }

    #[test]
    fn unknown_service_is_refused() {
        let _guard = testing::lock();
        let id = domain_create("unknown-svc", IsolationLevel::DriverRing).expect("slot");
        fn ask(_: usize) -> i32 {
            (kernel_service(999, 0, 0, 0) == SVC_DENIED) as i32
        }
        assert_eq!(domain_exec(id, ask, 0).expect("exec"), 1);
        domain_destroy(id).expect("cleanup");
    }

    #[test]
    fn service_gate_without_active_domain_denies_ports() {
        let _guard = testing::lock();
        assert_eq!(kernel_service(SVC_PORT_IN, 0x60, 1, 0), SVC_DENIED);
    }
}
