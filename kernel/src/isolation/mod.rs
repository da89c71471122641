//! Driver isolation.
//!
//! Selected drivers run in a lower-privilege ring under a *domain*: a
//! per-domain I/O-port permission bitmap, a dedicated stack for
//! driver-ring execution, and counters for kernel service calls and
//! I/O violations. While a domain is active its IOPB is installed in the
//! TSS; whenever none is, the installed bitmap denies every port.
//!
//! Two software vectors serve the driver ring: a kernel-service gate for
//! whitelisted privileged operations, and the driver-return gate through
//! which a finished driver call resumes the saved kernel context.

pub mod domain;
pub mod service;

pub use domain::{
    domain_allow_port, domain_create, domain_deactivate, domain_deny_port, domain_destroy,
    domain_exec, domain_stats, with_domain, DomainId, DomainStats, IsolationLevel,
    DRIVER_STACK_SIZE, IOPB_SIZE, MAX_DRIVER_DOMAINS,
};
pub use service::{kernel_service, SVC_ALLOC_MEM, SVC_FREE_MEM, SVC_LOG, SVC_PORT_IN, SVC_PORT_OUT};

use crate::arch;

/// Install the driver-ring trap handlers and force the deny-all IOPB.
pub fn init() {
    arch::clear_iopb();

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    {
        use crate::irq::{self, DRIVER_RETURN_VECTOR, DRIVER_SERVICE_VECTOR};

        irq::register_handler(DRIVER_SERVICE_VECTOR, service::service_trap_handler);
        irq::register_handler(DRIVER_RETURN_VECTOR, domain::driver_return_trap_handler);
    }

    log::info!("isolation: driver domains ready, IOPB deny-all");
}
