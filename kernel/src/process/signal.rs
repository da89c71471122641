//! Signals: posting, masks, dispositions, and the delivery scan run on
//! the way back to user mode.

use super::lifecycle;
use super::pcb::{
    Pid, ProcessState, SignalDisposition, NSIG, SIGCHLD, SIGCONT, SIGKILL, SIGSTOP, SIGTSTP,
    SIGTTIN, SIGTTOU, SIGURG, SIGWINCH,
};
use super::table;
use crate::error::{KernelError, KernelResult};

/// `sigprocmask` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOp {
    Block,
    Unblock,
    Set,
}

fn sig_bit(sig: u32) -> u32 {
    1 << (sig - 1)
}

/// Post a signal. Signal 0 only probes for existence. SIGCONT wakes a
/// stopped process on posting, before any delivery scan.
pub fn send(pid: Pid, sig: u32) -> KernelResult<()> {
    if sig as usize >= NSIG {
        return Err(KernelError::BadArgument);
    }
    if sig == 0 {
        return if table::exists(pid) {
            Ok(())
        } else {
            Err(KernelError::NoSuchProcess)
        };
    }

    table::with_process(pid, |proc| {
        proc.pending_signals |= sig_bit(sig);
        if sig == SIGCONT && proc.state == ProcessState::Stopped {
            proc.state = ProcessState::Ready;
        }
    })
}

/// Install a disposition. SIGKILL and SIGSTOP cannot be caught, blocked,
/// or ignored.
pub fn sigaction(pid: Pid, sig: u32, disposition: SignalDisposition) -> KernelResult<()> {
    if sig == 0 || sig as usize >= NSIG || sig == SIGKILL || sig == SIGSTOP {
        return Err(KernelError::BadArgument);
    }
    table::with_process(pid, |proc| {
        proc.handlers[sig as usize] = disposition;
    })
}

/// Adjust the blocked-signal mask; returns the previous mask.
pub fn sigprocmask(pid: Pid, op: MaskOp, mask: u32) -> KernelResult<u32> {
    // The uncatchable pair is also unblockable.
    let mask = mask & !(sig_bit(SIGKILL) | sig_bit(SIGSTOP));
    table::with_process(pid, |proc| {
        let old = proc.blocked_signals;
        proc.blocked_signals = match op {
            MaskOp::Block => old | mask,
            MaskOp::Unblock => old & !mask,
            MaskOp::Set => mask,
        };
        old
    })
}

/// What the delivery scan decided for one signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Ignore,
    Terminate,
    Stop,
    Continue,
    Handle(u32),
}

fn default_action(sig: u32) -> Action {
    match sig {
        SIGCHLD | SIGURG | SIGWINCH => Action::Ignore,
        SIGCONT => Action::Continue,
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => Action::Stop,
        _ => Action::Terminate,
    }
}

/// Deliver deliverable pending signals for the current process. Called
/// on the kernel -> user transition path; sleeps are not interrupted.
pub fn check_pending() {
    let pid = table::current_pid();

    loop {
        // Pick one deliverable signal and decide under the table lock.
        let decision = table::with_process(pid, |proc| {
            let deliverable = proc.pending_signals & !proc.blocked_signals;
            if deliverable == 0 {
                return None;
            }
            let sig = deliverable.trailing_zeros() + 1;
            proc.pending_signals &= !sig_bit(sig);

            let action = if sig == SIGKILL {
                Action::Terminate
            } else if sig == SIGSTOP {
                Action::Stop
            } else {
                match proc.handlers[sig as usize] {
                    SignalDisposition::Default => default_action(sig),
                    SignalDisposition::Ignore => Action::Ignore,
                    SignalDisposition::Handler(entry) => Action::Handle(entry),
                }
            };
            Some((sig, action))
        })
        .unwrap_or(None);

        let Some((sig, action)) = decision else {
            return;
        };

        match action {
            Action::Ignore => {}
            Action::Terminate => {
                log::info!("signal: pid {} terminated by signal {}", pid, sig);
                lifecycle::exit(-(sig as i32));
                return;
            }
            Action::Stop => {
                let _ = table::with_process(pid, |proc| proc.state = ProcessState::Stopped);
                return;
            }
            Action::Continue => {
                let _ = table::with_process(pid, |proc| {
                    if proc.state == ProcessState::Stopped {
                        proc.state = ProcessState::Ready;
                    }
                });
            }
            Action::Handle(entry) => deliver_to_user(entry, sig),
        }
    }
}

/// Invoke a registered user handler.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn deliver_to_user(entry: u32, sig: u32) {
    // The handler runs on the user stack with the signal number as its
    // argument; its return resumes the interrupted flow. Same frame
    // discipline as the ELF entry path.
    // SAFETY: the handler address was registered by the process itself
    // and runs in its own address space.
    let handler: extern "C" fn(u32) = unsafe { core::mem::transmute(entry as usize) };
    handler(sig);
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn deliver_to_user(entry: u32, sig: u32) {
    log::debug!("signal: would deliver signal {} to handler {:#010x}", sig, entry);
}
