//! Process-control syscalls.

use super::string_from_user;
use crate::error::{KernelError, KernelResult};
use crate::mm::user_validation::validate_user_ptr;
use crate::process::{self, pcb::SignalDisposition, signal, table};

#[allow(unreachable_code)]
pub fn sys_exit(status: i32) -> KernelResult<u32> {
    process::exit(status);
    // The task carrying this process stops here on bare metal.
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::sched::task_exit();
    Ok(0)
}

pub fn sys_getpid() -> KernelResult<u32> {
    Ok(table::current_pid())
}

pub fn sys_getppid() -> KernelResult<u32> {
    table::with_process(table::current_pid(), |p| p.ppid)
}

pub fn sys_fork() -> KernelResult<u32> {
    process::fork()
}

pub fn sys_exec(path_ptr: u32, _argv_ptr: u32) -> KernelResult<u32> {
    let path = string_from_user(path_ptr, crate::fs::PATH_MAX as u32)?;
    process::exec(&path, &[])?;
    Ok(0)
}

pub fn sys_waitpid(pid: i32, status_ptr: u32, options: u32) -> KernelResult<u32> {
    if status_ptr != 0 {
        validate_user_ptr(status_ptr, 4)?;
    }
    let (child, status) = process::waitpid(pid, options)?;
    if status_ptr != 0 {
        super::copy_to_user(status_ptr, &status.to_le_bytes());
    }
    Ok(child)
}

/// `kill` posts a signal; signal 0 only probes the pid.
pub fn sys_kill(pid: u32, sig: u32) -> KernelResult<u32> {
    signal::send(pid, sig)?;
    Ok(0)
}

pub fn sys_setpgid(pid: u32, pgid: u32) -> KernelResult<u32> {
    process::setpgid(pid, pgid)?;
    Ok(0)
}

pub fn sys_getpgid(pid: u32) -> KernelResult<u32> {
    process::getpgid(pid)
}

pub fn sys_sigaction(sig: u32, handler: u32) -> KernelResult<u32> {
    let disposition = match handler {
        0 => SignalDisposition::Default,
        1 => SignalDisposition::Ignore,
        entry => {
            validate_user_ptr(entry, 4)?;
            SignalDisposition::Handler(entry)
        }
    };
    signal::sigaction(table::current_pid(), sig, disposition)?;
    Ok(0)
}

pub fn sys_sigprocmask(how: u32, mask: u32) -> KernelResult<u32> {
    let op = match how {
        0 => signal::MaskOp::Block,
        1 => signal::MaskOp::Unblock,
        2 => signal::MaskOp::Set,
        _ => return Err(KernelError::BadArgument),
    };
    signal::sigprocmask(table::current_pid(), op, mask)
}
