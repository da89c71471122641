//! The syscall gate.
//!
//! User code raises the syscall vector with the call number and up to
//! five arguments in registers. Every pointer argument is validated
//! against the caller's mappings before the kernel touches it; results
//! and errors travel back as signed values in the number register, with
//! errors in -1..-4095.

mod filesystem;
mod ipc_calls;
mod memory;
mod net_calls;
mod process_calls;

use crate::error::KernelResult;

// Process control
pub const SYS_EXIT: u32 = 0;
pub const SYS_READ: u32 = 1;
pub const SYS_WRITE: u32 = 2;
pub const SYS_OPEN: u32 = 3;
pub const SYS_CLOSE: u32 = 4;
pub const SYS_GETPID: u32 = 5;
pub const SYS_LSEEK: u32 = 6;
pub const SYS_STAT: u32 = 7;
pub const SYS_FORK: u32 = 8;
pub const SYS_EXEC: u32 = 9;
pub const SYS_WAITPID: u32 = 10;
pub const SYS_KILL: u32 = 11;
pub const SYS_GETPPID: u32 = 12;
pub const SYS_SETPGID: u32 = 13;
pub const SYS_GETPGID: u32 = 14;
pub const SYS_SIGACTION: u32 = 15;
pub const SYS_SIGPROCMASK: u32 = 16;
// IPC
pub const SYS_PIPE: u32 = 17;
pub const SYS_SHMGET: u32 = 18;
pub const SYS_SHMAT: u32 = 19;
pub const SYS_SHMDT: u32 = 20;
pub const SYS_MSGGET: u32 = 21;
pub const SYS_MSGSND: u32 = 22;
pub const SYS_MSGRCV: u32 = 23;
// Memory
pub const SYS_MMAP: u32 = 24;
pub const SYS_MUNMAP: u32 = 25;
pub const SYS_MPROTECT: u32 = 26;
pub const SYS_BRK: u32 = 27;
// Sockets
pub const SYS_SOCKET: u32 = 50;
pub const SYS_BIND: u32 = 51;
pub const SYS_LISTEN: u32 = 52;
pub const SYS_ACCEPT: u32 = 53;
pub const SYS_CONNECT: u32 = 54;
pub const SYS_SEND: u32 = 55;
pub const SYS_RECV: u32 = 56;
pub const SYS_CLOSESOCK: u32 = 57;
pub const SYS_SHUTDOWN: u32 = 60;
pub const SYS_GETSOCKNAME: u32 = 61;
pub const SYS_GETPEERNAME: u32 = 62;
pub const SYS_SETSOCKOPT: u32 = 63;
pub const SYS_GETSOCKOPT: u32 = 64;
pub const SYS_SELECT: u32 = 65;

/// Largest single read/write the gate stages through kernel memory.
pub const IO_CHUNK_MAX: usize = 64 * 1024;

/// Dispatch one syscall. The return value goes straight back to user
/// code: non-negative success, or a negative errno. Unknown numbers
/// return -1.
pub fn dispatch(nr: u32, args: [u32; 5]) -> i32 {
    let result: KernelResult<u32> = match nr {
        SYS_EXIT => process_calls::sys_exit(args[0] as i32),
        SYS_READ => filesystem::sys_read(args[0], args[1], args[2]),
        SYS_WRITE => filesystem::sys_write(args[0], args[1], args[2]),
        SYS_OPEN => filesystem::sys_open(args[0], args[1]),
        SYS_CLOSE => filesystem::sys_close(args[0]),
        SYS_GETPID => process_calls::sys_getpid(),
        SYS_LSEEK => filesystem::sys_lseek(args[0], args[1] as i32, args[2]),
        SYS_STAT => filesystem::sys_stat(args[0], args[1]),
        SYS_FORK => process_calls::sys_fork(),
        SYS_EXEC => process_calls::sys_exec(args[0], args[1]),
        SYS_WAITPID => process_calls::sys_waitpid(args[0] as i32, args[1], args[2]),
        SYS_KILL => process_calls::sys_kill(args[0], args[1]),
        SYS_GETPPID => process_calls::sys_getppid(),
        SYS_SETPGID => process_calls::sys_setpgid(args[0], args[1]),
        SYS_GETPGID => process_calls::sys_getpgid(args[0]),
        SYS_SIGACTION => process_calls::sys_sigaction(args[0], args[1]),
        SYS_SIGPROCMASK => process_calls::sys_sigprocmask(args[0], args[1]),
        SYS_PIPE => ipc_calls::sys_pipe(args[0]),
        SYS_SHMGET => ipc_calls::sys_shmget(args[0], args[1]),
        SYS_SHMAT => ipc_calls::sys_shmat(args[0], args[1]),
        SYS_SHMDT => ipc_calls::sys_shmdt(args[0], args[1]),
        SYS_MSGGET => ipc_calls::sys_msgget(args[0]),
        SYS_MSGSND => ipc_calls::sys_msgsnd(args[0], args[1], args[2], args[3]),
        SYS_MSGRCV => ipc_calls::sys_msgrcv(args[0], args[1], args[2], args[3]),
        SYS_MMAP => memory::sys_mmap(args[0], args[1], args[2], args[3], args[4] as i32),
        SYS_MUNMAP => memory::sys_munmap(args[0], args[1]),
        SYS_MPROTECT => memory::sys_mprotect(args[0], args[1], args[2]),
        SYS_BRK => memory::sys_brk(args[0]),
        SYS_SOCKET => net_calls::sys_socket(args[0], args[1], args[2]),
        SYS_BIND => net_calls::sys_bind(args[0], args[1]),
        SYS_LISTEN => net_calls::sys_listen(args[0], args[1]),
        SYS_ACCEPT => net_calls::sys_accept(args[0], args[1]),
        SYS_CONNECT => net_calls::sys_connect(args[0], args[1]),
        SYS_SEND => net_calls::sys_send(args[0], args[1], args[2], args[3]),
        SYS_RECV => net_calls::sys_recv(args[0], args[1], args[2], args[3]),
        SYS_CLOSESOCK => net_calls::sys_closesock(args[0]),
        SYS_SHUTDOWN => net_calls::sys_shutdown(args[0], args[1]),
        SYS_GETSOCKNAME => net_calls::sys_getsockname(args[0], args[1]),
        SYS_GETPEERNAME => net_calls::sys_getpeername(args[0], args[1]),
        SYS_SETSOCKOPT => net_calls::sys_setsockopt(args[0], args[1], args[2], args[3]),
        SYS_GETSOCKOPT => net_calls::sys_getsockopt(args[0], args[1], args[2]),
        SYS_SELECT => net_calls::sys_select(args[0], args[1], args[2]),
        _ => {
            log::debug!("syscall: unknown number {}", nr);
            return -1;
        }
    };

    match result {
        Ok(value) => value as i32,
        Err(e) => e.to_errno(),
    }
}

/// Register the gate on its trap vector and hook signal delivery into
/// the return path.
pub fn init() {
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    crate::irq::register_handler(crate::irq::SYSCALL_VECTOR, syscall_trap_handler);
    log::info!("syscall: gate installed");
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn syscall_trap_handler(frame: &mut crate::irq::TrapFrame) {
    let args = [frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi];
    frame.eax = dispatch(frame.eax, args) as u32;
    // Pending signals are delivered on the way back to user mode.
    crate::process::signal::check_pending();
}

/// Copy kernel bytes out to validated user memory.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub(crate) fn copy_to_user(ptr: u32, data: &[u8]) {
    // SAFETY: the caller validated [ptr, ptr + data.len()) as mapped
    // user memory.
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub(crate) fn copy_to_user(_ptr: u32, _data: &[u8]) {}

/// Copy validated user memory into a kernel buffer.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub(crate) fn copy_from_user(ptr: u32, buf: &mut [u8]) {
    // SAFETY: the caller validated [ptr, ptr + buf.len()) as mapped
    // user memory.
    unsafe {
        core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), buf.len());
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub(crate) fn copy_from_user(_ptr: u32, buf: &mut [u8]) {
    buf.fill(0);
}

/// Read a validated user string into a kernel `String`.
pub(crate) fn string_from_user(ptr: u32, max_len: u32) -> KernelResult<alloc::string::String> {
    let len = crate::mm::user_validation::validate_user_string(ptr, max_len)?;
    let mut buf = alloc::vec![0u8; len as usize];
    copy_from_user(ptr, &mut buf);
    alloc::string::String::from_utf8(buf).map_err(|_| crate::error::KernelError::BadArgument)
}
