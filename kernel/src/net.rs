//! Socket interface to the network stack.
//!
//! The TCP/UDP/IP stack lives outside the core; it registers a
//! [`SocketBackend`] here and the syscall gate forwards the socket
//! family to it. Until a backend registers, every socket call asks the
//! caller to retry.

use spin::RwLock;

use crate::error::{KernelError, KernelResult};

/// Socket address in the wire-friendly shape the syscalls pass around.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockAddr {
    pub family: u16,
    pub port: u16,
    pub addr: u32,
}

/// Operations the external network stack provides.
pub trait SocketBackend: Send + Sync {
    fn socket(&self, domain: u32, sock_type: u32, protocol: u32) -> KernelResult<u32>;
    fn bind(&self, socket: u32, addr: SockAddr) -> KernelResult<()>;
    fn listen(&self, socket: u32, backlog: u32) -> KernelResult<()>;
    fn accept(&self, socket: u32) -> KernelResult<(u32, SockAddr)>;
    fn connect(&self, socket: u32, addr: SockAddr) -> KernelResult<()>;
    fn send(&self, socket: u32, data: &[u8], flags: u32) -> KernelResult<usize>;
    fn recv(&self, socket: u32, buf: &mut [u8], flags: u32) -> KernelResult<usize>;
    fn close(&self, socket: u32) -> KernelResult<()>;
    fn shutdown(&self, socket: u32, how: u32) -> KernelResult<()>;
    fn getsockopt(&self, socket: u32, level: u32, option: u32) -> KernelResult<u32>;
    fn setsockopt(&self, socket: u32, level: u32, option: u32, value: u32) -> KernelResult<()>;
    fn getsockname(&self, socket: u32) -> KernelResult<SockAddr>;
    fn getpeername(&self, socket: u32) -> KernelResult<SockAddr>;
    /// Readiness poll over up to 32 sockets, bitmask in/out.
    fn select(&self, read_mask: u32, write_mask: u32) -> KernelResult<(u32, u32)>;
}

static BACKEND: RwLock<Option<&'static dyn SocketBackend>> = RwLock::new(None);

/// Called by the network stack once it is ready to serve sockets.
pub fn register_backend(backend: &'static dyn SocketBackend) {
    *BACKEND.write() = Some(backend);
    log::info!("net: socket backend registered");
}

/// Run `f` against the registered backend.
pub fn with_backend<R>(f: impl FnOnce(&dyn SocketBackend) -> KernelResult<R>) -> KernelResult<R> {
    match *BACKEND.read() {
        Some(backend) => f(backend),
        None => Err(KernelError::TryAgain),
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn without_backend_sockets_try_again() {
        let result = with_backend(|b| b.socket(2, 1, 0));
        assert_eq!(result, Err(KernelError::TryAgain));
    }
}
