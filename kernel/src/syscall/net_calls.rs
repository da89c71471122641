//! Socket syscalls, forwarded to the registered network backend.

use alloc::vec;

use super::{copy_from_user, copy_to_user, IO_CHUNK_MAX};
use crate::error::KernelResult;
use crate::mm::user_validation::validate_user_ptr;
use crate::net::{self, SockAddr};

const SOCKADDR_SIZE: u32 = 8;

fn sockaddr_from_user(ptr: u32) -> KernelResult<SockAddr> {
    validate_user_ptr(ptr, SOCKADDR_SIZE)?;
    let mut raw = [0u8; SOCKADDR_SIZE as usize];
    copy_from_user(ptr, &mut raw);
    Ok(SockAddr {
        family: u16::from_le_bytes([raw[0], raw[1]]),
        port: u16::from_be_bytes([raw[2], raw[3]]),
        addr: u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
    })
}

fn sockaddr_to_user(ptr: u32, addr: SockAddr) -> KernelResult<()> {
    validate_user_ptr(ptr, SOCKADDR_SIZE)?;
    let mut raw = [0u8; SOCKADDR_SIZE as usize];
    raw[0..2].copy_from_slice(&addr.family.to_le_bytes());
    raw[2..4].copy_from_slice(&addr.port.to_be_bytes());
    raw[4..8].copy_from_slice(&addr.addr.to_be_bytes());
    copy_to_user(ptr, &raw);
    Ok(())
}

pub fn sys_socket(domain: u32, sock_type: u32, protocol: u32) -> KernelResult<u32> {
    net::with_backend(|b| b.socket(domain, sock_type, protocol))
}

pub fn sys_bind(socket: u32, addr_ptr: u32) -> KernelResult<u32> {
    let addr = sockaddr_from_user(addr_ptr)?;
    net::with_backend(|b| b.bind(socket, addr))?;
    Ok(0)
}

pub fn sys_listen(socket: u32, backlog: u32) -> KernelResult<u32> {
    net::with_backend(|b| b.listen(socket, backlog))?;
    Ok(0)
}

pub fn sys_accept(socket: u32, addr_ptr: u32) -> KernelResult<u32> {
    let (peer, addr) = net::with_backend(|b| b.accept(socket))?;
    if addr_ptr != 0 {
        sockaddr_to_user(addr_ptr, addr)?;
    }
    Ok(peer)
}

pub fn sys_connect(socket: u32, addr_ptr: u32) -> KernelResult<u32> {
    let addr = sockaddr_from_user(addr_ptr)?;
    net::with_backend(|b| b.connect(socket, addr))?;
    Ok(0)
}

pub fn sys_send(socket: u32, buf_ptr: u32, len: u32, flags: u32) -> KernelResult<u32> {
    validate_user_ptr(buf_ptr, len)?;
    let len = (len as usize).min(IO_CHUNK_MAX);
    let mut staging = vec![0u8; len];
    copy_from_user(buf_ptr, &mut staging);
    let sent = net::with_backend(|b| b.send(socket, &staging, flags))?;
    Ok(sent as u32)
}

pub fn sys_recv(socket: u32, buf_ptr: u32, len: u32, flags: u32) -> KernelResult<u32> {
    validate_user_ptr(buf_ptr, len)?;
    let len = (len as usize).min(IO_CHUNK_MAX);
    let mut staging = vec![0u8; len];
    let received = net::with_backend(|b| b.recv(socket, &mut staging, flags))?;
    copy_to_user(buf_ptr, &staging[..received]);
    Ok(received as u32)
}

pub fn sys_closesock(socket: u32) -> KernelResult<u32> {
    net::with_backend(|b| b.close(socket))?;
    Ok(0)
}

pub fn sys_shutdown(socket: u32, how: u32) -> KernelResult<u32> {
    net::with_backend(|b| b.shutdown(socket, how))?;
    Ok(0)
}

pub fn sys_getsockname(socket: u32, addr_ptr: u32) -> KernelResult<u32> {
    let addr = net::with_backend(|b| b.getsockname(socket))?;
    sockaddr_to_user(addr_ptr, addr)?;
    Ok(0)
}

pub fn sys_getpeername(socket: u32, addr_ptr: u32) -> KernelResult<u32> {
    let addr = net::with_backend(|b| b.getpeername(socket))?;
    sockaddr_to_user(addr_ptr, addr)?;
    Ok(0)
}

pub fn sys_setsockopt(socket: u32, level: u32, option: u32, value: u32) -> KernelResult<u32> {
    net::with_backend(|b| b.setsockopt(socket, level, option, value))?;
    Ok(0)
}

pub fn sys_getsockopt(socket: u32, level: u32, option: u32) -> KernelResult<u32> {
    net::with_backend(|b| b.getsockopt(socket, level, option))
}

pub fn sys_select(read_mask: u32, write_mask: u32, out_ptr: u32) -> KernelResult<u32> {
    let (readable, writable) = net::with_backend(|b| b.select(read_mask, write_mask))?;
    if out_ptr != 0 {
        validate_user_ptr(out_ptr, 8)?;
        let mut raw = [0u8; 8];
        raw[0..4].copy_from_slice(&readable.to_le_bytes());
        raw[4..8].copy_from_slice(&writable.to_le_bytes());
        copy_to_user(out_ptr, &raw);
    }
    Ok((readable.count_ones() + writable.count_ones()) as u32)
}
