//! Memory syscalls, thin wrappers over the VMA layer for the calling
//! process.

use crate::error::KernelResult;
use crate::mm::vma::{self, Prot, VmaFlags};
use crate::process::table;

pub fn sys_mmap(addr: u32, length: u32, prot: u32, flags: u32, fd: i32) -> KernelResult<u32> {
    let prot = Prot::from_bits_truncate(prot);
    let flags = VmaFlags::from_bits_truncate(flags);
    vma::mmap(table::current_pid(), addr, length, prot, flags, fd, 0)
}

pub fn sys_munmap(addr: u32, length: u32) -> KernelResult<u32> {
    vma::munmap(table::current_pid(), addr, length)?;
    Ok(0)
}

pub fn sys_mprotect(addr: u32, length: u32, prot: u32) -> KernelResult<u32> {
    let prot = Prot::from_bits_truncate(prot);
    vma::mprotect(table::current_pid(), addr, length, prot)?;
    Ok(0)
}

/// `brk(0)` queries the break, anything else moves it.
pub fn sys_brk(new_break: u32) -> KernelResult<u32> {
    let target = if new_break == 0 { None } else { Some(new_break) };
    vma::brk(table::current_pid(), target)
}
