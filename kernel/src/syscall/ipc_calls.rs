//! IPC syscalls: pipes, shared memory, message queues.

use alloc::vec;

use super::{copy_from_user, copy_to_user, IO_CHUNK_MAX};
use crate::error::{KernelError, KernelResult};
use crate::ipc::{msgqueue, pipe, shm};
use crate::mm::user_validation::validate_user_ptr;
use crate::process::table;

/// `pipe(fds)`: create a pipe and bind its two ends to fresh
/// descriptors, read end first.
pub fn sys_pipe(fds_ptr: u32) -> KernelResult<u32> {
    validate_user_ptr(fds_ptr, 8)?;

    let id = pipe::create()?;
    let bound = table::with_process(table::current_pid(), |proc| {
        let read_fd = proc.fd_table.alloc()?;
        let write_fd = match proc.fd_table.alloc() {
            Ok(fd) => fd,
            Err(e) => {
                let _ = proc.fd_table.close(read_fd);
                return Err(e);
            }
        };

        let entry = proc.fd_table.get_mut(read_fd)?;
        entry.pipe = Some(id);
        entry.flags.read = true;
        entry.flags.write = false;

        let entry = proc.fd_table.get_mut(write_fd)?;
        entry.pipe = Some(id);
        entry.flags.read = false;
        entry.flags.write = true;

        Ok((read_fd as u32, write_fd as u32))
    })?;

    let (read_fd, write_fd) = match bound {
        Ok(pair) => pair,
        Err(e) => {
            // Unwind the pipe if descriptor allocation failed.
            let _ = pipe::close_end(id, false);
            let _ = pipe::close_end(id, true);
            return Err(e);
        }
    };

    let mut out = [0u8; 8];
    out[0..4].copy_from_slice(&read_fd.to_le_bytes());
    out[4..8].copy_from_slice(&write_fd.to_le_bytes());
    copy_to_user(fds_ptr, &out);
    Ok(0)
}

pub fn sys_shmget(key: u32, size: u32) -> KernelResult<u32> {
    shm::shmget(key, size).map(|id| id as u32)
}

pub fn sys_shmat(id: u32, addr: u32) -> KernelResult<u32> {
    shm::shmat(table::current_pid(), id as usize, addr)
}

pub fn sys_shmdt(id: u32, addr: u32) -> KernelResult<u32> {
    shm::shmdt(table::current_pid(), id as usize, addr)?;
    Ok(0)
}

pub fn sys_msgget(key: u32) -> KernelResult<u32> {
    msgqueue::msgget(key).map(|id| id as u32)
}

pub fn sys_msgsnd(id: u32, mtype: u32, body_ptr: u32, body_len: u32) -> KernelResult<u32> {
    if body_len as usize > IO_CHUNK_MAX {
        return Err(KernelError::BadArgument);
    }
    validate_user_ptr(body_ptr, body_len)?;
    let mut body = vec![0u8; body_len as usize];
    copy_from_user(body_ptr, &mut body);

    msgqueue::msgsnd(id as usize, mtype, &body)?;
    Ok(0)
}

pub fn sys_msgrcv(id: u32, mtype: u32, buf_ptr: u32, buf_len: u32) -> KernelResult<u32> {
    if buf_len as usize > IO_CHUNK_MAX {
        return Err(KernelError::BadArgument);
    }
    validate_user_ptr(buf_ptr, buf_len)?;

    let mut staging = vec![0u8; buf_len as usize];
    let (_mtype, len) = msgqueue::msgrcv(id as usize, mtype, &mut staging)?;
    copy_to_user(buf_ptr, &staging[..len]);
    Ok(len as u32)
}
