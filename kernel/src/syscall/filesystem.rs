//! File syscalls: descriptor I/O, open/close, seek, stat.

use alloc::sync::Arc;
use alloc::vec;

use super::{copy_from_user, copy_to_user, string_from_user, IO_CHUNK_MAX};
use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::{self, file::OpenFlags, NodeType, Permissions, SeekFrom, VfsNode};
use crate::ipc::pipe;
use crate::mm::user_validation::validate_user_ptr;
use crate::process::table;

/// What an fd resolves to for I/O.
enum Target {
    Node { node: Arc<dyn VfsNode>, offset: usize },
    Pipe { id: usize, write_end: bool },
}

fn resolve_fd(fd: u32) -> KernelResult<Target> {
    table::with_process(table::current_pid(), |proc| {
        let entry = proc.fd_table.get(fd as usize)?;
        if let Some(id) = entry.pipe {
            // By convention the read end is handed out first; the entry
            // flags record which side this descriptor is.
            return Ok(Target::Pipe {
                id,
                write_end: entry.flags.write,
            });
        }
        match &entry.node {
            Some(node) => Ok(Target::Node {
                node: node.clone(),
                offset: entry.offset,
            }),
            None => Err(KernelError::BadDescriptor),
        }
    })?
}

fn advance_offset(fd: u32, by: usize) {
    let _ = table::with_process(table::current_pid(), |proc| {
        if let Ok(entry) = proc.fd_table.get_mut(fd as usize) {
            entry.offset += by;
        }
    });
}

pub fn sys_read(fd: u32, buf_ptr: u32, count: u32) -> KernelResult<u32> {
    validate_user_ptr(buf_ptr, count)?;
    let count = (count as usize).min(IO_CHUNK_MAX);
    let mut staging = vec![0u8; count];

    let read = match resolve_fd(fd)? {
        Target::Pipe { id, .. } => pipe::read(id, &mut staging)?,
        Target::Node { node, offset } => {
            let n = node.read(offset, &mut staging)?;
            advance_offset(fd, n);
            n
        }
    };

    copy_to_user(buf_ptr, &staging[..read]);
    Ok(read as u32)
}

pub fn sys_write(fd: u32, buf_ptr: u32, count: u32) -> KernelResult<u32> {
    validate_user_ptr(buf_ptr, count)?;
    let count = (count as usize).min(IO_CHUNK_MAX);
    let mut staging = vec![0u8; count];
    copy_from_user(buf_ptr, &mut staging);

    let written = match resolve_fd(fd)? {
        Target::Pipe { id, .. } => pipe::write(id, &staging)?,
        Target::Node { node, offset } => {
            let n = node.write(offset, &staging)?;
            advance_offset(fd, n);
            n
        }
    };
    Ok(written as u32)
}

pub fn sys_open(path_ptr: u32, flags: u32) -> KernelResult<u32> {
    let path = string_from_user(path_ptr, fs::PATH_MAX as u32)?;
    let flags = OpenFlags::from_bits(flags);

    let node = match fs::lookup(&path) {
        Ok(node) => node,
        Err(KernelError::Fs(FsError::NotFound)) if flags.create => {
            fs::create(&path, NodeType::File, Permissions::FILE_DEFAULT)?
        }
        Err(e) => return Err(e),
    };

    if flags.write && node.node_type() == NodeType::Directory {
        return Err(FsError::IsADirectory.into());
    }
    node.open(&flags)?;
    if flags.truncate {
        node.truncate(0)?;
    }
    let start_offset = if flags.append {
        node.metadata()?.size
    } else {
        0
    };

    table::with_process(table::current_pid(), |proc| {
        let fd = proc.fd_table.alloc()?;
        let entry = proc.fd_table.get_mut(fd)?;
        entry.node = Some(node.clone());
        entry.flags = flags;
        entry.offset = start_offset;
        Ok(fd as u32)
    })?
}

pub fn sys_close(fd: u32) -> KernelResult<u32> {
    // Pipe ends need their refcount dropped before the slot clears.
    let pipe_end = table::with_process(table::current_pid(), |proc| {
        proc.fd_table
            .get(fd as usize)
            .ok()
            .and_then(|e| e.pipe.map(|id| (id, e.flags.write)))
    })?;
    if let Some((id, write_end)) = pipe_end {
        let _ = pipe::close_end(id, write_end);
    }

    table::with_process(table::current_pid(), |proc| proc.fd_table.close(fd as usize))??;
    Ok(0)
}

pub fn sys_lseek(fd: u32, offset: i32, whence: u32) -> KernelResult<u32> {
    let origin = match whence {
        0 => SeekFrom::Set(offset as i64),
        1 => SeekFrom::Current(offset as i64),
        2 => SeekFrom::End(offset as i64),
        _ => return Err(KernelError::BadArgument),
    };

    table::with_process(table::current_pid(), |proc| {
        let entry = proc.fd_table.get_mut(fd as usize)?;
        let node = entry.node.as_ref().ok_or(KernelError::BadDescriptor)?;
        let size = node.metadata()?.size as i64;

        let target = match origin {
            SeekFrom::Set(n) => n,
            SeekFrom::Current(n) => entry.offset as i64 + n,
            SeekFrom::End(n) => size + n,
        };
        if target < 0 {
            return Err(KernelError::BadArgument);
        }
        entry.offset = target as usize;
        Ok(target as u32)
    })?
}

/// The stat structure written back to user space.
#[repr(C)]
struct Stat {
    inode: u32,
    size: u32,
    mode: u32,
    uid: u32,
    gid: u32,
    mtime: u32,
}

pub fn sys_stat(path_ptr: u32, stat_ptr: u32) -> KernelResult<u32> {
    validate_user_ptr(stat_ptr, core::mem::size_of::<Stat>() as u32)?;
    let path = string_from_user(path_ptr, fs::PATH_MAX as u32)?;

    let node = fs::lookup(&path)?;
    let meta = node.metadata()?;
    let is_dir = (meta.node_type == NodeType::Directory) as u32;
    let stat = Stat {
        inode: meta.inode as u32,
        size: meta.size as u32,
        mode: meta.permissions.mode() as u32 | (is_dir << 14),
        uid: meta.uid,
        gid: meta.gid,
        mtime: meta.modified as u32,
    };

    // SAFETY: Stat is repr(C) plain data.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &stat as *const Stat as *const u8,
            core::mem::size_of::<Stat>(),
        )
    };
    copy_to_user(stat_ptr, bytes);
    Ok(0)
}
