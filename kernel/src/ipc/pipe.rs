//! Pipes: fixed-capacity byte rings connecting two descriptors.

use spin::Mutex;

use crate::error::{IpcError, KernelError, KernelResult};

/// Capacity of one pipe.
pub const PIPE_BUF: usize = 4096;

/// Pipes available system-wide.
pub const MAX_PIPES: usize = 16;

pub type PipeId = usize;

struct Pipe {
    in_use: bool,
    buf: [u8; PIPE_BUF],
    read_pos: usize,
    count: usize,
    readers: u32,
    writers: u32,
}

impl Pipe {
    const fn empty() -> Self {
        Self {
            in_use: false,
            buf: [0; PIPE_BUF],
            read_pos: 0,
            count: 0,
            readers: 0,
            writers: 0,
        }
    }
}

static PIPES: Mutex<[Pipe; MAX_PIPES]> = Mutex::new([const { Pipe::empty() }; MAX_PIPES]);

/// Allocate a pipe. The caller wires the two returned ends into fd
/// entries (read end first by convention).
pub fn create() -> KernelResult<PipeId> {
    let mut pipes = PIPES.lock();
    let id = pipes
        .iter()
        .position(|p| !p.in_use)
        .ok_or(IpcError::TableFull)?;
    pipes[id] = Pipe::empty();
    pipes[id].in_use = true;
    pipes[id].readers = 1;
    pipes[id].writers = 1;
    log::debug!("pipe: created {}", id);
    Ok(id)
}

/// Read up to `buf.len()` bytes. An empty pipe with live writers asks
/// the caller to retry; with no writers it reports clean EOF (0).
pub fn read(id: PipeId, buf: &mut [u8]) -> KernelResult<usize> {
    let mut pipes = PIPES.lock();
    let pipe = pipes
        .get_mut(id)
        .filter(|p| p.in_use)
        .ok_or(KernelError::BadDescriptor)?;

    if pipe.count == 0 {
        return if pipe.writers == 0 {
            Ok(0)
        } else {
            Err(KernelError::WouldBlock)
        };
    }

    let take = buf.len().min(pipe.count);
    for out in buf.iter_mut().take(take) {
        *out = pipe.buf[pipe.read_pos];
        pipe.read_pos = (pipe.read_pos + 1) % PIPE_BUF;
        pipe.count -= 1;
    }
    Ok(take)
}

/// Write up to `data.len()` bytes. A pipe with no readers is broken; a
/// full pipe asks the caller to retry.
pub fn write(id: PipeId, data: &[u8]) -> KernelResult<usize> {
    let mut pipes = PIPES.lock();
    let pipe = pipes
        .get_mut(id)
        .filter(|p| p.in_use)
        .ok_or(KernelError::BadDescriptor)?;

    if pipe.readers == 0 {
        return Err(KernelError::BrokenPipe);
    }
    if pipe.count == PIPE_BUF {
        return Err(KernelError::WouldBlock);
    }

    let room = PIPE_BUF - pipe.count;
    let put = data.len().min(room);
    for &byte in data.iter().take(put) {
        let write_pos = (pipe.read_pos + pipe.count) % PIPE_BUF;
        pipe.buf[write_pos] = byte;
        pipe.count += 1;
    }
    Ok(put)
}

/// Drop one end. The pipe itself dies when both sides are gone.
pub fn close_end(id: PipeId, write_end: bool) -> KernelResult<()> {
    let mut pipes = PIPES.lock();
    let pipe = pipes
        .get_mut(id)
        .filter(|p| p.in_use)
        .ok_or(KernelError::BadDescriptor)?;

    if write_end {
        pipe.writers = pipe.writers.saturating_sub(1);
    } else {
        pipe.readers = pipe.readers.saturating_sub(1);
    }
    if pipe.readers == 0 && pipe.writers == 0 {
        pipe.in_use = false;
        log::debug!("pipe: destroyed {}", id);
    }
    Ok(())
}

/// Another holder of an end (fork duplicating the fd table).
pub fn add_ref(id: PipeId, write_end: bool) -> KernelResult<()> {
    let mut pipes = PIPES.lock();
    let pipe = pipes
        .get_mut(id)
        .filter(|p| p.in_use)
        .ok_or(KernelError::BadDescriptor)?;
    if write_end {
        pipe.writers += 1;
    } else {
        pipe.readers += 1;
    }
    Ok(())
}

pub fn buffered(id: PipeId) -> KernelResult<usize> {
    let pipes = PIPES.lock();
    pipes
        .get(id)
        .filter(|p| p.in_use)
        .map(|p| p.count)
        .ok_or(KernelError::BadDescriptor)
}
