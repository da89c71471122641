//! Inter-process communication: pipes, shared memory segments, and
//! message queues.

pub mod msgqueue;
pub mod pipe;
pub mod shm;

pub use msgqueue::{msg_remove, msgget, msgrcv, msgsnd};
pub use pipe::{PipeId, PIPE_BUF};
pub use shm::{shm_remove, shmat, shmdt, shmget};

/// Nothing to set up beyond the static tables; kept for the boot
/// sequence's explicit ordering.
pub fn init() {
    log::info!("ipc: pipes, shared memory, message queues ready");
}
