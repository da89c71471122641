//! Processes: records, lifecycle, signals, and the blocking
//! synchronization primitives built on the scheduler.

pub mod lifecycle;
pub mod pcb;
pub mod signal;
pub mod sync;
pub mod table;

/// Size of the process arena; pids stay below this and are recycled.
pub const MAX_PROCESSES: usize = 64;

pub use lifecycle::{exec, exit, fork, getpgid, kill, setpgid, waitpid};
pub use pcb::{Pid, Process, ProcessState, SignalDisposition, NSIG};
pub use table::{create, current_pid, init, set_current, with_process};
