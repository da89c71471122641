//! Process control block.

use alloc::string::String;

use crate::fs::file::FdTable;

pub type Pid = u32;

/// Signals 1..NSIG are valid; bit `sig - 1` in the masks.
pub const NSIG: usize = 32;

pub const SIGHUP: u32 = 1;
pub const SIGINT: u32 = 2;
pub const SIGQUIT: u32 = 3;
pub const SIGKILL: u32 = 9;
pub const SIGSEGV: u32 = 11;
pub const SIGTERM: u32 = 15;
pub const SIGCHLD: u32 = 17;
pub const SIGCONT: u32 = 18;
pub const SIGSTOP: u32 = 19;
pub const SIGTSTP: u32 = 20;
pub const SIGTTIN: u32 = 21;
pub const SIGTTOU: u32 = 22;
pub const SIGURG: u32 = 23;
pub const SIGWINCH: u32 = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,
    Ready,
    Running,
    Blocked,
    Zombie,
    Stopped,
}

/// What happens when a signal is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    Default,
    Ignore,
    /// User-space handler entry point
    Handler(u32),
}

/// One process record.
pub struct Process {
    pub pid: Pid,
    pub ppid: Pid,
    pub pgid: Pid,
    pub state: ProcessState,
    pub name: String,
    pub fd_table: FdTable,
    /// Bit `sig - 1` set = signal pending
    pub pending_signals: u32,
    pub blocked_signals: u32,
    pub handlers: [SignalDisposition; NSIG],
    /// Scheduler arena slot executing this process, if any
    pub task: Option<usize>,
    pub exit_code: i32,
    pub start_tick: u64,
    pub cpu_time: u64,
    /// Advisory ownership; maintained but not enforced
    pub uid: u32,
    pub gid: u32,
}

impl Process {
    pub const fn unused() -> Self {
        Self {
            pid: 0,
            ppid: 0,
            pgid: 0,
            state: ProcessState::Unused,
            name: String::new(),
            fd_table: FdTable::new(),
            pending_signals: 0,
            blocked_signals: 0,
            handlers: [SignalDisposition::Default; NSIG],
            task: None,
            exit_code: 0,
            start_tick: 0,
            cpu_time: 0,
            uid: 0,
            gid: 0,
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, ProcessState::Unused)
    }
}

pub fn state_name(state: ProcessState) -> &'static str {
    match state {
        ProcessState::Unused => "unused",
        ProcessState::Ready => "ready",
        ProcessState::Running => "running",
        ProcessState::Blocked => "blocked",
        ProcessState::Zombie => "zombie",
        ProcessState::Stopped => "stopped",
    }
}
