//! Task records.
//!
//! The scheduler's unit of execution. Tasks live in a fixed-size arena and
//! reference each other by index, so the ready queue is a thread of
//! indices rather than owned pointers.

use alloc::string::String;

/// Lower number = more urgent.
pub type Priority = u8;

/// Priority given to newly created tasks.
pub const DEFAULT_PRIORITY: Priority = 10;

/// The idle task runs only when nothing else can.
pub const IDLE_PRIORITY: Priority = 255;

/// Default kernel stack size for new tasks.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unused,
    Ready,
    Running,
    Blocked(BlockReason),
    Sleeping,
    Zombie,
}

/// Why a task is blocked, for diagnostics and targeted wakeups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Mutex,
    Semaphore,
    CondVar,
    RwLock,
    Wait,
    Io,
}

/// One task record.
pub struct Task {
    pub tid: u32,
    /// Process this task executes for (0 = kernel)
    pub owning_pid: u32,
    pub name: String,
    pub state: TaskState,
    pub base_priority: Priority,
    /// Set while holding a donation from a more urgent waiter
    pub inherited_priority: Option<Priority>,
    /// Kernel stack, allocated from the kernel heap
    pub kernel_stack_base: usize,
    pub kernel_stack_size: usize,
    /// Saved stack pointer while switched out
    pub saved_sp: usize,
    /// Tick at which a sleeping task becomes runnable
    pub wake_tick: u64,
    /// Timer ticks charged to this task
    pub cpu_time: u64,
    /// Ready-queue link: index of the next queued task
    pub next: Option<usize>,
}

impl Task {
    pub const fn unused() -> Self {
        Self {
            tid: 0,
            owning_pid: 0,
            name: String::new(),
            state: TaskState::Unused,
            base_priority: DEFAULT_PRIORITY,
            inherited_priority: None,
            kernel_stack_base: 0,
            kernel_stack_size: 0,
            saved_sp: 0,
            wake_tick: 0,
            cpu_time: 0,
            next: None,
        }
    }

    /// Urgency the scheduler and the lock donation logic act on.
    pub fn effective_priority(&self) -> Priority {
        match self.inherited_priority {
            Some(inherited) => inherited.min(self.base_priority),
            None => self.base_priority,
        }
    }

    pub fn is_runnable(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn effective_priority_is_min_of_base_and_inherited() {
        let mut task = Task::unused();
        task.base_priority = 20;
        assert_eq!(task.effective_priority(), 20);

        task.inherited_priority = Some(5);
        assert_eq!(task.effective_priority(), 5);

        // A donation never lowers urgency below the base.
        task.inherited_priority = Some(30);
        assert_eq!(task.effective_priority(), 20);

        task.inherited_priority = None;
        assert_eq!(task.effective_priority(), 20);
    }
}
