//! The scheduler: single-CPU preemptive round-robin with priority
//! inheritance hooks.
//!
//! One ready queue, tail-insert and head-remove. The timer tick charges
//! CPU time, wakes expired sleepers, and reschedules whenever anything is
//! runnable. An idle task exists outside the queue and is dispatched only
//! when nothing else is.

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::string::String;

use spin::Mutex;

use super::queue::ReadyQueue;
use super::task::{
    BlockReason, Task, TaskState, DEFAULT_PRIORITY, DEFAULT_STACK_SIZE, IDLE_PRIORITY, Priority,
};
use crate::arch;
use crate::error::{KernelResult, SchedError};
use crate::timer;

/// Size of the task arena.
pub const MAX_TASKS: usize = 64;

pub struct Scheduler {
    tasks: [Task; MAX_TASKS],
    ready: ReadyQueue,
    current: usize,
    idle: Option<usize>,
    next_tid: u32,
    enabled: bool,
}

impl Scheduler {
    const fn new() -> Self {
        Self {
            tasks: [const { Task::unused() }; MAX_TASKS],
            ready: ReadyQueue::new(),
            current: 0,
            idle: None,
            next_tid: 1,
            enabled: false,
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.tasks
            .iter()
            .position(|t| matches!(t.state, TaskState::Unused))
    }

    fn release_stack(task: &mut Task) {
        if task.kernel_stack_base != 0 {
            // SAFETY: the stack was allocated in create_task with exactly
            // this layout and is not executing (the task is dead).
            unsafe {
                dealloc(
                    task.kernel_stack_base as *mut u8,
                    Layout::from_size_align(task.kernel_stack_size, 16)
                        .expect("stack layout was valid at allocation"),
                );
            }
            task.kernel_stack_base = 0;
            task.kernel_stack_size = 0;
        }
    }
}

static SCHEDULER: Mutex<Scheduler> = Mutex::new(Scheduler::new());

fn idle_entry() {
    loop {
        arch::halt();
    }
}

fn task_exit_entry() {
    task_exit();
}

/// Set up the arena: slot 0 adopts the boot flow of control as the kernel
/// task, and the idle task is created outside the ready queue.
pub fn init() {
    {
        let mut sched = SCHEDULER.lock();
        let kernel = &mut sched.tasks[0];
        kernel.tid = 0;
        kernel.owning_pid = 0;
        kernel.name = String::from("kernel");
        kernel.state = TaskState::Running;
        kernel.base_priority = 0;
        sched.current = 0;
    }

    match create_task("idle", idle_entry, DEFAULT_STACK_SIZE) {
        Ok(idle) => {
            let mut sched = SCHEDULER.lock();
            // The idle task never waits in the queue; it is dispatched
            // directly when nothing else is runnable.
            let Scheduler { tasks, ready, .. } = &mut *sched;
            if ready.contains(tasks, idle) {
                let mut drained = ReadyQueue::new();
                while let Some(i) = ready.pop(tasks) {
                    if i != idle {
                        drained.push(tasks, i);
                    }
                }
                *ready = drained;
            }
            sched.tasks[idle].state = TaskState::Ready;
            sched.tasks[idle].base_priority = IDLE_PRIORITY;
            sched.idle = Some(idle);
        }
        Err(e) => log::error!("sched: failed to create idle task: {}", e),
    }

    log::info!("sched: initialized, {} task slots", MAX_TASKS);
}

/// Allow the tick handler to start preempting.
pub fn enable() {
    SCHEDULER.lock().enabled = true;
    log::info!("sched: preemption enabled");
}

pub fn disable() {
    SCHEDULER.lock().enabled = false;
}

/// Create a kernel task that begins at `entry` and is enqueued ready.
pub fn create_task(name: &str, entry: fn(), stack_size: usize) -> KernelResult<usize> {
    let stack_size = if stack_size == 0 {
        DEFAULT_STACK_SIZE
    } else {
        stack_size
    };

    let layout = Layout::from_size_align(stack_size, 16).map_err(|_| SchedError::NoStack)?;
    // SAFETY: layout has non-zero size.
    let stack = unsafe { alloc(layout) };
    if stack.is_null() {
        return Err(SchedError::NoStack.into());
    }

    let mut sched = SCHEDULER.lock();
    let Some(index) = sched.free_slot() else {
        // SAFETY: just allocated above with this layout, never exposed.
        unsafe { dealloc(stack, layout) };
        return Err(SchedError::TableFull.into());
    };

    let owning_pid = sched.tasks[sched.current].owning_pid;
    let tid = sched.next_tid;
    sched.next_tid += 1;

    let stack_top = stack as usize + stack_size;
    let seeded_sp = arch::prepare_task_stack(stack_top, entry, task_exit_entry);

    let task = &mut sched.tasks[index];
    Scheduler::release_stack(task); // recycle any stale zombie stack
    task.tid = tid;
    task.owning_pid = owning_pid;
    task.name = String::from(name);
    task.base_priority = DEFAULT_PRIORITY;
    task.inherited_priority = None;
    task.kernel_stack_base = stack as usize;
    task.kernel_stack_size = stack_size;
    task.saved_sp = seeded_sp;
    task.wake_tick = 0;
    task.cpu_time = 0;
    task.next = None;

    let Scheduler { tasks, ready, .. } = &mut *sched;
    ready.push(tasks, index);

    log::debug!("sched: created task '{}' (tid {})", name, tid);
    Ok(index)
}

/// Pick the next task and switch to it. No-op when nothing better is
/// runnable.
pub fn schedule() {
    let switch = {
        let mut sched = SCHEDULER.lock();
        let Scheduler {
            tasks,
            ready,
            current,
            idle,
            ..
        } = &mut *sched;

        let prev = *current;
        // Pop until a genuinely ready task surfaces; tasks retired while
        // queued are dropped here.
        let popped = loop {
            match ready.pop(tasks) {
                Some(i) if tasks[i].state == TaskState::Ready => break Some(i),
                Some(_) => continue,
                None => break None,
            }
        };
        let next = match popped {
            Some(next) => next,
            // Queue empty: if the current task can no longer run, fall
            // back to the idle task.
            None if !tasks[prev].is_runnable() => match *idle {
                Some(idle) if idle != prev => idle,
                _ => return,
            },
            None => return,
        };

        if next == prev {
            tasks[prev].state = TaskState::Running;
            return;
        }

        if tasks[prev].state == TaskState::Running && Some(prev) != *idle {
            ready.push(tasks, prev);
        }

        *current = next;
        tasks[next].state = TaskState::Running;
        tasks[next].next = None;

        // A later user -> kernel crossing must land on the new task's
        // stack.
        if tasks[next].kernel_stack_base != 0 {
            arch::set_kernel_stack(
                (tasks[next].kernel_stack_base + tasks[next].kernel_stack_size) as u32,
            );
        }

        let prev_sp = &mut tasks[prev].saved_sp as *mut usize;
        let next_sp = tasks[next].saved_sp;
        (prev_sp, next_sp)
    };

    let (prev_sp, next_sp) = switch;
    arch::without_interrupts(|| {
        // SAFETY: both stack pointers were seeded by prepare_task_stack or
        // a previous switch; the scheduler lock is released and interrupts
        // are off for the duration.
        unsafe { arch::context_switch(prev_sp as *mut u32, next_sp as u32) };
    });
}

/// Timer-interrupt hook: charge time, wake sleepers, preempt.
pub fn scheduler_tick() {
    let should_schedule = {
        let mut sched = SCHEDULER.lock();
        if !sched.enabled {
            return;
        }
        let current = sched.current;
        sched.tasks[current].cpu_time += 1;

        let now = timer::ticks();
        let Scheduler { tasks, ready, .. } = &mut *sched;
        for index in 0..MAX_TASKS {
            if tasks[index].state == TaskState::Sleeping && now >= tasks[index].wake_tick {
                ready.push(tasks, index);
            }
        }

        !ready.is_empty()
    };

    if should_schedule {
        schedule();
    }
}

/// Block the current task and run something else.
pub fn task_block(reason: BlockReason) {
    {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        sched.tasks[current].state = TaskState::Blocked(reason);
    }
    schedule();
}

/// Make a blocked task runnable again.
pub fn task_unblock(index: usize) {
    let mut sched = SCHEDULER.lock();
    if matches!(sched.tasks[index].state, TaskState::Blocked(_)) {
        let Scheduler { tasks, ready, .. } = &mut *sched;
        ready.push(tasks, index);
    }
}

/// Sleep for at least `ms` milliseconds.
pub fn task_sleep(ms: u64) {
    {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        sched.tasks[current].wake_tick = timer::ticks() + ms * timer::TICK_HZ / 1000;
        sched.tasks[current].state = TaskState::Sleeping;
    }
    schedule();
}

/// Terminate the current task. The zombie slot (and its stack) is
/// recycled on reap or on slot reuse.
pub fn task_exit() -> ! {
    {
        let mut sched = SCHEDULER.lock();
        let current = sched.current;
        log::debug!("sched: task '{}' exiting", sched.tasks[current].name);
        sched.tasks[current].state = TaskState::Zombie;
    }
    schedule();
    // Only reached when nothing else was runnable and no idle task exists
    // (early boot); nothing to do but wait for the tick.
    loop {
        arch::halt();
    }
}

/// Mark the task executing for `pid` dead. Process exit and kill go
/// through here; a queued link is discarded by the next schedule pass.
pub fn retire_task_for_pid(pid: u32) {
    let mut sched = SCHEDULER.lock();
    if let Some(index) = sched
        .tasks
        .iter()
        .position(|t| t.state != TaskState::Unused && t.owning_pid == pid && t.tid != 0)
    {
        sched.tasks[index].state = TaskState::Zombie;
    }
}

/// Release a dead task's slot and stack.
pub fn reap_task(index: usize) {
    let mut sched = SCHEDULER.lock();
    if sched.tasks[index].state == TaskState::Zombie {
        Scheduler::release_stack(&mut sched.tasks[index]);
        sched.tasks[index] = Task::unused();
    }
}

/// Donate priority to `index` (the holder of a contended lock). Keeps the
/// most urgent donation seen.
pub fn boost_priority(index: usize, priority: Priority) {
    let mut sched = SCHEDULER.lock();
    let task = &mut sched.tasks[index];
    match task.inherited_priority {
        Some(existing) if existing <= priority => {}
        _ => task.inherited_priority = Some(priority),
    }
}

/// Drop any donation and return to the base priority.
pub fn restore_priority(index: usize) {
    SCHEDULER.lock().tasks[index].inherited_priority = None;
}

pub fn effective_priority(index: usize) -> Priority {
    SCHEDULER.lock().tasks[index].effective_priority()
}

/// Arena index of the running task.
pub fn current_index() -> usize {
    SCHEDULER.lock().current
}

pub fn current_tid() -> u32 {
    let sched = SCHEDULER.lock();
    sched.tasks[sched.current].tid
}

/// Pid the running task executes for.
pub fn current_pid() -> u32 {
    let sched = SCHEDULER.lock();
    sched.tasks[sched.current].owning_pid
}

/// Bind the running task to a process (process creation and exec).
pub fn set_current_pid(pid: u32) {
    let mut sched = SCHEDULER.lock();
    let current = sched.current;
    sched.tasks[current].owning_pid = pid;
}

/// Find the task slot executing for `pid`, if any.
pub fn task_for_pid(pid: u32) -> Option<usize> {
    let sched = SCHEDULER.lock();
    sched
        .tasks
        .iter()
        .position(|t| t.state != TaskState::Unused && t.owning_pid == pid && t.tid != 0)
}

pub fn task_state(index: usize) -> TaskState {
    SCHEDULER.lock().tasks[index].state
}

pub fn task_count() -> usize {
    SCHEDULER
        .lock()
        .tasks
        .iter()
        .filter(|t| t.state != TaskState::Unused)
        .count()
}

/// Whether a task is waiting in the ready queue.
pub fn is_queued(index: usize) -> bool {
    let sched = SCHEDULER.lock();
    sched.ready.contains(&sched.tasks, index)
}

/// Consistency check: the ready queue terminates and each queued task is
/// actually ready.
pub fn ready_queue_consistent() -> bool {
    let sched = SCHEDULER.lock();
    if !sched.ready.is_acyclic(&sched.tasks) {
        return false;
    }
    for (i, task) in sched.tasks.iter().enumerate() {
        if sched.ready.contains(&sched.tasks, i) && task.state != TaskState::Ready {
            return false;
        }
    }
    true
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testing {
    //! The scheduler is one global arena; tests that touch it serialize on
    //! this guard and share one initialized instance.

    use spin::{Mutex, MutexGuard, Once};

    static INIT: Once<()> = Once::new();
    static GUARD: Mutex<()> = Mutex::new(());

    pub fn lock() -> MutexGuard<'static, ()> {
        let guard = GUARD.lock();
        INIT.call_once(|| {
            super::init();
        });
        guard
    }

    /// Force the arena's notion of the running task. Tests use this to
    /// play several actors against one lock.
    pub fn force_current(index: usize) {
        let mut sched = super::SCHEDULER.lock();
        sched.current = index;
        sched.tasks[index].state = super::TaskState::Running;
        sched.tasks[index].next = None;
    }

    /// Pull a task out of the ready queue so it can be forced current.
    pub fn remove_from_queue(index: usize) {
        let mut sched = super::SCHEDULER.lock();
        let super::Scheduler { tasks, ready, .. } = &mut *sched;
        let mut drained = super::ReadyQueue::new();
        while let Some(i) = ready.pop(tasks) {
            if i != index {
                drained.push(tasks, i);
            }
        }
        *ready = drained;
    }

    pub fn set_base_priority(index: usize, priority: u8) {
        super::SCHEDULER.lock().tasks[index].base_priority = priority;
    }

    pub fn mark_blocked(index: usize, reason: super::BlockReason) {
        super::SCHEDULER.lock().tasks[index].state = super::TaskState::Blocked(reason);
    }

    pub fn mark_zombie(index: usize) {
        super::SCHEDULER.lock().tasks[index].state = super::TaskState::Zombie;
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn noop_entry() {}

    #[test]
    fn round_robin_requeues_preempted_tasks() {
        let _guard = testing::lock();

        let a = create_task("rr-a", noop_entry, 4096).expect("slot available");
        let b = create_task("rr-b", noop_entry, 4096).expect("slot available");
        assert!(is_queued(a) && is_queued(b));
        assert!(ready_queue_consistent());

        // Adopt `a` as the running task, then schedule: `a` is still
        // runnable, so it goes to the tail and `b` (or the next queued
        // task) takes over.
        testing::remove_from_queue(a);
        testing::force_current(a);
        schedule();
        assert!(is_queued(a), "preempted runnable task is re-enqueued");
        assert!(ready_queue_consistent());

        // Drain our tasks so later tests see a clean queue.
        for idx in [a, b] {
            testing::remove_from_queue(idx);
            let mut sched = SCHEDULER.lock();
            sched.tasks[idx].state = TaskState::Zombie;
            drop(sched);
            reap_task(idx);
        }
    }

    #[test]
    fn blocked_tasks_leave_the_queue_until_unblocked() {
        let _guard = testing::lock();

        let t = create_task("blocker", noop_entry, 4096).expect("slot available");
        testing::remove_from_queue(t);
        testing::force_current(t);

        task_block(BlockReason::Semaphore);
        assert_eq!(task_state(t), TaskState::Blocked(BlockReason::Semaphore));
        assert!(!is_queued(t));

        task_unblock(t);
        assert_eq!(task_state(t), TaskState::Ready);
        assert!(is_queued(t));

        testing::remove_from_queue(t);
        SCHEDULER.lock().tasks[t].state = TaskState::Zombie;
        reap_task(t);
    }

    #[test]
    fn sleeping_tasks_wake_after_deadline() {
        let _guard = testing::lock();
        enable();

        let t = create_task("sleeper", noop_entry, 4096).expect("slot available");
        testing::remove_from_queue(t);
        testing::force_current(t);

        task_sleep(5);
        assert_eq!(task_state(t), TaskState::Sleeping);

        // Not yet due: the tick must not wake it.
        scheduler_tick();
        assert_eq!(task_state(t), TaskState::Sleeping);

        crate::timer::advance_for_test(10);
        scheduler_tick();
        assert!(
            matches!(task_state(t), TaskState::Ready | TaskState::Running),
            "expired sleeper is runnable again"
        );

        disable();
        testing::remove_from_queue(t);
        SCHEDULER.lock().tasks[t].state = TaskState::Zombie;
        reap_task(t);
    }

    #[test]
    fn priority_donation_boosts_and_restores() {
        let _guard = testing::lock();

        let holder = create_task("pi-holder", noop_entry, 4096).expect("slot available");
        {
            let mut sched = SCHEDULER.lock();
            sched.tasks[holder].base_priority = 20;
        }

        assert_eq!(effective_priority(holder), 20);
        boost_priority(holder, 5);
        assert_eq!(effective_priority(holder), 5);

        // A less urgent donation does not displace a more urgent one.
        boost_priority(holder, 9);
        assert_eq!(effective_priority(holder), 5);

        restore_priority(holder);
        assert_eq!(effective_priority(holder), 20);

        testing::remove_from_queue(holder);
        SCHEDULER.lock().tasks[holder].state = TaskState::Zombie;
        reap_task(holder);
    }

    #[test]
    fn zombie_reap_releases_the_slot() {
        let _guard = testing::lock();

        let before = task_count();
        let t = create_task("short-lived", noop_entry, 4096).expect("slot available");
        assert_eq!(task_count(), before + 1);

        testing::remove_from_queue(t);
        SCHEDULER.lock().tasks[t].state = TaskState::Zombie;
        reap_task(t);
        assert_eq!(task_count(), before);
        assert_eq!(task_state(t), TaskState::Unused);
    }
}
