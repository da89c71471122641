//! The process table.
//!
//! A fixed arena of process records. Pids are recycled from the lowest
//! free number so they stay valid indices into the per-pid resources
//! (VMA tables) for the life of the system. Pid 0 is the kernel, pid 1
//! is init/shell; neither can be killed or reaped.

use alloc::string::String;

use spin::Mutex;

use super::pcb::{Pid, Process, ProcessState};
use super::MAX_PROCESSES;
use crate::error::{KernelError, KernelResult};
use crate::timer;

pub struct ProcessTable {
    procs: [Process; MAX_PROCESSES],
    current: Pid,
}

impl ProcessTable {
    const fn new() -> Self {
        Self {
            procs: [const { Process::unused() }; MAX_PROCESSES],
            current: 0,
        }
    }

    fn slot_of(&self, pid: Pid) -> Option<usize> {
        self.procs
            .iter()
            .position(|p| p.is_live() && p.pid == pid)
    }

    /// Lowest pid not in use, starting at 2.
    fn allocate_pid(&self) -> Option<Pid> {
        (2..MAX_PROCESSES as Pid).find(|&pid| self.slot_of(pid).is_none())
    }
}

static PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());

/// Install the two permanent processes: the kernel (pid 0) and
/// init/shell (pid 1).
pub fn init() {
    let mut table = PROCESS_TABLE.lock();

    let kernel = &mut table.procs[0];
    kernel.pid = 0;
    kernel.ppid = 0;
    kernel.pgid = 0;
    kernel.state = ProcessState::Running;
    kernel.name = String::from("kernel");

    let shell = &mut table.procs[1];
    shell.pid = 1;
    shell.ppid = 0;
    shell.pgid = 1;
    shell.state = ProcessState::Running;
    shell.name = String::from("shell");

    table.current = 1;
    log::info!("proc: table ready, {} slots", MAX_PROCESSES);
}

/// Create a process record. Returns the new pid.
pub fn create(name: &str, ppid: Pid) -> KernelResult<Pid> {
    let mut table = PROCESS_TABLE.lock();

    let pid = table.allocate_pid().ok_or(KernelError::TryAgain)?;
    let slot = table
        .procs
        .iter()
        .position(|p| !p.is_live())
        .ok_or(KernelError::TryAgain)?;

    let proc = &mut table.procs[slot];
    *proc = Process::unused();
    proc.pid = pid;
    proc.ppid = ppid;
    proc.pgid = pid;
    proc.state = ProcessState::Ready;
    proc.name = String::from(name);
    proc.start_tick = timer::ticks();

    crate::mm::vma::init_process(pid);
    Ok(pid)
}

/// Run `f` against a live process record.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> KernelResult<R> {
    let mut table = PROCESS_TABLE.lock();
    let slot = table.slot_of(pid).ok_or(KernelError::NoSuchProcess)?;
    Ok(f(&mut table.procs[slot]))
}

/// Run `f` against two live processes at once (fork's parent/child).
pub fn with_process_pair<R>(
    a: Pid,
    b: Pid,
    f: impl FnOnce(&mut Process, &mut Process) -> R,
) -> KernelResult<R> {
    let mut table = PROCESS_TABLE.lock();
    let slot_a = table.slot_of(a).ok_or(KernelError::NoSuchProcess)?;
    let slot_b = table.slot_of(b).ok_or(KernelError::NoSuchProcess)?;
    if slot_a == slot_b {
        return Err(KernelError::BadArgument);
    }
    // Split the arena to hold two disjoint mutable records.
    let (low, high) = if slot_a < slot_b { (slot_a, slot_b) } else { (slot_b, slot_a) };
    let (head, tail) = table.procs.split_at_mut(high);
    let (first, second) = (&mut head[low], &mut tail[0]);
    if slot_a < slot_b {
        Ok(f(first, second))
    } else {
        Ok(f(second, first))
    }
}

pub fn exists(pid: Pid) -> bool {
    PROCESS_TABLE.lock().slot_of(pid).is_some()
}

pub fn current_pid() -> Pid {
    PROCESS_TABLE.lock().current
}

pub fn set_current(pid: Pid) {
    PROCESS_TABLE.lock().current = pid;
}

pub fn count() -> usize {
    PROCESS_TABLE
        .lock()
        .procs
        .iter()
        .filter(|p| p.is_live())
        .count()
}

/// Snapshot of `(pid, ppid, state, name)` for every live process.
pub fn snapshot() -> alloc::vec::Vec<(Pid, Pid, ProcessState, String)> {
    PROCESS_TABLE
        .lock()
        .procs
        .iter()
        .filter(|p| p.is_live())
        .map(|p| (p.pid, p.ppid, p.state, p.name.clone()))
        .collect()
}

/// Release a process slot entirely (reaping).
pub fn release(pid: Pid) -> KernelResult<()> {
    if pid <= 1 {
        return Err(KernelError::PermissionDenied);
    }
    let mut table = PROCESS_TABLE.lock();
    let slot = table.slot_of(pid).ok_or(KernelError::NoSuchProcess)?;
    table.procs[slot] = Process::unused();
    Ok(())
}

/// Move every child of `parent` under init (pid 1).
pub fn reparent_children(parent: Pid) {
    let mut table = PROCESS_TABLE.lock();
    for proc in table.procs.iter_mut() {
        if proc.is_live() && proc.ppid == parent {
            proc.ppid = 1;
            log::debug!("proc: reparented pid {} to init", proc.pid);
        }
    }
}

/// Find a zombie child of `parent`, optionally a specific pid. Returns
/// `(pid, exit_code)` without releasing the slot.
pub fn find_zombie_child(parent: Pid, which: Option<Pid>) -> Option<(Pid, i32)> {
    let table = PROCESS_TABLE.lock();
    table
        .procs
        .iter()
        .filter(|p| p.is_live() && p.ppid == parent && p.state == ProcessState::Zombie)
        .filter(|p| which.is_none_or(|pid| p.pid == pid))
        .map(|p| (p.pid, p.exit_code))
        .next()
}

/// Whether `parent` has any live children at all.
pub fn has_children(parent: Pid) -> bool {
    let table = PROCESS_TABLE.lock();
    table
        .procs
        .iter()
        .any(|p| p.is_live() && p.ppid == parent)
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod testing {
    use spin::{Mutex, MutexGuard, Once};

    static INIT: Once<()> = Once::new();
    static GUARD: Mutex<()> = Mutex::new(());

    /// Serialize tests that mutate the global process table, initializing
    /// it on first use.
    pub fn lock() -> MutexGuard<'static, ()> {
        let guard = GUARD.lock();
        INIT.call_once(|| {
            super::init();
        });
        guard
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn kernel_and_shell_exist_after_init() {
        let _guard = testing::lock();
        assert!(exists(0));
        assert!(exists(1));
        assert!(with_process(1, |p| p.name.clone()).unwrap() == "shell");
    }

    #[test]
    fn pids_are_recycled_lowest_first() {
        let _guard = testing::lock();
        let a = create("recycle-a", 1).expect("slot available");
        let b = create("recycle-b", 1).expect("slot available");
        assert!(b > a);

        release(a).expect("release");
        let c = create("recycle-c", 1).expect("slot available");
        assert_eq!(c, a, "lowest free pid is reused");

        release(b).expect("cleanup");
        release(c).expect("cleanup");
    }

    #[test]
    fn release_protects_kernel_and_init() {
        let _guard = testing::lock();
        assert!(release(0).is_err());
        assert!(release(1).is_err());
    }

    #[test]
    fn reparenting_moves_children_to_init() {
        let _guard = testing::lock();
        let parent = create("rp-parent", 1).expect("slot");
        let child = create("rp-child", parent).expect("slot");

        reparent_children(parent);
        assert_eq!(with_process(child, |p| p.ppid).unwrap(), 1);

        release(child).expect("cleanup");
        release(parent).expect("cleanup");
    }

    #[test]
    fn zombie_children_are_found_by_filter() {
        let _guard = testing::lock();
        let parent = create("zb-parent", 1).expect("slot");
        let child = create("zb-child", parent).expect("slot");

        assert!(find_zombie_child(parent, None).is_none());
        with_process(child, |p| {
            p.state = ProcessState::Zombie;
            p.exit_code = 42;
        })
        .unwrap();

        assert_eq!(find_zombie_child(parent, None), Some((child, 42)));
        assert_eq!(find_zombie_child(parent, Some(child)), Some((child, 42)));
        assert_eq!(find_zombie_child(parent, Some(child + 17)), None);

        release(child).expect("cleanup");
        release(parent).expect("cleanup");
    }
}
