//! Blocking synchronization primitives.
//!
//! Built directly on the scheduler's block/unblock operations. The mutex
//! donates priority: when a more urgent task arrives at a held mutex, the
//! holder inherits the waiter's urgency until it releases. Ownership is
//! handed to a waiter at unlock, so there is no re-contention race.

use alloc::collections::VecDeque;

use spin::Mutex as SpinMutex;

use crate::error::{KernelError, KernelResult};
use crate::sched::{self, BlockReason};

/// Sleeping mutual exclusion with priority inheritance.
pub struct Mutex {
    inner: SpinMutex<MutexInner>,
}

struct MutexInner {
    /// Task-arena index of the holder
    holder: Option<usize>,
    waiters: VecDeque<usize>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(MutexInner {
                holder: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Take the mutex without blocking. Returns false if held elsewhere.
    pub fn try_lock(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.holder.is_none() {
            inner.holder = Some(sched::current_index());
            true
        } else {
            false
        }
    }

    /// Acquire, blocking while another task holds the mutex.
    pub fn lock(&self) {
        let me = sched::current_index();
        loop {
            if self.lock_attempt_as(me) {
                return;
            }
            sched::task_block(BlockReason::Mutex);
        }
    }

    /// One acquisition attempt for `me`: take the mutex if free, otherwise
    /// enqueue and donate priority to the holder. Returns whether the
    /// mutex is now held by `me` (possibly handed over by unlock).
    pub(crate) fn lock_attempt_as(&self, me: usize) -> bool {
        let mut inner = self.inner.lock();
        match inner.holder {
            None => {
                inner.holder = Some(me);
                true
            }
            Some(holder) if holder == me => true,
            Some(holder) => {
                if !inner.waiters.contains(&me) {
                    inner.waiters.push_back(me);
                }
                // Donate urgency so the holder cannot be starved under us.
                let mine = sched::effective_priority(me);
                if mine < sched::effective_priority(holder) {
                    sched::boost_priority(holder, mine);
                }
                false
            }
        }
    }

    /// Release, handing ownership to the longest-waiting task if any.
    pub fn unlock(&self) -> KernelResult<()> {
        self.unlock_as(sched::current_index())
    }

    pub(crate) fn unlock_as(&self, me: usize) -> KernelResult<()> {
        let mut inner = self.inner.lock();
        if inner.holder != Some(me) {
            return Err(KernelError::PermissionDenied);
        }

        // Any donation received while holding this mutex ends here.
        sched::restore_priority(me);

        match inner.waiters.pop_front() {
            Some(next) => {
                inner.holder = Some(next);
                sched::task_unblock(next);
            }
            None => inner.holder = None,
        }
        Ok(())
    }

    pub fn holder(&self) -> Option<usize> {
        self.inner.lock().holder
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Counting semaphore.
pub struct Semaphore {
    inner: SpinMutex<SemaphoreInner>,
}

struct SemaphoreInner {
    count: i32,
    waiters: VecDeque<usize>,
}

impl Semaphore {
    pub const fn new(count: i32) -> Self {
        Self {
            inner: SpinMutex::new(SemaphoreInner {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn wait(&self) {
        let me = sched::current_index();
        if !self.wait_attempt_as(me) {
            sched::task_block(BlockReason::Semaphore);
        }
    }

    /// Decrement; returns false (caller must block) when the count went
    /// negative.
    pub(crate) fn wait_attempt_as(&self, me: usize) -> bool {
        let mut inner = self.inner.lock();
        inner.count -= 1;
        if inner.count < 0 {
            inner.waiters.push_back(me);
            false
        } else {
            true
        }
    }

    pub fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn signal(&self) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        if let Some(next) = inner.waiters.pop_front() {
            sched::task_unblock(next);
        }
    }

    pub fn count(&self) -> i32 {
        self.inner.lock().count
    }
}

/// Condition variable; always used with a [`Mutex`].
pub struct CondVar {
    waiters: SpinMutex<VecDeque<usize>>,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            waiters: SpinMutex::new(VecDeque::new()),
        }
    }

    /// Atomically release `mutex` and block; re-acquire before returning.
    pub fn wait(&self, mutex: &Mutex) -> KernelResult<()> {
        let me = sched::current_index();
        self.waiters.lock().push_back(me);
        mutex.unlock_as(me)?;
        sched::task_block(BlockReason::CondVar);
        mutex.lock();
        Ok(())
    }

    /// Wake one waiter.
    pub fn signal(&self) {
        if let Some(next) = self.waiters.lock().pop_front() {
            sched::task_unblock(next);
        }
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(next) = waiters.pop_front() {
            sched::task_unblock(next);
        }
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader-writer lock. Writers get priority on arrival so a stream of
/// readers cannot starve them.
pub struct RwLock {
    inner: SpinMutex<RwLockInner>,
}

struct RwLockInner {
    readers: usize,
    writer: Option<usize>,
    waiting_readers: VecDeque<usize>,
    waiting_writers: VecDeque<usize>,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(RwLockInner {
                readers: 0,
                writer: None,
                waiting_readers: VecDeque::new(),
                waiting_writers: VecDeque::new(),
            }),
        }
    }

    pub fn read_lock(&self) {
        let me = sched::current_index();
        loop {
            if self.read_attempt_as(me) {
                return;
            }
            sched::task_block(BlockReason::RwLock);
        }
    }

    /// Readers are admitted only while no writer holds or awaits the lock.
    pub(crate) fn read_attempt_as(&self, me: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.writer.is_none() && inner.waiting_writers.is_empty() {
            inner.readers += 1;
            true
        } else {
            if !inner.waiting_readers.contains(&me) {
                inner.waiting_readers.push_back(me);
            }
            false
        }
    }

    pub fn read_unlock(&self) {
        let mut inner = self.inner.lock();
        inner.readers = inner.readers.saturating_sub(1);
        if inner.readers == 0 {
            if let Some(next) = inner.waiting_writers.pop_front() {
                sched::task_unblock(next);
            }
        }
    }

    pub fn write_lock(&self) {
        let me = sched::current_index();
        loop {
            if self.write_attempt_as(me) {
                return;
            }
            sched::task_block(BlockReason::RwLock);
        }
    }

    pub(crate) fn write_attempt_as(&self, me: usize) -> bool {
        let mut inner = self.inner.lock();
        if inner.readers == 0 && inner.writer.is_none() {
            inner.writer = Some(me);
            true
        } else {
            if !inner.waiting_writers.contains(&me) {
                inner.waiting_writers.push_back(me);
            }
            false
        }
    }

    pub fn write_unlock(&self) {
        let mut inner = self.inner.lock();
        inner.writer = None;
        if let Some(next) = inner.waiting_writers.pop_front() {
            sched::task_unblock(next);
        } else {
            while let Some(reader) = inner.waiting_readers.pop_front() {
                sched::task_unblock(reader);
            }
        }
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers
    }

    pub fn writer_held(&self) -> bool {
        self.inner.lock().writer.is_some()
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}
