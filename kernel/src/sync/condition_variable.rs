//! A condition variable used together with [`Mutex`].
//!
//! `signal` wakes the highest-priority waiter rather than the
//! longest-waiting one — the same no-FIFO policy `Mutex::unlock` and
//! `Semaphore::up` use, found by the same
//! `scheduler::highest_priority_waiter` lookup [`Mutex`] uses.
use super::mutex::{Mutex, MutexGuard};
use alloc::collections::vec_deque::VecDeque;
use keos::{
    sync::SpinLock,
    thread::{Current, ParkHandle},
};

/// Lets a thread sleep until a predicate over mutex-guarded state holds.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<VecDeque<(u64, ParkHandle)>>,
}

impl ConditionVariable {
    /// Creates a condition variable with no waiters.
    pub fn new() -> Self {
        Self {
            waiters: SpinLock::new(VecDeque::new()),
        }
    }

    /// Blocks while `predicate` holds, releasing `mutex` while asleep and
    /// reacquiring it (and re-checking `predicate`) on every wakeup.
    pub fn wait_while<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        predicate: impl Fn(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        while predicate(&mut guard) {
            let tid = Current::get_tid();
            // Register as a waiter *before* releasing `mutex` — a signaler
            // can't touch `self.waiters` without first locking `mutex`
            // itself, so releasing it only after we're enqueued here means
            // no signal/broadcast can run in between and be missed.
            Current::park_with(|handle| {
                let mut w = self.waiters.lock();
                w.push_back((tid, handle));
                w.unlock();
                guard.unlock();
            });
            guard = mutex.lock();
        }
        guard
    }

    /// Wakes the highest-priority waiter. The guard is handed back so the
    /// caller can keep using it or drop it to release the mutex.
    pub fn signal<T>(&self, guard: MutexGuard<'_, T>) {
        let mut w = self.waiters.lock();
        let tids: alloc::vec::Vec<u64> = w.iter().map(|(t, _)| *t).collect();
        let next = crate::scheduler::highest_priority_waiter(&tids).map(|idx| w.remove(idx).unwrap());
        w.unlock();
        if let Some((_, handle)) = next {
            handle.unpark();
        }
        guard.unlock();
    }

    /// Wakes every waiter.
    pub fn broadcast<T>(&self, guard: MutexGuard<'_, T>) {
        let mut w = self.waiters.lock();
        let all: alloc::vec::Vec<(u64, ParkHandle)> = w.drain(..).collect();
        w.unlock();
        for (_, handle) in all {
            handle.unpark();
        }
        guard.unlock();
    }
}
