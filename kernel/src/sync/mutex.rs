//! A sleeping mutex that participates in priority donation.
//!
//! Every [`Mutex`] registers a [`LockId`](crate::scheduler::LockId) with the
//! scheduler at construction time. `lock`/`unlock` call into
//! `crate::scheduler::{begin_wait, end_wait, lock_acquired, lock_released}`
//! so that [`crate::scheduler::effective_priority`] can walk the
//! currently-held-locks graph and donate priority through a blocked holder.
use crate::scheduler::{self, LockId};
use alloc::collections::vec_deque::VecDeque;
use core::ops::{Deref, DerefMut};
use keos::{
    sync::{SpinLock, SpinLockGuard, WouldBlock},
    thread::{Current, ParkHandle},
};

/// A mutual-exclusion primitive that sleeps waiters instead of spinning.
pub struct Mutex<T> {
    t: SpinLock<T>,
    waiters: SpinLock<VecDeque<(u64, ParkHandle)>>,
    id: LockId,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state.
    pub fn new(t: T) -> Mutex<T> {
        Mutex {
            t: SpinLock::new(t),
            waiters: SpinLock::new(VecDeque::new()),
            id: scheduler::lock_created(),
        }
    }

    /// Acquires the mutex, blocking the current thread until it is free.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let tid = Current::get_tid();
        loop {
            match self.t.try_lock() {
                Ok(guard) => {
                    scheduler::lock_acquired(tid, self.id);
                    return MutexGuard {
                        guard: Some(guard),
                        lock: self,
                    };
                }
                Err(WouldBlock) => {
                    scheduler::begin_wait(tid, self.id);
                    Current::park_with(|handle| {
                        let mut w = self.waiters.lock();
                        w.push_back((tid, handle));
                        w.unlock();
                    });
                }
            }
        }
    }

    /// Attempts to acquire the mutex without blocking.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        if let Ok(guard) = self.t.try_lock() {
            scheduler::lock_acquired(Current::get_tid(), self.id);
            Ok(MutexGuard {
                guard: Some(guard),
                lock: self,
            })
        } else {
            Err(WouldBlock)
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.t.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut *self.guard.as_mut().unwrap()
    }
}

/// A scoped guard for [`Mutex`]. Must be released with [`Self::unlock`];
/// dropping it without unlocking panics.
pub struct MutexGuard<'a, T: 'a> {
    guard: Option<SpinLockGuard<'a, T>>,
    lock: &'a Mutex<T>,
}

impl<T> !Send for MutexGuard<'_, T> {}
unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> MutexGuard<'_, T> {
    /// Releases the underlying mutex and wakes the highest-priority waiter.
    pub fn unlock(mut self) {
        let lock = self.lock;
        self.guard.take().unwrap().unlock();
        let tid = Current::get_tid();
        scheduler::lock_released(tid, lock.id);
        let mut w = lock.waiters.lock();
        let tids: alloc::vec::Vec<u64> = w.iter().map(|(t, _)| *t).collect();
        let next = scheduler::highest_priority_waiter(&tids).map(|idx| w.remove(idx).unwrap());
        w.unlock();
        if let Some((_, handle)) = next {
            handle.unpark();
        }
        core::mem::forget(self);
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.guard.is_some() {
            panic!("`.unlock()` must be explicitly called for MutexGuard.");
        }
    }
}
