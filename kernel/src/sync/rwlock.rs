//! A writer-preference, sleeping reader-writer lock.
//!
//! `keos::sync::RwLock` spins and has no read/write priority policy; this
//! one sleeps waiters through [`Mutex`] + [`ConditionVariable`] the same way
//! [`super::semaphore::Semaphore`] does, and once a writer is waiting, no new
//! reader is admitted until that writer has run (writer preference).
use super::{condition_variable::ConditionVariable, mutex::Mutex};
use core::ops::{Deref, DerefMut};

struct State {
    readers: usize,
    writer_active: bool,
    writers_waiting: usize,
}

/// A reader-writer lock that favors waiting writers over new readers.
pub struct RwLock<T> {
    state: Mutex<State>,
    readable: ConditionVariable,
    writable: ConditionVariable,
    data: core::cell::UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates an unlocked reader-writer lock around `t`.
    pub fn new(t: T) -> Self {
        Self {
            state: Mutex::new(State {
                readers: 0,
                writer_active: false,
                writers_waiting: 0,
            }),
            readable: ConditionVariable::new(),
            writable: ConditionVariable::new(),
            data: core::cell::UnsafeCell::new(t),
        }
    }

    /// Blocks until a shared read lock can be taken.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        let mut guard = self
            .readable
            .wait_while(&self.state, |s| s.writer_active || s.writers_waiting > 0);
        guard.readers += 1;
        guard.unlock();
        RwLockReadGuard { lock: self }
    }

    /// Blocks until the exclusive write lock can be taken.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        {
            let mut guard = self.state.lock();
            guard.writers_waiting += 1;
            guard.unlock();
        }
        let mut guard = self
            .writable
            .wait_while(&self.state, |s| s.writer_active || s.readers > 0);
        guard.writers_waiting -= 1;
        guard.writer_active = true;
        guard.unlock();
        RwLockWriteGuard { lock: self }
    }

    fn release_read(&self) {
        let mut guard = self.state.lock();
        guard.readers -= 1;
        let should_wake_writer = guard.readers == 0 && guard.writers_waiting > 0;
        if should_wake_writer {
            self.writable.signal(guard);
        } else {
            guard.unlock();
        }
    }

    fn release_write(&self) {
        let mut guard = self.state.lock();
        guard.writer_active = false;
        if guard.writers_waiting > 0 {
            self.writable.signal(guard);
        } else {
            self.readable.broadcast(guard);
        }
    }
}

/// A shared read guard for [`RwLock`].
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// An exclusive write guard for [`RwLock`].
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
