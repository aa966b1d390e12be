//! A counting semaphore built from [`Mutex`] + [`ConditionVariable`].
use core::ops::Deref;

use super::{condition_variable::ConditionVariable, mutex::Mutex};

/// A semaphore guarding a piece of shared state with up to `permits`
/// concurrent holders.
pub struct Semaphore<T> {
    resource: T,
    permits: Mutex<usize>,
    cond: ConditionVariable,
}

impl<T> Semaphore<T> {
    /// Creates a semaphore starting with `permits` available permits.
    pub fn new(permits: usize, resource: T) -> Self {
        Self {
            resource,
            permits: Mutex::new(permits),
            cond: ConditionVariable::new(),
        }
    }

    /// Blocks until a permit is available, then takes one.
    pub fn wait(&self) -> SemaphorePermits<'_, T> {
        let mut guard = self.cond.wait_while(&self.permits, |n| *n == 0);
        *guard -= 1;
        guard.unlock();
        SemaphorePermits { sema: self }
    }

    /// Returns a permit and wakes one waiter, if any.
    pub fn signal(&self) {
        let mut guard = self.permits.lock();
        *guard += 1;
        self.cond.signal(guard);
    }
}

/// Releases its permit back to the [`Semaphore`] on drop.
pub struct SemaphorePermits<'a, T> {
    sema: &'a Semaphore<T>,
}

impl<T> Deref for SemaphorePermits<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.sema.resource
    }
}

impl<T> Drop for SemaphorePermits<'_, T> {
    fn drop(&mut self) {
        self.sema.signal()
    }
}
