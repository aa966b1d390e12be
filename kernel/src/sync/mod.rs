//! Sleeping synchronization primitives layered on top of
//! `keos::sync::SpinLock` and the priority-donation bookkeeping in
//! [`crate::scheduler`].
//!
//! Build order mirrors dependency order: [`mutex`] first (everything else
//! sleeps through it), then [`condition_variable`], then [`semaphore`] and
//! [`rwlock`], which are both built from the first two.
pub mod condition_variable;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;

pub use condition_variable::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::{Semaphore, SemaphorePermits};
