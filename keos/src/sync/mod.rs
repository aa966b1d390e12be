//! Synchronization primitives.
//!
//! This module gathers the low-level building blocks the rest of the
//! kernel builds higher-level locks and condition variables on top of:
//! a spinlock ([`SpinLock`]), a reader-writer lock ([`RwLock`]), and
//! `no_std`-friendly atomic wrappers ([`atomic`]).
pub mod atomic;
mod rwlock;
mod spinlock;

pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
