//! A small bounded channel for handing values between threads.
//!
//! [`Sender`] and [`Receiver`] back pipe file descriptors and the
//! read-ahead request queue used elsewhere in the kernel. Rather than
//! maintaining a dedicated waiter list, both halves busy-poll a
//! [`SpinLock`]-guarded ring buffer and yield the CPU through
//! [`crate::thread::scheduler::scheduler().reschedule()`] between
//! attempts — the same spin-and-reschedule idiom already used by
//! [`crate::thread::JoinHandle::join`].
use crate::sync::SpinLock;
use alloc::{collections::VecDeque, sync::Arc};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

struct Inner<T> {
    queue: SpinLock<VecDeque<T>>,
    capacity: usize,
    sender_count: AtomicUsize,
    receiver_dropped: AtomicBool,
}

/// The sending half of a channel, returned by [`channel`].
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

/// The receiving half of a channel, returned by [`channel`].
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

/// Returned by [`Sender::send`] when every [`Receiver`] has been dropped.
///
/// Carries the value back so the caller can decide what to do with it.
#[derive(Debug)]
pub struct SendError<T>(pub T);

/// Returned by [`Receiver::recv`] when every [`Sender`] has been dropped
/// and the queue has drained.
#[derive(Debug)]
pub struct RecvError;

/// Creates a new channel with room for `capacity` in-flight values.
///
/// `capacity` of `0` still allows rendezvous-style handoff: a sender
/// blocks until a receiver has taken the previous value out.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        queue: SpinLock::new(VecDeque::new()),
        capacity,
        sender_count: AtomicUsize::new(1),
        receiver_dropped: AtomicBool::new(false),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.inner.sender_count.fetch_add(1, Ordering::SeqCst);
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.inner.sender_count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.receiver_dropped.store(true, Ordering::SeqCst);
    }
}

impl<T> Sender<T> {
    /// Sends `value`, blocking while the channel is at capacity.
    ///
    /// Returns [`SendError`] (handing `value` back) once the receiver
    /// has been dropped.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        let mut value = value;
        loop {
            if self.inner.receiver_dropped.load(Ordering::SeqCst) {
                return Err(SendError(value));
            }
            let mut guard = self.inner.queue.lock();
            if guard.len() < self.inner.capacity.max(1) {
                guard.push_back(value);
                guard.unlock();
                return Ok(());
            }
            guard.unlock();
            crate::scheduler().reschedule();
        }
    }
}

impl<T> Receiver<T> {
    /// Receives the next value, blocking until one is available.
    ///
    /// Returns [`RecvError`] once every [`Sender`] has been dropped and
    /// no buffered value remains.
    pub fn recv(&self) -> Result<T, RecvError> {
        loop {
            let mut guard = self.inner.queue.lock();
            if let Some(v) = guard.pop_front() {
                guard.unlock();
                return Ok(v);
            }
            let senders_alive = self.inner.sender_count.load(Ordering::SeqCst) > 0;
            guard.unlock();
            if !senders_alive {
                return Err(RecvError);
            }
            crate::scheduler().reschedule();
        }
    }

    /// Receives the next value without blocking.
    pub fn try_recv(&self) -> Option<T> {
        let mut guard = self.inner.queue.lock();
        let v = guard.pop_front();
        guard.unlock();
        v
    }
}

unsafe impl<T: Send> Send for Sender<T> {}
unsafe impl<T: Send> Sync for Sender<T> {}
unsafe impl<T: Send> Send for Receiver<T> {}
unsafe impl<T: Send> Sync for Receiver<T> {}
