//! Global frame table: one entry per physical page handed out to a user
//! mapping, with clock-hand eviction and pin/unpin for DMA-style critical
//! sections.
//!
//! Unlike `keos-project5`'s [`crate::mm::page_table`]-adjacent `LRUCache`,
//! eviction here walks a fixed-size array with a moving hand and an
//! accessed-bit check (`cache.c`'s policy in `original_source/`), not a
//! recency list: the frame table owns physical pages system-wide, across
//! every process, so a per-process LRU list has no single place to live.
use crate::sync::{Mutex, MutexGuard};
use alloc::{sync::Arc, vec::Vec};
use keos::{KernelError, addressing::Va, mm::Page};

/// Whatever owns a frame must be able to answer the clock hand's
/// questions about it and take over eviction when the hand lands on it.
pub trait FrameOwner: Send + Sync {
    /// The virtual address this frame is currently mapped at.
    fn va(&self) -> Va;
    /// Whether the hardware accessed bit is set for this mapping (checked,
    /// and cleared, in the owner's own page table — the frame table itself
    /// does not know which page table to look in).
    fn accessed_and_clear(&self) -> bool;
    /// Whether the page has been written since it was last made clean.
    fn dirty(&self) -> bool;
    /// Evicts this frame: write its contents out (swap or file) and unmap
    /// it from the owner's page table. The frame table reclaims the
    /// physical page only after this returns successfully.
    fn evict(&self) -> Result<(), KernelError>;
}

struct Entry {
    page: Page,
    owner: Arc<dyn FrameOwner>,
    pinned: bool,
}

struct Inner {
    frames: Vec<Option<Entry>>,
    hand: usize,
}

/// Fixed-capacity table of user-owned physical frames.
pub struct FrameTable {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl FrameTable {
    /// Creates a frame table that can hold up to `capacity` frames before
    /// it must evict to make room for a new one.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: (0..capacity).map(|_| None).collect(),
                hand: 0,
            }),
            capacity,
        }
    }

    /// Hands out a fresh page owned by `owner`, evicting the clock hand's
    /// target first if the table is full.
    pub fn alloc(&self, owner: Arc<dyn FrameOwner>) -> Result<Page, KernelError> {
        let mut guard = self.inner.lock();
        let slot = loop {
            if let Some(idx) = guard.frames.iter().position(|e| e.is_none()) {
                break idx;
            }
            self.evict_one(&mut guard)?;
        };
        let page = Page::new();
        guard.frames[slot] = Some(Entry {
            page: page.clone(),
            owner,
            pinned: false,
        });
        guard.unlock();
        Ok(page)
    }

    /// Marks the frame backing `va` (as claimed by `owner.va()`) as pinned,
    /// so the clock hand skips it until [`Self::unpin`] is called. Used to
    /// protect a page mid-I/O (e.g. while a buffer-cache write-back or a
    /// syscall's `read`/`write` touches it).
    pub fn pin(&self, va: Va) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.frames.iter_mut().flatten().find(|e| e.owner.va() == va) {
            entry.pinned = true;
        }
        guard.unlock();
    }

    /// Reverses [`Self::pin`].
    pub fn unpin(&self, va: Va) {
        let mut guard = self.inner.lock();
        if let Some(entry) = guard.frames.iter_mut().flatten().find(|e| e.owner.va() == va) {
            entry.pinned = false;
        }
        guard.unlock();
    }

    /// Drops the table's ownership of the frame at `va`, e.g. because the
    /// owning mapping was explicitly unmapped rather than evicted.
    pub fn release(&self, va: Va) {
        let mut guard = self.inner.lock();
        if let Some(slot) = guard
            .frames
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.owner.va() == va))
        {
            guard.frames[slot] = None;
        }
        guard.unlock();
    }

    fn evict_one(&self, guard: &mut MutexGuard<'_, Inner>) -> Result<(), KernelError> {
        let cap = self.capacity;
        for _ in 0..2 * cap {
            let idx = guard.hand;
            guard.hand = (guard.hand + 1) % cap;
            let Some(entry) = &guard.frames[idx] else { continue };
            if entry.pinned {
                continue;
            }
            if entry.owner.accessed_and_clear() {
                continue;
            }
            entry.owner.evict()?;
            guard.frames[idx] = None;
            return Ok(());
        }
        Err(KernelError::NoMemory)
    }
}

static FRAME_TABLE: keos::sync::SpinLock<Option<FrameTable>> = keos::sync::SpinLock::new(None);

/// Default frame-table capacity: plenty for a teaching kernel's workloads
/// without needing to probe total physical memory.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Boot-time initialization.
pub fn init() {
    let mut guard = FRAME_TABLE.lock();
    *guard = Some(FrameTable::new(DEFAULT_CAPACITY));
    guard.unlock();
}

/// Runs `f` with the global frame table.
pub fn with_frame_table<R>(f: impl FnOnce(&FrameTable) -> R) -> R {
    let guard = FRAME_TABLE.lock();
    let r = f(guard.as_ref().expect("frame table not initialized"));
    guard.unlock();
    r
}
