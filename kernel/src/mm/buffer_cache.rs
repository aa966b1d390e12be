//! A fixed 64-entry write-back cache of 512-byte disk sectors, sitting
//! between the filesystem's block-level logic and the raw `keos::fs::Disk`
//! sector I/O.
//!
//! `keos::fs::RegularFile::read`/`write` already bounce-buffer at
//! 4096-byte `FileBlockNumber` granularity; this cache is a layer below
//! that, the same relationship `cache.c` (`original_source/`) has to the
//! Pintos `filesys` layer — it intercepts the raw sector reads/writes the
//! filesystem issues and only touches the disk on a miss or at flush time.
//! Grounded in shape on `keos-project5/src/page_cache/mod.rs`'s background
//! flush thread, but keyed by `Sector` instead of `(InodeNumber,
//! FileBlockNumber)` and evicted by clock hand instead of LRU, since this
//! cache has no filesystem-level notion of files at all.
use crate::sync::{Mutex, MutexGuard, RwLock};
use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};
use keos::{
    KernelError,
    fs::{Disk, Sector},
    thread::ThreadBuilder,
};

const CAPACITY: usize = 64;
/// Periodic flush interval (`cache.c`'s ~30s write-back timer).
const FLUSH_INTERVAL_TICKS: u64 = 30 * 100;

/// One cached sector. `accessed`/`dirty` are plain atomics rather than
/// living behind `data`'s lock — the clock hand needs to read/clear
/// `accessed` on slots it isn't necessarily reading the data of, and a
/// writer only needs `data` exclusively, not the bookkeeping bits too.
struct Entry {
    sector: Sector,
    accessed: AtomicBool,
    dirty: AtomicBool,
    /// Per-entry reader-writer lock (spec §3/§5): concurrent readers of
    /// the same sector don't serialize behind each other, only behind a
    /// writer or an eviction write-back.
    data: RwLock<[u8; 512]>,
}

struct Inner {
    slots: Vec<Option<Arc<Entry>>>,
    hand: usize,
}

/// The write-back sector cache.
pub struct BufferCache {
    disk: Disk,
    /// Guards the slot table and clock hand — which sector lives in which
    /// slot, and eviction's scan order — not the sector data itself.
    inner: Mutex<Inner>,
}

impl BufferCache {
    /// Wraps `disk` with a 64-entry cache.
    pub fn new(disk: Disk) -> Self {
        Self {
            disk,
            inner: Mutex::new(Inner {
                slots: (0..CAPACITY).map(|_| None).collect(),
                hand: 0,
            }),
        }
    }

    fn find(&self, guard: &MutexGuard<'_, Inner>, sector: Sector) -> Option<Arc<Entry>> {
        guard
            .slots
            .iter()
            .find_map(|s| s.as_ref().filter(|e| e.sector == sector).cloned())
    }

    /// Reads 512 bytes from `sector`, through the cache.
    pub fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let entry = match self.find(&mut guard, sector) {
            Some(entry) => {
                guard.unlock();
                entry
            }
            None => {
                let idx = self.claim_slot(&mut guard)?;
                self.disk.read(sector, buf)?;
                let entry = Arc::new(Entry {
                    sector,
                    accessed: AtomicBool::new(true),
                    dirty: AtomicBool::new(false),
                    data: RwLock::new(*buf),
                });
                guard.slots[idx] = Some(entry);
                guard.unlock();
                return Ok(());
            }
        };
        entry.accessed.store(true, Ordering::SeqCst);
        *buf = *entry.data.read();
        Ok(())
    }

    /// Writes 512 bytes to `sector`, through the cache (write-back: the
    /// disk is only touched on eviction or an explicit [`Self::flush`]).
    pub fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let entry = match self.find(&mut guard, sector) {
            Some(entry) => {
                guard.unlock();
                entry
            }
            None => {
                let idx = self.claim_slot(&mut guard)?;
                let entry = Arc::new(Entry {
                    sector,
                    accessed: AtomicBool::new(true),
                    dirty: AtomicBool::new(true),
                    data: RwLock::new(*buf),
                });
                guard.slots[idx] = Some(entry);
                guard.unlock();
                return Ok(());
            }
        };
        *entry.data.write() = *buf;
        entry.dirty.store(true, Ordering::SeqCst);
        entry.accessed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn claim_slot(&self, guard: &mut MutexGuard<'_, Inner>) -> Result<usize, KernelError> {
        if let Some(idx) = guard.slots.iter().position(|s| s.is_none()) {
            return Ok(idx);
        }
        loop {
            let idx = guard.hand;
            guard.hand = (guard.hand + 1) % CAPACITY;
            let entry = guard.slots[idx].as_ref().unwrap().clone();
            if entry.accessed.swap(false, Ordering::SeqCst) {
                continue;
            }
            if entry.dirty.load(Ordering::SeqCst) {
                self.disk.write(entry.sector, &entry.data.read())?;
            }
            guard.slots[idx] = None;
            return Ok(idx);
        }
    }

    /// Writes back every dirty slot without evicting anything.
    pub fn flush(&self) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let entries: Vec<Arc<Entry>> = guard.slots.iter().flatten().cloned().collect();
        guard.unlock();
        for entry in entries {
            if entry.dirty.swap(false, Ordering::SeqCst) {
                self.disk.write(entry.sector, &entry.data.read())?;
            }
        }
        Ok(())
    }
}

static CACHE: keos::sync::SpinLock<Option<alloc::sync::Arc<BufferCache>>> =
    keos::sync::SpinLock::new(None);

/// Boot-time initialization: wraps the filesystem disk (block device slot
/// 1). Does *not* spawn the flush thread — at this point in boot the
/// scheduler installed is still the default `Fifo`
/// (`config_builder.set_scheduler` hasn't run yet), so a thread spawned
/// here would be enqueued on a run queue that gets discarded the moment
/// the real scheduler replaces it. See [`start_flush_thread`].
pub fn init() {
    let cache = alloc::sync::Arc::new(BufferCache::new(Disk::new(1)));
    let mut guard = CACHE.lock();
    *guard = Some(cache);
    guard.unlock();
}

/// Spawns the periodic (~30s) write-back flush thread. Must be called
/// only after the real scheduler is installed (i.e. after
/// `config_builder.set_scheduler(...)`), or the thread is stranded on
/// the default scheduler's run queue and never runs.
pub fn start_flush_thread() {
    let guard = CACHE.lock();
    let cache = guard.as_ref().expect("buffer cache not initialized").clone();
    guard.unlock();
    ThreadBuilder::new("buffer-cache-flush").spawn(move || {
        let mut last_flush = crate::scheduler::PriorityScheduler::ticks();
        loop {
            crate::scheduler::PriorityScheduler::sleep_until(last_flush + FLUSH_INTERVAL_TICKS);
            last_flush = crate::scheduler::PriorityScheduler::ticks();
            let _ = cache.flush();
        }
    });
}

/// Runs `f` with the global buffer cache.
pub fn with_cache<R>(f: impl FnOnce(&BufferCache) -> R) -> R {
    let guard = CACHE.lock();
    let r = f(guard.as_ref().expect("buffer cache not initialized"));
    guard.unlock();
    r
}
