//! Supplemental page table: per-process bookkeeping for pages that are not
//! currently resident, consulted by [`crate::mm::fault`] on every page
//! fault.
//!
//! Grounded on `keos-project3`'s `VmAreaStruct`/`LazyPager` split between
//! "what this address is backed by" and "how to fault it in" — here both
//! live in one `SptEntry` per page, since every backing kind (anonymous,
//! file, swapped-out, mmap) needs the same handful of fields the fault
//! handler reads.
use crate::{mm::swap::SwapSlot, sync::Mutex};
use alloc::collections::BTreeMap;
use keos::{addressing::Va, fs::RegularFile, mm::page_table::Permission};

/// Where the contents of a not-yet-resident page come from.
#[derive(Clone)]
pub enum Backing {
    /// Freshly zeroed memory (anonymous mapping, BSS, stack growth).
    Zero,
    /// Bytes from a file, read once and never written back (the
    /// executable's text/data segments).
    File {
        file: RegularFile,
        offset: usize,
        len: usize,
    },
    /// A memory-mapped file region: like `File`, but writes are tracked so
    /// [`crate::mm::mmap::munmap`] can write dirty pages back.
    Mmap {
        file: RegularFile,
        offset: usize,
        len: usize,
    },
    /// Previously resident, now written out to swap.
    Swapped(SwapSlot),
}

/// One page's worth of supplemental state.
#[derive(Clone)]
pub struct SptEntry {
    pub backing: Backing,
    pub perm: Permission,
}

/// A process's supplemental page table, keyed by page-aligned virtual
/// address.
#[derive(Default)]
pub struct Spt {
    entries: Mutex<BTreeMap<Va, SptEntry>>,
}

impl Spt {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Records how `va` should be filled in when first touched.
    pub fn install(&self, va: Va, entry: SptEntry) {
        let mut guard = self.entries.lock();
        guard.insert(va, entry);
        guard.unlock();
    }

    /// Looks up the entry for `va`, cloning it out so callers can fill the
    /// page without holding the table locked across disk I/O.
    pub fn lookup(&self, va: Va) -> Option<SptEntry> {
        let guard = self.entries.lock();
        let e = guard.get(&va).cloned();
        guard.unlock();
        e
    }

    /// Replaces the backing of an already-installed entry, e.g. after a
    /// page has been swapped out or swapped back in.
    pub fn update_backing(&self, va: Va, backing: Backing) {
        let mut guard = self.entries.lock();
        if let Some(entry) = guard.get_mut(&va) {
            entry.backing = backing;
        }
        guard.unlock();
    }

    /// Drops the entry for `va`, e.g. on `munmap`.
    pub fn remove(&self, va: Va) -> Option<SptEntry> {
        let mut guard = self.entries.lock();
        let e = guard.remove(&va);
        guard.unlock();
        e
    }

    /// All entries whose address falls in `[start, end)`, in address
    /// order. Used by `munmap` to enumerate an entire mapped region.
    pub fn range(&self, start: Va, end: Va) -> alloc::vec::Vec<(Va, SptEntry)> {
        let guard = self.entries.lock();
        let v = guard
            .range(start..end)
            .map(|(&va, e)| (va, e.clone()))
            .collect();
        guard.unlock();
        v
    }
}
