//! A flat, extent-based filesystem for a single raw block device.
//!
//! The on-disk layout is intentionally simple: a superblock in sector 0,
//! a fixed-size directory table immediately following it, and a data region
//! where every file occupies one contiguous run of sectors (an "extent").
//! There are no subdirectories, no free-space bitmap beyond a bump pointer,
//! and no journaling. Growing a file in place is only possible up to the
//! extent that was reserved for it at creation time.
#![no_std]

extern crate alloc;

#[cfg(feature = "keos_binder")]
mod keos_binder;
#[cfg(feature = "keos_binder")]
pub use keos_binder::{FileSystem, FsDisk, Root};

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Bytes per disk sector.
pub const SECTOR_SIZE: usize = 512;
/// Maximum number of files the flat directory can hold.
pub const MAX_ENTRIES: usize = 64;
/// Bytes used by a single directory entry record.
const DIR_ENTRY_SIZE: usize = 32;
/// Bytes reserved for a file name, including the null terminator.
const NAME_LEN: usize = 24;
/// Number of sectors occupied by the directory table.
const DIR_SECTORS: usize = (MAX_ENTRIES * DIR_ENTRY_SIZE).div_ceil(SECTOR_SIZE);
/// First sector available for file data.
const DATA_START_SECTOR: usize = 1 + DIR_SECTORS;
/// Sectors reserved for each file's extent, regardless of its current size.
///
/// A file can grow in place up to this many sectors before writes past the
/// extent start failing with [`Error::FsError`]. 256 sectors is 128KiB,
/// comfortably larger than any binary or test fixture this kernel loads.
const EXTENT_SECTORS: usize = 256;
const MAGIC: u32 = 0x53465332; // "SFS2"

/// A sector-addressed location on the backing [`Disk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sector(pub usize);

impl Sector {
    pub const fn new(n: usize) -> Self {
        Sector(n)
    }

    pub const fn into_usize(self) -> usize {
        self.0
    }
}

/// Errors reported by the filesystem and its backing [`Disk`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The underlying block device failed to service the request.
    DiskError,
    /// The on-disk structure is inconsistent or a request exceeds its bounds.
    FsError,
}

/// Raw sector-granular I/O to the device backing a [`SimpleFs`].
///
/// This is the only interface `simple_fs` needs from its host kernel;
/// [`keos_binder`] supplies the concrete implementation atop `keos::fs::Disk`.
pub trait Disk {
    fn read(&self, sector: Sector, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), Error>;
    fn write(&self, sector: Sector, buf: &[u8; SECTOR_SIZE]) -> Result<(), Error>;
}

#[derive(Clone, Copy)]
struct DirEntry {
    name: [u8; NAME_LEN],
    start_sector: u32,
    size_bytes: u32,
}

impl DirEntry {
    const EMPTY: DirEntry = DirEntry {
        name: [0; NAME_LEN],
        start_sector: 0,
        size_bytes: 0,
    };

    fn is_free(&self) -> bool {
        self.name[0] == 0
    }

    fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) -> Result<(), Error> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= NAME_LEN {
            return Err(Error::FsError);
        }
        self.name = [0; NAME_LEN];
        self.name[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn encode(&self, buf: &mut [u8]) {
        buf[..NAME_LEN].copy_from_slice(&self.name);
        buf[NAME_LEN..NAME_LEN + 4].copy_from_slice(&self.start_sector.to_le_bytes());
        buf[NAME_LEN + 4..NAME_LEN + 8].copy_from_slice(&self.size_bytes.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&buf[..NAME_LEN]);
        let start_sector = u32::from_le_bytes(buf[NAME_LEN..NAME_LEN + 4].try_into().unwrap());
        let size_bytes =
            u32::from_le_bytes(buf[NAME_LEN + 4..NAME_LEN + 8].try_into().unwrap());
        DirEntry {
            name,
            start_sector,
            size_bytes,
        }
    }
}

struct Superblock {
    magic: u32,
    next_free_sector: u32,
}

impl Superblock {
    fn encode(&self) -> [u8; SECTOR_SIZE] {
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.next_free_sector.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; SECTOR_SIZE]) -> Self {
        Superblock {
            magic: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            next_free_sector: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        }
    }
}

struct SimpleFsInner<D: Disk> {
    disk: D,
    entries: alloc::sync::Arc<keos_sync_compat::SpinLock<Vec<DirEntry>>>,
    next_free_sector: AtomicU32,
}

/// A mounted flat filesystem over a block device `D`.
pub struct SimpleFs<D: Disk> {
    inner: Arc<SimpleFsInner<D>>,
}

impl<D: Disk> Clone for SimpleFs<D> {
    fn clone(&self) -> Self {
        SimpleFs {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Disk> SimpleFs<D> {
    /// Mounts the filesystem on `disk`, formatting it in place if the
    /// superblock magic does not match.
    pub fn load(disk: D) -> Result<Self, Error> {
        let mut sb_buf = [0u8; SECTOR_SIZE];
        disk.read(Sector::new(0), &mut sb_buf)?;
        let mut sb = Superblock::decode(&sb_buf);
        if sb.magic != MAGIC {
            sb = Superblock {
                magic: MAGIC,
                next_free_sector: DATA_START_SECTOR as u32,
            };
            disk.write(Sector::new(0), &sb.encode())?;
            let zero = [0u8; SECTOR_SIZE];
            for i in 0..DIR_SECTORS {
                disk.write(Sector::new(1 + i), &zero)?;
            }
        }

        let mut entries = Vec::with_capacity(MAX_ENTRIES);
        let mut buf = [0u8; SECTOR_SIZE];
        let entries_per_sector = SECTOR_SIZE / DIR_ENTRY_SIZE;
        'outer: for s in 0..DIR_SECTORS {
            disk.read(Sector::new(1 + s), &mut buf)?;
            for i in 0..entries_per_sector {
                if entries.len() == MAX_ENTRIES {
                    break 'outer;
                }
                let off = i * DIR_ENTRY_SIZE;
                entries.push(DirEntry::decode(&buf[off..off + DIR_ENTRY_SIZE]));
            }
        }

        Ok(SimpleFs {
            inner: Arc::new(SimpleFsInner {
                disk,
                entries: Arc::new(keos_sync_compat::SpinLock::new(entries)),
                next_free_sector: AtomicU32::new(sb.next_free_sector),
            }),
        })
    }

    fn write_entry(inner: &SimpleFsInner<D>, index: usize, entry: &DirEntry) -> Result<(), Error> {
        let sector = index / (SECTOR_SIZE / DIR_ENTRY_SIZE);
        let off_in_sector = (index % (SECTOR_SIZE / DIR_ENTRY_SIZE)) * DIR_ENTRY_SIZE;
        let mut buf = [0u8; SECTOR_SIZE];
        inner.disk.read(Sector::new(1 + sector), &mut buf)?;
        entry.encode(&mut buf[off_in_sector..off_in_sector + DIR_ENTRY_SIZE]);
        inner.disk.write(Sector::new(1 + sector), &buf)
    }

    /// Opens an existing file by name.
    pub fn open(&self, name: &str) -> Option<File<D>> {
        let entries = self.inner.entries.lock();
        let found = entries
            .iter()
            .enumerate()
            .find(|(_, e)| !e.is_free() && e.name_str() == name)
            .map(|(idx, e)| (idx, e.start_sector, e.size_bytes));
        entries.unlock();
        found.map(|(entry_index, start_sector, size_bytes)| File {
            fs: self.inner.clone(),
            start_sector: Sector::new(start_sector as usize),
            size: AtomicUsize::new(size_bytes as usize),
            entry_index,
        })
    }

    /// Creates a new, empty file, reserving a fresh extent for it.
    pub fn create(&self, name: &str) -> Result<File<D>, Error> {
        let mut entries = self.inner.entries.lock();
        if entries.iter().any(|e| !e.is_free() && e.name_str() == name) {
            entries.unlock();
            return Err(Error::FsError);
        }
        let Some(entry_index) = entries.iter().position(|e| e.is_free()) else {
            entries.unlock();
            return Err(Error::FsError);
        };
        let start_sector = self
            .inner
            .next_free_sector
            .fetch_add(EXTENT_SECTORS as u32, Ordering::SeqCst);

        let mut entry = DirEntry::EMPTY;
        entry.set_name(name).map_err(|e| {
            entries.unlock();
            e
        })?;
        entry.start_sector = start_sector;
        entry.size_bytes = 0;
        entries[entry_index] = entry;
        Self::write_entry(&self.inner, entry_index, &entry)?;
        self.inner.disk.write(
            Sector::new(0),
            &Superblock {
                magic: MAGIC,
                next_free_sector: self.inner.next_free_sector.load(Ordering::SeqCst),
            }
            .encode(),
        )?;
        entries.unlock();

        Ok(File {
            fs: self.inner.clone(),
            start_sector: Sector::new(start_sector as usize),
            size: AtomicUsize::new(0),
            entry_index,
        })
    }

    /// Removes a file by name. Its extent is not reclaimed (no free list).
    pub fn unlink(&self, name: &str) -> Result<(), Error> {
        let mut entries = self.inner.entries.lock();
        let Some(idx) = entries
            .iter()
            .position(|e| !e.is_free() && e.name_str() == name)
        else {
            entries.unlock();
            return Err(Error::FsError);
        };
        entries[idx] = DirEntry::EMPTY;
        let entry = entries[idx];
        entries.unlock();
        Self::write_entry(&self.inner, idx, &entry)
    }

    /// Lists every live file name currently in the directory table.
    pub fn list(&self) -> Vec<alloc::string::String> {
        let entries = self.inner.entries.lock();
        let names = entries
            .iter()
            .filter(|e| !e.is_free())
            .map(|e| alloc::string::String::from(e.name_str()))
            .collect();
        entries.unlock();
        names
    }
}

/// A handle to a single file within a [`SimpleFs`].
pub struct File<D: Disk> {
    fs: Arc<SimpleFsInner<D>>,
    pub(crate) start_sector: Sector,
    pub(crate) size: AtomicUsize,
    entry_index: usize,
}

impl<D: Disk> File<D> {
    fn max_bytes(&self) -> usize {
        EXTENT_SECTORS * SECTOR_SIZE
    }

    /// Reads up to `buf.len()` bytes starting at byte offset `offset`.
    ///
    /// Returns the number of bytes actually read, which is less than
    /// `buf.len()` (including zero) once `offset` reaches the file's size.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let size = self.size.load(Ordering::SeqCst);
        if offset >= size {
            return Ok(0);
        }
        let to_read = buf.len().min(size - offset);
        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < to_read {
            let cur = offset + done;
            let sector_idx = cur / SECTOR_SIZE;
            let sector_off = cur % SECTOR_SIZE;
            self.fs
                .disk
                .read(Sector::new(self.start_sector.into_usize() + sector_idx), &mut sector_buf)?;
            let chunk = (SECTOR_SIZE - sector_off).min(to_read - done);
            buf[done..done + chunk].copy_from_slice(&sector_buf[sector_off..sector_off + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Writes `buf` at byte offset `offset`, extending the file (and its
    /// size record in the directory) if the write goes past the current end.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<usize, Error> {
        if offset + buf.len() > self.max_bytes() {
            return Err(Error::FsError);
        }
        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < buf.len() {
            let cur = offset + done;
            let sector_idx = cur / SECTOR_SIZE;
            let sector_off = cur % SECTOR_SIZE;
            let chunk = (SECTOR_SIZE - sector_off).min(buf.len() - done);
            if sector_off != 0 || chunk != SECTOR_SIZE {
                self.fs
                    .disk
                    .read(Sector::new(self.start_sector.into_usize() + sector_idx), &mut sector_buf)?;
            }
            sector_buf[sector_off..sector_off + chunk].copy_from_slice(&buf[done..done + chunk]);
            self.fs
                .disk
                .write(Sector::new(self.start_sector.into_usize() + sector_idx), &sector_buf)?;
            done += chunk;
        }
        let new_size = (offset + buf.len()).max(self.size.load(Ordering::SeqCst));
        if new_size != self.size.load(Ordering::SeqCst) {
            self.size.store(new_size, Ordering::SeqCst);
            let mut entries = self.fs.entries.lock();
            entries[self.entry_index].size_bytes = new_size as u32;
            let entry = entries[self.entry_index];
            entries.unlock();
            SimpleFs::write_entry(&self.fs, self.entry_index, &entry)?;
        }
        Ok(done)
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}

/// A tiny spinlock, independent of the host kernel, used to guard the
/// in-memory directory cache. Kept separate from `keos::sync::SpinLock` so
/// this crate builds standalone (e.g. under `cargo test` on a host target).
mod keos_sync_compat {
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, Ordering};

    pub struct SpinLock<T> {
        locked: AtomicBool,
        value: UnsafeCell<T>,
    }

    unsafe impl<T: Send> Send for SpinLock<T> {}
    unsafe impl<T: Send> Sync for SpinLock<T> {}

    pub struct SpinLockGuard<'a, T> {
        lock: &'a SpinLock<T>,
    }

    impl<T> core::ops::Deref for SpinLockGuard<'_, T> {
        type Target = T;
        fn deref(&self) -> &T {
            unsafe { &*self.lock.value.get() }
        }
    }
    impl<T> core::ops::DerefMut for SpinLockGuard<'_, T> {
        fn deref_mut(&mut self) -> &mut T {
            unsafe { &mut *self.lock.value.get() }
        }
    }

    impl<T> SpinLock<T> {
        pub const fn new(value: T) -> Self {
            SpinLock {
                locked: AtomicBool::new(false),
                value: UnsafeCell::new(value),
            }
        }

        pub fn lock(&self) -> SpinLockGuard<'_, T> {
            while self
                .locked
                .compare_exchange_weak(
                    false,
                    true,
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_err()
            {
                core::hint::spin_loop();
            }
            SpinLockGuard { lock: self }
        }
    }

    impl<'a, T> SpinLockGuard<'a, T> {
        pub fn unlock(self) {
            self.lock.locked.store(false, Ordering::Release);
        }
    }
}
