//! Swap space: a disk-backed overflow for evicted anonymous pages.
//!
//! Modeled on `keos::fs::Disk`'s raw 512-byte sector I/O (the same type
//! `simple_fs` is built on), but addressed in 4096-byte page-sized slots
//! since that is the unit the frame table evicts in. Block device slot 2
//! is reserved for swap, slots 0/1 being the kernel image and filesystem
//! disk (`abyss::dev::get_bdev`'s own doc comment).
use crate::sync::Mutex;
use alloc::vec::Vec;
use keos::{KernelError, fs::{Disk, Sector}};

/// Block device slot used for the swap disk.
pub const SWAP_DEVICE_SLOT: usize = 2;
const SECTORS_PER_SLOT: usize = 8; // 4096 / 512

/// A handle to a single page-sized region of the swap disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(usize);

struct Inner {
    disk: Disk,
    /// `true` means the slot holds live data.
    used: Vec<bool>,
}

/// The swap space, a bitmap-managed disk of fixed-size slots.
pub struct SwapSpace {
    inner: Mutex<Inner>,
}

impl SwapSpace {
    /// Opens the swap disk and sizes the free-slot bitmap from its block
    /// count.
    pub fn open() -> Result<Self, KernelError> {
        let block_cnt = abyss::dev::get_bdev(SWAP_DEVICE_SLOT)
            .ok_or(KernelError::IOError)?
            .block_cnt();
        let slots = block_cnt / SECTORS_PER_SLOT;
        Ok(Self {
            inner: Mutex::new(Inner {
                disk: Disk::new(SWAP_DEVICE_SLOT),
                used: alloc::vec![false; slots],
            }),
        })
    }

    /// Reserves a free slot.
    pub fn alloc(&self) -> Result<SwapSlot, KernelError> {
        let mut guard = self.inner.lock();
        let idx = guard
            .used
            .iter()
            .position(|&used| !used)
            .ok_or(KernelError::NoSpace)?;
        guard.used[idx] = true;
        guard.unlock();
        Ok(SwapSlot(idx))
    }

    /// Returns a slot to the free pool. The data is left in place; it is
    /// simply no longer reachable until reallocated and overwritten.
    pub fn free(&self, slot: SwapSlot) {
        let mut guard = self.inner.lock();
        guard.used[slot.0] = false;
        guard.unlock();
    }

    /// Writes a full 4096-byte page into `slot`.
    pub fn write_out(&self, slot: SwapSlot, page: &[u8]) -> Result<(), KernelError> {
        debug_assert_eq!(page.len(), 0x1000);
        let guard = self.inner.lock();
        let base = Sector(slot.0 * SECTORS_PER_SLOT);
        for i in 0..SECTORS_PER_SLOT {
            let mut buf = [0u8; 512];
            buf.copy_from_slice(&page[i * 512..(i + 1) * 512]);
            guard.disk.write(base + i, &buf)?;
        }
        guard.unlock();
        Ok(())
    }

    /// Reads a full 4096-byte page out of `slot`.
    pub fn read_in(&self, slot: SwapSlot, page: &mut [u8]) -> Result<(), KernelError> {
        debug_assert_eq!(page.len(), 0x1000);
        let guard = self.inner.lock();
        let base = Sector(slot.0 * SECTORS_PER_SLOT);
        for i in 0..SECTORS_PER_SLOT {
            let mut buf = [0u8; 512];
            guard.disk.read(base + i, &mut buf)?;
            page[i * 512..(i + 1) * 512].copy_from_slice(&buf);
        }
        guard.unlock();
        Ok(())
    }
}

static SWAP: keos::sync::SpinLock<Option<SwapSpace>> = keos::sync::SpinLock::new(None);

/// Boot-time initialization; must run before any page can be evicted.
pub fn init() -> Result<(), KernelError> {
    let space = SwapSpace::open()?;
    let mut guard = SWAP.lock();
    *guard = Some(space);
    guard.unlock();
    Ok(())
}

/// Runs `f` with the swap space, panicking if [`init`] was never called.
pub fn with_swap<R>(f: impl FnOnce(&SwapSpace) -> R) -> R {
    let guard = SWAP.lock();
    let r = f(guard.as_ref().expect("swap space not initialized"));
    guard.unlock();
    r
}
