//! Virtual memory tests: stack growth, swap round-trips, frame-table
//! eviction/pinning, buffer-cache write-back, and `mmap`/`munmap`, each
//! exercised directly against `kernel::mm` the same way `scheduler.rs`
//! pokes `kernel::scheduler` instead of only observing behavior through a
//! loaded ELF process.
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use keos::{
    addressing::Va,
    fs::{Disk, FileSystem, Sector},
    mm::{PageRef, page_table::Permission},
};
use kernel::{
    loader::stack_builder::STACK_TOP,
    mm::{
        fault::{self, PageFaultReason},
        frame_table::{FrameOwner, FrameTable},
        mmap,
        page_table::PageTable,
        spt::Spt,
        swap,
    },
};

fn fresh_addr_space() -> (Arc<Spt>, PageTable) {
    (Arc::new(Spt::new()), PageTable::new())
}

/// A fault just below `esp`, inside the stack-growth window, installs a
/// fresh zero page and the mapping becomes walkable.
pub fn stack_growth_within_limit_succeeds() {
    let (spt, mut pt) = fresh_addr_space();
    let esp = Va::new(STACK_TOP - 0x1000).unwrap();
    let fault_addr = Va::new(esp.into_usize() - 16).unwrap();
    let reason = PageFaultReason {
        fault_addr,
        is_write_access: true,
        is_present: false,
    };
    fault::handle(&reason, &mut pt, &spt, esp).expect("legitimate stack growth must succeed");
    assert!(
        pt.walk(fault_addr.page_down()).is_ok(),
        "stack-growth fault should install a mapping"
    );
}

/// A fault far below the stack-growth floor (`STACK_GROWTH_LIMIT_PAGES`
/// below `STACK_TOP`) is not stack growth and must be rejected.
pub fn stack_growth_beyond_limit_fails() {
    let (spt, mut pt) = fresh_addr_space();
    let esp = Va::new(STACK_TOP - 0x1000).unwrap();
    // Comfortably below STACK_TOP - 2048 pages.
    let fault_addr = Va::new(STACK_TOP - 4096 * 0x1000).unwrap();
    let reason = PageFaultReason {
        fault_addr,
        is_write_access: true,
        is_present: false,
    };
    assert!(
        fault::handle(&reason, &mut pt, &spt, esp).is_err(),
        "a fault far below the stack-growth floor must not grow the stack"
    );
}

/// A fault within the stack-growth region but far below `esp` (outside the
/// 32-byte `push`/`call` slack) is a wild access, not stack growth.
pub fn stack_growth_far_from_esp_fails() {
    let (spt, mut pt) = fresh_addr_space();
    let esp = Va::new(STACK_TOP - 0x1000).unwrap();
    let fault_addr = Va::new(STACK_TOP - 0x3000).unwrap();
    let reason = PageFaultReason {
        fault_addr,
        is_write_access: true,
        is_present: false,
    };
    assert!(
        fault::handle(&reason, &mut pt, &spt, esp).is_err(),
        "a fault far below esp with no spt entry must not be treated as stack growth"
    );
}

/// `swap.write_out(slot, p); swap.read_in(slot, q)` must return `p`.
pub fn swap_round_trip() {
    let pattern: alloc::vec::Vec<u8> = (0..0x1000).map(|i| (i % 251) as u8).collect();
    let pattern: [u8; 0x1000] = pattern.try_into().unwrap();

    let slot = swap::with_swap(|s| s.alloc()).expect("swap space should have free slots");
    swap::with_swap(|s| s.write_out(slot, &pattern)).expect("write_out should succeed");

    let mut readback = [0u8; 0x1000];
    swap::with_swap(|s| s.read_in(slot, &mut readback)).expect("read_in should succeed");
    assert_eq!(&readback[..], &pattern[..], "swap read must return what was written");

    swap::with_swap(|s| s.free(slot));
}

/// A frame owner that never reports itself as accessed, so the clock hand
/// always evicts it on its first pass, and that records whether it was
/// asked to evict.
struct TrackingOwner {
    va: Va,
    evicted: AtomicBool,
}

impl TrackingOwner {
    fn new(va: Va) -> Arc<Self> {
        Arc::new(Self {
            va,
            evicted: AtomicBool::new(false),
        })
    }
}

impl FrameOwner for TrackingOwner {
    fn va(&self) -> Va {
        self.va
    }
    fn accessed_and_clear(&self) -> bool {
        false
    }
    fn dirty(&self) -> bool {
        false
    }
    fn evict(&self) -> Result<(), keos::KernelError> {
        self.evicted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn test_va(page_no: usize) -> Va {
    Va::new(page_no * 0x1000).unwrap()
}

/// With the table full, allocating one more frame evicts the clock hand's
/// current target (the least-recently-installed, never-accessed owner).
pub fn frame_table_evicts_when_full() {
    let table = FrameTable::new(2);
    let a = TrackingOwner::new(test_va(0x1000));
    let b = TrackingOwner::new(test_va(0x1001));
    let c = TrackingOwner::new(test_va(0x1002));

    table.alloc(a.clone()).expect("first alloc into empty table");
    table.alloc(b.clone()).expect("second alloc into empty table");
    table.alloc(c.clone()).expect("third alloc must evict to make room");

    assert!(a.evicted.load(Ordering::SeqCst), "first-in frame should be the one evicted");
    assert!(!b.evicted.load(Ordering::SeqCst), "second frame should survive");
}

/// A pinned frame's pin-lock is held, so the clock hand must skip it and
/// evict the next candidate instead.
pub fn frame_table_pin_prevents_eviction() {
    let table = FrameTable::new(2);
    let a = TrackingOwner::new(test_va(0x2000));
    let b = TrackingOwner::new(test_va(0x2001));

    table.alloc(a.clone()).expect("first alloc into empty table");
    table.alloc(b.clone()).expect("second alloc into empty table");
    table.pin(a.va());

    let c = TrackingOwner::new(test_va(0x2002));
    table.alloc(c.clone()).expect("alloc must skip the pinned frame and evict the other one");

    assert!(!a.evicted.load(Ordering::SeqCst), "pinned frame must never be evicted");
    assert!(b.evicted.load(Ordering::SeqCst), "unpinned frame should be evicted instead");

    table.unpin(a.va());
}

/// `write(sector, buf); flush(); raw_read(sector)` must return `buf` — the
/// write only reaches the disk once flushed.
pub fn buffer_cache_write_back() {
    let bdev = abyss::dev::get_bdev(1).expect("filesystem disk must be registered");
    let sector = Sector(bdev.block_cnt() - 1);

    let mut pattern = [0u8; 512];
    for (i, b) in pattern.iter_mut().enumerate() {
        *b = (i * 7 + 3) as u8;
    }

    kernel::mm::buffer_cache::with_cache(|c| c.write(sector, &pattern)).expect("cache write");
    kernel::mm::buffer_cache::with_cache(|c| c.flush()).expect("flush");

    let mut raw = [0u8; 512];
    Disk::new(1).read(sector, &mut raw).expect("raw disk read");
    assert_eq!(raw, pattern, "flushed write must be visible to a direct disk read");
}

/// A read immediately after a write, with no intervening flush, must still
/// observe the write — the cache is coherent with itself even before the
/// dirty data reaches the disk.
pub fn buffer_cache_read_after_write() {
    let bdev = abyss::dev::get_bdev(1).expect("filesystem disk must be registered");
    let sector = Sector(bdev.block_cnt() - 2);

    let pattern = [0xABu8; 512];
    kernel::mm::buffer_cache::with_cache(|c| c.write(sector, &pattern)).expect("cache write");

    let mut out = [0u8; 512];
    kernel::mm::buffer_cache::with_cache(|c| c.read(sector, &mut out)).expect("cache read");
    assert_eq!(out, pattern, "a read right after a write must observe it, flushed or not");

    kernel::mm::buffer_cache::with_cache(|c| c.flush()).expect("flush");
}

fn make_test_file(path: &str, contents: &[u8]) -> keos::fs::RegularFile {
    let _ = FileSystem::root().unlink(path);
    let file = FileSystem::root()
        .create(path, false)
        .expect("file creation should succeed")
        .into_regular_file()
        .expect("created entry should be a regular file");
    file.write(0, contents).expect("seed write should succeed");
    file
}

fn read_mapped_page(pt: &mut PageTable, va: Va) -> [u8; 0x1000] {
    let pa = pt.walk(va.page_down()).unwrap().pa().expect("page should be mapped");
    let page = unsafe { PageRef::from_pa(pa) }.into_page();
    let mut out = [0u8; 0x1000];
    out.copy_from_slice(page.inner());
    out
}

/// After `mmap` and a fault on the first page, the mapped memory holds the
/// file's bytes (zero-padded past EOF within the page).
pub fn mmap_reads_file_contents() {
    let contents = b"hello from a memory-mapped file";
    let file = make_test_file("/mmap_reads.bin", contents);

    let (spt, mut pt) = fresh_addr_space();
    let addr = Va::new(0x2000_0000).unwrap();
    let id = mmap::mmap(&spt, addr, contents.len(), Permission::USER | Permission::READ, &file, 0)
        .expect("mmap should succeed");
    assert_eq!(id, addr.into_usize() >> 12);

    let reason = PageFaultReason {
        fault_addr: addr,
        is_write_access: false,
        is_present: false,
    };
    fault::handle(&reason, &mut pt, &spt, addr).expect("demand-paging the mapped page should succeed");

    let page = read_mapped_page(&mut pt, addr);
    assert_eq!(&page[..contents.len()], &contents[..]);
    assert!(page[contents.len()..].iter().all(|&b| b == 0), "past EOF within the page must read zero");
}

/// Dirtying a mapped page and then `munmap`ing it writes the page back to
/// the file at the mapping's offset; a clean region is left untouched.
pub fn mmap_write_back_on_munmap() {
    let original = [b'A'; 0x1000];
    let file = make_test_file("/mmap_writeback.bin", &original);

    let (spt, mut pt) = fresh_addr_space();
    let addr = Va::new(0x2010_0000).unwrap();
    let id = mmap::mmap(
        &spt,
        addr,
        original.len(),
        Permission::USER | Permission::READ | Permission::WRITE,
        &file,
        0,
    )
    .expect("mmap should succeed");

    let reason = PageFaultReason {
        fault_addr: addr,
        is_write_access: true,
        is_present: false,
    };
    fault::handle(&reason, &mut pt, &spt, addr).expect("demand-paging should succeed");

    {
        let pa = pt.walk(addr).unwrap().pa().unwrap();
        let mut page = unsafe { PageRef::from_pa(pa) }.into_page();
        page.inner_mut()[..100].fill(b'Z');
        unsafe { pt.walk_mut(addr).unwrap().mark_dirty() };
    }

    mmap::munmap(&spt, &mut pt, id).expect("munmap should succeed");

    let mut readback = [0u8; 0x1000];
    file.read(0, &mut readback).expect("readback");
    assert!(readback[..100].iter().all(|&b| b == b'Z'), "overwritten prefix must be written back");
    assert!(readback[100..].iter().all(|&b| b == b'A'), "untouched suffix must be unchanged");
}

/// `mmap` at a null address is always rejected.
pub fn mmap_rejects_zero_addr() {
    let file = make_test_file("/mmap_zero_addr.bin", b"x");
    let (spt, _pt) = fresh_addr_space();
    let addr = Va::new(0).unwrap();
    assert!(mmap::mmap(&spt, addr, 1, Permission::USER | Permission::READ, &file, 0).is_err());
}

/// `mmap` at an address that isn't page-aligned is rejected.
pub fn mmap_rejects_unaligned_addr() {
    let file = make_test_file("/mmap_unaligned.bin", b"x");
    let (spt, _pt) = fresh_addr_space();
    let addr = Va::new(0x2020_0001).unwrap();
    assert!(mmap::mmap(&spt, addr, 1, Permission::USER | Permission::READ, &file, 0).is_err());
}

/// `mmap` onto a range that already has an `Spt` entry (e.g. it overlaps an
/// existing mapping) is rejected rather than silently clobbering it.
pub fn mmap_rejects_overlapping_range() {
    let file_a = make_test_file("/mmap_overlap_a.bin", b"aaaaaaaaaaaaaaaa");
    let file_b = make_test_file("/mmap_overlap_b.bin", b"bbbbbbbbbbbbbbbb");
    let (spt, _pt) = fresh_addr_space();
    let addr = Va::new(0x2030_0000).unwrap();
    mmap::mmap(&spt, addr, 16, Permission::USER | Permission::READ, &file_a, 0)
        .expect("first mmap should succeed");
    assert!(
        mmap::mmap(&spt, addr, 16, Permission::USER | Permission::READ, &file_b, 0).is_err(),
        "mmap over an already-mapped range must fail"
    );
}

/// `mmap`'s returned id is exactly the page number of the mapped address,
/// and `munmap` takes that id back.
pub fn munmap_id_is_page_number() {
    let file = make_test_file("/mmap_id.bin", b"0123456789abcdef");
    let (spt, mut pt) = fresh_addr_space();
    let addr = Va::new(0x2040_0000).unwrap();
    let id = mmap::mmap(&spt, addr, 16, Permission::USER | Permission::READ, &file, 0)
        .expect("mmap should succeed");
    assert_eq!(id, addr.into_usize() >> 12);
    mmap::munmap(&spt, &mut pt, id).expect("munmap by the returned id should succeed");
}
