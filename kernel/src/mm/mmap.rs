//! `mmap`/`munmap`: maps a file (or anonymous memory) into a process's
//! address space by installing [`Spt`] entries over the requested range —
//! actual physical pages are only brought in lazily by
//! [`crate::mm::fault::handle`], the same demand-paging split
//! `keos-project3`'s `LazyPager` makes between `mmap` and the fault path.
use crate::{
    loader::stack_builder::{STACK_GROWTH_LIMIT_PAGES, STACK_TOP},
    mm::{
        page_table::PageTable,
        spt::{Backing, Spt, SptEntry},
    },
};
use alloc::sync::Arc;
use keos::{KernelError, addressing::Va, fs::RegularFile, mm::page_table::Permission};

/// Rounds `n` up to the next page boundary.
fn page_round_up(n: usize) -> usize {
    (n + 0xFFF) & !0xFFF
}

/// Maps `size` bytes of `file`, from `offset`, starting at `addr`, and
/// returns the page number of `addr` as the mapping's identifier (what a
/// later `munmap` call must pass back).
///
/// `addr` must be non-zero and page-aligned (KeOS does not pick an address
/// for the caller the way Linux's `addr == NULL` does), `size` must be
/// non-zero, `file` must be non-empty, and the range must not already have
/// any `spt` entries in it or overlap the region the stack is allowed to
/// grow into.
pub fn mmap(
    spt: &Arc<Spt>,
    addr: Va,
    size: usize,
    perm: Permission,
    file: &RegularFile,
    offset: usize,
) -> Result<usize, KernelError> {
    if addr.into_usize() == 0 || addr.into_usize() & 0xFFF != 0 || size == 0 || file.size() == 0 {
        return Err(KernelError::InvalidArgument);
    }
    let mapped_len = page_round_up(size);
    let end = Va::new(addr.into_usize() + mapped_len).ok_or(KernelError::InvalidArgument)?;
    if !spt.range(addr, end).is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let stack_floor = STACK_TOP.saturating_sub(STACK_GROWTH_LIMIT_PAGES * 0x1000);
    if addr.into_usize() < STACK_TOP && end.into_usize() > stack_floor {
        return Err(KernelError::InvalidArgument);
    }

    let mut off = 0usize;
    let mut va = addr;
    while off < mapped_len {
        let backing = Backing::Mmap {
            file: file.clone(),
            offset: offset + off,
            len: file.size().saturating_sub(offset + off).min(0x1000),
        };
        spt.install(va, SptEntry { backing, perm });
        va = Va::new(va.into_usize() + 0x1000).ok_or(KernelError::InvalidArgument)?;
        off += 0x1000;
    }
    Ok(addr.into_usize() >> 12)
}

/// Unmaps the mapping identified by `id` (the page number `mmap` returned),
/// writing back dirty file-backed pages and discarding clean ones.
pub fn munmap(spt: &Arc<Spt>, page_table: &mut PageTable, id: usize) -> Result<usize, KernelError> {
    let addr = Va::new(id << 12).ok_or(KernelError::InvalidArgument)?;
    let far = Va::new(usize::MAX & !0xFFF).unwrap();
    let entries = spt.range(addr, far);
    let mut n = 0;
    for (va, entry) in entries {
        if va != Va::new(addr.into_usize() + n).unwrap() {
            break; // stop at the first gap: only this one mapping's run
        }
        if !matches!(entry.backing, Backing::Mmap { .. }) {
            break;
        }
        if let Ok(mut walked) = page_table.walk_mut(va) {
            if let Backing::Mmap { file, offset, len } = &entry.backing {
                if walked.flags().contains(keos::mm::page_table::PteFlags::D) {
                    if let Some(page) = walked.clear() {
                        let page = page.invalidate();
                        let wn = (*len).min(page.inner().len());
                        file.write(*offset, &page.inner()[..wn])?;
                    }
                } else {
                    walked.clear().map(|p| p.invalidate());
                }
            }
        }
        spt.remove(va);
        n += 0x1000;
    }
    Ok(n)
}

/// Writes back every outstanding dirty `mmap` page and drops its `Spt`
/// entry, without requiring the caller to know each mapping's id. Process
/// exit implicitly `munmap`s everything still mapped; this is that in one
/// pass instead of one `munmap` call per mapping.
pub fn writeback_all(spt: &Arc<Spt>, page_table: &mut PageTable) {
    let everything = spt.range(Va::new(0).unwrap(), Va::new(usize::MAX & !0xFFF).unwrap());
    for (va, entry) in everything {
        let Backing::Mmap { file, offset, len } = &entry.backing else {
            continue;
        };
        if let Ok(mut walked) = page_table.walk_mut(va) {
            if walked.flags().contains(keos::mm::page_table::PteFlags::D) {
                if let Some(page) = walked.clear() {
                    let page = page.invalidate();
                    let wn = (*len).min(page.inner().len());
                    let _ = file.write(*offset, &page.inner()[..wn]);
                }
            }
        }
        spt.remove(va);
    }
}
