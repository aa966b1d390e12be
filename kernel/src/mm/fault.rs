//! The page-fault handler: resolves a faulting address against a process's
//! [`Spt`] and either demand-loads it or kills the process.
//!
//! Grounded on `keos-project3`'s `PageFaultReason`/`LazyPager::do_lazy_load`
//! split (decode the hardware error code, then consult the demand-paging
//! metadata), generalized from a single `VmAreaStruct` list to the full
//! [`Spt`] (anonymous, file, mmap, and swapped backings all funnel through
//! here, not just file-backed `mmap` regions).
use crate::{
    loader::stack_builder::{STACK_GROWTH_LIMIT_PAGES, STACK_TOP},
    mm::{
        frame_table::{self, FrameOwner},
        page_table::PageTable,
        spt::{Backing, Spt, SptEntry},
        swap,
    },
};
use alloc::sync::Arc;
use keos::{
    KernelError,
    addressing::Va,
    mm::page_table::Permission,
    task::PFErrorCode,
};

/// A decoded `cr2`/error-code pair.
pub struct PageFaultReason {
    pub fault_addr: Va,
    pub is_write_access: bool,
    pub is_present: bool,
}

impl PageFaultReason {
    /// Decodes the hardware fault info.
    pub fn new(ec: PFErrorCode, cr2: Va) -> Self {
        Self {
            fault_addr: cr2,
            is_write_access: ec.contains(PFErrorCode::WRITE_ACCESS),
            is_present: ec.contains(PFErrorCode::PRESENT),
        }
    }

    /// A demand-paging fault is a fault on an address the process knows
    /// about (it has an [`Spt`] entry) but has not yet brought in — as
    /// opposed to a fault on a page that is already present (a permission
    /// violation) or on an address with no entry at all (a bad access).
    pub fn is_demand_paging_fault(&self) -> bool {
        !self.is_present
    }
}

fn page_align(va: Va) -> Va {
    Va::new(va.into_usize() & !0xFFF).unwrap()
}

/// Owner glue connecting a frame back to the SPT entry and page table slot
/// it was faulted in for, so the frame table's clock hand can ask it to
/// check/clear the accessed bit or evict on its behalf.
pub struct SptFrameOwner {
    va: Va,
    spt: Arc<Spt>,
    page_table: *mut PageTable,
}

unsafe impl Send for SptFrameOwner {}
unsafe impl Sync for SptFrameOwner {}

impl SptFrameOwner {
    /// # Safety
    /// `page_table` must outlive every frame registered with this owner,
    /// and must only be accessed from the thread that owns the process
    /// (page tables are not shared across processes).
    pub unsafe fn new(va: Va, spt: Arc<Spt>, page_table: *mut PageTable) -> Self {
        Self { va, spt, page_table }
    }

    fn page_table(&self) -> &mut PageTable {
        unsafe { &mut *self.page_table }
    }
}

impl FrameOwner for SptFrameOwner {
    fn va(&self) -> Va {
        self.va
    }

    fn accessed_and_clear(&self) -> bool {
        match self.page_table().walk_mut(self.va) {
            Ok(mut walked) => {
                let accessed = walked
                    .flags()
                    .contains(keos::mm::page_table::PteFlags::A);
                if accessed {
                    unsafe { walked.clear_accessed() };
                }
                accessed
            }
            Err(_) => false,
        }
    }

    fn dirty(&self) -> bool {
        self.page_table()
            .walk_mut(self.va)
            .map(|w| w.flags().contains(keos::mm::page_table::PteFlags::D))
            .unwrap_or(false)
    }

    fn evict(&self) -> Result<(), KernelError> {
        let dirty = self.dirty();
        let entry = self.spt.lookup(self.va).ok_or(KernelError::BadAddress)?;
        let page = self.page_table().unmap(self.va).map_err(|_| KernelError::BadAddress)?;
        match entry.backing {
            Backing::Zero if dirty => {
                let slot = swap::with_swap(|s| s.alloc())?;
                swap::with_swap(|s| s.write_out(slot, page.inner()))?;
                self.spt.update_backing(self.va, Backing::Swapped(slot));
            }
            Backing::Zero => {
                // Never written: nothing worth preserving. Re-fault zeroes it.
            }
            Backing::Mmap { ref file, offset, len } if dirty => {
                let n = len.min(page.inner().len());
                file.write(offset, &page.inner()[..n])?;
            }
            Backing::File { .. } | Backing::Mmap { .. } => {
                // Clean file-backed page: dropping it is enough, the file
                // still holds the truth.
            }
            Backing::Swapped(_) => unreachable!("a resident page cannot already be swapped"),
        }
        Ok(())
    }
}

/// A fault with no supplemental-page-table entry is a legitimate user-stack
/// growth, not a wild pointer, when it lands within 32 bytes below `esp`
/// (the `PUSH`/`CALL` slack a single instruction can touch before `esp`
/// itself moves) and within [`STACK_GROWTH_LIMIT_PAGES`] of [`STACK_TOP`].
fn is_stack_growth(fault_addr: Va, esp: Va) -> bool {
    let floor = STACK_TOP.saturating_sub(STACK_GROWTH_LIMIT_PAGES * 0x1000);
    let addr = fault_addr.into_usize();
    addr < STACK_TOP && addr >= floor && addr + 32 >= esp.into_usize()
}

/// Resolves `reason` against `spt`, allocating and installing a frame if
/// it is a legitimate demand-paging fault, or returning an error (the
/// caller kills the faulting thread) otherwise. `esp` is the user stack
/// pointer at fault time, consulted only when `reason`'s address has no
/// existing entry (see [`is_stack_growth`]).
pub fn handle(
    reason: &PageFaultReason,
    page_table: &mut PageTable,
    spt: &Arc<Spt>,
    esp: Va,
) -> Result<(), KernelError> {
    let va = page_align(reason.fault_addr);
    let entry = match spt.lookup(va) {
        Some(entry) => entry,
        None if !reason.is_present && is_stack_growth(reason.fault_addr, esp) => {
            let entry = SptEntry {
                backing: Backing::Zero,
                perm: Permission::READ | Permission::WRITE | Permission::USER,
            };
            spt.install(va, entry.clone());
            entry
        }
        None => return Err(KernelError::BadAddress),
    };
    if !reason.is_demand_paging_fault() {
        // Already present: either a genuine permission violation, or a
        // spurious fault racing an eviction that has since completed.
        if page_table.walk(va).is_ok() {
            return Ok(());
        }
        return Err(KernelError::BadAddress);
    }
    if reason.is_write_access && !entry.perm.contains(keos::mm::page_table::Permission::WRITE) {
        return Err(KernelError::InvalidAccess);
    }

    let owner: Arc<dyn FrameOwner> = Arc::new(unsafe {
        SptFrameOwner::new(va, spt.clone(), page_table as *mut PageTable)
    });
    let mut page = frame_table::with_frame_table(|ft| ft.alloc(owner))?;

    match &entry.backing {
        Backing::Zero => {
            page.inner_mut().fill(0);
        }
        Backing::File { file, offset, len } | Backing::Mmap { file, offset, len } => {
            page.inner_mut().fill(0);
            let n = (*len).min(page.inner().len());
            file.read(*offset, &mut page.inner_mut()[..n])?;
        }
        Backing::Swapped(slot) => {
            swap::with_swap(|s| s.read_in(*slot, page.inner_mut()))?;
            swap::with_swap(|s| s.free(*slot));
            // Now resident: clear the swap backing so a future eviction
            // writes to a fresh slot instead of hitting the `Swapped`
            // variant `SptFrameOwner::evict` never expects to see.
            spt.update_backing(va, Backing::Zero);
        }
    }

    page_table
        .map(va, page, entry.perm)
        .map_err(|_| KernelError::BadAddress)?;
    Ok(())
}
