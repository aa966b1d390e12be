//! Four-level x86_64 page table, owned per process.
//!
//! Walks and mutates a [`PageTableRoot`] the way `keos::mm::page_table`
//! exposes it: each level (PML4 -> PDPT -> PD -> PT) is a plain array of
//! entries, and intermediate tables are allocated on demand with
//! [`Page::new`] the first time a virtual address needs them.
use alloc::boxed::Box;
use core::ops::Deref;
use keos::{
    addressing::{Kva, Pa, Va},
    mm::{
        Page,
        page_table::{
            PageTableMappingError, PageTableRoot, Pde, PdeFlags, Pdpe, PdpeFlags, Permission, Pte,
            PteFlags, StaleTLBEntry,
        },
    },
};

/// Decomposition of a virtual address into its four page-table indices.
pub struct PtIndices {
    pub va: Va,
    pub pml4ei: usize,
    pub pdptei: usize,
    pub pdei: usize,
    pub ptei: usize,
}

impl PtIndices {
    /// Splits `va` into PML4/PDPT/PD/PT indices (9 bits each, from bit 39
    /// down to bit 12).
    pub fn from_va(va: Va) -> Result<Self, PageTableMappingError> {
        if va.into_usize() & 0xFFF == 0 {
            let n = va.into_usize();
            Ok(Self {
                va,
                pml4ei: (n >> 39) & 0x1FF,
                pdptei: (n >> 30) & 0x1FF,
                pdei: (n >> 21) & 0x1FF,
                ptei: (n >> 12) & 0x1FF,
            })
        } else {
            Err(PageTableMappingError::Unaligned)
        }
    }
}

fn perm_to_pml4e_flags(perm: Permission) -> keos::mm::page_table::Pml4eFlags {
    use keos::mm::page_table::Pml4eFlags as F;
    let mut f = F::P | F::RW;
    if perm.contains(Permission::USER) {
        f |= F::US;
    }
    f
}

fn perm_to_pdpe_flags(perm: Permission) -> PdpeFlags {
    let mut f = PdpeFlags::P | PdpeFlags::RW;
    if perm.contains(Permission::USER) {
        f |= PdpeFlags::US;
    }
    f
}

fn perm_to_pde_flags(perm: Permission) -> PdeFlags {
    let mut f = PdeFlags::P | PdeFlags::RW;
    if perm.contains(Permission::USER) {
        f |= PdeFlags::US;
    }
    f
}

fn perm_to_pte_flags(perm: Permission) -> PteFlags {
    let mut f = PteFlags::P;
    if perm.contains(Permission::WRITE) {
        f |= PteFlags::RW;
    }
    if perm.contains(Permission::USER) {
        f |= PteFlags::US;
    }
    if !perm.contains(Permission::EXECUTABLE) {
        f |= PteFlags::XD;
    }
    f
}

/// A process's own 4-level page table.
pub struct PageTable(pub Box<PageTableRoot>);

impl PageTable {
    /// An empty page table that can still resolve kernel addresses (the
    /// shared upper half above [`PageTableRoot::KBASE`]).
    pub fn new() -> Self {
        Self(PageTableRoot::new_boxed_with_kernel_addr())
    }

    /// Physical address of the PML4 root, i.e. what goes into `cr3`.
    pub fn pa(&self) -> Pa {
        Kva::new(self.0.as_ref().deref() as *const _ as usize)
            .unwrap()
            .into_pa()
    }

    /// Maps `va` to a freshly-owned physical page, taking ownership of it.
    pub fn map(&mut self, va: Va, pg: Page, perm: Permission) -> Result<(), PageTableMappingError> {
        let pa = pg.into_raw();
        unsafe {
            self.do_map(va, pa, perm).inspect_err(|_| {
                Page::from_pa(pa);
            })
        }
    }

    /// Maps `va` to an already-physical `pa` without taking page ownership.
    ///
    /// # Safety
    /// `pa` must name a page the caller intends this table to (co-)own for
    /// as long as the mapping exists.
    pub unsafe fn do_map(
        &mut self,
        va: Va,
        pa: Pa,
        perm: Permission,
    ) -> Result<(), PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pml4e = &mut self.0[indices.pml4ei];
        if pml4e.pa().is_none() {
            let table = Page::new().ok_or(PageTableMappingError::InvalidPermission)?;
            pml4e.set_pa(table.into_raw())?;
            unsafe {
                pml4e.set_flags(perm_to_pml4e_flags(perm));
            }
        } else {
            unsafe {
                let merged = pml4e.flags() | perm_to_pml4e_flags(perm);
                pml4e.set_flags(merged);
            }
        }
        let pdp = pml4e.into_pdp_mut()?;

        let pdpe = &mut pdp[indices.pdptei];
        if pdpe.pa().is_none() {
            let table = Page::new().ok_or(PageTableMappingError::InvalidPermission)?;
            pdpe.set_pa(table.into_raw())?;
            unsafe {
                pdpe.set_flags(perm_to_pdpe_flags(perm));
            }
        } else {
            unsafe {
                let merged = pdpe.flags() | perm_to_pdpe_flags(perm);
                pdpe.set_flags(merged);
            }
        }
        let pd = pdpe.into_pd_mut()?;

        let pde = &mut pd[indices.pdei];
        if pde.pa().is_none() {
            let table = Page::new().ok_or(PageTableMappingError::InvalidPermission)?;
            pde.set_pa(table.into_raw())?;
            unsafe {
                pde.set_flags(perm_to_pde_flags(perm));
            }
        } else {
            unsafe {
                let merged = pde.flags() | perm_to_pde_flags(perm);
                pde.set_flags(merged);
            }
        }
        let pt = pde.into_pt_mut()?;

        let pte = &mut pt[indices.ptei];
        if pte.flags().contains(PteFlags::P) {
            return Err(PageTableMappingError::Duplicated);
        }
        pte.set_pa(pa)?;
        unsafe {
            pte.set_flags(perm_to_pte_flags(perm));
        }
        Ok(())
    }

    /// Removes the mapping for `va`, returning the page that was mapped
    /// there (after a TLB shootdown on this address).
    pub fn unmap(&mut self, va: Va) -> Result<Page, PageTableMappingError> {
        let mut walked = self.walk_mut(va)?;
        let stale = walked.clear().ok_or(PageTableMappingError::NotExist)?;
        Ok(stale.invalidate())
    }

    /// Looks up the PTE for `va` without modifying anything.
    pub fn walk(&self, va: Va) -> Result<&Pte, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pdp = self.0[indices.pml4ei].into_pdp()?;
        let pd = pdp[indices.pdptei].into_pd()?;
        let pt = pd[indices.pdei].into_pt()?;
        Ok(&pt[indices.ptei])
    }

    /// Looks up the PTE for `va`, allocating no intermediate tables: every
    /// level must already exist, or [`PageTableMappingError::NotExist`] is
    /// returned.
    pub fn walk_mut(&mut self, va: Va) -> Result<Walked<'_>, PageTableMappingError> {
        let indices = PtIndices::from_va(va)?;
        let pdp = self.0[indices.pml4ei].into_pdp_mut()?;
        let pd = pdp[indices.pdptei].into_pd_mut()?;
        let pt = pd[indices.pdei].into_pt_mut()?;
        Ok(Walked {
            addr: va,
            pte: &mut pt[indices.ptei],
        })
    }

    /// Unmaps everything below [`PageTableRoot::KBASE`] and frees every
    /// intermediate table, leaving only the PML4 page itself.
    fn clear(&mut self) {
        for pml4ei in 0..PageTableRoot::KBASE {
            let pml4e = &mut self.0[pml4ei];
            let Some(pdp_pa) = pml4e.pa() else { continue };
            if let Ok(pdp) = pml4e.into_pdp_mut() {
                for pdpe in pdp.iter_mut() {
                    let Some(pd_pa) = pdpe.pa() else { continue };
                    if let Ok(pd) = pdpe.into_pd_mut() {
                        for pde in pd.iter_mut() {
                            let Some(pt_pa) = pde.pa() else { continue };
                            if let Ok(pt) = pde.into_pt_mut() {
                                for pte in pt.iter_mut() {
                                    if let Some(pa) = unsafe { pte.clear() } {
                                        drop(unsafe { Page::from_pa(pa) });
                                    }
                                }
                            }
                            unsafe {
                                pde.clear();
                            }
                            drop(unsafe { Page::from_pa(pt_pa) });
                        }
                    }
                    unsafe {
                        pdpe.clear();
                    }
                    drop(unsafe { Page::from_pa(pd_pa) });
                }
            }
            unsafe {
                pml4e.clear();
            }
            drop(unsafe { Page::from_pa(pdp_pa) });
        }
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        assert_ne!(
            keos::intrinsics::read_cr3(),
            self.pa().into_usize(),
            "dropping an active page table"
        );
        self.clear()
    }
}

/// A live reference into a PTE slot, obtained from [`PageTable::walk_mut`].
pub struct Walked<'a> {
    addr: Va,
    pte: &'a mut Pte,
}

impl Walked<'_> {
    /// Clears the mapping, handing back a [`StaleTLBEntry`] the caller must
    /// invalidate (or, as [`PageTable::unmap`] does, invalidate immediately).
    pub fn clear(&mut self) -> Option<StaleTLBEntry> {
        unsafe {
            self.pte
                .clear()
                .map(|pa| StaleTLBEntry::new(self.addr, Page::from_pa(pa)))
        }
    }

    /// Installs `page` into this slot with `flags`, failing if something is
    /// already mapped here.
    pub fn set_page(&mut self, page: Page, flags: PteFlags) -> Result<(), PageTableMappingError> {
        if self.pte.flags().contains(PteFlags::P) {
            Err(PageTableMappingError::Duplicated)
        } else {
            unsafe {
                self.pte.set_pa(page.into_raw())?.set_flags(flags);
            }
            Ok(())
        }
    }

    /// Raw access to the underlying accessed/dirty bits, used by the frame
    /// table's clock hand.
    pub fn flags(&self) -> PteFlags {
        self.pte.flags()
    }

    /// Clears the accessed bit without disturbing the mapping, so the next
    /// access can be observed again.
    ///
    /// # Safety
    /// Caller must invalidate the TLB entry for this address afterwards.
    pub unsafe fn clear_accessed(&mut self) {
        let f = self.pte.flags() & !PteFlags::A;
        unsafe {
            self.pte.set_flags(f);
        }
    }

    /// Sets the dirty bit without disturbing the mapping. The MMU sets this
    /// on every hardware write; tests that can't drive a real write use this
    /// to simulate one before exercising a write-back path.
    ///
    /// # Safety
    /// Caller must invalidate the TLB entry for this address afterwards.
    pub unsafe fn mark_dirty(&mut self) {
        let f = self.pte.flags() | PteFlags::D;
        unsafe {
            self.pte.set_flags(f);
        }
    }
}

impl Deref for Walked<'_> {
    type Target = Pte;
    fn deref(&self) -> &Self::Target {
        self.pte
    }
}
