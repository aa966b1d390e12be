//! Lays out a fresh user stack: argument strings, the `argv` pointer array,
//! and a fake return address, growing down from a fixed top address.
use crate::mm::{
    fault::{self, PageFaultReason},
    page_table::PageTable,
    spt::{Backing, Spt, SptEntry},
};
use alloc::sync::Arc;
use keos::{addressing::Va, mm::page_table::Permission};

/// Top of the user stack; the stack region spans the `0x10000` bytes below
/// it and is torn down along with the rest of the address space on exit.
pub const STACK_TOP: usize = 0x4748_0000;
const STACK_SIZE: usize = 0x10000;

/// How far below [`STACK_TOP`] a stack-growth fault may still install a new
/// page, in pages. Bounds runaway recursion the same way a real stack-size
/// rlimit would; [`crate::mm::fault::handle`] is the other half of this.
pub const STACK_GROWTH_LIMIT_PAGES: usize = 2048;

/// Incrementally builds a user stack by pushing bytes from high to low
/// addresses, the same direction the hardware stack pointer moves.
pub struct StackBuilder<'a> {
    sp: Va,
    page_table: &'a mut PageTable,
    spt: &'a Arc<Spt>,
}

impl<'a> StackBuilder<'a> {
    /// Reserves the stack's address range in `spt` (zero-filled, demand
    /// paged like any other anonymous mapping) and starts the cursor at the
    /// top of it.
    pub fn new(page_table: &'a mut PageTable, spt: &'a Arc<Spt>) -> Self {
        let base = Va::new(STACK_TOP - STACK_SIZE).expect("stack base is a valid address");
        let mut va = base;
        for _ in 0..(STACK_SIZE / 0x1000) {
            spt.install(
                va,
                SptEntry {
                    backing: Backing::Zero,
                    perm: Permission::READ | Permission::WRITE | Permission::USER,
                },
            );
            va += 0x1000;
        }
        Self {
            sp: Va::new(STACK_TOP).expect("stack top is a valid address"),
            page_table,
            spt,
        }
    }

    /// The stack pointer to install into the user thread's registers once
    /// layout is finished.
    pub fn finish(self) -> Va {
        self.sp
    }

    /// The current stack pointer, without consuming the builder.
    pub fn sp(&self) -> Va {
        self.sp
    }

    /// Moves the stack pointer down until it is aligned to `align` bytes.
    pub fn align(&mut self, align: usize) {
        while self.sp.into_usize() % align != 0 {
            self.sp -= 1;
        }
    }

    /// Materializes the stack page at `page_va` if it is not already
    /// resident, by routing through the ordinary page fault handler.
    fn ensure_mapped(&mut self, page_va: Va) {
        if self.page_table.walk(page_va).ok().and_then(|pte| pte.pa()).is_some() {
            return;
        }
        let reason = PageFaultReason {
            fault_addr: page_va,
            is_write_access: true,
            is_present: false,
        };
        fault::handle(&reason, self.page_table, self.spt, page_va).expect("stack page is backed by spt");
    }

    /// Pushes `bytes` onto the stack and returns the address it was written
    /// at (the new stack pointer).
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Va {
        self.sp -= bytes.len();
        let start = self.sp;
        let mut cursor = start;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let page_va = cursor.page_down();
            let off = cursor.offset();
            let n = remaining.len().min(0x1000 - off);
            self.ensure_mapped(page_va);
            let pa = self
                .page_table
                .walk(page_va)
                .ok()
                .and_then(|pte| pte.pa())
                .expect("stack page was just mapped");
            let kva = pa.into_kva().into_usize() as *mut u8;
            unsafe {
                core::ptr::copy_nonoverlapping(remaining.as_ptr(), kva.add(off), n);
            }
            remaining = &remaining[n..];
            cursor += n;
        }
        start
    }

    /// Pushes a `usize` in native byte order.
    pub fn push_usize(&mut self, value: usize) -> Va {
        self.push_bytes(&value.to_ne_bytes())
    }

    /// Pushes a NUL-terminated string.
    pub fn push_str(&mut self, s: &str) -> Va {
        self.push_bytes(&[0]);
        self.push_bytes(s.as_bytes())
    }
}
