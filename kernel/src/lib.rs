//! # KeOS teaching kernel: scheduler and virtual memory
//!
//! This crate implements the two hardest subsystems of a small teaching
//! operating system kernel:
//!
//! - [`scheduler`] and [`sync`]: cooperative/preemptive multitasking with
//!   priority scheduling, priority donation through locks, an MLFQ mode
//!   using [`fixed_point`] 17.14 arithmetic, and timed sleep.
//! - [`mm`]: a demand-paging stack combining a per-process supplemental
//!   page table ([`mm::spt`]), a global frame table with clock eviction
//!   and pinning ([`mm::frame_table`]), a [`mm::swap`] space over a block
//!   device, a write-back [`mm::buffer_cache`] over the filesystem block
//!   device, and [`mm::mmap`] memory-mapped files.
//!
//! Everything else — the user-program loader ([`loader`]), the open-file
//! table ([`file_struct`]), and the single [`process`] that wires both
//! into the syscall trap vector ([`syscall`]) — is glue around those two
//! subsystems, not the subject of this crate.
#![no_std]
#![no_main]
#![feature(negative_impls)]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[allow(unused_imports)]
#[macro_use]
extern crate keos;

pub mod file_struct;
pub mod fixed_point;
pub mod loader;
pub mod mm;
pub mod process;
pub mod scheduler;
pub mod sync;
pub mod syscall;

pub use process::Process;
pub use scheduler::PriorityScheduler;

/// Brings up every kernel subsystem in dependency order: fixed-point math
/// has no dependencies and is used purely as a library, so the ordering
/// that matters starts at the page allocator
/// (already brought up by `keos::rust_main` before `main` runs) — frame
/// table and swap space next (neither depends on the other, but both
/// must exist before any page fault can be serviced), then the buffer
/// cache (needs the filesystem disk registered first).
pub fn init() -> Result<(), keos::KernelError> {
    mm::init()
}

/// Starts background maintenance threads (the buffer cache's periodic
/// flush). Must be called only after `config_builder.set_scheduler(...)`
/// has installed the real scheduler — spawned before that point, a
/// thread is stranded on the default scheduler's run queue and replaced
/// with it, never running.
pub fn start_background_threads() {
    mm::start_background_threads()
}
