//! Virtual memory: per-process page tables, the supplemental page table
//! that backs demand paging, the global frame table with clock eviction,
//! swap space, the write-back buffer cache, and `mmap`.
pub mod buffer_cache;
pub mod fault;
pub mod frame_table;
pub mod mmap;
pub mod page_table;
pub mod spt;
pub mod swap;

/// Brings up every VM subsystem in dependency order: the frame table and
/// swap space have no dependencies on each other, but both must exist
/// before any page fault can be serviced, and the buffer cache needs the
/// filesystem disk registered first.
pub fn init() -> Result<(), keos::KernelError> {
    frame_table::init();
    swap::init()?;
    buffer_cache::init();
    Ok(())
}

/// Starts background maintenance threads that must not be spawned until
/// the real scheduler is installed. See
/// [`buffer_cache::start_flush_thread`].
pub fn start_background_threads() {
    buffer_cache::start_flush_thread();
}
