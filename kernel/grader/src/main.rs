// This is test & bootstrap implementation.
// This file will be overwritten when grading.
#![no_std]
#![no_main]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;
extern crate keos;
extern crate kernel;
#[macro_use]
extern crate grading;

mod scheduler;
mod sync;
mod vm;

use keos::SystemConfigurationBuilder;
pub use kernel::Process;

#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe fn main(config_builder: SystemConfigurationBuilder) {
    kernel::init().expect("failed to bring up kernel subsystems");

    if let Ok(fs) = simple_fs::FileSystem::load(1) {
        keos::info!("Filesystem: use `SimpleFS`.");
        keos::fs::FileSystem::register(fs)
    }

    config_builder.set_scheduler(kernel::PriorityScheduler::from_kernel_cmdline());
    kernel::start_background_threads();

    keos::TestDriver::<Process>::start([
        // Synchronization primitives.
        &sync::mutex::smoke,
        &sync::mutex::smoke_many,
        &sync::mutex::parking,
        &sync::condition_variable::bounded_buffer_1,
        &sync::condition_variable::bounded_buffer_2,
        &sync::semaphore::sema_0,
        &sync::semaphore::sema_1,
        &sync::semaphore::sema_2,
        &sync::semaphore::exec_order,
        &sync::semaphore::n_permits,
        &sync::rwlock::readers_share,
        &sync::rwlock::writer_excludes_readers,
        &sync::rwlock::writer_preference,
        // Priority donation and MLFQ scheduling.
        &scheduler::donation_raises_effective_priority,
        &scheduler::donation_transitive_chain,
        &scheduler::donation_reverts_on_release,
        &scheduler::priority_queue_selects_highest,
        &scheduler::sleep_wakes_in_tick_order,
        &scheduler::mlfq_hog_drops_below_idle,
        &scheduler::fixed_point::int_roundtrip,
        &scheduler::fixed_point::rounding_matches_nearest,
        &scheduler::fixed_point::mul_div_precision,
        &scheduler::fixed_point::negative_mul,
        &scheduler::fixed_point::load_avg_decay_shape,
        // Virtual memory: demand paging, swap, buffer cache, mmap.
        &vm::stack_growth_within_limit_succeeds,
        &vm::stack_growth_beyond_limit_fails,
        &vm::stack_growth_far_from_esp_fails,
        &vm::swap_round_trip,
        &vm::frame_table_evicts_when_full,
        &vm::frame_table_pin_prevents_eviction,
        &vm::buffer_cache_write_back,
        &vm::buffer_cache_read_after_write,
        &vm::mmap_reads_file_contents,
        &vm::mmap_write_back_on_munmap,
        &vm::mmap_rejects_zero_addr,
        &vm::mmap_rejects_unaligned_addr,
        &vm::mmap_rejects_overlapping_range,
        &vm::munmap_id_is_page_number,
    ]);
}

#[unsafe(no_mangle)]
pub unsafe fn ap_main() {}
