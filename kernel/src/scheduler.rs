//! Ready/blocked/sleeping state, priority selection, MLFQ, and sleep.
//!
//! [`keos::thread::Thread`] only carries the fields the runtime itself
//! needs (tid, stack, saved `sp`, exit status, ...); it has no notion of
//! priority, niceness, recent-CPU, or which locks a thread holds. The
//! same problem shows up inside `keos` itself — `EXIT_CODE_TABLE` and
//! `THREAD_STATE_TABLE` in `keos::thread` are side tables keyed by tid
//! for exactly this reason — so scheduling state here is kept the same
//! way, in [`SCHED_INFO`], rather than trying to smuggle it onto
//! `Thread`.
//!
//! This scheduler is single-core by design and keeps one global ready
//! queue and one global sleep queue instead of the runtime's own
//! `PerCore` pattern (see `RoundRobin` elsewhere in the tree) — there
//! is exactly one core to serve.
use crate::fixed_point::Fixed;
use alloc::{boxed::Box, collections::VecDeque, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use keos::{
    sync::SpinLock,
    thread::{ParkHandle, Thread, scheduler::Scheduler},
};

/// Lowest priority a thread may have.
pub const PRI_MIN: u8 = 0;
/// Highest priority a thread may have.
pub const PRI_MAX: u8 = 63;
/// Priority newly created threads start at.
pub const PRI_DEFAULT: u8 = 31;
/// Lowest niceness accepted by [`set_nice`].
pub const NICE_MIN: i32 = -20;
/// Highest niceness accepted by [`set_nice`].
pub const NICE_MAX: i32 = 20;
/// Niceness newly created threads start at.
pub const NICE_DEFAULT: i32 = 0;
/// Ticks a thread may run before the timer forces a reschedule.
const TIME_SLICE: u64 = 4;
/// Ticks between one-second MLFQ housekeeping (`load_avg`/`recent_cpu`).
const TICKS_PER_SEC: u64 = 100;

/// Opaque identifier for a lock, used to track donation chains.
///
/// Allocated by [`new_lock_id`]; `kernel::sync::Mutex` stores one of
/// these alongside its own waiter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LockId(u64);

fn new_lock_id() -> LockId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    LockId(NEXT.fetch_add(1, Ordering::SeqCst))
}

struct SchedInfo {
    base_priority: AtomicU8,
    nice: AtomicI32,
    recent_cpu: SpinLock<Fixed>,
    /// Locks this thread currently holds, for donation lookups.
    held_locks: SpinLock<Vec<LockId>>,
}

impl SchedInfo {
    fn new(priority: u8) -> Self {
        Self {
            base_priority: AtomicU8::new(priority),
            nice: AtomicI32::new(NICE_DEFAULT),
            recent_cpu: SpinLock::new(Fixed::ZERO),
            held_locks: SpinLock::new(Vec::new()),
        }
    }
}

struct LockMeta {
    holder: AtomicU64,
    waiters: SpinLock<Vec<u64>>,
}

static SCHED_INFO: SpinLock<alloc::collections::BTreeMap<u64, Arc<SchedInfo>>> =
    SpinLock::new(alloc::collections::BTreeMap::new());
static LOCKS: SpinLock<alloc::collections::BTreeMap<LockId, LockMeta>> =
    SpinLock::new(alloc::collections::BTreeMap::new());
static MLFQS: AtomicBool = AtomicBool::new(false);
static LOAD_AVG: SpinLock<Fixed> = SpinLock::new(Fixed::ZERO);
static TICKS: AtomicU64 = AtomicU64::new(0);

fn sched_info(tid: u64) -> Arc<SchedInfo> {
    let mut guard = SCHED_INFO.lock();
    let info = guard
        .entry(tid)
        .or_insert_with(|| Arc::new(SchedInfo::new(PRI_DEFAULT)))
        .clone();
    guard.unlock();
    info
}

/// Registers a freshly created thread with an explicit starting
/// priority. Safe to call more than once; later calls overwrite the
/// priority of an already-registered thread.
pub fn register_thread(tid: u64, priority: u8) {
    let info = sched_info(tid);
    info.base_priority.store(priority, Ordering::SeqCst);
}

/// Drops the side-table entry for a thread that has exited.
pub fn unregister_thread(tid: u64) {
    let mut guard = SCHED_INFO.lock();
    guard.remove(&tid);
    guard.unlock();
}

/// Sets a thread's base priority (ignored once `mlfqs` mode recomputes
/// priority from `recent_cpu`/`nice` every fourth tick).
pub fn set_priority(tid: u64, priority: u8) {
    sched_info(tid)
        .base_priority
        .store(priority.min(PRI_MAX), Ordering::SeqCst);
}

/// A thread's own priority, ignoring any donation.
pub fn priority(tid: u64) -> u8 {
    sched_info(tid).base_priority.load(Ordering::SeqCst)
}

/// Sets a thread's MLFQ niceness, clamped to `[NICE_MIN, NICE_MAX]`.
pub fn set_nice(tid: u64, nice: i32) {
    sched_info(tid)
        .nice
        .store(nice.clamp(NICE_MIN, NICE_MAX), Ordering::SeqCst);
}

/// A thread's MLFQ niceness.
pub fn nice(tid: u64) -> i32 {
    sched_info(tid).nice.load(Ordering::SeqCst)
}

/// A thread's `recent_cpu` fixed-point accumulator.
pub fn recent_cpu(tid: u64) -> Fixed {
    let info = sched_info(tid);
    let guard = info.recent_cpu.lock();
    let v = *guard;
    guard.unlock();
    v
}

/// System-wide exponential moving average of the ready-queue length.
pub fn load_avg() -> Fixed {
    let guard = LOAD_AVG.lock();
    let v = *guard;
    guard.unlock();
    v
}

/// Effective priority: the thread's own priority, or — outside MLFQ
/// mode — the maximum of that and the effective priorities of every
/// thread waiting on a lock this thread holds, computed recursively.
/// A `visited` set breaks donation cycles.
pub fn effective_priority(tid: u64) -> u8 {
    if MLFQS.load(Ordering::SeqCst) {
        return priority(tid);
    }
    let mut visited = alloc::collections::BTreeSet::new();
    effective_priority_inner(tid, &mut visited)
}

fn effective_priority_inner(tid: u64, visited: &mut alloc::collections::BTreeSet<u64>) -> u8 {
    if !visited.insert(tid) {
        return PRI_MIN;
    }
    let info = sched_info(tid);
    let mut best = info.base_priority.load(Ordering::SeqCst);
    let held = info.held_locks.lock();
    let held_ids: Vec<LockId> = held.clone();
    held.unlock();
    // Collect every waiter tid across all held locks *before* recursing —
    // `effective_priority_inner` may itself need `LOCKS`, and the spinlock
    // is not reentrant, so the guard must be gone before we recurse.
    let mut all_waiters = Vec::new();
    let locks = LOCKS.lock();
    for id in held_ids {
        if let Some(meta) = locks.get(&id) {
            let waiters = meta.waiters.lock();
            all_waiters.extend(waiters.iter().copied());
            waiters.unlock();
        }
    }
    locks.unlock();
    for w in all_waiters {
        let p = effective_priority_inner(w, visited);
        if p > best {
            best = p;
        }
    }
    best
}

/// Registers a newly constructed lock and returns its id.
pub fn lock_created() -> LockId {
    let id = new_lock_id();
    let mut guard = LOCKS.lock();
    guard.insert(
        id,
        LockMeta {
            holder: AtomicU64::new(0),
            waiters: SpinLock::new(Vec::new()),
        },
    );
    guard.unlock();
    id
}

/// Records that `tid` is now blocked waiting to acquire `lock`.
pub fn begin_wait(tid: u64, lock: LockId) {
    let guard = LOCKS.lock();
    if let Some(meta) = guard.get(&lock) {
        let mut waiters = meta.waiters.lock();
        waiters.push(tid);
        waiters.unlock();
    }
    guard.unlock();
}

/// Records that `tid` stopped waiting on `lock` (either it acquired it
/// or gave up).
pub fn end_wait(tid: u64, lock: LockId) {
    let guard = LOCKS.lock();
    if let Some(meta) = guard.get(&lock) {
        let mut waiters = meta.waiters.lock();
        waiters.retain(|&w| w != tid);
        waiters.unlock();
    }
    guard.unlock();
}

/// Records that `tid` now holds `lock`.
pub fn lock_acquired(tid: u64, lock: LockId) {
    end_wait(tid, lock);
    let guard = LOCKS.lock();
    if let Some(meta) = guard.get(&lock) {
        meta.holder.store(tid, Ordering::SeqCst);
    }
    guard.unlock();
    let info = sched_info(tid);
    let mut held = info.held_locks.lock();
    held.push(lock);
    held.unlock();
}

/// Records that `tid` released `lock`.
pub fn lock_released(tid: u64, lock: LockId) {
    let guard = LOCKS.lock();
    if let Some(meta) = guard.get(&lock) {
        meta.holder.store(0, Ordering::SeqCst);
    }
    guard.unlock();
    let info = sched_info(tid);
    let mut held = info.held_locks.lock();
    held.retain(|&l| l != lock);
    held.unlock();
}

/// Picks the highest (effective-priority) waiter of `lock`, if any.
/// Ties are broken by insertion order, i.e. the earliest-inserted
/// waiter among those tied for highest priority.
pub fn highest_priority_waiter(waiters: &[u64]) -> Option<usize> {
    waiters
        .iter()
        .enumerate()
        .max_by_key(|(idx, &tid)| (effective_priority(tid), core::cmp::Reverse(*idx)))
        .map(|(idx, _)| idx)
}

struct SleepEntry {
    wake_tick: u64,
    seq: u64,
    handle: ParkHandle,
}

// A single global ready queue and sleep queue, the same way
// `keos::thread::scheduler::Fifo` keeps its run queue in a module-level
// `static` rather than an instance field — there is only ever one
// scheduler installed for the lifetime of the kernel, and single-core
// means there is no per-core state to carry either.
static READY: SpinLock<VecDeque<Box<Thread>>> = SpinLock::new(VecDeque::new());
static SLEEPING: SpinLock<Vec<SleepEntry>> = SpinLock::new(Vec::new());
static TICKS_SINCE_YIELD: AtomicU64 = AtomicU64::new(0);
static SLEEP_SEQ: AtomicU64 = AtomicU64::new(0);

/// The priority-donation / MLFQ scheduler.
///
/// Selects whichever ready thread has the highest effective priority
/// (priority-donation mode) or the highest recomputed MLFQ priority
/// (`mlfqs` mode); both share the same ready queue and selection code,
/// since MLFQ just changes how `base_priority` is written, not how the
/// queue is searched.
pub struct PriorityScheduler;

impl Default for PriorityScheduler {
    fn default() -> Self {
        Self::new(false)
    }
}

impl PriorityScheduler {
    /// Creates the scheduler. `mlfqs` mirrors the `-o mlfqs` kernel
    /// command-line token: when set, priority is derived from
    /// `recent_cpu`/`nice` rather than donation.
    pub fn new(mlfqs: bool) -> Self {
        MLFQS.store(mlfqs, Ordering::SeqCst);
        Self
    }

    /// Installs a [`PriorityScheduler`] reading its mode from the
    /// kernel command line and returns it for
    /// [`keos::SystemConfigurationBuilder::set_scheduler`].
    pub fn from_kernel_cmdline() -> Self {
        let mlfqs = keos::kernel_cmdline()
            .map(|s| s.split_whitespace().any(|tok| tok == "mlfqs"))
            .unwrap_or(false);
        Self::new(mlfqs)
    }

    /// Current global tick counter: one counter drives sleep wakeup,
    /// the 4-tick preemption counter, and the 1-second MLFQ recompute.
    pub fn ticks() -> u64 {
        TICKS.load(Ordering::SeqCst)
    }

    /// Blocks the current thread until [`Self::ticks`] reaches
    /// `wake_tick`.
    pub fn sleep_until(wake_tick: u64) {
        if wake_tick <= Self::ticks() {
            return;
        }
        let seq = SLEEP_SEQ.fetch_add(1, Ordering::SeqCst);
        keos::thread::Current::park_with(|handle| {
            let mut guard = SLEEPING.lock();
            guard.push(SleepEntry {
                wake_tick,
                seq,
                handle,
            });
            guard.unlock();
        });
    }
}

fn wake_sleepers(now: u64) {
    let mut guard = SLEEPING.lock();
    let mut ready = Vec::new();
    let mut remaining = Vec::new();
    for entry in guard.drain(..) {
        if entry.wake_tick <= now {
            ready.push(entry);
        } else {
            remaining.push(entry);
        }
    }
    *guard = remaining;
    guard.unlock();
    // Same-tick ties favor earlier insertion.
    ready.sort_by_key(|e| e.seq);
    for entry in ready {
        entry.handle.unpark();
    }
}

fn recompute_recent_cpu_and_priority() {
    let load_avg = load_avg();
    let coeff = (load_avg.mul_int(2)).div(load_avg.mul_int(2) + Fixed::from_int(1));
    let guard = SCHED_INFO.lock();
    let infos: Vec<(u64, Arc<SchedInfo>)> =
        guard.iter().map(|(&tid, info)| (tid, info.clone())).collect();
    guard.unlock();
    for (tid, info) in &infos {
        let mut rc = info.recent_cpu.lock();
        *rc = coeff.mul(*rc) + Fixed::from_int(info.nice.load(Ordering::SeqCst));
        rc.unlock();
        recompute_priority_one(*tid, info);
    }
}

fn recompute_priority_tick() {
    let guard = SCHED_INFO.lock();
    let infos: Vec<(u64, Arc<SchedInfo>)> =
        guard.iter().map(|(&tid, info)| (tid, info.clone())).collect();
    guard.unlock();
    for (tid, info) in &infos {
        recompute_priority_one(*tid, info);
    }
}

fn recompute_priority_one(tid: u64, info: &SchedInfo) {
    let rc = recent_cpu(tid);
    let nice = info.nice.load(Ordering::SeqCst);
    let pri = Fixed::from_int(PRI_MAX as i32) - rc.div_int(4) - Fixed::from_int(nice * 2);
    let clamped = pri.to_int_round().clamp(PRI_MIN as i32, PRI_MAX as i32);
    info.base_priority.store(clamped as u8, Ordering::SeqCst);
}

impl Scheduler for PriorityScheduler {
    fn next_to_run(&self) -> Option<Box<Thread>> {
        let mut guard = READY.lock();
        if guard.is_empty() {
            guard.unlock();
            return None;
        }
        let idx = guard
            .iter()
            .enumerate()
            .max_by_key(|(idx, th)| (effective_priority(th.tid), core::cmp::Reverse(*idx)))
            .map(|(idx, _)| idx)
            .unwrap();
        let th = guard.remove(idx);
        guard.unlock();
        TICKS_SINCE_YIELD.store(0, Ordering::SeqCst);
        th
    }

    fn push_to_queue(&self, th: Box<Thread>) {
        register_thread(th.tid, priority(th.tid));
        let mut guard = READY.lock();
        guard.push_back(th);
        guard.unlock();
    }

    fn timer_tick(&self) {
        let now = TICKS.fetch_add(1, Ordering::SeqCst) + 1;
        wake_sleepers(now);

        if MLFQS.load(Ordering::SeqCst) {
            let tid = keos::thread::Current::get_tid();
            let info = sched_info(tid);
            let mut rc = info.recent_cpu.lock();
            *rc += Fixed::from_int(1);
            rc.unlock();

            if now % TICKS_PER_SEC == 0 {
                let ready_threads = {
                    let guard = READY.lock();
                    let n = guard.len();
                    guard.unlock();
                    n as i32 + 1 // +1 for the running thread.
                };
                let mut load_avg = LOAD_AVG.lock();
                let fifty_nine_sixtieths = Fixed::from_int(59).div(Fixed::from_int(60));
                let one_sixtieth = Fixed::from_int(1).div(Fixed::from_int(60));
                *load_avg =
                    fifty_nine_sixtieths.mul(*load_avg) + one_sixtieth.mul_int(ready_threads);
                load_avg.unlock();
                recompute_recent_cpu_and_priority();
            } else if now % 4 == 0 {
                recompute_priority_tick();
            }
        }

        let slice = TICKS_SINCE_YIELD.fetch_add(1, Ordering::SeqCst) + 1;
        let should_yield = if slice >= TIME_SLICE {
            true
        } else {
            let tid = keos::thread::Current::get_tid();
            let running_pri = effective_priority(tid);
            let guard = READY.lock();
            let higher = guard.iter().any(|th| effective_priority(th.tid) > running_pri);
            guard.unlock();
            higher
        };
        if should_yield {
            keos::thread::scheduler::scheduler().reschedule();
        }
    }
}
