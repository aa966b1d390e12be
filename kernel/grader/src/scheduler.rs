//! Priority donation and MLFQ tests, exercising `kernel::scheduler`
//! directly the same way the round-robin scheduler's own test suite pokes
//! `Scheduler::next_to_run`/`push_to_queue` instead of only observing
//! outcomes through running threads.
use alloc::{sync::Arc, vec::Vec};
use keos::{
    sync::atomic::{AtomicBool, AtomicU64},
    thread::ThreadBuilder,
};
use kernel::{
    fixed_point::Fixed,
    scheduler::{self, PRI_DEFAULT, PRI_MAX, PRI_MIN},
    sync::Mutex,
    PriorityScheduler,
};

/// A low-priority holder should have its effective priority raised to
/// match a higher-priority thread blocked on a lock it holds, and the
/// donation should disappear again once the lock is released.
pub fn donation_raises_effective_priority() {
    let mutex = Arc::new(Mutex::new(()));
    let low_tid = Arc::new(AtomicU64::new(0));
    let holder_may_release = Arc::new(AtomicBool::new(false));

    let guard = mutex.lock();
    let holder = {
        let (mutex, low_tid, holder_may_release) =
            (mutex.clone(), low_tid.clone(), holder_may_release.clone());
        ThreadBuilder::new("low").spawn(move || {
            low_tid.store(keos::thread::Current::get_tid());
            scheduler::set_priority(keos::thread::Current::get_tid(), PRI_MIN + 1);
            // Blocks immediately: the test thread is still holding `mutex`.
            let g = mutex.lock();
            while !holder_may_release.load() {
                core::hint::spin_loop();
            }
            g.unlock();
        })
    };
    while low_tid.load() == 0 {
        core::hint::spin_loop();
    }
    guard.unlock();
    // Now the spawned thread holds the lock. Block a high-priority waiter
    // on it.
    let low = low_tid.load();
    let high_waiting = Arc::new(AtomicBool::new(false));
    let waiter = {
        let (mutex, high_waiting) = (mutex.clone(), high_waiting.clone());
        ThreadBuilder::new("high").spawn(move || {
            scheduler::set_priority(keos::thread::Current::get_tid(), PRI_MAX - 1);
            high_waiting.store(true);
            let g = mutex.lock();
            g.unlock();
        })
    };
    while !high_waiting.load() {
        core::hint::spin_loop();
    }
    for _ in 0..20000 {
        core::hint::spin_loop();
    }

    assert_eq!(
        scheduler::effective_priority(low),
        PRI_MAX - 1,
        "holder should inherit the blocked waiter's priority"
    );

    holder_may_release.store(true);
    holder.join();
    waiter.join();

    assert_eq!(
        scheduler::effective_priority(low),
        PRI_MIN + 1,
        "donation should not outlive the lock that caused it"
    );
}

/// Donation chains through a thread that is itself both a waiter on one
/// lock and the holder of another: raising the priority of the thread at
/// the end of the chain must propagate all the way back to the first
/// holder.
pub fn donation_transitive_chain() {
    let lock_a = Arc::new(Mutex::new(()));
    let lock_b = Arc::new(Mutex::new(()));
    let low_tid = Arc::new(AtomicU64::new(0));
    let mid_tid = Arc::new(AtomicU64::new(0));

    let guard_a = lock_a.lock();
    let low = {
        let (lock_a, low_tid) = (lock_a.clone(), low_tid.clone());
        ThreadBuilder::new("low").spawn(move || {
            low_tid.store(keos::thread::Current::get_tid());
            scheduler::set_priority(keos::thread::Current::get_tid(), PRI_MIN + 1);
            let g = lock_a.lock();
            for _ in 0..40000 {
                core::hint::spin_loop();
            }
            g.unlock();
        })
    };
    while low_tid.load() == 0 {
        core::hint::spin_loop();
    }
    guard_a.unlock();

    let guard_b = lock_b.lock();
    let mid = {
        let (lock_a, lock_b, mid_tid) = (lock_a.clone(), lock_b.clone(), mid_tid.clone());
        ThreadBuilder::new("mid").spawn(move || {
            mid_tid.store(keos::thread::Current::get_tid());
            scheduler::set_priority(keos::thread::Current::get_tid(), PRI_DEFAULT);
            let gb = lock_b.lock();
            let ga = lock_a.lock();
            ga.unlock();
            gb.unlock();
        })
    };
    while mid_tid.load() == 0 {
        core::hint::spin_loop();
    }
    for _ in 0..10000 {
        core::hint::spin_loop();
    }
    guard_b.unlock();

    let high = ThreadBuilder::new("high").spawn({
        let lock_b = lock_b.clone();
        move || {
            scheduler::set_priority(keos::thread::Current::get_tid(), PRI_MAX);
            let g = lock_b.lock();
            g.unlock();
        }
    });

    for _ in 0..20000 {
        core::hint::spin_loop();
    }
    assert_eq!(
        scheduler::effective_priority(low_tid.load()),
        PRI_MAX,
        "priority should donate transitively across the mid thread's own wait"
    );

    low.join();
    mid.join();
    high.join();
}

/// Releasing the lock a thread was donated priority for must restore its
/// own, undonated priority.
pub fn donation_reverts_on_release() {
    let mutex = Arc::new(Mutex::new(0usize));
    let tid = Arc::new(AtomicU64::new(0));
    let release = Arc::new(AtomicBool::new(false));

    let guard = mutex.lock();
    let holder = {
        let (mutex, tid, release) = (mutex.clone(), tid.clone(), release.clone());
        ThreadBuilder::new("holder").spawn(move || {
            tid.store(keos::thread::Current::get_tid());
            scheduler::set_priority(keos::thread::Current::get_tid(), 5);
            let g = mutex.lock();
            while !release.load() {
                core::hint::spin_loop();
            }
            g.unlock();
        })
    };
    while tid.load() == 0 {
        core::hint::spin_loop();
    }
    guard.unlock();

    let waiter = {
        let mutex = mutex.clone();
        ThreadBuilder::new("waiter").spawn(move || {
            scheduler::set_priority(keos::thread::Current::get_tid(), 50);
            let g = mutex.lock();
            g.unlock();
        })
    };
    for _ in 0..20000 {
        core::hint::spin_loop();
    }
    assert_eq!(scheduler::effective_priority(tid.load()), 50);

    release.store(true);
    holder.join();
    waiter.join();
    assert_eq!(scheduler::effective_priority(tid.load()), 5);
}

/// Threads blocked on the same semaphore, at different priorities, should
/// be woken in decreasing effective-priority order as permits trickle in
/// one at a time, ties broken by the order they started waiting in —
/// exercising `scheduler::highest_priority_waiter` through the public
/// `Semaphore`/`ConditionVariable` wakeup path rather than the scheduler's
/// own ready queue (which is shared with the live, running kernel and not
/// safe to poke with throwaway `Thread` objects).
pub fn priority_queue_selects_highest() {
    use kernel::sync::Semaphore;

    let sema = Arc::new(Semaphore::new(0, ()));
    let waiting = Arc::new(AtomicU64::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let names_and_pri = [("a", 10u8), ("b", 50), ("c", 50), ("d", 30)];
    let mut handles = Vec::new();
    for (name, pri) in names_and_pri {
        let (sema, waiting, order) = (sema.clone(), waiting.clone(), order.clone());
        handles.push(ThreadBuilder::new(name).spawn(move || {
            scheduler::set_priority(keos::thread::Current::get_tid(), pri);
            waiting.fetch_add(1);
            let permit = sema.wait();
            let mut g = order.lock();
            g.push(name);
            g.unlock();
            core::mem::forget(permit);
        }));
    }
    while waiting.load() != names_and_pri.len() as u64 {
        core::hint::spin_loop();
    }
    for _ in 0..20000 {
        core::hint::spin_loop();
    }

    for _ in 0..names_and_pri.len() {
        sema.signal();
        for _ in 0..20000 {
            core::hint::spin_loop();
        }
    }
    for h in handles {
        h.join();
    }

    let g = order.lock();
    assert_eq!(*g, alloc::vec!["b", "c", "d", "a"]);
    g.unlock();
}

/// Threads sleeping until different tick deadlines should wake up in
/// deadline order, not insertion order.
pub fn sleep_wakes_in_tick_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let base = PriorityScheduler::ticks();

    let late = {
        let order = order.clone();
        ThreadBuilder::new("late").spawn(move || {
            PriorityScheduler::sleep_until(base + 40);
            let mut g = order.lock();
            g.push(2);
            g.unlock();
        })
    };
    let early = {
        let order = order.clone();
        ThreadBuilder::new("early").spawn(move || {
            PriorityScheduler::sleep_until(base + 10);
            let mut g = order.lock();
            g.push(1);
            g.unlock();
        })
    };

    early.join();
    late.join();

    let g = order.lock();
    assert_eq!(*g, alloc::vec![1, 2]);
    g.unlock();
}

/// A thread that spins continuously should accumulate `recent_cpu` and
/// have its MLFQ priority drop below a thread that spends the same real
/// time asleep, and niceness should bias the formula in the expected
/// direction.
pub fn mlfq_hog_drops_below_idle() {
    PriorityScheduler::new(true);

    let stop = Arc::new(AtomicBool::new(false));
    let hog_tid = Arc::new(AtomicU64::new(0));
    let idle_tid = Arc::new(AtomicU64::new(0));

    let hog = {
        let (stop, hog_tid) = (stop.clone(), hog_tid.clone());
        ThreadBuilder::new("hog").spawn(move || {
            hog_tid.store(keos::thread::Current::get_tid());
            while !stop.load() {
                core::hint::spin_loop();
            }
        })
    };
    let idle = {
        let idle_tid = idle_tid.clone();
        let start = PriorityScheduler::ticks();
        ThreadBuilder::new("idle").spawn(move || {
            idle_tid.store(keos::thread::Current::get_tid());
            PriorityScheduler::sleep_until(start + 500);
        })
    };
    while hog_tid.load() == 0 || idle_tid.load() == 0 {
        core::hint::spin_loop();
    }

    let start = PriorityScheduler::ticks();
    PriorityScheduler::sleep_until(start + 500);
    stop.store(true);
    hog.join();
    idle.join();

    assert!(
        scheduler::recent_cpu(hog_tid.load()) > Fixed::ZERO,
        "a continuously running thread should accumulate recent_cpu"
    );
    assert!(
        scheduler::priority(hog_tid.load()) < scheduler::priority(idle_tid.load()),
        "a CPU hog's MLFQ priority should fall below an idle thread's"
    );

    // Restore priority-donation mode for every test that runs after this
    // one.
    PriorityScheduler::new(false);
}

/// 17.14 fixed-point arithmetic, the building block the MLFQ formulas
/// above are computed with.
pub mod fixed_point {
    use kernel::fixed_point::Fixed;

    pub fn int_roundtrip() {
        assert_eq!(Fixed::from_int(59).to_int_trunc(), 59);
        assert_eq!(Fixed::from_int(-59).to_int_trunc(), -59);
    }

    pub fn rounding_matches_nearest() {
        // 59/60 in fixed point, rounded, should be 1.
        let f = Fixed::from_int(59).div(Fixed::from_int(60));
        assert_eq!(f.to_int_round(), 1);
        assert_eq!(f.to_int_trunc(), 0);
    }

    pub fn mul_div_precision() {
        // (1/3) * 3 should recover 1 within a fractional unit of rounding.
        let third = Fixed::from_int(1).div(Fixed::from_int(3));
        let back = third.mul_int(3);
        assert_eq!(back.to_int_round(), 1);
    }

    pub fn negative_mul() {
        let a = Fixed::from_int(-2);
        let b = Fixed::from_int(3);
        assert_eq!(a.mul(b).to_int_trunc(), -6);
    }

    pub fn load_avg_decay_shape() {
        // load_avg' = (59/60)*load_avg + (1/60)*ready_threads, starting from
        // zero with one ready thread, should climb toward but never reach 1.
        let fifty_nine_sixtieths = Fixed::from_int(59).div(Fixed::from_int(60));
        let one_sixtieth = Fixed::from_int(1).div(Fixed::from_int(60));
        let mut load_avg = Fixed::ZERO;
        for _ in 0..100 {
            load_avg = fifty_nine_sixtieths.mul(load_avg) + one_sixtieth.mul_int(1);
        }
        assert!(load_avg.to_int_trunc() <= 1);
        assert!(load_avg > Fixed::ZERO);
    }
}
