//! End-to-end scenarios exercising the public API only

use sisal::{topology::TopologyBuilder, BalancedPool, PuId, Topology};
use std::{
    ffi::c_void,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Condvar, Mutex,
    },
};

/// The heterogeneous two-PU machine the scheduler was originally tuned on
fn heterogeneous_machine() -> Topology {
    let mut builder = TopologyBuilder::new();
    let socket = builder.socket();
    let numa_node = builder.numa_node();
    let core = builder.core(socket, numa_node);
    builder.pu(core, PuId(24), 100_000);
    builder.pu(core, PuId(26), 70_000);
    builder.build().expect("descriptor is well-formed")
}

#[test]
fn heterogeneous_dispatch_follows_strengths() {
    let pool = BalancedPool::new(heterogeneous_machine(), false);
    let executed = Arc::new(AtomicUsize::new(0));

    let mut per_pu = [0u32; 2];
    for _ in 0..17 {
        let executed = executed.clone();
        let pu = pool.submit_once(
            move || {
                executed.fetch_add(1, Ordering::Relaxed);
            },
            1,
            0,
        );
        let slot = match pu {
            PuId(24) => 0,
            PuId(26) => 1,
            other => panic!("dispatched to unknown {other}"),
        };
        per_pu[slot] += 1;
    }

    // Strong PU gets work in the 10:7 strength ratio
    assert_eq!(per_pu, [10, 7]);

    pool.shutdown();
    assert_eq!(executed.load(Ordering::Relaxed), 17);
    assert_eq!(pool.pool().outstanding_records(), 0);
}

#[test]
fn topology_is_immutable_across_the_pool_lifetime() {
    let pool = BalancedPool::new(heterogeneous_machine(), false);
    let before: Vec<_> = pool
        .topology()
        .pus()
        .iter()
        .map(|pu| (pu.id(), pu.isolated_strength()))
        .collect();

    for i in 0..50 {
        pool.submit_once(|| {}, i % 7, 0);
    }
    pool.shutdown();

    let after: Vec<_> = pool
        .topology()
        .pus()
        .iter()
        .map(|pu| (pu.id(), pu.isolated_strength()))
        .collect();
    assert_eq!(before, after);
    assert_eq!(pool.topology().max_strength(), 100_000);
}

#[test]
fn single_pu_machine_receives_everything() {
    let topology = Topology::homogeneous([0]).expect("descriptor is well-formed");
    let pool = BalancedPool::new(topology, false);
    for _ in 0..25 {
        assert_eq!(pool.submit_once(|| {}, 3, 0), PuId(0));
    }
    // The lone ledger keeps growing: 25 tasks of weight 3
    assert_eq!(pool.dump_histories(), vec![(PuId(0), 75_000)]);
    pool.shutdown();
}

/// Completion signaling in the style the C-function path is meant for: the
/// task flips caller-owned state and the caller waits on it
#[test]
fn raw_task_signals_its_own_completion() {
    struct Completion {
        done: Mutex<bool>,
        signal: Condvar,
    }

    fn task(arg: *mut c_void) {
        // SAFETY: The submitter keeps the Completion alive until signaled
        let completion = unsafe { &*arg.cast::<Completion>() };
        *completion.done.lock().unwrap() = true;
        completion.signal.notify_one();
    }

    let pool = BalancedPool::new(heterogeneous_machine(), false);
    let completion = Box::new(Completion {
        done: Mutex::new(false),
        signal: Condvar::new(),
    });
    let arg = std::ptr::addr_of!(*completion).cast_mut().cast::<c_void>();

    // SAFETY: `completion` outlives the wait below, which outlives the task
    let pu = unsafe { pool.submit(task, arg, 5, 0) };
    assert!(pu == PuId(24) || pu == PuId(26));

    let mut done = completion.done.lock().unwrap();
    while !*done {
        done = completion.signal.wait(done).unwrap();
    }
    drop(done);
    pool.shutdown();
}

#[test]
fn shutdown_callbacks_observe_a_quiet_pool() {
    let pool = BalancedPool::new(heterogeneous_machine(), false);
    let executed = Arc::new(AtomicUsize::new(0));
    for _ in 0..30 {
        let executed = executed.clone();
        pool.submit_once(
            move || {
                executed.fetch_add(1, Ordering::Relaxed);
            },
            2,
            0,
        );
    }

    let seen_at_shutdown = Arc::new(AtomicUsize::new(0));
    {
        let executed = executed.clone();
        let seen_at_shutdown = seen_at_shutdown.clone();
        pool.pool().append_shutdown_callback(move || {
            seen_at_shutdown.store(executed.load(Ordering::Relaxed), Ordering::Relaxed);
        });
    }

    pool.shutdown();
    // The callback ran after every submitted task had finished
    assert_eq!(seen_at_shutdown.load(Ordering::Relaxed), 30);
}
