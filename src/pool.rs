//! Pinned worker pool: thread lifecycle, submission plumbing and shutdown

use crate::{
    queue::TaskQueue,
    task::{TaskFn, TaskPool, TaskRef},
    topology::{Pu, PuId, Topology},
    worker::Worker,
};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::{
    ffi::c_void,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

/// Polling period of the shutdown drain phase
const SHUTDOWN_POLL_PERIOD: Duration = Duration::from_micros(100);

/// Number of workers added per extension trigger
const EXTENSION_STEP: usize = 2;

/// Deferred callback run when the pool shuts down
pub type ShutdownCallback = Box<dyn FnOnce() + Send>;

/// Shutdown state machine: the pool only ever moves forward through these
const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const JOINING: u8 = 2;
const DEAD: u8 = 3;

/// State shared between the pool and all of its workers
#[derive(Debug)]
pub(crate) struct SharedState {
    /// One work queue per pinned worker, in topology order
    ///
    /// The queue set is frozen at construction even for extendible pools, so
    /// the PU → queue mapping handed to the scheduler stays stable.
    pub queues: Box<[CachePadded<TaskQueue<TaskRef>>]>,

    /// Recycled task records
    pub tasks: TaskPool,

    /// Set when shutdown begins; gates pool extension
    pub done: AtomicBool,

    /// One flag per worker, raised while that worker waits for work
    ///
    /// Grows past the pinned workers when an extendible pool extends itself.
    pub availability: Mutex<Vec<Arc<AtomicBool>>>,
}

/// Pool of worker threads, one pinned to each PU in use
///
/// Workers execute submitted tasks to completion without preemption; the
/// submitter never waits. Dropping the pool shuts it down: queues are
/// invalidated, remaining work is drained, workers are joined, deferred
/// callbacks run.
pub struct WorkerPool {
    /// Shared state
    shared: Arc<SharedState>,

    /// Worker threads; grows when the pool is extendible
    threads: Mutex<Vec<JoinHandle<()>>>,

    /// PU pinned by each queue's worker, in topology order
    pinned_pus: Vec<PuId>,

    /// Whether the pool may spawn extra workers under load
    extendible: bool,

    /// Shutdown state machine position
    state: AtomicU8,

    /// Deferred callbacks, run in submission order at the end of shutdown
    shutdown_callbacks: TaskQueue<ShutdownCallback>,
}
//
impl WorkerPool {
    /// Create a pool with one pinned worker per PU of `topology`
    pub fn new(topology: &Topology, extendible: bool) -> Self {
        Self::with_worker_count(topology, extendible, topology.num_pus())
    }

    /// Create a pool over the first `num_workers` PUs in topology order
    ///
    /// # Panics
    ///
    /// Panics if `num_workers` is zero or exceeds the number of PUs.
    pub fn with_worker_count(topology: &Topology, extendible: bool, num_workers: usize) -> Self {
        assert!(
            num_workers > 0,
            "a pool without workers can't make progress and will never drain a submission"
        );
        assert!(
            num_workers <= topology.num_pus(),
            "can't pin more workers than there are PUs"
        );
        let pinned_pus: Vec<PuId> = topology.pus()[..num_workers].iter().map(Pu::id).collect();

        let queues = (0..num_workers)
            .map(|_| CachePadded::new(TaskQueue::new()))
            .collect();
        let shared = Arc::new(SharedState {
            queues,
            tasks: TaskPool::new(),
            done: AtomicBool::new(false),
            availability: Mutex::new(Vec::with_capacity(num_workers)),
        });

        let mut threads = Vec::with_capacity(num_workers);
        for &pu in &pinned_pus {
            Self::spawn_worker(&shared, &mut threads, Some(pu));
        }

        Self {
            shared,
            threads: Mutex::new(threads),
            pinned_pus,
            extendible,
            state: AtomicU8::new(RUNNING),
            shutdown_callbacks: TaskQueue::new(),
        }
    }

    /// Submit a task onto the queue at `queue_index` and detach from it
    ///
    /// Returns whether the task was enqueued: a submission racing with
    /// shutdown may be discarded, in which case its record is recycled and
    /// `f` will never run. No completion notification is produced either way.
    ///
    /// # Safety
    ///
    /// `arg` must point to data that is safe to hand to another thread and
    /// that outlives the task's execution.
    ///
    /// # Panics
    ///
    /// Panics if `queue_index` is out of range.
    pub unsafe fn submit_and_detach(&self, f: TaskFn, arg: *mut c_void, queue_index: usize) -> bool {
        let task = self.shared.tasks.lease();
        // SAFETY: We hold the only lease and the record is not enqueued yet
        unsafe { task.set_payload(f, arg) };
        let submitted = match self.shared.queues[queue_index].push(task) {
            Ok(()) => true,
            Err(task) => {
                // The queue was invalidated by a concurrent shutdown
                self.shared.tasks.release(task);
                log::trace!("discarded a submission to invalidated queue #{queue_index}");
                false
            }
        };
        if submitted {
            self.maybe_extend();
        }
        submitted
    }

    /// Submit a closure onto the queue at `queue_index` and detach from it
    ///
    /// Safe counterpart of [`submit_and_detach()`](Self::submit_and_detach):
    /// the closure is boxed and run through a trampoline on the worker.
    pub fn submit_once<F: FnOnce() + Send + 'static>(&self, f: F, queue_index: usize) -> bool {
        let arg = Box::into_raw(Box::new(f)).cast::<c_void>();
        // SAFETY: The boxed closure is 'static and Send, and stays alive until
        //         the trampoline reclaims it on the worker
        let submitted = unsafe { self.submit_and_detach(closure_trampoline::<F>, arg, queue_index) };
        if !submitted {
            // SAFETY: The submission was discarded, the trampoline will never
            //         run, so the box is ours again
            drop(unsafe { Box::from_raw(arg.cast::<F>()) });
        }
        submitted
    }

    /// Queue index feeding the worker pinned to `pu`, if any
    pub fn queue_index_of(&self, pu: PuId) -> Option<usize> {
        self.pinned_pus.iter().position(|&pinned| pinned == pu)
    }

    /// PUs with a pinned worker, in topology order (= queue index order)
    pub fn worker_pus(&self) -> &[PuId] {
        &self.pinned_pus
    }

    /// Number of worker threads currently alive
    pub fn worker_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// Number of submitted tasks that did not start executing yet
    pub fn pending_tasks(&self) -> u64 {
        self.shared
            .queues
            .iter()
            .map(|queue| queue.len() as u64)
            .sum()
    }

    /// Number of workers currently waiting for work
    pub fn idle_workers(&self) -> usize {
        self.shared
            .availability
            .lock()
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count()
    }

    /// Number of task records ever allocated
    ///
    /// Bounded by the peak number of concurrently outstanding tasks.
    pub fn allocated_records(&self) -> usize {
        self.shared.tasks.allocated()
    }

    /// Number of task records currently leased to outstanding tasks
    ///
    /// Zero once the pool has shut down.
    pub fn outstanding_records(&self) -> usize {
        self.shared.tasks.outstanding()
    }

    /// Register a callback to run when the pool shuts down
    ///
    /// Callbacks run on the thread driving the shutdown, in registration
    /// order, after every worker has been joined.
    pub fn append_shutdown_callback(&self, callback: impl FnOnce() + Send + 'static) {
        if self.shutdown_callbacks.push(Box::new(callback)).is_err() {
            log::warn!("dropped a shutdown callback appended after shutdown");
        }
    }

    /// Shut the pool down, waiting for all submitted work to finish
    ///
    /// Idempotent: only the first call does anything, later calls (including
    /// the one from `Drop`) are no-ops.
    pub fn shutdown(&self) {
        // RUNNING -> DRAINING is the only contended transition
        if self
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        log::debug!("pool shutting down, draining {} pending tasks", self.pending_tasks());
        self.shared.done.store(true, Ordering::Release);
        for queue in self.shared.queues.iter() {
            queue.invalidate();
        }

        // Drain: wait until every worker has gone idle for good. A worker may
        // still be inside its last task when all flags read false; the join
        // below covers that window.
        loop {
            let all_lowered = self
                .shared
                .availability
                .lock()
                .iter()
                .all(|flag| !flag.load(Ordering::Acquire));
            if all_lowered {
                break;
            }
            std::thread::sleep(SHUTDOWN_POLL_PERIOD);
        }

        self.state.store(JOINING, Ordering::Release);
        for thread in self.threads.lock().drain(..) {
            if thread.join().is_err() {
                log::error!("a worker thread panicked outside of task execution");
            }
        }

        // Deferred callbacks, in registration order
        self.shutdown_callbacks.invalidate();
        while let Some(callback) = self.shutdown_callbacks.try_pop() {
            callback();
        }
        self.state.store(DEAD, Ordering::Release);
        log::debug!("pool is down");
    }

    /// Whether the pool has fully shut down
    pub fn is_shut_down(&self) -> bool {
        self.state.load(Ordering::Acquire) == DEAD
    }

    /// Spawn extra workers if the pool is extendible and the backlog justifies
    /// it
    ///
    /// Extended workers are not pinned and consume from the existing queues.
    fn maybe_extend(&self) {
        if !self.extendible || self.shared.done.load(Ordering::Acquire) {
            return;
        }
        if (self.idle_workers() as u64) < self.pending_tasks() {
            let mut threads = self.threads.lock();
            for _ in 0..EXTENSION_STEP {
                Self::spawn_worker(&self.shared, &mut threads, None);
            }
            log::debug!("extended the pool to {} workers", threads.len());
        }
    }

    /// Start one worker thread
    ///
    /// The worker consumes from the queue at its index modulo the queue
    /// count, so pinned workers (spawned first) get a queue of their own and
    /// extended workers share the existing ones.
    fn spawn_worker(
        shared: &Arc<SharedState>,
        threads: &mut Vec<JoinHandle<()>>,
        pin_target: Option<PuId>,
    ) {
        let idx = threads.len();
        let queue_idx = idx % shared.queues.len();
        let availability = Arc::new(AtomicBool::new(true));
        shared.availability.lock().push(availability.clone());
        let shared = shared.clone();
        let name = match pin_target {
            Some(pu) => format!("sisal worker #{idx} ({pu})"),
            None => format!("sisal worker #{idx} (unpinned)"),
        };
        threads.push(
            std::thread::Builder::new()
                .name(name)
                .spawn(move || Worker::run(shared, idx, queue_idx, availability, pin_target))
                .expect("failed to spawn worker thread"),
        );
    }
}
//
impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Shutdown callbacks are opaque closures, everything else shows
        f.debug_struct("WorkerPool")
            .field("shared", &self.shared)
            .field("threads", &self.threads)
            .field("pinned_pus", &self.pinned_pus)
            .field("extendible", &self.extendible)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
//
impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Entry point that unboxes and runs a closure submitted via `submit_once()`
fn closure_trampoline<F: FnOnce()>(arg: *mut c_void) {
    // SAFETY: `arg` was produced by Box::into_raw over an F in submit_once
    let f = unsafe { Box::from_raw(arg.cast::<F>()) };
    f()
}
