//! Topology-aware, weight-balanced pinned worker pool
//!
//! This crate dispatches short C-style compute tasks (`fn(*mut c_void)` plus
//! an opaque argument) across the logical processors of one machine. Each
//! submission carries a caller-estimated *weight*; the scheduler picks the PU
//! whose strength-normalized work ledger would stay lowest, and a worker
//! pinned to that PU runs the task to completion. Submitters never wait:
//! completion signaling (releasing a caller-held lock, bumping a counter...)
//! is the task's own business.
//!
//! The three load-bearing pieces are the immutable [machine
//! model](topology::Topology), the [pinned worker pool](pool::WorkerPool)
//! with one FIFO [queue](queue::TaskQueue) and one recycled-record path per
//! worker, and the [weight-balancing scheduler](scheduler::Scheduler).
//! [`BalancedPool`] bundles the three for embedders who don't need to hold
//! the pieces separately.
//!
//! ```
//! use sisal::{BalancedPool, Topology};
//! use std::sync::{
//!     atomic::{AtomicUsize, Ordering},
//!     Arc,
//! };
//!
//! let topology = Topology::homogeneous([0, 1]).expect("well-formed descriptor");
//! let pool = BalancedPool::new(topology, false);
//!
//! let done = Arc::new(AtomicUsize::new(0));
//! for _ in 0..10 {
//!     let done = done.clone();
//!     pool.submit_once(
//!         move || {
//!             done.fetch_add(1, Ordering::Relaxed);
//!         },
//!         1, // weight
//!         0, // locality island
//!     );
//! }
//! pool.shutdown(); // waits for all ten tasks
//! assert_eq!(done.load(Ordering::Relaxed), 10);
//! ```

#![warn(clippy::print_stdout, clippy::print_stderr, clippy::dbg_macro)]

pub mod pool;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod topology;
mod worker;

pub use crate::{
    pool::WorkerPool,
    queue::TaskQueue,
    scheduler::{LocalityIsland, Scheduler, TaskWeight, WEIGHT_GRANULARITY},
    task::TaskFn,
    topology::{PuId, Strength, Topology, TopologyBuilder, TopologyError},
};

use std::{ffi::c_void, sync::Arc};

#[cfg(feature = "queue-sleep")]
use std::time::Duration;

/// Initial sleep interval of the back-off ramp used by the sleeping queue
/// variant
#[cfg(feature = "queue-sleep")]
pub(crate) const SLEEP_RAMP_START: Duration = Duration::from_micros(4);

/// Ceiling of the back-off ramp used by the sleeping queue variant
#[cfg(feature = "queue-sleep")]
pub(crate) const SLEEP_RAMP_CEILING: Duration = Duration::from_millis(10);

/// One-stop facade bundling a topology, a pinned worker pool and a scheduler
///
/// Owns all three subsystems in the right teardown order. Embedders that need
/// finer control (direct per-queue submission, a pool subset, several
/// schedulers) can assemble the pieces themselves instead.
#[derive(Debug)]
pub struct BalancedPool {
    /// Machine model the pool was built over
    topology: Arc<Topology>,

    /// Pinned workers and their queues
    pool: Arc<WorkerPool>,

    /// Weight-balancing dispatch policy
    scheduler: Scheduler,
}
//
impl BalancedPool {
    /// Pool with one pinned worker per PU of `topology`
    pub fn new(topology: Topology, extendible: bool) -> Self {
        let num_workers = topology.num_pus();
        Self::with_worker_count(topology, extendible, num_workers)
    }

    /// Pool over the first `num_workers` PUs of `topology`, in topology order
    ///
    /// # Panics
    ///
    /// Panics if `num_workers` is zero or exceeds the number of PUs.
    pub fn with_worker_count(topology: Topology, extendible: bool, num_workers: usize) -> Self {
        let topology = Arc::new(topology);
        let pool = Arc::new(WorkerPool::with_worker_count(
            &topology, extendible, num_workers,
        ));
        let scheduler = Scheduler::new(pool.clone(), &topology);
        Self {
            topology,
            pool,
            scheduler,
        }
    }

    /// Submit a task for execution on the most appropriate PU
    ///
    /// Returns the id of the PU the task was dispatched to.
    ///
    /// # Safety
    ///
    /// `arg` must point to data that is safe to hand to another thread and
    /// that outlives the task's execution.
    pub unsafe fn submit(
        &self,
        f: TaskFn,
        arg: *mut c_void,
        weight: TaskWeight,
        island: LocalityIsland,
    ) -> PuId {
        // SAFETY: Per this function's own contract
        unsafe { self.scheduler.submit(f, arg, weight, island) }
    }

    /// Submit a closure for execution on the most appropriate PU
    pub fn submit_once<F: FnOnce() + Send + 'static>(
        &self,
        f: F,
        weight: TaskWeight,
        island: LocalityIsland,
    ) -> PuId {
        self.scheduler.submit_once(f, weight, island)
    }

    /// Work ledgers of all PUs, in topology order (diagnostics)
    pub fn dump_histories(&self) -> Vec<(PuId, u64)> {
        self.scheduler.dump_histories()
    }

    /// The underlying worker pool
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// The machine model the pool was built over
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Shut everything down, waiting for all submitted work to finish
    ///
    /// Idempotent; also runs when the facade is dropped.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
