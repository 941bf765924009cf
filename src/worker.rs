//! Per-worker dispatch loop

use crate::{pool::SharedState, task::TaskRef, topology::PuId};
use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Worker thread state
#[derive(Debug)]
pub(crate) struct Worker {
    /// Access to the shared state
    shared: Arc<SharedState>,

    /// Index of this worker in the pool's thread table
    idx: usize,

    /// Index of the queue this worker consumes from
    ///
    /// Equal to `idx` for the pinned workers created at pool construction;
    /// extended workers share the existing queues instead.
    queue_idx: usize,

    /// Raised while this worker is blocked waiting for work, lowered for good
    /// when it exits
    availability: Arc<AtomicBool>,

    /// PU this worker should execute on, if any
    pin_target: Option<PuId>,
}
//
impl Worker {
    /// Set up and run the worker
    pub fn run(
        shared: Arc<SharedState>,
        idx: usize,
        queue_idx: usize,
        availability: Arc<AtomicBool>,
        pin_target: Option<PuId>,
    ) {
        let worker = Self {
            shared,
            idx,
            queue_idx,
            availability,
            pin_target,
        };
        worker.pin();
        worker.main();
    }

    /// Bind this thread to its assigned PU, before first blocking on the queue
    ///
    /// A refused binding is not fatal: the worker keeps running unpinned.
    fn pin(&self) {
        let Some(pu) = self.pin_target else {
            return;
        };
        if core_affinity::set_for_current(core_affinity::CoreId { id: pu.0 }) {
            log::trace!("worker #{} pinned to {pu}", self.idx);
        } else {
            log::warn!(
                "worker #{} failed to pin to {pu}, running unpinned",
                self.idx
            );
        }
    }

    /// Main dispatch loop
    fn main(&self) {
        loop {
            self.availability.store(true, Ordering::Release);
            // A None pop means the queue was invalidated and fully drained
            let Some(task) = self.shared.queues[self.queue_idx].wait_pop() else {
                break;
            };
            self.availability.store(false, Ordering::Release);
            self.execute(task);
        }
        // Lower the flag for good so shutdown can observe that we are gone
        self.availability.store(false, Ordering::Release);
        log::trace!("worker #{} exiting", self.idx);
    }

    /// Run one task and return its record to the object pool
    fn execute(&self, task: TaskRef) {
        // A panicking task must not take the worker (or its siblings) down
        // SAFETY: We popped this record from our queue, so the submitter has
        //         finished writing the payload and handed the record over.
        let result = std::panic::catch_unwind(AssertUnwindSafe(|| unsafe { task.execute() }));
        if result.is_err() {
            log::error!(
                "worker #{}: task record #{} panicked, continuing",
                self.idx,
                task.id()
            );
        }
        self.shared.tasks.release(task);
    }
}
