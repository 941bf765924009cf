//! Reusable task records and the grow-only pool that recycles them
//!
//! Every submission borrows a fixed-size record holding the task's function
//! pointer and opaque argument. Records are returned to the pool by the
//! worker that executed them and handed out again on later submissions, so
//! steady-state dispatch performs no allocation at all. The pool only grows,
//! bounded by the peak number of concurrently outstanding tasks.

use std::{
    cell::UnsafeCell,
    ffi::c_void,
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

/// C-style task entry point, receiving the opaque argument passed at
/// submission
///
/// The pool passes the argument through unchanged and never interprets it.
/// Completion signaling (releasing a caller-held lock, bumping a counter...)
/// is the task's own business.
pub type TaskFn = fn(*mut c_void);

/// Placeholder payload of freshly allocated records
fn noop(_arg: *mut c_void) {}

/// Fixed-size, reusable record describing one submitted task
///
/// Only `available` changes after a lease, and only through [`TaskPool`]. The
/// payload is written by the lease holder before the record is pushed on a
/// queue and read by the worker that pops it; the queue's internal lock
/// provides the happens-before edge between the two.
#[derive(Debug)]
pub(crate) struct TaskRecord {
    /// Position in the pool's record table, stable for the pool's lifetime
    id: u64,

    /// Whether the record is free for reuse; flipped under the pool's lock
    available: AtomicBool,

    /// Function to execute
    func: UnsafeCell<TaskFn>,

    /// Opaque argument handed to `func`
    arg: UnsafeCell<*mut c_void>,
}
//
// SAFETY: The record itself never dereferences `arg`; it is a courier between
//         the submitting thread and the executing worker. The submitter
//         vouches for the pointed-to data being safe to hand across threads
//         when it calls the unsafe submission entry points.
unsafe impl Send for TaskRecord {}
unsafe impl Sync for TaskRecord {}
//
impl TaskRecord {
    /// Set up a record; fresh records are born leased
    fn new(id: u64) -> Self {
        Self {
            id,
            available: AtomicBool::new(false),
            func: UnsafeCell::new(noop),
            arg: UnsafeCell::new(std::ptr::null_mut()),
        }
    }

    /// Stable identifier assigned at allocation
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Overwrite the payload
    ///
    /// # Safety
    ///
    /// May only be called by the current lease holder, before the record is
    /// pushed on a queue.
    pub unsafe fn set_payload(&self, func: TaskFn, arg: *mut c_void) {
        // SAFETY: Lease exclusivity makes us the only writer, and no worker
        //         can be reading yet since the record isn't enqueued.
        unsafe {
            *self.func.get() = func;
            *self.arg.get() = arg;
        }
    }

    /// Run the task
    ///
    /// # Safety
    ///
    /// May only be called by the worker that popped this record from a queue,
    /// at most once per lease.
    pub unsafe fn execute(&self) {
        // SAFETY: The pop that delivered this record to us synchronizes with
        //         the push that followed `set_payload()`, and the lease holder
        //         stopped writing at the push.
        let (func, arg) = unsafe { (*self.func.get(), *self.arg.get()) };
        func(arg);
    }
}

/// Shared handle to a leased [`TaskRecord`]
///
/// This is what worker queues carry. It is only ever created by
/// [`TaskPool::lease()`] and consumed by [`TaskPool::release()`], and must
/// not outlive the pool that created it.
#[derive(Debug)]
pub(crate) struct TaskRef(NonNull<TaskRecord>);
//
// SAFETY: A TaskRef is a loan of a record owned by the pool; the record is
//         Send + Sync and heap-pinned, so the loan may travel to the worker.
unsafe impl Send for TaskRef {}
//
impl Deref for TaskRef {
    type Target = TaskRecord;

    fn deref(&self) -> &TaskRecord {
        // SAFETY: Records are boxed and never dropped nor moved while the
        //         owning pool lives, and TaskRefs don't outlive the pool.
        unsafe { self.0.as_ref() }
    }
}

/// Grow-only pool of reusable task records
///
/// `lease`/`release` are serialized by a spinlock: the critical sections are
/// a scan of a small table on one side and a flag flip on the other.
#[derive(Debug, Default)]
pub(crate) struct TaskPool {
    /// Record table; boxing keeps records pinned across table growth
    records: spin::Mutex<Vec<Box<TaskRecord>>>,
}
//
impl TaskPool {
    /// Set up an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease a free record, allocating a new one only if none is free
    pub fn lease(&self) -> TaskRef {
        let mut records = self.records.lock();
        for record in records.iter() {
            // Relaxed suffices: availability is only touched under this lock
            if record.available.load(Ordering::Relaxed) {
                record.available.store(false, Ordering::Relaxed);
                return TaskRef(NonNull::from(&**record));
            }
        }
        let record = Box::new(TaskRecord::new(records.len() as u64));
        let lease = TaskRef(NonNull::from(&*record));
        records.push(record);
        lease
    }

    /// Return a record to the pool
    ///
    /// # Panics
    ///
    /// Panics if the record was not leased: that can only mean the lease
    /// discipline was broken somewhere and the pool state is corrupt.
    pub fn release(&self, task: TaskRef) {
        let _records = self.records.lock();
        let was_available = task.available.swap(true, Ordering::Relaxed);
        assert!(
            !was_available,
            "released task record #{} which was not leased",
            task.id()
        );
    }

    /// Number of records ever allocated
    pub fn allocated(&self) -> usize {
        self.records.lock().len()
    }

    /// Number of records currently leased out
    pub fn outstanding(&self) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|record| !record.available.load(Ordering::Relaxed))
            .count()
    }
}
