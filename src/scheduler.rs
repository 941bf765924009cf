//! Weight-balanced task scheduler
//!
//! Each submission carries a caller-estimated weight. The scheduler tracks
//! the strength-normalized work it has already dispatched to every PU and
//! sends each new task to the PU that would end up with the lowest total,
//! which keeps the predicted imbalance bounded by a single task's worth of
//! work per submission.

use crate::{
    pool::WorkerPool,
    task::TaskFn,
    topology::{PuId, Strength, Topology},
};
use std::{ffi::c_void, sync::Arc};

/// Fixed multiplier applied to submission weights before normalization
///
/// Keeps the integer division by PU strengths from collapsing distinctions
/// between fast and slow PUs when strengths differ by modest ratios. 1000 is
/// the historical calibration point.
pub const WEIGHT_GRANULARITY: u64 = 1000;

/// Caller's relative estimate of a task's cost
///
/// The unit is unspecified; it only needs to be used consistently across a
/// run.
pub type TaskWeight = u64;

/// Opaque integer grouping tasks expected to share data
///
/// Accepted for forward compatibility; the default policy ignores it.
pub type LocalityIsland = usize;

/// Work ledger of one PU
#[derive(Debug)]
pub(crate) struct PuHistory {
    /// PU this ledger tracks
    pu: PuId,

    /// Isolated strength of that PU, frozen at scheduler construction
    strength: Strength,

    /// Strength-normalized scaled weight of every dispatch so far
    ///
    /// Non-decreasing, except when the overflow policy halves all ledgers.
    accumulated_work: u64,
}

/// Scheduler mapping submissions to the least-loaded PU of a [`WorkerPool`]
///
/// One scheduler serves many concurrent submitters; the ledger is guarded by
/// a single spinlock whose critical section is one O(num_pus) scan.
#[derive(Debug)]
pub struct Scheduler {
    /// Pool the chosen tasks are dispatched to
    pool: Arc<WorkerPool>,

    /// One ledger per pool PU, in topology order (= queue index order)
    histories: spin::Mutex<Vec<PuHistory>>,

    /// Normalization constant of the underlying topology
    max_strength: Strength,
}
//
impl Scheduler {
    /// Set up a scheduler for a pool built over `topology`
    ///
    /// # Panics
    ///
    /// Panics if some pool worker is pinned to a PU that `topology` does not
    /// describe, i.e. if the pool was built over a different topology.
    pub fn new(pool: Arc<WorkerPool>, topology: &Topology) -> Self {
        let histories = pool
            .worker_pus()
            .iter()
            .map(|&pu| PuHistory {
                pu,
                strength: topology.pu_strength(pu),
                accumulated_work: 0,
            })
            .collect();
        Self {
            pool,
            histories: spin::Mutex::new(histories),
            max_strength: topology.max_strength(),
        }
    }

    /// Submit a task for execution on the most appropriate PU
    ///
    /// Returns the id of the PU the task was dispatched to. The submitter
    /// does not wait: completion signaling is the task's own business.
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
        // The locality hint has no default semantics yet
        let _ = island;
        let (pu, queue_index) = self.charge_best_pu(weight);
        // SAFETY: Per this function's own contract
        unsafe { self.pool.submit_and_detach(f, arg, queue_index) };
        pu
    }

    /// Submit a closure for execution on the most appropriate PU
    ///
    /// Safe counterpart of [`submit()`](Self::submit), built on the pool's
    /// boxed-trampoline path.
    pub fn submit_once<F: FnOnce() + Send + 'static>(
        &self,
        f: F,
        weight: TaskWeight,
        island: LocalityIsland,
    ) -> PuId {
        let _ = island;
        let (pu, queue_index) = self.charge_best_pu(weight);
        self.pool.submit_once(f, queue_index);
        pu
    }

    /// Work ledgers of all PUs, in topology order
    ///
    /// Diagnostics only: the snapshot is outdated as soon as it is taken if
    /// other submitters are active.
    pub fn dump_histories(&self) -> Vec<(PuId, u64)> {
        self.histories
            .lock()
            .iter()
            .map(|history| (history.pu, history.accumulated_work))
            .collect()
    }

    /// Pick the least-loaded PU for a task of a given weight and charge the
    /// task's normalized cost to it
    fn charge_best_pu(&self, weight: TaskWeight) -> (PuId, usize) {
        let scaled_weight = weight.saturating_mul(WEIGHT_GRANULARITY);
        let mut histories = self.histories.lock();
        let winner = charge(&mut histories, scaled_weight, self.max_strength);
        (histories[winner].pu, winner)
    }
}

/// Charge `scaled_weight` to the ledger that minimizes the predicted total,
/// returning its index
///
/// Ties break toward the lowest topology index. If charging would overflow
/// some ledger, *all* ledgers are halved (preserving their ordering) and the
/// scan starts over; this is the documented overflow policy.
pub(crate) fn charge(
    histories: &mut [PuHistory],
    scaled_weight: u64,
    max_strength: Strength,
) -> usize {
    debug_assert!(!histories.is_empty());
    loop {
        let mut best: Option<(usize, u64)> = None;
        let mut saturated = None;
        for (idx, history) in histories.iter().enumerate() {
            let cost = normalized_cost(scaled_weight, history.strength, max_strength);
            let Some(candidate) = history.accumulated_work.checked_add(cost) else {
                saturated = Some(history.pu);
                break;
            };
            if best.map_or(true, |(_, lowest)| candidate < lowest) {
                best = Some((idx, candidate));
            }
        }
        if let Some(pu) = saturated {
            // Halving preserves the ledgers' relative ordering
            log::warn!("work ledger of {pu} saturated, halving all ledgers");
            for history in histories.iter_mut() {
                history.accumulated_work >>= 1;
            }
            continue;
        }
        let (winner, total) = best.expect("at least one ledger to scan");
        histories[winner].accumulated_work = total;
        return winner;
    }
}

/// Convert a scaled weight into the common work unit of the ledgers
///
/// Multiplying by `max_strength / strength` makes one unit mean the same
/// wall-clock time on every PU. The multiply goes through u128 so it cannot
/// overflow before the division tames it back down.
fn normalized_cost(scaled_weight: u64, strength: Strength, max_strength: Strength) -> u64 {
    let cost = u128::from(scaled_weight) * u128::from(max_strength) / u128::from(strength);
    u64::try_from(cost).unwrap_or(u64::MAX)
}
