//! Bounded-wait FIFO queue shared between submitters and a consuming worker
//!
//! One queue feeds one worker, but any number of submitters may push into it.
//! The queue can be invalidated to wake a blocked consumer at shutdown;
//! values that were already enqueued stay poppable until drained, so no
//! submission is lost to an invalidation.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// FIFO queue with blocking pop and invalidation
///
/// The waiting discipline of [`wait_pop()`](Self::wait_pop) is a mutex plus
/// two condition variables by default. With the `queue-sleep` feature it
/// becomes a sleeping back-off ramp instead, which trades wakeup latency for
/// never making producers contend with a waking consumer; nothing else about
/// the contract changes.
#[derive(Debug)]
pub struct TaskQueue<T> {
    /// Values and validity, guarded as one unit
    state: Mutex<State<T>>,

    /// Signaled when the queue gains a value or is invalidated
    empty_cond: Condvar,

    /// Signaled when the queue loses a value, is cleared or is invalidated
    full_cond: Condvar,
}

/// Contents of a [`TaskQueue`]
#[derive(Debug)]
struct State<T> {
    /// Queued values, oldest first
    values: VecDeque<T>,

    /// Cleared by `invalidate()`, never set again
    valid: bool,
}
//
impl<T> Default for State<T> {
    fn default() -> Self {
        Self {
            values: VecDeque::new(),
            valid: true,
        }
    }
}
//
impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
//
impl<T> TaskQueue<T> {
    /// Set up an empty, valid queue
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            empty_cond: Condvar::new(),
            full_cond: Condvar::new(),
        }
    }

    /// Enqueue a value without ever blocking
    ///
    /// On an invalidated queue the value is not enqueued and is handed back
    /// through `Err` so the caller can dispose of it.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if !state.valid {
            return Err(value);
        }
        state.values.push_back(value);
        self.empty_cond.notify_one();
        Ok(())
    }

    /// Enqueue a value once the queue holds fewer than `max_size` values
    ///
    /// Blocks while the queue is full and valid. On an invalidated queue the
    /// value is handed back through `Err`.
    pub fn wait_push(&self, value: T, max_size: usize) -> Result<(), T> {
        let mut state = self.state.lock();
        while state.valid && state.values.len() >= max_size {
            self.full_cond.wait(&mut state);
        }
        if !state.valid {
            return Err(value);
        }
        state.values.push_back(value);
        self.empty_cond.notify_one();
        Ok(())
    }

    /// Get the oldest value without blocking
    ///
    /// Keeps returning values after invalidation until the queue is drained.
    pub fn try_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        let value = state.values.pop_front();
        if value.is_some() {
            self.full_cond.notify_one();
        }
        value
    }

    /// Get the oldest value, blocking while the queue is empty and valid
    ///
    /// Returns `None` only once the queue is invalidated *and* drained, which
    /// is the consumer's signal to stop consuming.
    #[cfg(not(feature = "queue-sleep"))]
    pub fn wait_pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.values.pop_front() {
                self.full_cond.notify_one();
                return Some(value);
            }
            if !state.valid {
                return None;
            }
            self.empty_cond.wait(&mut state);
        }
    }

    /// Get the oldest value, blocking while the queue is empty and valid
    ///
    /// Returns `None` only once the queue is invalidated *and* drained, which
    /// is the consumer's signal to stop consuming.
    #[cfg(feature = "queue-sleep")]
    pub fn wait_pop(&self) -> Option<T> {
        let mut sleep = crate::SLEEP_RAMP_START;
        loop {
            {
                let mut state = self.state.lock();
                if let Some(value) = state.values.pop_front() {
                    self.full_cond.notify_one();
                    return Some(value);
                }
                if !state.valid {
                    return None;
                }
            }
            std::thread::sleep(sleep);
            sleep = (sleep * 2).min(crate::SLEEP_RAMP_CEILING);
        }
    }

    /// Drop all queued values, waking blocked pushers
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.values.clear();
        self.full_cond.notify_all();
    }

    /// Mark the queue invalid and wake every blocked waiter
    ///
    /// Idempotent. Already-enqueued values remain poppable; only the blocking
    /// behavior of pop and push changes.
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        if !state.valid {
            return;
        }
        state.valid = false;
        self.empty_cond.notify_all();
        self.full_cond.notify_all();
    }

    /// Whether the queue has been invalidated
    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    /// Whether the queue currently holds no value
    pub fn is_empty(&self) -> bool {
        self.state.lock().values.is_empty()
    }

    /// Number of values currently enqueued
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::{collections::VecDeque, sync::Arc, time::Duration};

    #[test]
    fn fifo_order() {
        let queue = TaskQueue::new();
        for i in 0..10 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 10);
        for i in 0..10 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_pop_receives_later_push() {
        let queue = Arc::new(TaskQueue::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.wait_pop())
        };
        // Give the consumer a chance to actually block
        std::thread::sleep(Duration::from_millis(10));
        queue.push(42).unwrap();
        assert_eq!(consumer.join().unwrap(), Some(42));
    }

    #[test]
    fn invalidate_wakes_empty_waiter() {
        let queue = Arc::new(TaskQueue::<u32>::new());
        let consumer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.wait_pop())
        };
        std::thread::sleep(Duration::from_millis(10));
        queue.invalidate();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn invalidation_does_not_lose_values() {
        let queue = TaskQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.invalidate();
        assert_eq!(queue.wait_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.wait_pop(), None);
    }

    #[test]
    fn invalidate_is_idempotent() {
        let queue = TaskQueue::new();
        queue.push(1).unwrap();
        queue.invalidate();
        queue.invalidate();
        assert!(!queue.is_valid());
        assert_eq!(queue.try_pop(), Some(1));
    }

    #[test]
    fn push_after_invalidation_hands_value_back() {
        let queue = TaskQueue::new();
        queue.invalidate();
        assert_eq!(queue.push(7), Err(7));
        assert!(queue.is_empty());
    }

    #[test]
    fn wait_push_honors_bound() {
        let queue = Arc::new(TaskQueue::new());
        queue.wait_push(1, 2).unwrap();
        queue.wait_push(2, 2).unwrap();
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.wait_push(3, 2))
        };
        std::thread::sleep(Duration::from_millis(10));
        // The bounded push is still blocked on the full queue
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.try_pop(), Some(1));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn wait_push_fails_on_invalidation() {
        let queue = Arc::new(TaskQueue::new());
        queue.push(1).unwrap();
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.wait_push(2, 1))
        };
        std::thread::sleep(Duration::from_millis(10));
        queue.invalidate();
        assert_eq!(producer.join().unwrap(), Err(2));
    }

    /// One step of the model-based exercise below
    #[derive(Clone, Debug)]
    enum Op {
        Push(u8),
        TryPop,
        Observe,
        Invalidate,
        Clear,
    }

    fn arbitrary_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => any::<u8>().prop_map(Op::Push),
            4 => Just(Op::TryPop),
            1 => Just(Op::Observe),
            1 => Just(Op::Invalidate),
            1 => Just(Op::Clear),
        ]
    }

    proptest! {
        /// Under single-threaded use, the queue is a plain FIFO plus a
        /// validity flag, whatever the operation mix
        #[test]
        fn behaves_like_a_model(ops in proptest::collection::vec(arbitrary_op(), 0..100)) {
            let queue = TaskQueue::new();
            let mut model = VecDeque::new();
            let mut valid = true;
            for op in ops {
                match op {
                    Op::Push(value) => {
                        let pushed = queue.push(value);
                        if valid {
                            prop_assert_eq!(pushed, Ok(()));
                            model.push_back(value);
                        } else {
                            prop_assert_eq!(pushed, Err(value));
                        }
                    }
                    Op::TryPop => prop_assert_eq!(queue.try_pop(), model.pop_front()),
                    Op::Observe => {
                        prop_assert_eq!(queue.len(), model.len());
                        prop_assert_eq!(queue.is_empty(), model.is_empty());
                    }
                    Op::Invalidate => {
                        queue.invalidate();
                        valid = false;
                    }
                    Op::Clear => {
                        queue.clear();
                        model.clear();
                    }
                }
                prop_assert_eq!(queue.is_valid(), valid);
            }
        }
    }

    #[test]
    fn clear_drops_values_and_unblocks_pushers() {
        let queue = Arc::new(TaskQueue::new());
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || queue.wait_push(3, 2))
        };
        std::thread::sleep(Duration::from_millis(10));
        queue.clear();
        producer.join().unwrap().unwrap();
        assert_eq!(queue.try_pop(), Some(3));
        assert!(queue.is_empty());
    }
}
