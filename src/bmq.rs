//! Priority bitmap queue
//!
//! The per-CPU runnable index: a fixed array of FIFO buckets, one per
//! effective priority slot, plus a bitmap with one bit per non-empty bucket.
//! Selection is a find-first-bit over the bitmap followed by a front-of-list
//! read. The idle task is permanently resident in the last bucket, so the
//! bitmap is never all-zero on an initialized queue.
//!
//! Bucket 0 is shared by all realtime tasks and is kept sorted by ascending
//! effective priority, appending on ties — FIFO within one RT priority,
//! which is what RR/FIFO semantics require. Every other bucket is pure
//! FIFO: the bucket index itself encodes the ordering.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::task::Task;
use crate::types::{IDLE_TASK_SCHED_PRIO, SCHED_BITS};

pub(crate) struct Bmq {
    bitmap: u64,
    buckets: [VecDeque<Arc<Task>>; SCHED_BITS],
}

impl Bmq {
    pub(crate) fn new() -> Bmq {
        Bmq {
            bitmap: 0,
            buckets: core::array::from_fn(|_| VecDeque::new()),
        }
    }

    /// File the idle task into its reserved bucket. Called once per CPU at
    /// start-of-day; the idle task never leaves.
    pub(crate) fn init_idle(&mut self, idle: Arc<Task>) {
        idle.set_queue_idx(IDLE_TASK_SCHED_PRIO);
        self.buckets[IDLE_TASK_SCHED_PRIO].push_back(idle);
        self.bitmap |= 1 << IDLE_TASK_SCHED_PRIO;
    }

    /// Append `task` to bucket `idx`. Bucket 0 inserts by ascending prio
    /// instead, appending on ties.
    pub(crate) fn insert(&mut self, task: Arc<Task>, idx: usize) {
        debug_assert!(idx < SCHED_BITS);
        if idx != 0 {
            self.buckets[idx].push_back(task);
        } else {
            let prio = task.prio();
            let pos = self.buckets[0]
                .iter()
                .position(|t| t.prio() > prio)
                .unwrap_or(self.buckets[0].len());
            self.buckets[0].insert(pos, task);
        }
        self.bitmap |= 1 << idx;
    }

    /// Unlink `task` from the bucket recorded in its `queue_idx`; clears
    /// the bucket's bit if it drained.
    pub(crate) fn remove(&mut self, task: &Arc<Task>) {
        let idx = task.queue_idx();
        let bucket = &mut self.buckets[idx];
        let pos = bucket
            .iter()
            .position(|t| Arc::ptr_eq(t, task))
            .expect("bmq: task not in its recorded bucket");
        bucket.remove(pos);
        if bucket.is_empty() {
            self.bitmap &= !(1 << idx);
        }
    }

    /// Index of the lowest non-empty bucket. The resident idle task
    /// guarantees one exists.
    #[inline]
    pub(crate) fn first_bucket(&self) -> usize {
        debug_assert!(self.bitmap != 0, "bmq: queue has no idle task");
        self.bitmap.trailing_zeros() as usize
    }

    /// Head of the lowest non-empty bucket.
    pub(crate) fn first(&self) -> Arc<Task> {
        let head = &self.buckets[self.first_bucket()];
        debug_assert!(!head.is_empty());
        head.front().expect("bmq: bit set on empty bucket").clone()
    }

    /// Successor of `task` within the queue: next in its bucket, else the
    /// head of the next non-empty bucket. `task` must be queued.
    pub(crate) fn next(&self, task: &Arc<Task>) -> Arc<Task> {
        let idx = task.queue_idx();
        let bucket = &self.buckets[idx];
        let pos = bucket
            .iter()
            .position(|t| Arc::ptr_eq(t, task))
            .expect("bmq: task not in its recorded bucket");
        if pos + 1 < bucket.len() {
            return bucket[pos + 1].clone();
        }

        let rest = self.bitmap & !((1u64 << (idx + 1)) - 1);
        debug_assert!(rest != 0, "bmq: no successor past the idle bucket");
        let next_idx = rest.trailing_zeros() as usize;
        self.buckets[next_idx]
            .front()
            .expect("bmq: bit set on empty bucket")
            .clone()
    }

    /// Iterate queued tasks in priority order (idle bucket included last).
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.buckets.iter().flat_map(|b| b.iter())
    }

    /// Bitmap/bucket consistency: bit `i` set iff bucket `i` non-empty.
    pub(crate) fn is_consistent(&self) -> bool {
        (0..SCHED_BITS)
            .all(|i| ((self.bitmap >> i) & 1 != 0) == !self.buckets[i].is_empty())
    }
}
