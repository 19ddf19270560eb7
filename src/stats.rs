//! Scheduler statistics and system-wide queries
//!
//! Per-CPU counters live outside the runqueue lock as relaxed atomics so
//! hot paths pay one add and observers never contend.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::task::Task;
use crate::types::{bucket_to_watermark, MAX_RT_PRIO};
use crate::Scheduler;

/// Per-runqueue event counters.
#[derive(Debug, Default)]
pub(crate) struct RqStats {
    /// schedule() invocations.
    pub sched_count: AtomicU64,
    /// schedule() decisions that picked the idle task.
    pub sched_goidle: AtomicU64,
    /// Context switches performed.
    pub nr_switches: AtomicU64,
    /// Wakeups enqueued on this CPU.
    pub ttwu_count: AtomicU64,
    /// Wakeups performed by this CPU for itself.
    pub ttwu_local: AtomicU64,
    /// Wakeups that crossed CPUs.
    pub ttwu_wake_remote: AtomicU64,
    /// sched_yield calls.
    pub yld_count: AtomicU64,
    /// Tasks pulled in by the idle balancer.
    pub migrations_in: AtomicU64,
    /// Tasks pushed out by migration/balance.
    pub migrations_out: AtomicU64,
}

impl RqStats {
    #[inline]
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Copyable snapshot of one CPU's counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedStats {
    pub sched_count: u64,
    pub sched_goidle: u64,
    pub nr_switches: u64,
    pub ttwu_count: u64,
    pub ttwu_local: u64,
    pub ttwu_wake_remote: u64,
    pub yld_count: u64,
    pub migrations_in: u64,
    pub migrations_out: u64,
}

impl Scheduler {
    /// Snapshot of `cpu`'s counters.
    pub fn stats(&self, cpu: usize) -> SchedStats {
        let s = &self.rqs[cpu].stats;
        SchedStats {
            sched_count: s.sched_count.load(Ordering::Relaxed),
            sched_goidle: s.sched_goidle.load(Ordering::Relaxed),
            nr_switches: s.nr_switches.load(Ordering::Relaxed),
            ttwu_count: s.ttwu_count.load(Ordering::Relaxed),
            ttwu_local: s.ttwu_local.load(Ordering::Relaxed),
            ttwu_wake_remote: s.ttwu_wake_remote.load(Ordering::Relaxed),
            yld_count: s.yld_count.load(Ordering::Relaxed),
            migrations_in: s.migrations_in.load(Ordering::Relaxed),
            migrations_out: s.migrations_out.load(Ordering::Relaxed),
        }
    }

    /// Queued tasks on `cpu`, the resident idle task excluded.
    pub fn nr_running(&self, cpu: usize) -> usize {
        self.lock_rq(cpu).nr_running
    }

    /// Queued tasks across all CPUs.
    pub fn nr_running_total(&self) -> usize {
        (0..self.nr_cpus()).map(|cpu| self.nr_running(cpu)).sum()
    }

    /// Context switches across all CPUs.
    pub fn nr_context_switches(&self) -> u64 {
        self.rqs
            .iter()
            .map(|rq| rq.stats.nr_switches.load(Ordering::Relaxed))
            .sum()
    }

    /// Tasks blocked in iowait on `cpu`.
    pub fn nr_iowait_cpu(&self, cpu: usize) -> u64 {
        self.rqs[cpu].nr_iowait.load(Ordering::Relaxed)
    }

    /// Tasks blocked in iowait across all CPUs.
    pub fn nr_iowait(&self) -> u64 {
        self.rqs
            .iter()
            .map(|rq| rq.nr_iowait.load(Ordering::Relaxed))
            .sum()
    }

    /// Is `cpu` currently running its idle task?
    pub fn idle_cpu(&self, cpu: usize) -> bool {
        let rq = self.lock_rq(cpu);
        Arc::ptr_eq(&rq.curr, &rq.idle)
    }

    /// Is `t` currently executing on its CPU?
    pub fn task_curr(&self, t: &Arc<Task>) -> bool {
        let rq = self.lock_rq(t.cpu());
        Arc::ptr_eq(&rq.curr, t)
    }

    /// The priority value as seen by users: RT tasks are offset to
    /// negative values, normal tasks report their slot with the boost
    /// adjustment folded in.
    pub fn task_prio(&self, t: &Arc<Task>) -> i32 {
        let prio = t.prio();
        if prio < MAX_RT_PRIO {
            return prio - MAX_RT_PRIO;
        }
        prio - MAX_RT_PRIO + t.boost_prio()
    }

    /// Structural invariants of `cpu`'s runqueue, checked under its lock:
    /// bitmap/bucket consistency, the idle task's residency, and the
    /// advertised watermark matching the first non-empty bucket.
    pub fn validate_rq(&self, cpu: usize) -> bool {
        let rq = self.lock_rq(cpu);
        let queue_ok = rq.queue.is_consistent();
        let idle_ok = rq
            .queue
            .iter()
            .any(|t| Arc::ptr_eq(t, &rq.idle));
        let wm_ok = rq.watermark == bucket_to_watermark(rq.queue.first_bucket());
        queue_ok && idle_ok && wm_ok
    }
}
