//! Per-CPU runqueue
//!
//! One [`Runqueue`] per CPU, protected by a spin lock with short,
//! allocation-free critical sections. The lock covers the priority bitmap
//! queue, the current-task pointer, the clocks and this CPU's slot in the
//! watermark index.
//!
//! ## Lock hierarchy
//!
//! To avoid deadlocks, locks are acquired in this order:
//! 1. Task `pi_lock` (when both are needed)
//! 2. This CPU's runqueue lock
//! 3. A migration destination's runqueue lock — only after releasing the
//!    source lock, with the task marked `Migrating` in between, or through
//!    a non-blocking try-lock for idle pulls.

use core::sync::atomic::AtomicU64;
use std::sync::Arc;

use spin::Mutex;

use crate::bmq::Bmq;
use crate::stats::RqStats;
use crate::task::Task;
use crate::types::{DequeueFlags, EnqueueFlags, OnRq, IDLE_WM};
use crate::Scheduler;

/// Lock-protected per-CPU scheduler state.
pub(crate) struct Runqueue {
    pub(crate) cpu: usize,
    pub(crate) queue: Bmq,
    /// The task currently executing on this CPU.
    pub(crate) curr: Arc<Task>,
    /// Permanently resident; the universal fallback of every selection.
    pub(crate) idle: Arc<Task>,
    /// The per-CPU stopper thread's handle, excluded from retuning.
    pub(crate) stop: Option<Arc<Task>>,
    /// One-shot selection hint set by yield_type 2.
    pub(crate) skip: Option<Arc<Task>>,

    /// Monotonic runqueue clock.
    pub(crate) clock: u64,
    /// Runqueue clock minus interrupt and steal time; drives timeslice
    /// accounting.
    pub(crate) clock_task: u64,
    prev_irq_time: u64,
    prev_steal_time: u64,
    pub(crate) last_tick: u64,
    /// Clock at the last context switch; the boost heuristic measures
    /// run-streak length against it.
    pub(crate) last_ts_switch: u64,

    /// Queued tasks, the resident idle task excluded.
    pub(crate) nr_running: usize,
    pub(crate) nr_uninterruptible: i64,
    /// Watermark level currently advertised for this CPU.
    pub(crate) watermark: usize,

    pub(crate) online: bool,
    /// Latch preventing concurrent sibling-group balance dispatches.
    pub(crate) active_balance: bool,
}

/// A CPU's scheduler cell: the locked runqueue plus counters that are read
/// or written without the lock.
pub(crate) struct CpuRq {
    pub(crate) lock: Mutex<Runqueue>,
    /// Tasks from this runqueue blocked in iowait. Decremented by remote
    /// wakers without the runqueue lock.
    pub(crate) nr_iowait: AtomicU64,
    pub(crate) stats: RqStats,
}

impl Runqueue {
    pub(crate) fn new(cpu: usize, idle: Arc<Task>, online: bool) -> Runqueue {
        let mut queue = Bmq::new();
        idle.set_on_cpu();
        queue.init_idle(idle.clone());
        Runqueue {
            cpu,
            queue,
            curr: idle.clone(),
            idle,
            stop: None,
            skip: None,
            clock: 0,
            clock_task: 0,
            prev_irq_time: 0,
            prev_steal_time: 0,
            last_tick: 0,
            last_ts_switch: 0,
            nr_running: 0,
            nr_uninterruptible: 0,
            watermark: IDLE_WM,
            online,
            active_balance: false,
        }
    }

    /// First task of the queue, the skip hint honored.
    pub(crate) fn runnable_task(&self) -> Arc<Task> {
        let next = self.queue.first();
        match &self.skip {
            Some(skip) if Arc::ptr_eq(&next, skip) => self.queue.next(&next),
            _ => next,
        }
    }
}

impl Scheduler {
    /// Advance `clock`; `clock_task` additionally sheds interrupt and
    /// paravirt-stolen time. Both are clamped non-negative and monotonic.
    pub(crate) fn update_rq_clock(&self, rq: &mut Runqueue) {
        let now = self.platform.now_ns(rq.cpu);
        if now <= rq.clock {
            return;
        }
        let mut delta = now - rq.clock;
        rq.clock = now;

        let irq_total = self.platform.irq_time_ns(rq.cpu);
        // Clamp: a late irq-time update may exceed the clock delta; stop
        // clock_task and let the next update consume the rest.
        let irq_delta = irq_total.saturating_sub(rq.prev_irq_time).min(delta);
        rq.prev_irq_time += irq_delta;
        delta -= irq_delta;

        let steal_total = self.platform.steal_time_ns(rq.cpu);
        let steal = steal_total.saturating_sub(rq.prev_steal_time).min(delta);
        rq.prev_steal_time += steal;
        delta -= steal;

        rq.clock_task += delta;
    }

    /// Re-advertise the runqueue's watermark after its first bucket moved.
    pub(crate) fn update_rq_watermark(&self, rq: &mut Runqueue) {
        rq.watermark = self.watermark.update(
            rq.cpu,
            rq.queue.first_bucket(),
            rq.watermark,
            &self.topology,
        );
    }

    /// Add `t` to the runqueue.
    ///
    /// Context: rq lock held, `t.cpu() == rq.cpu`.
    pub(crate) fn enqueue_task(&self, rq: &mut Runqueue, t: &Arc<Task>, _flags: EnqueueFlags) {
        debug_assert!(self.rqs[rq.cpu].lock.is_locked());
        if t.cpu() != rq.cpu {
            kwarn!(
                "sched: enqueue task pid={} residing on cpu{} to cpu{}",
                t.pid(),
                t.cpu(),
                rq.cpu
            );
        }

        let idx = t.sched_idx();
        t.set_queue_idx(idx);
        rq.queue.insert(t.clone(), idx);
        self.update_rq_watermark(rq);
        rq.nr_running += 1;
        if rq.nr_running == 2 {
            self.pending.set_cpu(rq.cpu);
        }

        // An iowait wakeup would otherwise miss its frequency bump: the
        // governor only sees utilization after the task has run.
        if t.in_iowait() {
            self.platform.cpufreq_update(rq.cpu, true);
        }
    }

    /// Remove `t` from the runqueue.
    ///
    /// Context: rq lock held, `t.cpu() == rq.cpu`.
    pub(crate) fn dequeue_task(&self, rq: &mut Runqueue, t: &Arc<Task>, _flags: DequeueFlags) {
        debug_assert!(self.rqs[rq.cpu].lock.is_locked());
        if t.cpu() != rq.cpu {
            kwarn!(
                "sched: dequeue task pid={} residing on cpu{} from cpu{}",
                t.pid(),
                t.cpu(),
                rq.cpu
            );
        }

        rq.queue.remove(t);
        self.update_rq_watermark(rq);
        rq.nr_running -= 1;
        if rq.nr_running == 1 {
            self.pending.clear_cpu(rq.cpu);
        }
    }

    /// Re-file `t` under its current `sched_idx`. Moves the task to the
    /// tail of the (possibly new) bucket.
    pub(crate) fn requeue_task(&self, rq: &mut Runqueue, t: &Arc<Task>) {
        debug_assert!(self.rqs[rq.cpu].lock.is_locked());
        let idx = t.sched_idx();
        let changed = idx != t.queue_idx();
        rq.queue.remove(t);
        t.set_queue_idx(idx);
        rq.queue.insert(t.clone(), idx);
        if changed {
            self.update_rq_watermark(rq);
        }
    }

    /// As `requeue_task`, but a no-op when the bucket did not change.
    /// Returns whether a real move happened.
    pub(crate) fn requeue_task_lazy(&self, rq: &mut Runqueue, t: &Arc<Task>) -> bool {
        debug_assert!(self.rqs[rq.cpu].lock.is_locked());
        let idx = t.sched_idx();
        if idx == t.queue_idx() {
            return false;
        }
        rq.queue.remove(t);
        t.set_queue_idx(idx);
        rq.queue.insert(t.clone(), idx);
        self.update_rq_watermark(rq);
        true
    }

    /// Move a task to the runqueue: the wake half of the state machine.
    ///
    /// Context: rq lock held.
    pub(crate) fn activate_task(&self, rq: &mut Runqueue, t: &Arc<Task>) {
        if t.contributes_to_load() {
            rq.nr_uninterruptible -= 1;
            t.set_contributes_to_load(false);
        }
        self.enqueue_task(rq, t, EnqueueFlags::WAKEUP);
        t.set_on_rq(OnRq::Queued);
        self.platform.cpufreq_update(rq.cpu, false);
    }

    /// Remove a blocking task from the runqueue.
    ///
    /// Context: rq lock held.
    pub(crate) fn deactivate_task(&self, rq: &mut Runqueue, t: &Arc<Task>) {
        if t.task_contributes_to_load() {
            rq.nr_uninterruptible += 1;
        }
        self.dequeue_task(rq, t, DequeueFlags::SLEEP);
        t.set_on_rq(OnRq::Off);
        self.platform.cpufreq_update(rq.cpu, false);
    }
}
