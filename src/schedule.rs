//! Core scheduling algorithms
//!
//! The central choose/switch routine and everything that feeds it: the
//! boost/deboost interactivity heuristic, timeslice accounting, preemption
//! checks, the timer tick, the high-resolution preemption timer and yield.
//!
//! ## The boost heuristic
//!
//! Non-realtime tasks carry a dynamic adjustment `boost_prio`. A task that
//! blocks after only a short run-streak looks interactive and is boosted
//! one step toward urgency; a task that exhausts its timeslice is deboosted
//! one step. More-boosted tasks need a shorter streak to boost further, so
//! the threshold shrinks exponentially with the current boost.

use core::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::runqueue::Runqueue;
use crate::stats::RqStats;
use crate::task::Task;
use crate::types::{
    SchedPolicy, TaskState, YieldType, MAX_PRIORITY_ADJ, RESCHED_NS,
};
use crate::Scheduler;

impl Scheduler {
    /// Run-streak threshold below which a blocking task earns a boost.
    #[inline]
    fn boost_threshold(&self, t: &Arc<Task>) -> u64 {
        let shift = (10 - MAX_PRIORITY_ADJ - t.boost_prio()) as u32;
        self.config.timeslice_ns >> shift
    }

    /// Boost `t` one step if it held the CPU only briefly. Policy floors:
    /// NORMAL may boost to the top, BATCH and IDLE never above their
    /// static slot, realtime is excluded entirely.
    pub(crate) fn boost_task(&self, t: &Arc<Task>, rq: &Runqueue) {
        let limit = match t.policy() {
            SchedPolicy::Normal => -MAX_PRIORITY_ADJ,
            SchedPolicy::Batch | SchedPolicy::Idle => 0,
            _ => return,
        };

        let switch_time = rq.clock - rq.last_ts_switch;
        if t.boost_prio() > limit && switch_time < self.boost_threshold(t) {
            t.set_boost_prio(t.boost_prio() - 1);
        }
    }

    /// Deboost `t` one step toward the bottom of its range.
    pub(crate) fn deboost_task(&self, t: &Arc<Task>) {
        if t.boost_prio() < MAX_PRIORITY_ADJ {
            t.set_boost_prio(t.boost_prio() + 1);
        }
    }

    /// Mark the runqueue's current task 'to be rescheduled now'. Kicks the
    /// CPU with an IPI when the flag was not already set and the caller is
    /// not that CPU.
    ///
    /// Context: rq lock held.
    pub(crate) fn resched_curr(&self, rq: &Runqueue) {
        let curr = &rq.curr;
        if curr.need_resched() {
            return;
        }
        curr.set_need_resched();
        if self.platform.current_cpu() != Some(rq.cpu) {
            self.platform.send_reschedule_ipi(rq.cpu);
        }
    }

    /// Should the newly runnable `t` preempt what `rq` is running? Idle is
    /// always preempted; otherwise only a task that now heads the queue
    /// outranks the current one. Equal-priority realtime tasks keep FIFO
    /// discipline and do not preempt each other.
    ///
    /// Context: rq lock held.
    pub(crate) fn check_preempt_curr(&self, rq: &mut Runqueue, t: &Arc<Task>) {
        if rq.curr.is_idle() {
            self.resched_curr(rq);
            return;
        }
        if Arc::ptr_eq(&rq.queue.first(), t) {
            self.resched_curr(rq);
        }
    }

    /// Charge the running task for the task-clock time since its last
    /// accounting point.
    pub(crate) fn update_curr(&self, rq: &Runqueue, t: &Arc<Task>) {
        let ns = rq.clock_task.saturating_sub(t.last_ran());
        t.add_sched_time(ns);
        t.set_time_slice(t.time_slice() - ns as i64);
        t.set_last_ran(rq.clock_task);
    }

    /// Account the outgoing task and refill/requeue it if its slice ran
    /// dry: FIFO keeps its slot, RR rotates without deboost, everything
    /// else is deboosted to the tail of its new bucket.
    pub(crate) fn check_curr(&self, t: &Arc<Task>, rq: &mut Runqueue) {
        if Arc::ptr_eq(t, &rq.idle) {
            return;
        }

        self.update_curr(rq, t);

        if t.time_slice() < RESCHED_NS {
            t.set_time_slice(self.config.timeslice_ns as i64);
            if t.policy() != SchedPolicy::Fifo && t.on_rq() == crate::types::OnRq::Queued {
                if t.policy() != SchedPolicy::Rr {
                    self.deboost_task(t);
                }
                self.requeue_task(rq, t);
            }
        }
    }

    /// Pick what runs next: honor (and clear) the yield skip hint, and let
    /// an idle outcome attempt a pull from a loaded CPU first.
    pub(crate) fn choose_next_task(&self, rq: &mut Runqueue, cpu: usize) -> Arc<Task> {
        if rq.skip.is_some() {
            let mut next = rq.runnable_task();
            if rq.online && next.is_idle() && self.take_other_rq_tasks(rq, cpu) {
                next = rq.runnable_task();
            }
            rq.skip = None;
            return next;
        }

        let next = rq.queue.first();
        if rq.online && next.is_idle() && self.take_other_rq_tasks(rq, cpu) {
            return rq.queue.first();
        }
        next
    }

    /// Dispatch bookkeeping for the task about to run.
    fn set_rq_task(&self, rq: &mut Runqueue, t: &Arc<Task>) {
        t.set_last_ran(rq.clock_task);
        // A full slice marks the start of a fresh run-streak.
        if t.time_slice() == self.config.timeslice_ns as i64 {
            rq.last_ts_switch = rq.clock;
        }
        if !t.is_idle() {
            self.platform
                .hrtimer_start(rq.cpu, t.time_slice().max(0) as u64);
        }
    }

    fn __schedule(&self, cpu: usize, preempt: bool) {
        let cell = &self.rqs[cpu];
        let mut guard = cell.lock.lock();
        // Pairs with the state stores of sleepers and remote wakers; the
        // signal_pending check below must not read stale state.
        fence(Ordering::SeqCst);
        let rq = &mut *guard;

        RqStats::inc(&cell.stats.sched_count);
        self.platform.hrtimer_cancel(cpu);
        self.update_rq_clock(rq);

        let prev = rq.curr.clone();

        if !preempt && prev.state() != TaskState::RUNNING {
            // A signal arriving during the sleep transition cancels it.
            if prev.state_matches(TaskState::INTERRUPTIBLE) && prev.signal_pending() {
                prev.set_state(TaskState::RUNNING);
            } else {
                self.boost_task(&prev, rq);
                self.deactivate_task(rq, &prev);

                if prev.in_iowait() {
                    cell.nr_iowait.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        prev.clear_need_resched();

        self.check_curr(&prev, rq);

        let next = self.choose_next_task(rq, cpu);
        self.set_rq_task(rq, &next);

        if !Arc::ptr_eq(&prev, &next) {
            if next.is_idle() {
                RqStats::inc(&cell.stats.sched_goidle);
            }
            rq.curr = next.clone();
            next.set_on_cpu();
            RqStats::inc(&cell.stats.nr_switches);
            rq.last_ts_switch = rq.clock;

            drop(guard);

            // All of prev's bookkeeping is published before a waker can
            // claim it (pairs with the acquire spin in try_to_wake_up).
            prev.clear_on_cpu();

            self.platform.context_switch(cpu, &prev, &next);

            if self.topology.smt_present() {
                self.sg_balance_check(cpu);
            }
        }
    }

    /// The main scheduler entry: the current task of `cpu` blocks or
    /// voluntarily reschedules.
    pub fn schedule(&self, cpu: usize) {
        self.__schedule(cpu, false);
    }

    /// Preemption-driven entry: the running task keeps its queue slot and
    /// its state.
    pub fn schedule_preempted(&self, cpu: usize) {
        self.__schedule(cpu, true);
    }

    /// Timer tick, invoked at fixed HZ with the tick interrupt masked.
    pub fn scheduler_tick(&self, cpu: usize) {
        let mut guard = self.lock_rq(cpu);
        let rq = &mut *guard;
        self.update_rq_clock(rq);

        let curr = rq.curr.clone();
        if !curr.is_idle() {
            self.update_curr(rq, &curr);
            self.platform.cpufreq_update(cpu, false);

            // Tasks with less than RESCHED_NS of slice left get rescheduled.
            if curr.time_slice() < RESCHED_NS {
                self.resched_curr(rq);
            }
        }

        rq.last_tick = rq.clock;
    }

    /// High-resolution preemption timer callback: the armed slice has
    /// elapsed; re-check the current task.
    pub fn hrtick(&self, cpu: usize) {
        let mut guard = self.lock_rq(cpu);
        let rq = &mut *guard;
        let curr = rq.curr.clone();
        if curr.is_idle() {
            return;
        }
        self.update_rq_clock(rq);
        self.update_curr(rq, &curr);
        if curr.time_slice() < RESCHED_NS {
            self.resched_curr(rq);
        }
    }

    /// sched_yield, behavior per `yield_type`:
    /// deboost-and-requeue (default), skip hint, or nothing at all.
    pub fn yield_current(&self, cpu: usize) {
        if self.config.yield_type == YieldType::None {
            return;
        }

        {
            let mut guard = self.lock_rq(cpu);
            let rq = &mut *guard;
            RqStats::inc(&self.rqs[cpu].stats.yld_count);

            match self.config.yield_type {
                YieldType::Requeue => {
                    let curr = rq.curr.clone();
                    if !curr.rt_task() && !curr.is_idle() {
                        curr.set_boost_prio(MAX_PRIORITY_ADJ);
                        self.requeue_task(rq, &curr);
                    }
                }
                YieldType::Skip => {
                    if rq.nr_running > 1 {
                        rq.skip = Some(rq.curr.clone());
                    }
                }
                YieldType::None => {}
            }
        }

        self.schedule(cpu);
    }

    /// The current task of `cpu` is exiting: mark it dead and switch away.
    /// The final task reference is dropped by the next context switch.
    pub fn sched_exit(&self, cpu: usize) {
        {
            let guard = self.lock_rq(cpu);
            if Arc::ptr_eq(&guard.curr, &guard.idle) {
                kwarn!("sched: exit of the idle task on cpu{} ignored", cpu);
                return;
            }
            guard.curr.set_state(TaskState::DEAD);
        }
        self.schedule(cpu);
    }
}
