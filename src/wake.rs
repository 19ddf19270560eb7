//! Wake path
//!
//! Transitioning a sleeping task to runnable is the most ordering-sensitive
//! operation in the core. The protocol against the outgoing scheduler:
//!
//! - The CPU putting a task to sleep publishes all of its bookkeeping, then
//!   release-stores `on_cpu = false`.
//! - The waker acquire-spins on `on_cpu` before touching the task, so every
//!   store the task produced on its previous CPU happens-before anything
//!   the waker (or the task's next CPU) does with it.
//! - A migration between runqueues is ordered by the paired release/acquire
//!   of the two runqueue locks, with the task marked `Migrating` in the
//!   window between them; task-access readers spin that window out.

use core::hint::spin_loop;
use core::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use spin::MutexGuard;

use crate::runqueue::Runqueue;
use crate::stats::RqStats;
use crate::task::Task;
use crate::types::{OnRq, TaskState, WakeFlags};
use crate::Scheduler;

impl Scheduler {
    /// Lock the runqueue a running-or-queued task belongs to, re-validating
    /// ownership after the acquire. Returns `None` (no lock taken) when the
    /// task is neither running nor queued — the caller's pi_lock then
    /// suffices to keep it stable.
    ///
    /// Context: t's pi_lock.
    pub(crate) fn task_access_lock(&self, t: &Arc<Task>) -> Option<MutexGuard<'_, Runqueue>> {
        loop {
            let cpu = t.cpu();
            if t.on_cpu() || t.on_rq() == OnRq::Queued {
                let rq = self.rqs[cpu].lock.lock();
                if (t.on_cpu() || t.on_rq() == OnRq::Queued) && t.cpu() == cpu {
                    return Some(rq);
                }
                drop(rq);
            } else if t.on_rq() == OnRq::Migrating {
                while t.on_rq() == OnRq::Migrating {
                    spin_loop();
                }
            } else {
                return None;
            }
        }
    }

    /// Wake a task that never left a runqueue (it blocked and was woken
    /// before the scheduler dequeued it): just flip it back to RUNNING.
    fn ttwu_remote(&self, t: &Arc<Task>) -> bool {
        let Some(rq) = self.task_access_lock(t) else {
            return false;
        };
        let woken = t.on_rq() == OnRq::Queued;
        if woken {
            t.set_state(TaskState::RUNNING);
        }
        drop(rq);
        woken
    }

    /// Wakeup accounting. A wake is local when the waking thread of
    /// execution is the CPU the task lands on.
    fn ttwu_stat(&self, cpu: usize) {
        let stats = &self.rqs[cpu].stats;
        RqStats::inc(&stats.ttwu_count);
        if self.platform.current_cpu() == Some(cpu) {
            RqStats::inc(&stats.ttwu_local);
        } else {
            RqStats::inc(&stats.ttwu_wake_remote);
        }
    }

    /// Wake up a thread if its state falls inside `state_mask`.
    ///
    /// Returns true if the task was woken, false if it was already running
    /// or its state did not match.
    pub fn try_to_wake_up(
        &self,
        t: &Arc<Task>,
        state_mask: TaskState,
        mut wake_flags: WakeFlags,
    ) -> bool {
        let _pi = t.pi_lock.lock();
        // The waker's CONDITION=1 store must not be reordered with the
        // state check; pairs with the barrier sleepers issue when setting
        // their state.
        fence(Ordering::SeqCst);
        if !t.state_matches(state_mask) {
            return false;
        }

        if t.on_rq() != OnRq::Off && self.ttwu_remote(t) {
            self.ttwu_stat(t.cpu());
            return true;
        }

        // The owning CPU may still be mid-schedule() with this task as
        // prev; wait until it is done referencing it. Pairs with the
        // release store in the context-switch epilogue.
        while t.on_cpu() {
            spin_loop();
        }

        t.set_contributes_to_load(t.task_contributes_to_load());
        t.set_state(TaskState::WAKING);

        if t.in_iowait() {
            self.rqs[t.cpu()].nr_iowait.fetch_sub(1, Ordering::Relaxed);
            t.set_in_iowait(false);
        }

        let cpu = self.select_task_rq(t);
        if cpu != t.cpu() {
            wake_flags |= WakeFlags::MIGRATED;
            t.set_cpu(cpu);
        }
        let _ = wake_flags;

        let mut guard = self.lock_rq(cpu);
        let rq = &mut *guard;
        self.update_rq_clock(rq);
        self.activate_task(rq, t);
        t.set_state(TaskState::RUNNING);
        self.check_preempt_curr(rq, t);
        drop(guard);

        self.ttwu_stat(cpu);
        true
    }

    /// Wake up a task from either kind of sleep.
    pub fn wake_up(&self, t: &Arc<Task>) -> bool {
        self.try_to_wake_up(t, TaskState::NORMAL, WakeFlags::empty())
    }

    /// Wake up a task only from the given states.
    pub fn wake_up_state(&self, t: &Arc<Task>, state_mask: TaskState) -> bool {
        self.try_to_wake_up(t, state_mask, WakeFlags::empty())
    }

    /// Place a newly forked task on a runqueue for the first time. Fork
    /// balancing happens here rather than in sched_fork: the affinity mask
    /// can change between the two, and an earlier choice could have been
    /// unplugged meanwhile.
    pub fn wake_up_new_task(&self, t: &Arc<Task>) {
        let _pi = t.pi_lock.lock();
        t.set_state(TaskState::RUNNING);

        let cpu = self.select_task_rq(t);
        t.set_cpu(cpu);

        let mut guard = self.lock_rq(cpu);
        let rq = &mut *guard;
        self.update_rq_clock(rq);
        self.activate_task(rq, t);
        self.check_preempt_curr(rq, t);
    }

    /// Kick a remote CPU currently executing `t` so it passes through the
    /// kernel (signal delivery). Races are fine: if the task migrated away
    /// the IPI is wasted, not wrong.
    pub fn kick_process(&self, t: &Arc<Task>) {
        let cpu = t.cpu();
        if self.platform.current_cpu() != Some(cpu) && self.task_curr(t) {
            self.platform.send_reschedule_ipi(cpu);
        }
    }
}
