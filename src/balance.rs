//! Migration and the SMT sibling-group balancer
//!
//! Two mechanisms keep CPUs busy:
//!
//! - **Pull on idle**: a CPU about to dispatch its idle task walks its
//!   outward topology rings intersected with the pending mask (CPUs holding
//!   more than one runnable task), try-locks a source and takes a batch of
//!   its queued tasks. Try-locks only — a contended source is skipped, not
//!   waited on.
//! - **SMT active balance**: a fully idle sibling group scans for a core
//!   whose sole running task could run here, and dispatches a one-shot
//!   stopper to force-migrate it. This covers the case pulls never see: one
//!   long-running task monopolizing a thread of an SMT pair while a whole
//!   other core sits idle.
//!
//! Migration of a queued task between two runqueues releases the source
//! lock before taking the destination lock; the task is marked `Migrating`
//! across the window and every task-access reader spins it out.

use std::sync::Arc;

use spin::MutexGuard;

use crate::runqueue::Runqueue;
use crate::stats::RqStats;
use crate::task::Task;
use crate::types::{DequeueFlags, EnqueueFlags, OnRq, IDLE_WM, SCHED_RQ_NR_MIGRATION};
use crate::Scheduler;

impl Scheduler {
    /// Move a queued task to a new runqueue. Consumes the (locked) source
    /// and returns the locked destination.
    ///
    /// When `t` is the source's current task (the stopper bumped it off),
    /// the source is re-dispatched inline: account the task, hand the CPU
    /// to the next queue head, and release the task with the usual
    /// `on_cpu` protocol before it becomes claimable elsewhere.
    pub(crate) fn move_queued_task<'a>(
        &'a self,
        mut src: MutexGuard<'a, Runqueue>,
        t: &Arc<Task>,
        new_cpu: usize,
    ) -> MutexGuard<'a, Runqueue> {
        t.set_on_rq(OnRq::Migrating);
        let was_curr = Arc::ptr_eq(&src.curr, t);
        if was_curr {
            self.update_curr(&src, t);
        }
        self.dequeue_task(&mut src, t, DequeueFlags::empty());
        if was_curr {
            let next = src.queue.first();
            next.set_on_cpu();
            next.set_last_ran(src.clock_task);
            src.curr = next;
            RqStats::inc(&self.rqs[src.cpu].stats.nr_switches);
            t.clear_on_cpu();
        }
        t.set_cpu(new_cpu);
        RqStats::inc(&self.rqs[src.cpu].stats.migrations_out);
        drop(src);

        let mut dst = self.lock_rq(new_cpu);
        debug_assert_eq!(t.cpu(), new_cpu);
        self.enqueue_task(&mut dst, t, EnqueueFlags::empty());
        t.set_on_rq(OnRq::Queued);
        RqStats::inc(&self.rqs[new_cpu].stats.migrations_in);
        self.check_preempt_curr(&mut dst, t);
        dst
    }

    /// Body of the forced-migration stopper: re-validate under both locks,
    /// then move the task if it is still where the dispatcher saw it.
    /// Affinity may have changed again in flight; that is fine, the task
    /// just stays put.
    pub(crate) fn migration_cpu_stop(&self, cpu: usize, t: &Arc<Task>, dest_cpu: usize) {
        let _pi = t.pi_lock.lock();
        let mut rq = self.lock_rq(cpu);

        // If the task left this runqueue it cannot be migrated here: we
        // hold this rq's lock, and with pi_lock held it cannot get
        // enqueued elsewhere behind our back.
        if t.cpu() == cpu && t.on_rq() == OnRq::Queued && self.is_cpu_allowed(t, dest_cpu) {
            self.update_rq_clock(&mut rq);
            let dst = self.move_queued_task(rq, t, dest_cpu);
            drop(dst);
        }
    }

    /// Migrate a batch of queued tasks from `src` to `dst` (both locked).
    /// Walks the source queue in priority order, skipping the running task
    /// and tasks the destination does not admit, examining at most
    /// min(ceil(nr_running/2), SCHED_RQ_NR_MIGRATION) sleepers.
    fn migrate_pending_tasks(&self, src: &mut Runqueue, dst: &mut Runqueue) -> usize {
        let dest_cpu = dst.cpu;
        let mut nr_tries = ((src.nr_running + 1) / 2).min(SCHED_RQ_NR_MIGRATION);
        let mut nr_migrated = 0;

        let candidates: Vec<Arc<Task>> = src
            .queue
            .iter()
            .filter(|&t| !t.is_idle() && !t.on_cpu() && !Arc::ptr_eq(t, &src.curr))
            .cloned()
            .collect();

        for t in candidates {
            if nr_tries == 0 {
                break;
            }
            nr_tries -= 1;

            // Single-CPU affinity (per-CPU kthreads included) never moves.
            if !t.cpus_mask().is_set(dest_cpu) {
                continue;
            }

            self.dequeue_task(src, &t, DequeueFlags::empty());
            t.set_cpu(dest_cpu);
            self.enqueue_task(dst, &t, EnqueueFlags::empty());
            nr_migrated += 1;
        }

        if nr_migrated > 0 {
            RqStats::add(&self.rqs[src.cpu].stats.migrations_out, nr_migrated as u64);
            RqStats::add(&self.rqs[dest_cpu].stats.migrations_in, nr_migrated as u64);
            ktrace!(
                "sched: pulled {} tasks cpu{} -> cpu{}",
                nr_migrated,
                src.cpu,
                dest_cpu
            );
        }
        nr_migrated
    }

    /// Try-lock `src_cpu`'s runqueue and pull a batch into `rq`. A
    /// contended source is skipped without spinning: the lock nests at
    /// single depth under the destination lock, and only via try.
    fn lock_and_migrate_pending_tasks(&self, src_cpu: usize, rq: &mut Runqueue) -> usize {
        let Some(mut src) = self.rqs[src_cpu].lock.try_lock() else {
            return 0;
        };

        self.update_rq_clock(&mut src);
        let nr_migrated = self.migrate_pending_tasks(&mut src, rq);
        drop(src);

        if nr_migrated > 0 {
            self.platform.cpufreq_update(rq.cpu, false);
        }
        nr_migrated
    }

    /// Idle pull: walk the pending mask through this CPU's topology rings
    /// and take work from the first source that yields any. Gives up after
    /// two failed candidates rather than scanning the whole fleet.
    ///
    /// Context: rq lock held (the destination).
    pub(crate) fn take_other_rq_tasks(&self, rq: &mut Runqueue, cpu: usize) -> bool {
        if self.pending.load().is_empty() {
            return false;
        }

        let mut tried = 0;
        for ring in self.topology.pull_rings(cpu) {
            for src_cpu in self.pending.load().and(*ring).iter() {
                if self.lock_and_migrate_pending_tasks(src_cpu, rq) > 0 {
                    return true;
                }
                tried += 1;
                if tried > 1 {
                    return false;
                }
            }
        }
        false
    }

    // ========================================================================
    // SMT sibling-group balance
    // ========================================================================

    /// Stopper body for the active balance: push the CPU's sole running
    /// task onto a wholly idle sibling group.
    fn active_load_balance_stop(&self, cpu: usize, t: &Arc<Task>) {
        let _pi = t.pi_lock.lock();
        let mut rq = self.lock_rq(cpu);

        rq.active_balance = false;
        // Something may have changed the task meanwhile; double check.
        if t.cpu() == cpu && t.on_rq() == OnRq::Queued {
            if let Some(dest) = t.cpus_mask().any_and(self.watermark.sg_idle_mask()) {
                if self.is_cpu_allowed(t, dest) {
                    self.update_rq_clock(&mut rq);
                    let dst = self.move_queued_task(rq, t, dest);
                    drop(dst);
                }
            }
        }
    }

    /// Dispatch an active balance for `cpu` if it is running exactly one
    /// non-idle task that a wholly idle sibling group could take.
    fn sg_balance_trigger(&self, cpu: usize) -> bool {
        let Some(mut rq) = self.rqs[cpu].lock.try_lock() else {
            return false;
        };
        let curr = rq.curr.clone();
        let eligible = !curr.is_idle()
            && rq.nr_running == 1
            && curr.cpus_mask().intersects(self.watermark.sg_idle_mask());

        if !eligible || rq.active_balance {
            return false;
        }
        rq.active_balance = true;
        drop(rq);

        let sched = self.self_arc();
        let task = curr;
        self.platform.stop_one_cpu(
            cpu,
            Box::new(move || sched.active_load_balance_stop(cpu, &task)),
        );
        true
    }

    /// Sibling-group balance check, run after a context switch on `cpu`.
    pub(crate) fn sg_balance_check(&self, cpu: usize) {
        // No wholly idle sibling group, nothing to feed.
        if self.watermark.sg_idle_mask().is_empty() {
            return;
        }

        // Only CPUs inside an idle sibling group go hunting.
        if self.watermark.sg_idle_mask().is_set(cpu) {
            // Candidate sources: online, not pending (they are served by
            // plain pulls), not idle.
            let chk = self
                .online_mask()
                .andnot(self.pending.load())
                .andnot(self.watermark.mask(IDLE_WM));
            if chk.is_empty() {
                return;
            }

            let mut tried = 0;
            for i in chk.iter_wrap(cpu) {
                // Skip cores that still have an idle or a pending sibling.
                if self
                    .topology
                    .smt_mask(i)
                    .intersects(self.watermark.mask(IDLE_WM))
                {
                    continue;
                }
                if self.topology.smt_mask(i).intersects(self.pending.load()) {
                    continue;
                }
                if self.sg_balance_trigger(i) {
                    return;
                }
                tried += 1;
                if tried > 1 {
                    return;
                }
            }
            return;
        }

        // A CPU outside any idle group triggers for itself when its whole
        // sibling group is saturated but unpending.
        let nr_running = self.lock_rq(cpu).nr_running;
        if nr_running != 1 {
            return;
        }
        let smt = self.topology.smt_mask(cpu);
        let chk = smt
            .andnot(self.pending.load())
            .andnot(self.watermark.mask(IDLE_WM));
        if chk == smt {
            self.sg_balance_trigger(cpu);
        }
    }

    // ========================================================================
    // Hotplug
    // ========================================================================

    /// Mark `cpu`'s runqueue as participating in pulls again.
    pub fn set_rq_online(&self, cpu: usize) {
        self.lock_rq(cpu).online = true;
    }

    /// Take `cpu`'s runqueue out of service and drain every queued task
    /// onto still-usable CPUs through the fallback placement path.
    pub fn set_rq_offline(&self, cpu: usize) {
        self.lock_rq(cpu).online = false;

        loop {
            let src = self.lock_rq(cpu);
            let victim = src
                .queue
                .iter()
                .find(|&t| !t.is_idle() && !Arc::ptr_eq(t, &src.curr))
                .cloned();
            let Some(t) = victim else {
                break;
            };
            let dest = self.select_fallback_rq(cpu, &t);
            if dest == cpu {
                // The platform still reports this CPU usable; draining
                // onto itself would spin forever.
                kwarn!("sched: cpu{} offline but still the fallback target", cpu);
                break;
            }
            let dst = self.move_queued_task(src, &t, dest);
            drop(dst);
        }
    }
}
