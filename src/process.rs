//! Task lifecycle and parameter changes
//!
//! The operations the host kernel drives task scheduling state through:
//! fork-time setup, policy and nice changes with their permission rules,
//! affinity updates (including forced migration off a now-disallowed CPU),
//! the priority-inheritance hook and the runtime query.
//!
//! Every parameter change follows the same locking shape: validate outside
//! any lock, then take the task's pi_lock plus the task-access lock,
//! mutate, and re-file the task if its bucket moved.

use std::sync::Arc;

use crate::cpumask::CpuMask;
use crate::runqueue::Runqueue;
use crate::task::{compute_normal_prio, Task};
use crate::types::{
    nice_to_prio, prio_to_nice, Credentials, OnRq, RequestedPolicy, SchedAttr, SchedError,
    SchedPolicy, SchedResult, TaskState, MAX_PRIORITY_ADJ, MAX_RT_PRIO, RESCHED_NS, STOP_PRIO,
};
use crate::Scheduler;

impl Scheduler {
    /// A priority perturbation may have moved the task's bucket; re-file
    /// it lazily and trigger preemption re-evaluation if it really moved.
    ///
    /// Context: rq lock held.
    pub(crate) fn check_task_changed(&self, rq: &mut Runqueue, t: &Arc<Task>) {
        if t.on_rq() == OnRq::Queued && self.requeue_task_lazy(rq, t) {
            self.check_preempt_curr(rq, t);
        }
    }

    /// Effective priority with a PI donation folded in: the more urgent of
    /// `prio` and whatever a blocked waiter donated.
    fn rt_effective_prio(&self, t: &Arc<Task>, prio: i32) -> i32 {
        match t.pi_donor_prio() {
            Some(donated) => prio.min(donated),
            None => prio,
        }
    }

    /// Scheduler setup for a freshly forked task. The child inherits the
    /// parent's scheduling parameters (PI boost excluded), starts with the
    /// pessimistic boost, and takes half of the parent's remaining
    /// timeslice so fork does not mint fresh slice out of thin air.
    ///
    /// `cpu` is the CPU the parent is forking on.
    pub fn sched_fork(&self, cpu: usize, parent: &Arc<Task>, child: &Arc<Task>) {
        // NEW guarantees nobody runs the child or wakes it onto a
        // runqueue before wake_up_new_task.
        child.set_state(TaskState::NEW);

        child.set_sched_params(parent.policy(), parent.static_prio(), parent.rt_priority());
        child.set_cpus_mask(parent.cpus_mask());
        child.set_reset_on_fork(parent.reset_on_fork());

        // The child must not inherit a PI-boosted priority.
        child.set_prio(parent.normal_prio());

        if child.reset_on_fork() {
            if child.policy().is_realtime() {
                child.set_sched_params(SchedPolicy::Normal, nice_to_prio(0), 0);
            } else if child.static_prio() < nice_to_prio(0) {
                child.set_sched_params(child.policy(), nice_to_prio(0), 0);
            }
            child.set_prio(child.compute_normal_prio());
            child.set_reset_on_fork(false);
        }

        child.set_boost_prio(MAX_PRIORITY_ADJ);

        // Split the slice with the parent: the total amount of pending
        // timeslice in the system stays constant across fork.
        {
            let mut guard = self.lock_rq(cpu);
            let rq = &mut *guard;
            let curr = rq.curr.clone();
            curr.set_time_slice(curr.time_slice() / 2);
            child.set_time_slice(curr.time_slice());
            self.platform
                .hrtimer_start(cpu, curr.time_slice().max(0) as u64);

            if curr.time_slice() < RESCHED_NS {
                curr.set_time_slice(self.config.timeslice_ns as i64);
                self.resched_curr(rq);
            }
        }

        let _pi = child.pi_lock.lock();
        // First CPU assignment; wake_up_new_task rebalances later.
        child.set_cpu(cpu);
    }

    /// Install (or clear) the per-CPU stopper task handle. The stop task
    /// appears as a top-priority FIFO thread and is refused by the
    /// setscheduler path.
    pub fn set_stop_task(&self, cpu: usize, stop: Option<Arc<Task>>) {
        if let Some(ref t) = stop {
            let _pi = t.pi_lock.lock();
            t.set_sched_params(SchedPolicy::Fifo, t.static_prio(), STOP_PRIO);
            t.set_prio(t.compute_normal_prio());
        }
        self.lock_rq(cpu).stop = stop;
    }

    fn validate_attr(attr: &SchedAttr) -> SchedResult<(SchedPolicy, SchedAttr)> {
        // Deadline requests are folded onto top-priority FIFO.
        let attr = if attr.policy == RequestedPolicy::Deadline {
            SchedAttr {
                policy: RequestedPolicy::Fifo,
                rt_priority: MAX_RT_PRIO - 1,
                nice: 0,
                reset_on_fork: attr.reset_on_fork,
            }
        } else {
            *attr
        };

        let policy = attr.policy.to_policy().ok_or(SchedError::InvalidParam)?;

        // Valid priorities: 1..=99 for RR/FIFO, exactly 0 for the rest.
        if attr.rt_priority < 0 || attr.rt_priority > MAX_RT_PRIO - 1 {
            return Err(SchedError::InvalidParam);
        }
        if policy.is_realtime() != (attr.rt_priority != 0) {
            return Err(SchedError::InvalidParam);
        }
        if attr.nice < -20 || attr.nice > 19 {
            return Err(SchedError::InvalidParam);
        }

        Ok((policy, attr))
    }

    fn check_permissions(
        t: &Arc<Task>,
        policy: SchedPolicy,
        attr: &SchedAttr,
        creds: &Credentials,
    ) -> SchedResult<()> {
        if creds.privileged {
            return Ok(());
        }

        if policy.is_realtime() {
            // Can't adopt a realtime policy with a zero rlimit.
            if policy != t.policy() && creds.rtprio_limit == 0 {
                return Err(SchedError::PermissionDenied);
            }
            // Can't raise the priority beyond the rlimit.
            if attr.rt_priority > t.rt_priority() && attr.rt_priority > creds.rtprio_limit {
                return Err(SchedError::PermissionDenied);
            }
        }

        // Can't change another user's tasks.
        if !creds.owns_task {
            return Err(SchedError::PermissionDenied);
        }

        // Normal users shall not clear the reset-on-fork flag.
        if t.reset_on_fork() && !attr.reset_on_fork {
            return Err(SchedError::PermissionDenied);
        }

        Ok(())
    }

    fn setscheduler(
        &self,
        t: &Arc<Task>,
        attr: &SchedAttr,
        creds: Option<&Credentials>,
    ) -> SchedResult<()> {
        let (policy, attr) = Self::validate_attr(attr)?;
        if let Some(creds) = creds {
            Self::check_permissions(t, policy, &attr, creds)?;
        }

        // No PI waiter may arrive or leave while the priority changes.
        let _pi = t.pi_lock.lock();
        let rq_guard = self.task_access_lock(t);

        // Retuning the stop thread is refused outright.
        let is_stop = match &rq_guard {
            Some(rq) => rq.stop.as_ref().is_some_and(|s| Arc::ptr_eq(s, t)),
            None => {
                let rq = self.lock_rq(t.cpu());
                rq.stop.as_ref().is_some_and(|s| Arc::ptr_eq(s, t))
            }
        };
        if is_stop {
            return Err(SchedError::InvalidParam);
        }

        // Nothing changes: only record the reset flag.
        if policy == t.policy() {
            let rt_same = !policy.is_realtime() || attr.rt_priority == t.rt_priority();
            let nice_same = policy.is_realtime() || nice_to_prio(attr.nice) == t.static_prio();
            if rt_same && nice_same {
                t.set_reset_on_fork(attr.reset_on_fork);
                return Ok(());
            }
        }

        t.set_reset_on_fork(attr.reset_on_fork);

        // If a PI boost dominates the new priority anyway, store the
        // parameters and leave the queue placement alone; the deboost
        // path applies them later.
        let newprio = compute_normal_prio(policy, nice_to_prio(attr.nice), attr.rt_priority);
        if self.rt_effective_prio(t, newprio) == t.prio() {
            t.set_sched_params(policy, nice_to_prio(attr.nice), attr.rt_priority);
            return Ok(());
        }

        t.set_sched_params(policy, nice_to_prio(attr.nice), attr.rt_priority);
        let prio = self.rt_effective_prio(t, t.compute_normal_prio());
        t.set_prio(prio);
        kdebug!(
            "sched: pid={} policy={:?} rt_priority={} nice={} -> prio {}",
            t.pid(),
            policy,
            attr.rt_priority,
            attr.nice,
            prio
        );

        if let Some(mut rq) = rq_guard {
            self.check_task_changed(&mut rq, t);
        }
        Ok(())
    }

    /// Change policy and priority from kernel context (no permission
    /// checks).
    pub fn set_policy(&self, t: &Arc<Task>, attr: &SchedAttr) -> SchedResult<()> {
        self.setscheduler(t, attr, None)
    }

    /// Change policy and priority on behalf of a user; `creds` carries the
    /// adapter-resolved privilege, rlimit and ownership facts.
    pub fn set_policy_checked(
        &self,
        t: &Arc<Task>,
        attr: &SchedAttr,
        creds: &Credentials,
    ) -> SchedResult<()> {
        self.setscheduler(t, attr, Some(creds))
    }

    /// Change a task's nice value. Allowed on realtime tasks too, where it
    /// only takes effect once the task drops back to a normal policy.
    pub fn set_user_nice(&self, t: &Arc<Task>, nice: i32) {
        if !(-20..=19).contains(&nice) || prio_to_nice(t.static_prio()) == nice {
            return;
        }

        // The task might be mid-schedule on another CPU; the access lock
        // stabilizes it.
        let _pi = t.pi_lock.lock();
        let rq_guard = self.task_access_lock(t);

        t.set_static_prio(nice_to_prio(nice));
        if t.policy().is_realtime() {
            return;
        }

        t.set_prio(t.effective_prio());
        if let Some(mut rq) = rq_guard {
            self.check_task_changed(&mut rq, t);
        }
    }

    /// Priority-inheritance hook: adopt (or drop) a donated effective
    /// priority. `donor` is the most urgent blocked waiter, or `None` when
    /// the boost ends. normal_prio is never touched here.
    pub fn set_effective_prio(&self, t: &Arc<Task>, donor: Option<&Arc<Task>>) {
        let donor_prio = donor.map(|d| d.prio());
        let prio = match donor_prio {
            Some(dp) => dp.min(t.normal_prio()),
            None => t.normal_prio(),
        };

        if t.pi_donor_prio() == donor_prio && prio == t.prio() {
            return;
        }

        let _pi = t.pi_lock.lock();
        let rq_guard = self.task_access_lock(t);

        // Set under both locks so either suffices for readers.
        t.set_pi_donor_prio(donor_prio);

        if prio == t.prio() {
            return;
        }

        // Idle task boosting is a nono.
        if t.is_idle() {
            kwarn!(
                "sched: refusing PI boost of the idle task on cpu{}",
                t.cpu()
            );
            return;
        }

        t.set_prio(prio);
        if let Some(mut rq) = rq_guard {
            self.check_task_changed(&mut rq, t);
        }
    }

    /// Replace the allowed CPU set, migrating the task away if the CPU it
    /// occupies is no longer permitted. A running task is moved through
    /// the stopper; a queued one is re-filed directly.
    pub fn set_affinity(&self, t: &Arc<Task>, new_mask: CpuMask) -> SchedResult<()> {
        let pi = t.pi_lock.lock();
        let rq_guard = self.task_access_lock(t);

        // Kernel threads may land on online-but-inactive CPUs.
        let valid_mask = if t.is_kthread() {
            self.online_mask()
        } else {
            self.active_mask()
        };

        if t.no_setaffinity() {
            return Err(SchedError::InvalidAffinity);
        }

        if new_mask == t.cpus_mask() {
            return Ok(());
        }

        if !new_mask.intersects(valid_mask) {
            return Err(SchedError::InvalidAffinity);
        }

        t.set_cpus_mask(new_mask);

        // Still on an allowed CPU: nothing to move.
        if new_mask.is_set(t.cpu()) {
            return Ok(());
        }

        // Watermark-preferred destination within the new mask, topology
        // tie-broken; re-validated by the migration itself.
        let dest_cpu = {
            let preferred = new_mask.and(valid_mask);
            let idle = preferred.and(self.watermark.mask(crate::types::IDLE_WM));
            let pick = if !idle.is_empty() { idle } else { preferred };
            self.topology.best_mask_cpu(t.cpu(), pick)
        };

        let running = match &rq_guard {
            Some(rq) => Arc::ptr_eq(&rq.curr, t),
            None => false,
        };
        if running || t.state() == TaskState::WAKING {
            // Need the stopper's help: drop the locks and let it bump the
            // task off its CPU.
            let src_cpu = t.cpu();
            drop(rq_guard);
            drop(pi);

            let sched = self.self_arc();
            let task = t.clone();
            self.platform.stop_one_cpu(
                src_cpu,
                Box::new(move || sched.migration_cpu_stop(src_cpu, &task, dest_cpu)),
            );
            return Ok(());
        }

        if t.on_rq() == OnRq::Queued {
            if let Some(mut rq) = rq_guard {
                self.update_rq_clock(&mut rq);
                let dest = self.move_queued_task(rq, t, dest_cpu);
                drop(dest);
            }
        }

        Ok(())
    }

    /// Accounted runtime of `t` in ns, including the still-unaccounted
    /// delta if it is running right now.
    pub fn task_runtime_ns(&self, t: &Arc<Task>) -> u64 {
        // Cheap path: a task that is neither executing nor queued cannot
        // accumulate runtime concurrently, so the plain 64-bit read is
        // exact. Racing against CPU entry only makes the value look like
        // a read a few cycles earlier.
        if !t.on_cpu() || t.on_rq() != OnRq::Queued {
            return t.sched_time();
        }

        let _pi = t.pi_lock.lock();
        if let Some(mut guard) = self.task_access_lock(t) {
            // Must be both current and queued: a dequeued task would get
            // cycles projected onto it that it may never run.
            if Arc::ptr_eq(&guard.curr, t) && t.on_rq() == OnRq::Queued {
                let rq = &mut *guard;
                self.update_rq_clock(rq);
                self.update_curr(rq, t);
            }
        }
        t.sched_time()
    }
}
