//! Task placement
//!
//! Given a task about to become runnable, pick the CPU it should land on.
//! The engine prefers CPUs the task could *preempt* (their advertised
//! watermark is lighter than the task's own slot) over CPUs that would
//! merely run it later, and breaks ties toward cache locality through the
//! topology rings.
//!
//! Watermark reads here are optimistic: the chosen CPU re-validates under
//! its own runqueue lock on arrival, so stale data only costs placement
//! quality, never correctness.

use std::sync::Arc;

use crate::cpumask::CpuMask;
use crate::task::Task;
use crate::types::bucket_to_watermark;
use crate::Scheduler;

impl Scheduler {
    /// CPUs the platform reports online.
    pub(crate) fn online_mask(&self) -> CpuMask {
        let mut mask = CpuMask::empty();
        for cpu in 0..self.nr_cpus() {
            if self.platform.cpu_online(cpu) {
                mask.set(cpu);
            }
        }
        mask
    }

    /// CPUs accepting new placements; active ⊆ online.
    pub(crate) fn active_mask(&self) -> CpuMask {
        let mut mask = CpuMask::empty();
        for cpu in 0..self.nr_cpus() {
            if self.platform.cpu_active(cpu) {
                mask.set(cpu);
            }
        }
        mask
    }

    /// May `t` be placed on `cpu` right now? Per-CPU kernel threads may use
    /// online-but-inactive CPUs; everything else needs an active CPU.
    pub(crate) fn is_cpu_allowed(&self, t: &Arc<Task>, cpu: usize) -> bool {
        if !t.cpus_mask().is_set(cpu) {
            return false;
        }
        if t.is_kthread() && t.nr_cpus_allowed() == 1 {
            return self.platform.cpu_online(cpu);
        }
        self.platform.cpu_active(cpu)
    }

    /// Pick a target CPU for `t`.
    ///
    /// Context: t's pi_lock.
    pub(crate) fn select_task_rq(&self, t: &Arc<Task>) -> usize {
        let chk = t.cpus_mask().and(self.online_mask());
        if chk.is_empty() {
            return self.select_fallback_rq(t.cpu(), t);
        }

        // Scan watermark levels lighter than the slot t would occupy:
        // any CPU found there can be preempted by t immediately.
        let preempt_level = bucket_to_watermark(t.sched_idx());
        let mut level = self.watermark.first_level();
        while let Some(l) = level {
            if l >= preempt_level {
                break;
            }
            let tmp = chk.and(self.watermark.mask(l));
            if !tmp.is_empty() {
                return self.topology.best_mask_cpu(t.cpu(), tmp);
            }
            level = self.watermark.next_level(l + 1);
        }

        self.topology.best_mask_cpu(t.cpu(), chk)
    }

    /// Last-resort placement when the allowed mask is disjoint from the
    /// online set: probe cache-local CPUs, then any allowed+active CPU,
    /// then let the cpuset layer widen the mask, then relax to the whole
    /// possible set. Still finding nothing is a configuration bug.
    pub(crate) fn select_fallback_rq(&self, cpu: usize, t: &Arc<Task>) -> usize {
        enum Pass {
            Cpuset,
            Possible,
            Fail,
        }

        // Look for an allowed, active CPU sharing a cache with `cpu`.
        for dest in self.topology.llc_mask(cpu).iter() {
            if self.platform.cpu_active(dest) && t.cpus_mask().is_set(dest) {
                return dest;
            }
        }

        let mut pass = Pass::Cpuset;
        loop {
            // Any allowed, usable CPU?
            for dest in t.cpus_mask().iter() {
                if self.is_cpu_allowed(t, dest) {
                    if !matches!(pass, Pass::Cpuset) {
                        kwarn!(
                            "sched: task pid={} no longer affine to cpu{}",
                            t.pid(),
                            cpu
                        );
                    }
                    return dest;
                }
            }

            pass = match pass {
                Pass::Cpuset => {
                    if let Some(mask) = self.platform.cpuset_fallback(t) {
                        t.set_cpus_mask(mask);
                    }
                    Pass::Possible
                }
                Pass::Possible => {
                    t.set_cpus_mask(CpuMask::all(self.nr_cpus()));
                    Pass::Fail
                }
                Pass::Fail => {
                    panic!("sched: no usable CPU for task pid={}", t.pid());
                }
            };
        }
    }
}
