//! Platform collaborator interface
//!
//! Everything the scheduler core needs from its enclosing kernel arrives
//! through this trait: time, cross-CPU kicks, the high-resolution preemption
//! timer, the stopper mechanism and CPU liveness. The core never blocks on
//! any of these; they are fire-and-forget or plain reads.
//!
//! Tests supply mock implementations (recording IPIs, driving a fake clock);
//! a real embedding wires them to its interrupt and timekeeping machinery.

use crate::cpumask::CpuMask;
use crate::task::Task;

/// A closure dispatched through the stopper mechanism. The stopper runs it
/// on the target CPU at strictly higher priority than any scheduler-managed
/// task; it completes even if the target is being unplugged (it then runs
/// wherever it was delivered).
pub type StopFn = Box<dyn FnOnce() + Send>;

pub trait Platform: Send + Sync {
    /// Monotonic per-CPU clock in nanoseconds. Never decreases across calls
    /// on a given CPU.
    fn now_ns(&self, cpu: usize) -> u64;

    /// Cumulative interrupt-attributed time on `cpu`, subtracted from the
    /// task clock.
    fn irq_time_ns(&self, _cpu: usize) -> u64 {
        0
    }

    /// Cumulative paravirt-stolen time on `cpu`, subtracted from the task
    /// clock.
    fn steal_time_ns(&self, _cpu: usize) -> u64 {
        0
    }

    /// The CPU the calling thread of execution represents, if it is one of
    /// the scheduler's CPUs. Used to suppress self-IPIs.
    fn current_cpu(&self) -> Option<usize> {
        None
    }

    /// Best-effort reschedule kick; may race, may be lost on hot-unplug.
    fn send_reschedule_ipi(&self, cpu: usize);

    /// Arm the one-shot preemption timer on `cpu` for `delay_ns` from now.
    fn hrtimer_start(&self, _cpu: usize, _delay_ns: u64) {}

    /// Cancel a pending preemption timer on `cpu`.
    fn hrtimer_cancel(&self, _cpu: usize) {}

    /// Force `cpu` to execute `f` at highest priority, preempting whatever
    /// runs there. Callers never hold scheduler locks across this call.
    fn stop_one_cpu(&self, cpu: usize, f: StopFn);

    fn cpu_online(&self, _cpu: usize) -> bool {
        true
    }

    /// Active CPUs accept new task placements; active ⊆ online.
    fn cpu_active(&self, _cpu: usize) -> bool {
        true
    }

    /// Frequency governor hint. `iowait_boost` marks a wakeup from iowait.
    fn cpufreq_update(&self, _cpu: usize, _iowait_boost: bool) {}

    /// Last-resort affinity for a task whose mask became disjoint from the
    /// online set; the cpuset layer may widen it. `None` leaves the mask
    /// untouched and the fallback escalates to the possible set.
    fn cpuset_fallback(&self, _task: &Task) -> Option<CpuMask> {
        None
    }

    /// Perform the architecture context switch from `prev` to `next` on
    /// `cpu`. The core has finished all bookkeeping by this point; a mock
    /// just records the transition.
    fn context_switch(&self, _cpu: usize, _prev: &Task, _next: &Task) {}
}
