//! bmq-sched: a priority-bitmap multi-queue CPU scheduler core
//!
//! The subsystem that, given a fleet of per-CPU runqueues and a stream of
//! task events (wake, sleep, fork, tick, yield, migrate, priority change),
//! decides which runnable task runs next on each CPU and moves tasks
//! between CPUs to balance load.
//!
//! ## Architecture
//!
//! - Each CPU owns a runqueue with a priority bitmap queue: an array of
//!   FIFO buckets indexed by effective priority plus a find-first-bit
//!   bitmap, so enqueue/dequeue/pick are O(1).
//! - A global watermark index advertises, per priority level, which CPUs
//!   currently admit a task of at most that urgency. Placement and
//!   balancing read it lock-free.
//! - Non-realtime tasks carry a dynamic boost adjustment approximating
//!   interactivity: block quickly and rise, burn a full slice and sink.
//! - Idle CPUs pull batches of queued tasks along the CPU topology rings;
//!   an SMT-aware active balancer keeps whole sibling groups from idling
//!   next to a saturated core.
//!
//! ## Module Organization
//!
//! - `types`: policies, states, priority constants, config, errors
//! - `cpumask`: CPU set types (plain and lock-free shared)
//! - `task`: the externally owned task handle and its locking contract
//! - `bmq`: the per-CPU priority bitmap queue
//! - `runqueue`: per-CPU runqueue, clocks, enqueue/dequeue/requeue
//! - `watermark`: the global per-level CPU masks
//! - `topology`: proximity rings and the nearest-CPU search
//! - `placement`: target CPU selection for wakes and forks
//! - `schedule`: schedule(), tick, preemption, boost/deboost, yield
//! - `wake`: try_to_wake_up and its memory-ordering protocol
//! - `process`: fork/exit setup, policy/nice/affinity changes, PI hook
//! - `balance`: idle pulls, forced migration, SMT sibling-group balance
//! - `stats`: counters and system-wide queries
//! - `platform`: the collaborator trait the host kernel implements

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {{
        ::log::log!($level, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {{
        $crate::klog!(::log::Level::Error, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {{
        $crate::klog!(::log::Level::Warn, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {{
        $crate::klog!(::log::Level::Info, $($arg)*);
    }};
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {{
        $crate::klog!(::log::Level::Debug, $($arg)*);
    }};
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {{
        $crate::klog!(::log::Level::Trace, $($arg)*);
    }};
}

mod balance;
mod bmq;
pub mod cpumask;
mod placement;
pub mod platform;
mod process;
mod runqueue;
mod schedule;
mod stats;
pub mod task;
pub mod topology;
pub mod types;
mod wake;
mod watermark;

use std::sync::{Arc, Weak};

use spin::MutexGuard;

use cpumask::AtomicCpuMask;
use runqueue::{CpuRq, Runqueue};
use topology::Topology;
use watermark::WatermarkIndex;

// Re-export the embedding-facing surface.
pub use cpumask::CpuMask;
pub use platform::{Platform, StopFn};
pub use stats::SchedStats;
pub use task::{Pid, Task};
pub use topology::CpuTopology;
pub use types::{
    Credentials, OnRq, RequestedPolicy, SchedAttr, SchedConfig, SchedError, SchedPolicy,
    SchedResult, TaskState, WakeFlags, YieldType,
};

/// One scheduler instance: per-CPU runqueues, the watermark index, the
/// pending mask and the topology rings, all initialized at start-of-day.
/// Cross references between tasks and runqueues go by CPU id; the per-CPU
/// cells are the only mutable state inside.
pub struct Scheduler {
    pub(crate) config: SchedConfig,
    pub(crate) platform: Arc<dyn Platform>,
    pub(crate) topology: Topology,
    pub(crate) rqs: Box<[CpuRq]>,
    pub(crate) watermark: WatermarkIndex,
    /// CPUs whose nr_running exceeds one: the candidates idle pulls raid.
    pub(crate) pending: AtomicCpuMask,
    /// Back-reference for stopper closures, which outlive the borrow they
    /// were created under.
    self_ref: Weak<Scheduler>,
}

impl Scheduler {
    /// Bring up a scheduler for the CPUs described by `topo`. Every CPU
    /// starts online, idle, and advertising the idle watermark.
    pub fn new(
        config: SchedConfig,
        topo: &CpuTopology,
        platform: Arc<dyn Platform>,
    ) -> Arc<Scheduler> {
        kinfo!(
            "sched: BMQ core starting, {} CPUs, timeslice {}ms",
            topo.nr_cpus,
            config.timeslice_ns / 1_000_000
        );

        let topology = Topology::build(topo);
        let rqs: Box<[CpuRq]> = (0..topo.nr_cpus)
            .map(|cpu| {
                let idle = Arc::new(Task::new_idle(cpu));
                CpuRq {
                    lock: spin::Mutex::new(Runqueue::new(
                        cpu,
                        idle,
                        platform.cpu_online(cpu),
                    )),
                    nr_iowait: Default::default(),
                    stats: Default::default(),
                }
            })
            .collect();

        Arc::new_cyclic(|weak| Scheduler {
            config,
            platform,
            topology,
            rqs,
            watermark: WatermarkIndex::new(topo.present_mask()),
            pending: AtomicCpuMask::new(CpuMask::empty()),
            self_ref: weak.clone(),
        })
    }

    /// Owned handle for a deferred dispatch. Infallible while any caller
    /// can still reach `&self` through the owning Arc.
    pub(crate) fn self_arc(&self) -> Arc<Scheduler> {
        self.self_ref.upgrade().expect("scheduler dropped")
    }

    #[inline]
    pub fn nr_cpus(&self) -> usize {
        self.topology.nr_cpus()
    }

    #[inline]
    pub(crate) fn lock_rq(&self, cpu: usize) -> MutexGuard<'_, Runqueue> {
        self.rqs[cpu].lock.lock()
    }

    /// The task currently running on `cpu`.
    pub fn curr_task(&self, cpu: usize) -> Arc<Task> {
        self.lock_rq(cpu).curr.clone()
    }

    /// The resident idle task of `cpu`.
    pub fn idle_task(&self, cpu: usize) -> Arc<Task> {
        self.lock_rq(cpu).idle.clone()
    }

    /// Does `cpu` have a pending reschedule request?
    pub fn need_resched_cpu(&self, cpu: usize) -> bool {
        self.lock_rq(cpu).curr.need_resched()
    }

    /// The watermark level `cpu` currently advertises.
    pub fn rq_watermark(&self, cpu: usize) -> usize {
        self.lock_rq(cpu).watermark
    }

    /// Snapshot of the pending mask (CPUs with more than one runnable).
    pub fn pending_mask(&self) -> CpuMask {
        self.pending.load()
    }

    /// `(clock, clock_task)` of `cpu`'s runqueue.
    pub fn rq_clock(&self, cpu: usize) -> (u64, u64) {
        let rq = self.lock_rq(cpu);
        (rq.clock, rq.clock_task)
    }

    /// Install an initial running task on `cpu`, as the host does when it
    /// adopts an already-executing thread of control at boot. The task is
    /// enqueued and becomes `curr`.
    pub fn adopt_running(&self, cpu: usize, t: &Arc<Task>) {
        let _pi = t.pi_lock.lock();
        t.set_cpu(cpu);
        t.set_state(types::TaskState::RUNNING);
        t.set_time_slice(self.config.timeslice_ns as i64);

        let mut guard = self.lock_rq(cpu);
        let rq = &mut *guard;
        self.update_rq_clock(rq);
        self.activate_task(rq, t);
        t.set_on_cpu();
        t.set_last_ran(rq.clock_task);
        rq.curr = t.clone();
    }
}
