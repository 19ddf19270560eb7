//! Task handle
//!
//! The scheduler core does not own task lifetimes: tasks are created by the
//! enclosing kernel and handed in as `Arc<Task>`. The core reads and writes
//! the scheduling fields of the handle under a composite locking rule:
//!
//! - `state`, `on_rq`, `on_cpu`, `need_resched` are atomics manipulated with
//!   explicit acquire/release ordering on the wakeup fast path.
//! - Everything else lives in [`SchedFields`] and is protected by the task's
//!   `pi_lock`, the runqueue lock of the task's current CPU, or both,
//!   mirroring the runqueue/pi locking rule of the core. Accessors perform
//!   plain reads/writes; callers are responsible for holding a covering
//!   lock.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::cpumask::CpuMask;
use crate::types::{
    nice_to_prio, rt_prio, OnRq, SchedPolicy, TaskState, IDLE_PRIO, IDLE_TASK_SCHED_PRIO,
    MAX_CPUS, MAX_PRIORITY_ADJ, MAX_RT_PRIO,
};

pub type Pid = u64;

/// Scheduling fields protected by the pi_lock / runqueue-lock rule.
#[derive(Debug)]
pub(crate) struct SchedFields {
    pub policy: SchedPolicy,
    pub static_prio: i32,
    pub rt_priority: i32,
    /// Effective priority; smaller = more urgent. May be RT-boosted by PI.
    pub prio: i32,
    /// Priority computed from policy/static/rt_priority, without PI boost.
    pub normal_prio: i32,
    /// Dynamic adjustment in [-MAX_PRIORITY_ADJ, +MAX_PRIORITY_ADJ],
    /// non-realtime tasks only.
    pub boost_prio: i32,
    /// PBQ bucket the task is filed under. Valid iff on_rq == Queued.
    pub queue_idx: usize,
    /// Remaining timeslice in ns. May transiently go negative.
    pub time_slice: i64,
    /// Task-clock timestamp at last dispatch.
    pub last_ran: u64,
    /// Allowed CPU set and its cardinality.
    pub cpus_mask: CpuMask,
    pub nr_cpus_allowed: u32,
    /// Revert to default policy/priority in sched_fork.
    pub reset_on_fork: bool,
    /// Effective priority donated by the PI machinery, if any.
    pub pi_donor_prio: Option<i32>,
}

/// A schedulable entity. Externally owned; see the module docs for the
/// locking contract on each field group.
pub struct Task {
    pid: Pid,
    name: &'static str,
    /// Per-CPU kernel thread: may run on online-but-inactive CPUs and is
    /// never migrated by the balancer.
    kthread: bool,
    /// Affinity changes rejected (pinned kernel thread).
    no_setaffinity: bool,

    /// Ordered outside any runqueue lock.
    pub(crate) pi_lock: Mutex<()>,

    state: AtomicU32,
    on_cpu: AtomicBool,
    on_rq: AtomicU8,
    cpu: AtomicUsize,
    need_resched: AtomicBool,
    signal_pending: AtomicBool,
    in_iowait: AtomicBool,
    /// Snapshot taken by the wake path: was the task contributing to the
    /// uninterruptible count when it went to sleep?
    contributes_to_load: AtomicBool,
    /// Accumulated runtime in ns; relaxed-readable for the lockless
    /// task_runtime_ns fast path.
    sched_time: AtomicU64,

    sched: UnsafeCell<SchedFields>,
}

// The UnsafeCell fields are protected by the pi_lock/rq-lock rule above.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// Create a task with default scheduling parameters: SCHED_NORMAL,
    /// nice 0, allowed on every CPU.
    pub fn new(pid: Pid, name: &'static str) -> Task {
        let static_prio = nice_to_prio(0);
        Task {
            pid,
            name,
            kthread: false,
            no_setaffinity: false,
            pi_lock: Mutex::new(()),
            state: AtomicU32::new(TaskState::NEW.bits()),
            on_cpu: AtomicBool::new(false),
            on_rq: AtomicU8::new(OnRq::Off as u8),
            cpu: AtomicUsize::new(0),
            need_resched: AtomicBool::new(false),
            signal_pending: AtomicBool::new(false),
            in_iowait: AtomicBool::new(false),
            contributes_to_load: AtomicBool::new(false),
            sched_time: AtomicU64::new(0),
            sched: UnsafeCell::new(SchedFields {
                policy: SchedPolicy::Normal,
                static_prio,
                rt_priority: 0,
                prio: static_prio + MAX_PRIORITY_ADJ,
                normal_prio: static_prio + MAX_PRIORITY_ADJ,
                boost_prio: MAX_PRIORITY_ADJ,
                queue_idx: 0,
                time_slice: 0,
                last_ran: 0,
                cpus_mask: CpuMask::all(MAX_CPUS),
                nr_cpus_allowed: MAX_CPUS as u32,
                reset_on_fork: false,
                pi_donor_prio: None,
            }),
        }
    }

    /// Builder: set the scheduling policy (and RT priority for RR/FIFO).
    pub fn with_policy(mut self, policy: SchedPolicy, rt_priority: i32) -> Self {
        let f = self.sched.get_mut();
        f.policy = policy;
        f.rt_priority = rt_priority;
        f.normal_prio = compute_normal_prio(policy, f.static_prio, rt_priority);
        f.prio = f.normal_prio;
        self
    }

    /// Builder: set the nice value.
    pub fn with_nice(mut self, nice: i32) -> Self {
        let f = self.sched.get_mut();
        f.static_prio = nice_to_prio(nice.clamp(-20, 19));
        f.normal_prio = compute_normal_prio(f.policy, f.static_prio, f.rt_priority);
        if !f.policy.is_realtime() {
            f.prio = f.normal_prio;
        }
        self
    }

    /// Builder: restrict the allowed CPU set.
    pub fn with_affinity(mut self, mask: CpuMask) -> Self {
        let f = self.sched.get_mut();
        f.cpus_mask = mask;
        f.nr_cpus_allowed = mask.weight();
        self
    }

    /// Builder: start with a specific boost adjustment (tests and fork).
    pub fn with_boost(mut self, boost: i32) -> Self {
        let f = self.sched.get_mut();
        f.boost_prio = boost.clamp(-MAX_PRIORITY_ADJ, MAX_PRIORITY_ADJ);
        self
    }

    /// Builder: mark as a per-CPU kernel thread pinned to `cpu`.
    pub fn kthread_on(mut self, cpu: usize) -> Self {
        self.kthread = true;
        self.no_setaffinity = true;
        let f = self.sched.get_mut();
        f.cpus_mask = CpuMask::single(cpu);
        f.nr_cpus_allowed = 1;
        self.cpu = AtomicUsize::new(cpu);
        self
    }

    /// The permanently resident idle task for `cpu`.
    pub(crate) fn new_idle(cpu: usize) -> Task {
        let mut t = Task::new(0, "idle");
        t.kthread = true;
        t.no_setaffinity = true;
        t.state = AtomicU32::new(TaskState::RUNNING.bits());
        t.cpu = AtomicUsize::new(cpu);
        let f = t.sched.get_mut();
        f.prio = IDLE_PRIO;
        f.normal_prio = IDLE_PRIO;
        f.boost_prio = 0;
        f.queue_idx = IDLE_TASK_SCHED_PRIO;
        f.cpus_mask = CpuMask::single(cpu);
        f.nr_cpus_allowed = 1;
        t
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn is_kthread(&self) -> bool {
        self.kthread
    }

    #[inline]
    pub(crate) fn no_setaffinity(&self) -> bool {
        self.no_setaffinity
    }

    // ========================================================================
    // Atomic state flags
    // ========================================================================

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: TaskState) {
        self.state.store(state.bits(), Ordering::Release);
    }

    /// Does the current state fall inside `mask`? A RUNNING task (no bits
    /// set) never matches.
    #[inline]
    pub(crate) fn state_matches(&self, mask: TaskState) -> bool {
        self.state().intersects(mask)
    }

    #[inline]
    pub fn on_rq(&self) -> OnRq {
        OnRq::from_u8(self.on_rq.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_on_rq(&self, v: OnRq) {
        self.on_rq.store(v as u8, Ordering::Release);
    }

    #[inline]
    pub fn on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    /// Mark the task as executing. Done under the runqueue lock right
    /// before the context switch.
    #[inline]
    pub(crate) fn set_on_cpu(&self) {
        self.on_cpu.store(true, Ordering::Relaxed);
    }

    /// Release-store pairing with the waker's acquire spin: every store the
    /// outgoing scheduler made on behalf of this task happens-before a
    /// subsequent wakeup observes `on_cpu == false`.
    #[inline]
    pub(crate) fn clear_on_cpu(&self) {
        self.on_cpu.store(false, Ordering::Release);
    }

    /// CPU the task belongs to (its runqueue index).
    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    /// Move the ownership pointer to a new CPU. The release ordering makes
    /// all prior per-task stores visible before anything observes the new
    /// CPU value.
    #[inline]
    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    #[inline]
    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Set the resched flag; returns whether it was already set.
    #[inline]
    pub(crate) fn set_need_resched(&self) -> bool {
        self.need_resched.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn clear_need_resched(&self) {
        self.need_resched.store(false, Ordering::Release);
    }

    #[inline]
    pub fn signal_pending(&self) -> bool {
        self.signal_pending.load(Ordering::Acquire)
    }

    /// Raised by the external signal-delivery layer; an interruptible
    /// sleep observed with this flag set is cancelled.
    #[inline]
    pub fn set_signal_pending(&self, v: bool) {
        self.signal_pending.store(v, Ordering::Release);
    }

    #[inline]
    pub fn in_iowait(&self) -> bool {
        self.in_iowait.load(Ordering::Relaxed)
    }

    /// Flag an imminent block as io-bound. Set by the external io-wait
    /// wrapper before the task calls schedule().
    #[inline]
    pub fn set_in_iowait(&self, v: bool) {
        self.in_iowait.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_contributes_to_load(&self, v: bool) {
        self.contributes_to_load.store(v, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn contributes_to_load(&self) -> bool {
        self.contributes_to_load.load(Ordering::Relaxed)
    }

    /// Accumulated runtime in ns (lockless snapshot).
    #[inline]
    pub fn sched_time(&self) -> u64 {
        self.sched_time.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn add_sched_time(&self, delta: u64) {
        self.sched_time.fetch_add(delta, Ordering::Relaxed);
    }

    // ========================================================================
    // Lock-protected scheduling fields
    // ========================================================================

    #[inline]
    fn fields(&self) -> *mut SchedFields {
        self.sched.get()
    }

    #[inline]
    pub fn policy(&self) -> SchedPolicy {
        unsafe { (*self.fields()).policy }
    }

    #[inline]
    pub fn prio(&self) -> i32 {
        unsafe { (*self.fields()).prio }
    }

    #[inline]
    pub(crate) fn set_prio(&self, prio: i32) {
        unsafe { (*self.fields()).prio = prio }
    }

    #[inline]
    pub fn normal_prio(&self) -> i32 {
        unsafe { (*self.fields()).normal_prio }
    }

    #[inline]
    pub fn static_prio(&self) -> i32 {
        unsafe { (*self.fields()).static_prio }
    }

    #[inline]
    pub(crate) fn set_static_prio(&self, prio: i32) {
        unsafe { (*self.fields()).static_prio = prio }
    }

    #[inline]
    pub fn rt_priority(&self) -> i32 {
        unsafe { (*self.fields()).rt_priority }
    }

    #[inline]
    pub fn boost_prio(&self) -> i32 {
        unsafe { (*self.fields()).boost_prio }
    }

    #[inline]
    pub(crate) fn set_boost_prio(&self, boost: i32) {
        unsafe { (*self.fields()).boost_prio = boost }
    }

    #[inline]
    pub(crate) fn queue_idx(&self) -> usize {
        unsafe { (*self.fields()).queue_idx }
    }

    #[inline]
    pub(crate) fn set_queue_idx(&self, idx: usize) {
        unsafe { (*self.fields()).queue_idx = idx }
    }

    #[inline]
    pub fn time_slice(&self) -> i64 {
        unsafe { (*self.fields()).time_slice }
    }

    #[inline]
    pub(crate) fn set_time_slice(&self, ns: i64) {
        unsafe { (*self.fields()).time_slice = ns }
    }

    #[inline]
    pub(crate) fn last_ran(&self) -> u64 {
        unsafe { (*self.fields()).last_ran }
    }

    #[inline]
    pub(crate) fn set_last_ran(&self, ts: u64) {
        unsafe { (*self.fields()).last_ran = ts }
    }

    #[inline]
    pub fn cpus_mask(&self) -> CpuMask {
        unsafe { (*self.fields()).cpus_mask }
    }

    #[inline]
    pub fn nr_cpus_allowed(&self) -> u32 {
        unsafe { (*self.fields()).nr_cpus_allowed }
    }

    /// Replace the allowed CPU set. Caller holds both pi_lock and the
    /// task-access lock.
    #[inline]
    pub(crate) fn set_cpus_mask(&self, mask: CpuMask) {
        let f = unsafe { &mut *self.fields() };
        f.cpus_mask = mask;
        f.nr_cpus_allowed = mask.weight();
    }

    #[inline]
    pub fn reset_on_fork(&self) -> bool {
        unsafe { (*self.fields()).reset_on_fork }
    }

    #[inline]
    pub(crate) fn set_reset_on_fork(&self, v: bool) {
        unsafe { (*self.fields()).reset_on_fork = v }
    }

    #[inline]
    pub(crate) fn pi_donor_prio(&self) -> Option<i32> {
        unsafe { (*self.fields()).pi_donor_prio }
    }

    #[inline]
    pub(crate) fn set_pi_donor_prio(&self, prio: Option<i32>) {
        unsafe { (*self.fields()).pi_donor_prio = prio }
    }

    /// Bulk parameter update for the setscheduler path. Caller holds
    /// pi_lock and the task-access lock.
    pub(crate) fn set_sched_params(&self, policy: SchedPolicy, static_prio: i32, rt_priority: i32) {
        let f = unsafe { &mut *self.fields() };
        f.policy = policy;
        f.static_prio = static_prio;
        f.rt_priority = rt_priority;
        f.normal_prio = compute_normal_prio(policy, static_prio, rt_priority);
    }

    // ========================================================================
    // Priority arithmetic
    // ========================================================================

    /// Is the task realtime by effective priority (policy RT or PI-boosted)?
    #[inline]
    pub fn rt_task(&self) -> bool {
        rt_prio(self.prio())
    }

    /// Recompute `normal_prio` from policy/static/rt_priority and return it.
    #[inline]
    pub(crate) fn compute_normal_prio(&self) -> i32 {
        let f = unsafe { &mut *self.fields() };
        f.normal_prio = compute_normal_prio(f.policy, f.static_prio, f.rt_priority);
        f.normal_prio
    }

    /// Effective priority: RT (or RT-boosted) tasks keep their current
    /// prio, everything else follows normal_prio.
    #[inline]
    pub(crate) fn effective_prio(&self) -> i32 {
        let normal = self.compute_normal_prio();
        if !rt_prio(self.prio()) {
            normal
        } else {
            self.prio()
        }
    }

    /// The PBQ bucket the task files under: realtime tasks share bucket 0,
    /// non-realtime tasks fold the boost adjustment in.
    #[inline]
    pub(crate) fn sched_idx(&self) -> usize {
        let f = unsafe { &*self.fields() };
        if f.prio < MAX_RT_PRIO {
            return 0;
        }
        (f.prio - MAX_RT_PRIO + f.boost_prio) as usize
    }

    /// Is this the idle task of some CPU?
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.prio() == IDLE_PRIO
    }

    /// Does the task count toward the uninterruptible load?
    #[inline]
    pub(crate) fn task_contributes_to_load(&self) -> bool {
        self.state() == TaskState::UNINTERRUPTIBLE
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("cpu", &self.cpu())
            .field("on_rq", &self.on_rq())
            .finish()
    }
}

/// Priority from policy/static/rt_priority, independent of PI boosting.
#[inline]
pub(crate) fn compute_normal_prio(policy: SchedPolicy, static_prio: i32, rt_priority: i32) -> i32 {
    if policy.is_realtime() {
        MAX_RT_PRIO - 1 - rt_priority
    } else {
        static_prio + MAX_PRIORITY_ADJ
    }
}
