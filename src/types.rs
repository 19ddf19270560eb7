//! Scheduler type definitions
//!
//! This module contains the type definitions and tunable constants used by
//! the scheduler core: scheduling policies, task state encoding, the
//! priority/bucket arithmetic of the bitmap multi-queue, boot-time
//! configuration and the error surface.

use bitflags::bitflags;

/// Maximum number of CPUs a scheduler instance can manage.
/// Bounded by the word width of [`crate::cpumask::CpuMask`].
pub const MAX_CPUS: usize = 64;

/// Number of real-time priority levels (FIFO/RR). Priorities 0..99,
/// smaller number = more urgent.
pub const MAX_RT_PRIO: i32 = 100;

/// Width of the nice range (-20..=19).
pub const NICE_WIDTH: i32 = 40;

/// Range of the dynamic boost adjustment applied to non-realtime tasks.
/// `boost_prio` stays within [-MAX_PRIORITY_ADJ, +MAX_PRIORITY_ADJ].
///
/// The boost threshold shift `10 - MAX_PRIORITY_ADJ - boost_prio` must stay
/// non-negative for every reachable `boost_prio`, which bounds this at 5.
pub const MAX_PRIORITY_ADJ: i32 = 4;

/// First priority value of the normal (non-realtime) range.
pub const MIN_NORMAL_PRIO: i32 = MAX_RT_PRIO;

/// Effective priority of a CPU's idle task. No other task reaches it.
pub const IDLE_PRIO: i32 = MAX_RT_PRIO + NICE_WIDTH + 2 * MAX_PRIORITY_ADJ;

/// Priority given to the per-CPU stop task (highest FIFO slot).
pub const STOP_PRIO: i32 = MAX_RT_PRIO - 1;

/// Number of buckets in the priority bitmap queue. Bucket 0 holds all
/// realtime tasks; the last bucket is reserved for the idle task.
pub const SCHED_BITS: usize = (NICE_WIDTH + 2 * MAX_PRIORITY_ADJ + 1) as usize;

/// Bucket index the idle task permanently occupies.
pub const IDLE_TASK_SCHED_PRIO: usize = SCHED_BITS - 1;

/// Number of watermark levels: one per bucket plus the SMT
/// sibling-group-idle level 0.
pub const WM_BITS: usize = SCHED_BITS + 1;

/// Watermark level advertised by a fully idle CPU.
pub const IDLE_WM: usize = 1;

/// Default base timeslice handed to a task on dispatch/refill: 4ms.
pub const DEFAULT_TIMESLICE_NS: u64 = 4_000_000;

/// Reschedule if less than this much timeslice is left (100us).
pub const RESCHED_NS: i64 = 100_000;

/// Upper bound on tasks examined per idle-pull batch.
pub const SCHED_RQ_NR_MIGRATION: usize = 32;

/// Convert a nice value (-20..=19) to a static priority.
#[inline]
pub const fn nice_to_prio(nice: i32) -> i32 {
    MAX_RT_PRIO + 20 + nice
}

/// Convert a static priority back to a nice value.
#[inline]
pub const fn prio_to_nice(prio: i32) -> i32 {
    prio - MAX_RT_PRIO - 20
}

/// Map a PBQ bucket index to its watermark level. Lower buckets (more
/// urgent work) map to higher levels; the idle bucket maps to [`IDLE_WM`].
#[inline]
pub const fn bucket_to_watermark(bucket: usize) -> usize {
    IDLE_TASK_SCHED_PRIO - bucket + 1
}

/// Scheduling policy for a task
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedPolicy {
    Normal, // SCHED_NORMAL: boost/deboost interactivity scheduling
    Batch,  // SCHED_BATCH: never boosted above its static slot
    Idle,   // SCHED_IDLE: never boosted above its static slot
    Rr,     // SCHED_RR: realtime, round-robin within a priority
    Fifo,   // SCHED_FIFO: realtime, runs until it blocks or yields
}

impl SchedPolicy {
    /// Realtime policies bypass the boost machinery and share PBQ bucket 0.
    #[inline]
    pub fn is_realtime(self) -> bool {
        matches!(self, SchedPolicy::Rr | SchedPolicy::Fifo)
    }
}

/// Is `prio` inside the realtime priority range?
#[inline]
pub const fn rt_prio(prio: i32) -> bool {
    prio < MAX_RT_PRIO
}

/// Policy as requested through the parameter-change surface. Deadline is
/// accepted here and folded onto FIFO before it reaches a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestedPolicy {
    Normal,
    Batch,
    Idle,
    Rr,
    Fifo,
    /// Folded to FIFO rt_priority 99; no EDF machinery behind it.
    Deadline,
}

impl RequestedPolicy {
    #[inline]
    pub(crate) fn to_policy(self) -> Option<SchedPolicy> {
        match self {
            RequestedPolicy::Normal => Some(SchedPolicy::Normal),
            RequestedPolicy::Batch => Some(SchedPolicy::Batch),
            RequestedPolicy::Idle => Some(SchedPolicy::Idle),
            RequestedPolicy::Rr => Some(SchedPolicy::Rr),
            RequestedPolicy::Fifo => Some(SchedPolicy::Fifo),
            RequestedPolicy::Deadline => None,
        }
    }
}

/// A scheduling parameter change request.
#[derive(Clone, Copy, Debug)]
pub struct SchedAttr {
    pub policy: RequestedPolicy,
    /// 1..=99 for RR/FIFO, 0 otherwise.
    pub rt_priority: i32,
    pub nice: i32,
    pub reset_on_fork: bool,
}

impl SchedAttr {
    pub fn new(policy: RequestedPolicy, rt_priority: i32, nice: i32) -> Self {
        Self {
            policy,
            rt_priority,
            nice,
            reset_on_fork: false,
        }
    }
}

bitflags! {
    /// Task state encoding. `RUNNING` is the absence of all bits, so a
    /// wake-state mask test (`state & mask`) never matches a running task.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TaskState: u32 {
        const INTERRUPTIBLE   = 1 << 0;
        const UNINTERRUPTIBLE = 1 << 1;
        const WAKING          = 1 << 2;
        const NEW             = 1 << 3;
        const DEAD            = 1 << 4;
    }
}

impl TaskState {
    /// The runnable state: no sleep/new/dead bit set.
    pub const RUNNING: TaskState = TaskState::empty();

    /// The states a plain `wake_up` is allowed to wake.
    pub const NORMAL: TaskState =
        TaskState::INTERRUPTIBLE.union(TaskState::UNINTERRUPTIBLE);
}

bitflags! {
    /// Modifier flags for the wake path.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct WakeFlags: u32 {
        /// Waker goes to sleep right after the wakeup.
        const SYNC     = 1 << 0;
        /// Child wakeup after fork.
        const FORK     = 1 << 1;
        /// Internal: the task changed CPU during this wake.
        const MIGRATED = 1 << 2;
    }
}

bitflags! {
    /// Enqueue modifiers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EnqueueFlags: u32 {
        /// Enqueue caused by a wakeup (as opposed to a migration).
        const WAKEUP = 1 << 0;
    }
}

bitflags! {
    /// Dequeue modifiers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DequeueFlags: u32 {
        /// Dequeue caused by the task going to sleep.
        const SLEEP = 1 << 0;
    }
}

/// Queuedness of a task, manipulated with explicit memory ordering.
/// `Migrating` is the handoff token between a source and destination
/// runqueue lock; readers spin while they observe it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OnRq {
    Off = 0,
    Queued = 1,
    Migrating = 2,
}

impl OnRq {
    #[inline]
    pub(crate) fn from_u8(v: u8) -> OnRq {
        match v {
            1 => OnRq::Queued,
            2 => OnRq::Migrating,
            _ => OnRq::Off,
        }
    }
}

/// What `sched_yield` does. Selected by [`SchedConfig::yield_type`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum YieldType {
    /// Yield is a no-op.
    None,
    /// Deboost to the floor and requeue the caller (default).
    Requeue,
    /// Mark the caller as the runqueue skip hint for one selection.
    Skip,
}

/// Boot-time scheduler configuration.
#[derive(Clone, Copy, Debug)]
pub struct SchedConfig {
    /// Base timeslice handed out on dispatch/refill, in nanoseconds.
    pub timeslice_ns: u64,
    /// Behavior of `yield_current`.
    pub yield_type: YieldType,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            timeslice_ns: DEFAULT_TIMESLICE_NS,
            yield_type: YieldType::Requeue,
        }
    }
}

/// Errors surfaced at the parameter-change edges of the core.
///
/// Validation happens before any runqueue lock is taken; once inside the
/// core with a lock held the only failure paths are transient and resolved
/// by retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Unknown policy, or a priority outside the range valid for the policy.
    InvalidParam,
    /// Affinity request disjoint from the valid CPU set, or an attempt to
    /// retune a pinned kernel thread or the stop task.
    InvalidAffinity,
    /// Caller lacks the privilege for the requested change.
    PermissionDenied,
    /// The referenced task does not exist (adapter-level lookups).
    NoSuchTask,
    /// Allocation failure while building an affinity mask.
    OutOfMemory,
}

impl SchedError {
    /// Map to the negated errno convention used at the syscall boundary.
    pub fn to_errno(self) -> i32 {
        match self {
            SchedError::InvalidParam => -22,     // EINVAL
            SchedError::InvalidAffinity => -22,  // EINVAL
            SchedError::PermissionDenied => -1,  // EPERM
            SchedError::NoSuchTask => -3,        // ESRCH
            SchedError::OutOfMemory => -12,      // ENOMEM
        }
    }
}

impl core::fmt::Display for SchedError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SchedError::InvalidParam => write!(f, "invalid scheduling parameter"),
            SchedError::InvalidAffinity => write!(f, "invalid CPU affinity"),
            SchedError::PermissionDenied => write!(f, "permission denied"),
            SchedError::NoSuchTask => write!(f, "no such task"),
            SchedError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for SchedError {}

/// Result type alias for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Credentials of the caller of a checked parameter change, supplied by the
/// syscall adapter. The core does not know about UIDs; the adapter resolves
/// ownership and rlimits before calling in.
#[derive(Clone, Copy, Debug)]
pub struct Credentials {
    /// CAP_SYS_NICE or equivalent.
    pub privileged: bool,
    /// RLIMIT_RTPRIO-style ceiling for unprivileged realtime requests.
    pub rtprio_limit: i32,
    /// Caller owns the target task.
    pub owns_task: bool,
}

impl Credentials {
    /// A fully privileged (kernel-internal) caller.
    pub const fn kernel() -> Self {
        Self {
            privileged: true,
            rtprio_limit: MAX_RT_PRIO - 1,
            owns_task: true,
        }
    }
}
