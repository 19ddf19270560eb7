//! Parameter-change surface: policy, nice, priority inheritance

mod common;

use std::sync::Arc;

use bmq_sched::cpumask::CpuMask;
use bmq_sched::task::Task;
use bmq_sched::types::{
    Credentials, RequestedPolicy, SchedAttr, SchedError, SchedPolicy, TaskState, IDLE_WM,
    MAX_RT_PRIO, WM_BITS,
};

use common::new_sched;

fn attr(policy: RequestedPolicy, rt_priority: i32, nice: i32) -> SchedAttr {
    SchedAttr::new(policy, rt_priority, nice)
}

// ============================================================================
// Validation
// ============================================================================

#[test]
fn test_rejects_inconsistent_priority() {
    let (sched, _platform) = new_sched(1);
    let t = Arc::new(Task::new(1, "t"));

    // Non-realtime policies take priority 0 only.
    assert_eq!(
        sched.set_policy(&t, &attr(RequestedPolicy::Normal, 5, 0)),
        Err(SchedError::InvalidParam)
    );
    // Realtime policies need a non-zero priority.
    assert_eq!(
        sched.set_policy(&t, &attr(RequestedPolicy::Fifo, 0, 0)),
        Err(SchedError::InvalidParam)
    );
    // Out of range.
    assert_eq!(
        sched.set_policy(&t, &attr(RequestedPolicy::Rr, MAX_RT_PRIO, 0)),
        Err(SchedError::InvalidParam)
    );
    assert_eq!(
        sched.set_policy(&t, &attr(RequestedPolicy::Normal, 0, 25)),
        Err(SchedError::InvalidParam)
    );
}

#[test]
fn test_errno_mapping() {
    assert_eq!(SchedError::InvalidParam.to_errno(), -22);
    assert_eq!(SchedError::PermissionDenied.to_errno(), -1);
    assert_eq!(SchedError::NoSuchTask.to_errno(), -3);
    assert_eq!(SchedError::OutOfMemory.to_errno(), -12);
}

#[test]
fn test_deadline_folds_to_top_fifo() {
    let (sched, _platform) = new_sched(1);
    let t = Arc::new(Task::new(1, "t"));

    sched
        .set_policy(&t, &attr(RequestedPolicy::Deadline, 0, 0))
        .unwrap();

    assert_eq!(t.policy(), SchedPolicy::Fifo);
    assert_eq!(t.rt_priority(), MAX_RT_PRIO - 1);
    assert_eq!(t.prio(), 0);
}

#[test]
fn test_stop_task_cannot_be_retuned() {
    let (sched, _platform) = new_sched(1);

    let stop = Arc::new(Task::new(1, "stopper").kthread_on(0));
    sched.set_stop_task(0, Some(stop.clone()));
    assert_eq!(stop.policy(), SchedPolicy::Fifo);

    assert_eq!(
        sched.set_policy(&stop, &attr(RequestedPolicy::Normal, 0, 0)),
        Err(SchedError::InvalidParam)
    );
}

// ============================================================================
// Permissions
// ============================================================================

#[test]
fn test_unprivileged_cannot_enter_rt_without_rlimit() {
    let (sched, _platform) = new_sched(1);
    let t = Arc::new(Task::new(1, "t"));

    let creds = Credentials {
        privileged: false,
        rtprio_limit: 0,
        owns_task: true,
    };
    assert_eq!(
        sched.set_policy_checked(&t, &attr(RequestedPolicy::Fifo, 10, 0), &creds),
        Err(SchedError::PermissionDenied)
    );
}

#[test]
fn test_unprivileged_cannot_raise_rt_beyond_rlimit() {
    let (sched, _platform) = new_sched(1);
    let t = Arc::new(Task::new(1, "t").with_policy(SchedPolicy::Fifo, 20));

    let creds = Credentials {
        privileged: false,
        rtprio_limit: 30,
        owns_task: true,
    };
    // Within the limit: fine.
    sched
        .set_policy_checked(&t, &attr(RequestedPolicy::Fifo, 30, 0), &creds)
        .unwrap();
    // Beyond it: refused.
    assert_eq!(
        sched.set_policy_checked(&t, &attr(RequestedPolicy::Fifo, 40, 0), &creds),
        Err(SchedError::PermissionDenied)
    );
}

#[test]
fn test_cannot_change_foreign_task() {
    let (sched, _platform) = new_sched(1);
    let t = Arc::new(Task::new(1, "t"));

    let creds = Credentials {
        privileged: false,
        rtprio_limit: 99,
        owns_task: false,
    };
    assert_eq!(
        sched.set_policy_checked(&t, &attr(RequestedPolicy::Batch, 0, 0), &creds),
        Err(SchedError::PermissionDenied)
    );
}

#[test]
fn test_unprivileged_cannot_clear_reset_on_fork() {
    let (sched, _platform) = new_sched(1);
    let t = Arc::new(Task::new(1, "t"));

    let mut flagged = attr(RequestedPolicy::Normal, 0, 0);
    flagged.reset_on_fork = true;
    sched.set_policy(&t, &flagged).unwrap();
    assert!(t.reset_on_fork());

    let creds = Credentials {
        privileged: false,
        rtprio_limit: 0,
        owns_task: true,
    };
    assert_eq!(
        sched.set_policy_checked(&t, &attr(RequestedPolicy::Normal, 0, 0), &creds),
        Err(SchedError::PermissionDenied)
    );

    // A privileged caller may.
    sched
        .set_policy_checked(&t, &attr(RequestedPolicy::Normal, 0, 0), &Credentials::kernel())
        .unwrap();
    assert!(!t.reset_on_fork());
}

// ============================================================================
// Queued-task refiling
// ============================================================================

#[test]
fn test_policy_change_refiles_queued_task() {
    let (sched, _platform) = new_sched(1);

    let a = Arc::new(Task::new(1, "a").with_affinity(CpuMask::single(0)));
    sched.adopt_running(0, &a);

    let t = Arc::new(Task::new(2, "t").with_affinity(CpuMask::single(0)));
    t.set_state(TaskState::INTERRUPTIBLE);
    assert!(sched.wake_up(&t));
    assert!(!a.need_resched());

    // Promote the queued task to realtime: it must outrank the current
    // task immediately.
    sched
        .set_policy(&t, &attr(RequestedPolicy::Fifo, 50, 0))
        .unwrap();

    assert_eq!(sched.rq_watermark(0), WM_BITS - 1);
    assert!(a.need_resched());
    assert!(sched.validate_rq(0));
}

#[test]
fn test_nice_change_refiles_queued_task() {
    let (sched, _platform) = new_sched(1);

    let t = Arc::new(Task::new(1, "t").with_affinity(CpuMask::single(0)));
    t.set_state(TaskState::INTERRUPTIBLE);
    assert!(sched.wake_up(&t));

    let wm_before = sched.rq_watermark(0);
    sched.set_user_nice(&t, -15);

    assert_eq!(t.static_prio(), bmq_sched::types::nice_to_prio(-15));
    assert!(sched.rq_watermark(0) > wm_before, "more urgent slot advertised");
    assert!(sched.validate_rq(0));
}

#[test]
fn test_nice_on_rt_task_changes_nothing_now() {
    let (sched, _platform) = new_sched(1);

    let t = Arc::new(Task::new(1, "t").with_policy(SchedPolicy::Fifo, 10));
    let prio_before = t.prio();
    sched.set_user_nice(&t, -10);

    assert_eq!(t.prio(), prio_before);
    assert_eq!(t.static_prio(), bmq_sched::types::nice_to_prio(-10));
}

// ============================================================================
// Priority inheritance
// ============================================================================

#[test]
fn test_pi_boost_refiles_to_rt_bucket_and_preempts() {
    let (sched, _platform) = new_sched(1);

    // A low-priority task L queued behind running A.
    let a = Arc::new(Task::new(1, "a").with_affinity(CpuMask::single(0)));
    sched.adopt_running(0, &a);

    let l = Arc::new(
        Task::new(2, "l")
            .with_nice(10)
            .with_affinity(CpuMask::single(0)),
    );
    l.set_state(TaskState::INTERRUPTIBLE);
    assert!(sched.wake_up(&l));
    assert!(!a.need_resched());

    // A FIFO-80 waiter donates its priority to L.
    let h = Arc::new(Task::new(3, "h").with_policy(SchedPolicy::Fifo, 80));
    sched.set_effective_prio(&l, Some(&h));

    assert_eq!(l.prio(), MAX_RT_PRIO - 1 - 80);
    assert!(l.rt_task());
    assert_eq!(sched.rq_watermark(0), WM_BITS - 1);
    assert!(a.need_resched(), "boosted task outranks the running one");
    assert!(sched.validate_rq(0));

    // Deboost: everything reverts.
    sched.set_effective_prio(&l, None);
    assert_eq!(l.prio(), l.normal_prio());
    assert!(!l.rt_task());
    assert!(sched.rq_watermark(0) < WM_BITS - 1);
    assert!(sched.validate_rq(0));
}

#[test]
fn test_pi_noop_when_donation_does_not_help() {
    let (sched, _platform) = new_sched(1);

    let t = Arc::new(Task::new(1, "t").with_nice(-10));
    let prio_before = t.prio();

    // A donor less urgent than the task itself changes nothing.
    let weak_donor = Arc::new(Task::new(2, "weak").with_nice(10));
    sched.set_effective_prio(&t, Some(&weak_donor));
    assert_eq!(t.prio(), prio_before);
}

#[test]
fn test_setscheduler_preserved_under_active_pi_boost() {
    let (sched, _platform) = new_sched(1);

    let t = Arc::new(Task::new(1, "t"));
    let donor = Arc::new(Task::new(2, "donor").with_policy(SchedPolicy::Fifo, 90));
    sched.set_effective_prio(&t, Some(&donor));
    let boosted = t.prio();

    // A policy change that the boost dominates: parameters stored, the
    // effective priority stays donated.
    sched
        .set_policy(&t, &attr(RequestedPolicy::Batch, 0, 5))
        .unwrap();
    assert_eq!(t.policy(), SchedPolicy::Batch);
    assert_eq!(t.prio(), boosted);

    // Dropping the donation applies the stored parameters.
    sched.set_effective_prio(&t, None);
    assert!(!t.rt_task());
    assert_eq!(t.prio(), t.normal_prio());
}

// ============================================================================
// Queries
// ============================================================================

#[test]
fn test_task_prio_user_convention() {
    let (sched, _platform) = new_sched(1);

    let rt = Arc::new(Task::new(1, "rt").with_policy(SchedPolicy::Fifo, 80));
    assert_eq!(sched.task_prio(&rt), -81);

    let normal = Arc::new(Task::new(2, "n").with_boost(0));
    assert_eq!(sched.task_prio(&normal), 24);
}

#[test]
fn test_runtime_query_includes_running_delta() {
    let (sched, platform) = new_sched(1);

    let t = Arc::new(Task::new(1, "t"));
    sched.adopt_running(0, &t);

    platform.advance(1_500_000);
    // No tick has run; the query itself folds in the pending delta.
    assert_eq!(sched.task_runtime_ns(&t), 1_500_000);
}

#[test]
fn test_idle_cpu_and_watermark_queries() {
    let (sched, _platform) = new_sched(2);

    assert!(sched.idle_cpu(0));
    assert_eq!(sched.rq_watermark(0), IDLE_WM);

    let t = Arc::new(Task::new(1, "t"));
    sched.adopt_running(0, &t);
    assert!(!sched.idle_cpu(0));
    assert!(sched.task_curr(&t));
    assert!(sched.idle_cpu(1));
}
