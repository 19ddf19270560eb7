//! SMP placement and preemption behavior
//!
//! These tests verify:
//! - Wakes land on idle CPUs before loaded ones
//! - Realtime wakeups preempt less urgent CPUs and set need-resched
//! - Watermark advertisement tracks queue contents
//! - Per-CPU runqueues stay isolated

mod common;

use std::sync::Arc;

use bmq_sched::cpumask::CpuMask;
use bmq_sched::task::Task;
use bmq_sched::types::{SchedPolicy, TaskState, IDLE_WM, WM_BITS};

use common::{new_sched, sleeping_task};

// ============================================================================
// Placement on wake
// ============================================================================

#[test]
fn test_wake_prefers_idle_cpu_over_busy() {
    let (sched, _platform) = new_sched(4);

    // CPU 0 runs task A.
    let a = Arc::new(Task::new(1, "a"));
    sched.adopt_running(0, &a);

    // Waking B must land it on one of the idle CPUs, not on CPU 0.
    let b = sleeping_task(2, "b");
    assert!(sched.wake_up(&b));

    assert_ne!(b.cpu(), 0, "woken task should avoid the busy CPU");
    assert!(sched.nr_running(b.cpu()) == 1);

    // A was not disturbed.
    assert!(!a.need_resched());
    for cpu in 0..4 {
        assert!(sched.validate_rq(cpu));
    }
}

#[test]
fn test_rt_wake_preempts_normal_cpu() {
    let (sched, platform) = new_sched(4);

    // Every CPU busy with a normal task.
    let mut running = Vec::new();
    for cpu in 0..4 {
        let t = Arc::new(Task::new(10 + cpu as u64, "busy"));
        sched.adopt_running(cpu, &t);
        running.push(t);
    }

    // A FIFO-50 wakeup cannot find an idle CPU; it must pick a CPU whose
    // current task it outranks and flag it before the wake returns.
    let rt = Arc::new(Task::new(99, "rt").with_policy(SchedPolicy::Fifo, 50));
    rt.set_state(TaskState::INTERRUPTIBLE);
    assert!(sched.wake_up(&rt));

    let target = rt.cpu();
    assert!(
        sched.need_resched_cpu(target),
        "target CPU must have need_resched set before the wake returns"
    );
    assert_eq!(platform.ipis_to(target), 1);

    // The others were not disturbed.
    for cpu in (0..4).filter(|&c| c != target) {
        assert!(!sched.need_resched_cpu(cpu));
    }
}

#[test]
fn test_wake_respects_affinity() {
    let (sched, _platform) = new_sched(4);

    let t = Arc::new(Task::new(1, "pinned").with_affinity(CpuMask::single(2)));
    t.set_state(TaskState::INTERRUPTIBLE);
    assert!(sched.wake_up(&t));
    assert_eq!(t.cpu(), 2);
}

#[test]
fn test_wake_already_running_task_fails() {
    let (sched, _platform) = new_sched(2);

    let t = Arc::new(Task::new(1, "t"));
    sched.adopt_running(0, &t);

    // RUNNING matches no wake mask.
    assert!(!sched.wake_up(&t));
}

#[test]
fn test_remote_wake_of_still_queued_task() {
    let (sched, _platform) = new_sched(2);

    // A task that marked itself sleeping but was never taken off the
    // queue is woken in place, with no migration.
    let t = Arc::new(Task::new(1, "t"));
    sched.adopt_running(0, &t);
    t.set_state(TaskState::INTERRUPTIBLE);

    assert!(sched.wake_up(&t));
    assert_eq!(t.state(), TaskState::RUNNING);
    assert_eq!(t.cpu(), 0);
    assert_eq!(sched.nr_running(0), 1);
}

// ============================================================================
// Watermark advertisement
// ============================================================================

#[test]
fn test_watermark_tracks_queue_contents() {
    let (sched, _platform) = new_sched(2);

    assert_eq!(sched.rq_watermark(0), IDLE_WM);

    // A queued normal task raises the advertised level.
    let t = Arc::new(Task::new(1, "t").with_affinity(CpuMask::single(0)));
    t.set_state(TaskState::INTERRUPTIBLE);
    assert!(sched.wake_up(&t));
    let busy_wm = sched.rq_watermark(0);
    assert!(busy_wm > IDLE_WM);

    // A queued realtime task raises it to the top level.
    let rt = Arc::new(
        Task::new(2, "rt")
            .with_policy(SchedPolicy::Fifo, 10)
            .with_affinity(CpuMask::single(0)),
    );
    rt.set_state(TaskState::INTERRUPTIBLE);
    assert!(sched.wake_up(&rt));
    assert_eq!(sched.rq_watermark(0), WM_BITS - 1);

    assert!(sched.validate_rq(0));
    assert_eq!(sched.rq_watermark(1), IDLE_WM);
}

// ============================================================================
// Runqueue isolation
// ============================================================================

#[test]
fn test_percpu_queue_isolation() {
    let (sched, _platform) = new_sched(4);

    // Stack different numbers of pinned tasks per CPU.
    let mut tasks = Vec::new();
    for cpu in 0..4usize {
        for i in 0..cpu {
            let t = Arc::new(
                Task::new((cpu * 10 + i) as u64, "t")
                    .with_affinity(CpuMask::single(cpu)),
            );
            t.set_state(TaskState::INTERRUPTIBLE);
            assert!(sched.wake_up(&t));
            tasks.push(t);
        }
    }

    for cpu in 0..4 {
        assert_eq!(sched.nr_running(cpu), cpu);
        assert!(sched.validate_rq(cpu));
    }

    // Pending mask holds exactly the CPUs with more than one runnable.
    assert_eq!(sched.pending_mask(), CpuMask::from_bits(0b1100));
}

#[test]
fn test_schedule_picks_highest_urgency_first() {
    let (sched, _platform) = new_sched(1);

    let normal = Arc::new(Task::new(1, "n").with_affinity(CpuMask::single(0)));
    normal.set_state(TaskState::INTERRUPTIBLE);
    let batch = Arc::new(
        Task::new(2, "b")
            .with_policy(SchedPolicy::Batch, 0)
            .with_nice(5)
            .with_affinity(CpuMask::single(0)),
    );
    batch.set_state(TaskState::INTERRUPTIBLE);
    let rt = Arc::new(
        Task::new(3, "rt")
            .with_policy(SchedPolicy::Rr, 30)
            .with_affinity(CpuMask::single(0)),
    );
    rt.set_state(TaskState::INTERRUPTIBLE);

    assert!(sched.wake_up(&normal));
    assert!(sched.wake_up(&batch));
    assert!(sched.wake_up(&rt));

    // The realtime task runs first.
    sched.schedule(0);
    assert!(Arc::ptr_eq(&sched.curr_task(0), &rt));

    // It exits; the normal task outranks the niced batch task.
    sched.sched_exit(0);
    assert!(Arc::ptr_eq(&sched.curr_task(0), &normal));

    sched.sched_exit(0);
    assert!(Arc::ptr_eq(&sched.curr_task(0), &batch));

    sched.sched_exit(0);
    assert!(sched.idle_cpu(0));
    assert!(sched.validate_rq(0));
}

#[test]
fn test_kick_process_pokes_running_remote_task() {
    let (sched, platform) = new_sched(2);

    let t = Arc::new(Task::new(1, "t"));
    sched.adopt_running(1, &t);

    sched.kick_process(&t);
    assert_eq!(platform.ipis_to(1), 1);

    // A task that is not current gets no kick.
    let idle_bound = Arc::new(Task::new(2, "s").with_affinity(CpuMask::single(0)));
    idle_bound.set_state(TaskState::INTERRUPTIBLE);
    assert!(sched.wake_up(&idle_bound));
    let before = platform.ipis_to(0);
    sched.kick_process(&idle_bound);
    assert_eq!(platform.ipis_to(0), before);
}

#[test]
fn test_idle_task_is_permanent_fallback() {
    let (sched, _platform) = new_sched(2);

    // Scheduling with nothing queued keeps the idle task running.
    sched.schedule(0);
    assert!(sched.idle_cpu(0));
    assert_eq!(sched.nr_running(0), 0);
    assert!(sched.validate_rq(0));
}
