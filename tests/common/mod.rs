//! Shared test scaffolding
//!
//! A recording mock of the platform contract: hand-driven clock, logged
//! IPIs, queued stoppers the test releases at a controlled point, and
//! togglable CPU liveness.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bmq_sched::platform::{Platform, StopFn};
use bmq_sched::task::Task;
use bmq_sched::topology::CpuTopology;
use bmq_sched::types::{SchedConfig, TaskState};
use bmq_sched::Scheduler;

pub struct MockPlatform {
    clock: AtomicU64,
    online: Vec<AtomicBool>,
    active: Vec<AtomicBool>,
    pub ipis: Mutex<Vec<usize>>,
    /// Dispatched stoppers, run when the test calls `run_stops`.
    pub stops: Mutex<Vec<(usize, StopFn)>>,
}

impl MockPlatform {
    pub fn new(nr_cpus: usize) -> Arc<MockPlatform> {
        Arc::new(MockPlatform {
            clock: AtomicU64::new(0),
            online: (0..nr_cpus).map(|_| AtomicBool::new(true)).collect(),
            active: (0..nr_cpus).map(|_| AtomicBool::new(true)).collect(),
            ipis: Mutex::new(Vec::new()),
            stops: Mutex::new(Vec::new()),
        })
    }

    /// Advance the shared clock by `ns`.
    pub fn advance(&self, ns: u64) {
        self.clock.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn set_online(&self, cpu: usize, v: bool) {
        self.online[cpu].store(v, Ordering::Relaxed);
        self.active[cpu].store(v, Ordering::Relaxed);
    }

    pub fn ipis_to(&self, cpu: usize) -> usize {
        self.ipis.lock().unwrap().iter().filter(|&&c| c == cpu).count()
    }

    /// Execute all queued stoppers; returns how many ran.
    pub fn run_stops(&self) -> usize {
        let stops: Vec<_> = std::mem::take(&mut *self.stops.lock().unwrap());
        let n = stops.len();
        for (_, f) in stops {
            f();
        }
        n
    }

    pub fn pending_stops(&self) -> usize {
        self.stops.lock().unwrap().len()
    }
}

impl Platform for MockPlatform {
    fn now_ns(&self, _cpu: usize) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    fn send_reschedule_ipi(&self, cpu: usize) {
        self.ipis.lock().unwrap().push(cpu);
    }

    fn stop_one_cpu(&self, cpu: usize, f: StopFn) {
        self.stops.lock().unwrap().push((cpu, f));
    }

    fn cpu_online(&self, cpu: usize) -> bool {
        self.online[cpu].load(Ordering::Relaxed)
    }

    fn cpu_active(&self, cpu: usize) -> bool {
        self.active[cpu].load(Ordering::Relaxed)
    }
}

/// A scheduler over `nr_cpus` independent cores.
pub fn new_sched(nr_cpus: usize) -> (Arc<Scheduler>, Arc<MockPlatform>) {
    new_sched_with(&CpuTopology::flat(nr_cpus), SchedConfig::default())
}

/// A scheduler over SMT pairs (0,1), (2,3), ...
pub fn new_smt_sched(nr_cpus: usize) -> (Arc<Scheduler>, Arc<MockPlatform>) {
    new_sched_with(&CpuTopology::smt_pairs(nr_cpus), SchedConfig::default())
}

pub fn new_sched_with(
    topo: &CpuTopology,
    config: SchedConfig,
) -> (Arc<Scheduler>, Arc<MockPlatform>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let platform = MockPlatform::new(topo.nr_cpus);
    let sched = Scheduler::new(config, topo, platform.clone());
    (sched, platform)
}

/// A task parked in interruptible sleep, ready to be woken.
pub fn sleeping_task(pid: u64, name: &'static str) -> Arc<Task> {
    let t = Arc::new(Task::new(pid, name));
    t.set_state(TaskState::INTERRUPTIBLE);
    t
}
