//! CPU topology masks
//!
//! Placement and balancing never scan all CPUs blindly: every CPU carries an
//! ordered sequence of proximity rings — SMT siblings, LLC/core-group peers,
//! package peers, everything else — and searches walk the rings outward so
//! the nearest suitable CPU wins. The rings are built once at start-of-day
//! (and rebuilt on hotplug) from a [`CpuTopology`] description supplied by
//! the platform.

use crate::cpumask::CpuMask;
use crate::types::MAX_CPUS;

/// Platform description of the CPU layout. All masks include the CPU
/// itself; a CPU with no configured group defaults to a singleton.
#[derive(Clone, Debug)]
pub struct CpuTopology {
    pub nr_cpus: usize,
    /// Per-CPU SMT sibling set (hyperthread pairs/quads), self included.
    pub smt_siblings: Vec<CpuMask>,
    /// Per-CPU last-level-cache group, self included. Superset of the
    /// sibling set.
    pub llc_groups: Vec<CpuMask>,
    /// Per-CPU package/die set, self included. Superset of the LLC group.
    pub packages: Vec<CpuMask>,
}

impl CpuTopology {
    /// A topology with no sharing: every CPU is its own core and package.
    pub fn flat(nr_cpus: usize) -> CpuTopology {
        assert!(nr_cpus > 0 && nr_cpus <= MAX_CPUS);
        let singles: Vec<CpuMask> = (0..nr_cpus).map(CpuMask::single).collect();
        CpuTopology {
            nr_cpus,
            smt_siblings: singles.clone(),
            llc_groups: singles.clone(),
            packages: vec![CpuMask::all(nr_cpus); nr_cpus],
        }
    }

    /// Adjacent CPUs paired as SMT siblings: (0,1), (2,3), ... sharing one
    /// package. `nr_cpus` must be even.
    pub fn smt_pairs(nr_cpus: usize) -> CpuTopology {
        assert!(nr_cpus > 0 && nr_cpus % 2 == 0 && nr_cpus <= MAX_CPUS);
        let pair = |cpu: usize| {
            let mut m = CpuMask::single(cpu);
            m.set(cpu ^ 1);
            m
        };
        let pairs: Vec<CpuMask> = (0..nr_cpus).map(pair).collect();
        CpuTopology {
            nr_cpus,
            smt_siblings: pairs.clone(),
            llc_groups: pairs,
            packages: vec![CpuMask::all(nr_cpus); nr_cpus],
        }
    }

    /// The set of all described CPUs.
    pub fn present_mask(&self) -> CpuMask {
        CpuMask::all(self.nr_cpus)
    }
}

/// Per-CPU affinity check state derived from a [`CpuTopology`].
pub(crate) struct Topology {
    nr_cpus: usize,
    smt_present: bool,
    smt_masks: Vec<CpuMask>,
    llc_masks: Vec<CpuMask>,
    /// Ordered proximity rings per CPU, nearest first. Ring contents
    /// overlap on purpose: the LLC ring repeats the SMT siblings so a
    /// search starting at the LLC ring still covers them.
    rings: Vec<Vec<CpuMask>>,
    /// Index of the ring idle pulls start from (the LLC ring).
    llc_start: Vec<usize>,
}

impl Topology {
    pub(crate) fn build(desc: &CpuTopology) -> Topology {
        let nr = desc.nr_cpus;
        assert!(nr > 0 && nr <= MAX_CPUS);
        assert_eq!(desc.smt_siblings.len(), nr);
        assert_eq!(desc.llc_groups.len(), nr);
        assert_eq!(desc.packages.len(), nr);

        let all = CpuMask::all(nr);
        let smt_present = desc.smt_siblings.iter().any(|m| m.weight() > 1);

        let mut rings = Vec::with_capacity(nr);
        let mut llc_start = Vec::with_capacity(nr);
        for cpu in 0..nr {
            let me = CpuMask::single(cpu);
            let smt = desc.smt_siblings[cpu].andnot(me);
            // The LLC ring repeats the SMT siblings: pulls start here and
            // must still see them.
            let llc = desc.llc_groups[cpu].andnot(me);
            let pkg = desc.packages[cpu].andnot(desc.llc_groups[cpu]);
            let others = all.andnot(desc.packages[cpu]);

            let mut cpu_rings = Vec::new();
            if !smt.is_empty() {
                cpu_rings.push(smt);
                kdebug!("sched: cpu#{} affinity ring - smt {:#x}", cpu, smt);
            }
            let start = cpu_rings.len();
            if !llc.is_empty() {
                cpu_rings.push(llc);
                kdebug!("sched: cpu#{} affinity ring - llc {:#x}", cpu, llc);
            }
            if !pkg.is_empty() {
                cpu_rings.push(pkg);
            }
            if !others.is_empty() {
                cpu_rings.push(others);
            }

            rings.push(cpu_rings);
            llc_start.push(start);
        }

        Topology {
            nr_cpus: nr,
            smt_present,
            smt_masks: desc.smt_siblings.clone(),
            llc_masks: desc.llc_groups.clone(),
            rings,
            llc_start,
        }
    }

    #[inline]
    pub(crate) fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    #[inline]
    pub(crate) fn smt_present(&self) -> bool {
        self.smt_present
    }

    /// SMT sibling set of `cpu`, self included.
    #[inline]
    pub(crate) fn smt_mask(&self, cpu: usize) -> CpuMask {
        self.smt_masks[cpu]
    }

    /// Last-level-cache group of `cpu`, self included.
    #[inline]
    pub(crate) fn llc_mask(&self, cpu: usize) -> CpuMask {
        self.llc_masks[cpu]
    }

    /// Proximity rings of `cpu`, nearest first.
    #[inline]
    pub(crate) fn rings(&self, cpu: usize) -> &[CpuMask] {
        &self.rings[cpu]
    }

    /// Rings starting from the LLC level, the range idle pulls walk.
    #[inline]
    pub(crate) fn pull_rings(&self, cpu: usize) -> &[CpuMask] {
        &self.rings[cpu][self.llc_start[cpu]..]
    }

    /// Pick the member of `candidates` closest to `from`: `from` itself if
    /// it qualifies, else the first hit walking the rings outward.
    pub(crate) fn best_mask_cpu(&self, from: usize, candidates: CpuMask) -> usize {
        if candidates.is_set(from) {
            return from;
        }
        for ring in &self.rings[from] {
            if let Some(cpu) = candidates.any_and(*ring) {
                return cpu;
            }
        }
        // Candidates outside every ring (offline holes): take any.
        candidates.first().unwrap_or(from)
    }
}
