//! Watermark index
//!
//! The process-wide view of how loaded every CPU is: one CPU mask per
//! priority level, plus a bitmap of which levels currently hold at least one
//! CPU. A CPU sits at the level derived from its lowest non-empty PBQ
//! bucket, so a fully idle CPU advertises [`IDLE_WM`] and a CPU with queued
//! realtime work advertises the top level.
//!
//! Level 0 is special: it holds whole SMT sibling groups in which every
//! logical CPU is idle. The placement engine prefers level 0 so new work
//! lands on cores whose siblings are quiet.
//!
//! Each CPU's slot is written only under that CPU's runqueue lock; readers
//! (placement, balancers) are lock-free and tolerate staleness — the chosen
//! CPU re-validates everything under its own lock on arrival.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::cpumask::{AtomicCpuMask, CpuMask};
use crate::topology::Topology;
use crate::types::{bucket_to_watermark, IDLE_WM, WM_BITS};

pub(crate) struct WatermarkIndex {
    masks: [AtomicCpuMask; WM_BITS],
    bitmap: AtomicU64,
}

impl WatermarkIndex {
    /// Start-of-day state: every present CPU is idle.
    pub(crate) fn new(present: CpuMask) -> WatermarkIndex {
        let masks: [AtomicCpuMask; WM_BITS] =
            core::array::from_fn(|_| AtomicCpuMask::new(CpuMask::empty()));
        masks[IDLE_WM].store(present);
        WatermarkIndex {
            masks,
            bitmap: AtomicU64::new(1 << IDLE_WM),
        }
    }

    /// Re-advertise `cpu` after its first non-empty bucket changed.
    /// Returns the new level. Caller holds `cpu`'s runqueue lock and passes
    /// the previously advertised level.
    pub(crate) fn update(
        &self,
        cpu: usize,
        first_bucket: usize,
        last_wm: usize,
        topology: &Topology,
    ) -> usize {
        let watermark = bucket_to_watermark(first_bucket);
        if watermark == last_wm {
            return last_wm;
        }

        if self.masks[last_wm].clear_cpu(cpu) {
            self.bitmap.fetch_and(!(1u64 << last_wm), Ordering::Relaxed);
        }
        self.masks[watermark].set_cpu(cpu);
        self.bitmap.fetch_or(1u64 << watermark, Ordering::Relaxed);

        if topology.smt_present() {
            let smt_mask = topology.smt_mask(cpu);
            if last_wm == IDLE_WM {
                // The group lost an idle member; it is no longer wholly idle.
                if self.masks[0].andnot_mask(smt_mask) {
                    self.bitmap.fetch_and(!1u64, Ordering::Relaxed);
                }
            } else if watermark == IDLE_WM {
                // If the whole sibling group is now idle, advertise it.
                if smt_mask.is_subset_of(self.masks[IDLE_WM].load()) {
                    self.masks[0].or_mask(smt_mask);
                    self.bitmap.fetch_or(1, Ordering::Relaxed);
                }
            }
        }

        watermark
    }

    /// CPUs currently advertised at `level`.
    #[inline]
    pub(crate) fn mask(&self, level: usize) -> CpuMask {
        self.masks[level].load()
    }

    /// The sibling-group-idle set (level 0).
    #[inline]
    pub(crate) fn sg_idle_mask(&self) -> CpuMask {
        self.masks[0].load()
    }

    /// Lowest non-empty level, if any.
    #[inline]
    pub(crate) fn first_level(&self) -> Option<usize> {
        let bits = self.bitmap.load(Ordering::Relaxed);
        if bits == 0 {
            None
        } else {
            Some(bits.trailing_zeros() as usize)
        }
    }

    /// Lowest non-empty level at or above `from`, if any.
    #[inline]
    pub(crate) fn next_level(&self, from: usize) -> Option<usize> {
        if from >= WM_BITS {
            return None;
        }
        let bits = self.bitmap.load(Ordering::Relaxed) & !((1u64 << from) - 1);
        if bits == 0 {
            None
        } else {
            Some(bits.trailing_zeros() as usize)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CpuTopology;
    use crate::types::{IDLE_TASK_SCHED_PRIO, WM_BITS};

    fn flat_topology(nr_cpus: usize) -> Topology {
        Topology::build(&CpuTopology::flat(nr_cpus))
    }

    fn smt_topology() -> Topology {
        // 4 CPUs, siblings (0,1) and (2,3).
        Topology::build(&CpuTopology::smt_pairs(4))
    }

    #[test]
    fn test_initial_state_all_idle() {
        let wm = WatermarkIndex::new(CpuMask::all(4));
        assert_eq!(wm.first_level(), Some(IDLE_WM));
        assert_eq!(wm.mask(IDLE_WM), CpuMask::all(4));
    }

    #[test]
    fn test_update_moves_cpu_between_levels() {
        let topo = flat_topology(2);
        let wm = WatermarkIndex::new(CpuMask::all(2));

        // CPU 0 now has work in bucket 20.
        let level = wm.update(0, 20, IDLE_WM, &topo);
        assert_eq!(level, bucket_to_watermark(20));
        assert!(wm.mask(level).is_set(0));
        assert!(!wm.mask(IDLE_WM).is_set(0));
        assert!(wm.mask(IDLE_WM).is_set(1));

        // Back to idle; the level drains and its bit clears.
        let level2 = wm.update(0, IDLE_TASK_SCHED_PRIO, level, &topo);
        assert_eq!(level2, IDLE_WM);
        assert!(wm.mask(level).is_empty());
        assert_eq!(wm.next_level(IDLE_WM + 1), None);
    }

    #[test]
    fn test_no_move_when_level_unchanged() {
        let topo = flat_topology(2);
        let wm = WatermarkIndex::new(CpuMask::all(2));
        let level = wm.update(0, IDLE_TASK_SCHED_PRIO, IDLE_WM, &topo);
        assert_eq!(level, IDLE_WM);
        assert_eq!(wm.mask(IDLE_WM), CpuMask::all(2));
    }

    #[test]
    fn test_smt_group_idle_tracking() {
        let topo = smt_topology();
        let wm = WatermarkIndex::new(CpuMask::all(4));

        // Boot state does not advertise group idleness; it materializes on
        // the first transition back to idle.
        assert!(wm.sg_idle_mask().is_empty());

        // CPU 0 gets work: its group can no longer be wholly idle.
        let l0 = wm.update(0, 20, IDLE_WM, &topo);
        assert!(wm.sg_idle_mask().is_empty());

        // CPU 0 drains back to idle: group {0,1} becomes wholly idle.
        wm.update(0, IDLE_TASK_SCHED_PRIO, l0, &topo);
        assert_eq!(wm.sg_idle_mask(), CpuMask::from_bits(0b0011));

        // CPU 1 gets work: the group leaves level 0.
        wm.update(1, 20, IDLE_WM, &topo);
        assert!(wm.sg_idle_mask().is_empty());
    }

    #[test]
    fn test_level_scan_order() {
        let topo = flat_topology(4);
        let wm = WatermarkIndex::new(CpuMask::all(4));

        // CPU 2 hosts realtime work (bucket 0 -> top level).
        wm.update(2, 0, IDLE_WM, &topo);
        // CPU 3 hosts normal work.
        wm.update(3, 24, IDLE_WM, &topo);

        // Scanning from the bottom: idle CPUs first, then the normal level,
        // then the realtime level.
        let l1 = wm.first_level().unwrap();
        assert_eq!(l1, IDLE_WM);
        let l2 = wm.next_level(l1 + 1).unwrap();
        assert_eq!(l2, bucket_to_watermark(24));
        let l3 = wm.next_level(l2 + 1).unwrap();
        assert_eq!(l3, WM_BITS - 1);
        assert!(wm.mask(l3).is_set(2));
    }
}
