//! Replica clusters.
//!
//! A cluster is a bounded array of chains representing the same logical
//! entity on up to eight replicas. It tracks per-slot errors, an
//! authoritative focus, and a rollup status; quorum requires enough
//! masters to agree on `update_tid`.

use std::sync::Arc;

use arrayvec::ArrayVec;
use bitflags::bitflags;
use log::debug;

use crate::chain::Chain;
use crate::error::{ErrorSet, Result};
use crate::mount::Dev;
use crate::param::CLUSTER_MAX;

bitflags! {
    /// Cluster rollup status.
    pub struct ClusterStatus: u32 {
        /// Reads can be satisfied from synchronized masters.
        const RDHARD  = 0x0001;
        /// Reads can be satisfied, possibly from stale slots.
        const RDSOFT  = 0x0002;
        /// Writes reach a quorum of masters.
        const WRHARD  = 0x0004;
        /// Writes reach at least one slot.
        const WRSOFT  = 0x0008;
        /// Some master slot is present but not synchronized.
        const UNHARD  = 0x0010;
        /// Some slave slot is present but not synchronized.
        const UNSOFT  = 0x0020;
        /// Some master slot is absent.
        const NOHARD  = 0x0040;
        /// Some slave slot is absent.
        const NOSOFT  = 0x0080;
        /// Every master is caught up.
        const MSYNCED = 0x0100;
        /// Every slave is caught up.
        const SSYNCED = 0x0200;
    }
}

/// Replica role of a slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SlotRole {
    Master,
    Slave,
}

/// One replica of the logical entity.
pub struct ClusterSlot {
    pub dev: Arc<Dev>,
    pub chain: Arc<Chain>,
    pub role: SlotRole,
    pub error: ErrorSet,
    pub invalid: bool,
}

impl ClusterSlot {
    pub fn new(dev: Arc<Dev>, chain: Arc<Chain>) -> ClusterSlot {
        ClusterSlot {
            dev,
            chain,
            role: SlotRole::Master,
            error: ErrorSet::empty(),
            invalid: false,
        }
    }

    pub fn with_role(mut self, role: SlotRole) -> ClusterSlot {
        self.role = role;
        self
    }

    fn update_tid(&self) -> u64 {
        self.chain.lock.read().bref.update_tid
    }

    fn modify_tid(&self) -> u64 {
        self.chain.lock.read().bref.modify_tid
    }
}

/// See module docs.
pub struct Cluster {
    slots: ArrayVec<ClusterSlot, CLUSTER_MAX>,
    focus: Option<usize>,
    status: ClusterStatus,
    quorum_threshold: usize,
}

impl Cluster {
    pub fn new(quorum_threshold: usize) -> Cluster {
        Cluster {
            slots: ArrayVec::new(),
            focus: None,
            status: ClusterStatus::empty(),
            quorum_threshold: quorum_threshold.max(1),
        }
    }

    pub fn add_slot(&mut self, slot: ClusterSlot) {
        assert!(self.slots.len() < CLUSTER_MAX, "cluster slot overflow");
        self.slots.push(slot);
    }

    pub fn slots(&self) -> &[ClusterSlot] {
        &self.slots
    }

    pub fn status(&self) -> ClusterStatus {
        self.status
    }

    pub fn focus_index(&self) -> Option<usize> {
        self.focus
    }

    /// The currently-authoritative chain.
    pub fn focus(&self) -> Option<&ClusterSlot> {
        self.focus.map(|i| &self.slots[i])
    }

    /// The `update_tid` enough masters agree on, if quorum holds.
    pub fn quorum_tid(&self) -> Option<u64> {
        let mut counts: Vec<(u64, usize)> = Vec::new();
        for slot in self.slots.iter() {
            if slot.role != SlotRole::Master || slot.invalid || !slot.error.is_empty() {
                continue;
            }
            let tid = slot.update_tid();
            match counts.iter_mut().find(|(t, _)| *t == tid) {
                Some((_, n)) => *n += 1,
                None => counts.push((tid, 1)),
            }
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n >= self.quorum_threshold)
            .max_by_key(|(tid, _)| *tid)
            .map(|(tid, _)| tid)
    }

    /// Elects the focus: a non-errored master matching the quorum tid,
    /// and recomputes the rollup status. Fails with INCOMPLETE when
    /// quorum is unavailable.
    pub fn resolve_focus(&mut self) -> Result<()> {
        let quorum = match self.quorum_tid() {
            Some(tid) => tid,
            None => {
                self.status = ClusterStatus::RDSOFT | ClusterStatus::WRSOFT;
                self.focus = None;
                return Err(ErrorSet::INCOMPLETE);
            }
        };

        let mut status = ClusterStatus::RDHARD | ClusterStatus::WRHARD;
        let mut msynced = true;
        let mut ssynced = true;
        self.focus = None;
        for (i, slot) in self.slots.iter().enumerate() {
            let usable = !slot.invalid && slot.error.is_empty();
            match slot.role {
                SlotRole::Master => {
                    if !usable {
                        status |= ClusterStatus::NOHARD;
                        msynced = false;
                    } else if slot.update_tid() != quorum {
                        status |= ClusterStatus::UNHARD;
                        msynced = false;
                    } else if self.focus.is_none() {
                        self.focus = Some(i);
                    }
                }
                SlotRole::Slave => {
                    if !usable {
                        status |= ClusterStatus::NOSOFT;
                        ssynced = false;
                    } else if slot.update_tid() != quorum {
                        status |= ClusterStatus::UNSOFT;
                        ssynced = false;
                    }
                }
            }
        }
        if msynced {
            status |= ClusterStatus::MSYNCED;
        }
        if ssynced {
            status |= ClusterStatus::SSYNCED;
        }
        status |= ClusterStatus::RDSOFT | ClusterStatus::WRSOFT;
        self.status = status;
        debug!(
            "cluster focus={:?} quorum_tid={} status={:?}",
            self.focus, quorum, status
        );
        Ok(())
    }

    /// Rolls the per-slot divergence up: true when `slot`'s chain lags
    /// the focus.
    pub fn slot_divergent(&self, index: usize) -> bool {
        match self.focus() {
            Some(focus) => {
                let slot = &self.slots[index];
                slot.modify_tid() != focus.modify_tid()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::mount::{Dev, MountOptions};
    use crate::param::ZONE_BYTES;

    fn dev_with_root(update_tid: u64, modify_tid: u64) -> (Arc<Dev>, Arc<Chain>) {
        let device = Arc::new(MemDevice::new(4 * ZONE_BYTES)) as Arc<dyn crate::device::Device>;
        let dev = Dev::format(device, MountOptions::default()).unwrap();
        let trans = dev.begin().unwrap();
        let root = dev.create_pfs_root(&trans, 1).unwrap();
        {
            let mut guard = root.lock.write();
            guard.bref.update_tid = update_tid;
            guard.bref.modify_tid = modify_tid;
        }
        drop(trans);
        (dev, root)
    }

    #[test]
    fn quorum_needs_enough_masters() {
        let (d0, r0) = dev_with_root(100, 7);
        let (d1, r1) = dev_with_root(100, 7);
        let (d2, r2) = dev_with_root(90, 5);

        let mut cluster = Cluster::new(2);
        cluster.add_slot(ClusterSlot::new(d0, r0));
        cluster.add_slot(ClusterSlot::new(d1, r1));
        cluster.add_slot(ClusterSlot::new(d2, r2));
        cluster.resolve_focus().unwrap();
        assert_eq!(cluster.quorum_tid(), Some(100));
        assert_eq!(cluster.focus_index(), Some(0));
        assert!(cluster.status().contains(ClusterStatus::UNHARD));
        assert!(!cluster.status().contains(ClusterStatus::MSYNCED));
    }

    #[test]
    fn no_quorum_is_incomplete() {
        let (d0, r0) = dev_with_root(100, 7);
        let (d1, r1) = dev_with_root(90, 5);
        let mut cluster = Cluster::new(2);
        cluster.add_slot(ClusterSlot::new(d0, r0));
        cluster.add_slot(ClusterSlot::new(d1, r1));
        assert_eq!(cluster.resolve_focus(), Err(ErrorSet::INCOMPLETE));
        assert!(cluster.focus().is_none());
    }

    #[test]
    fn synced_cluster_reports_msynced() {
        let (d0, r0) = dev_with_root(50, 3);
        let (d1, r1) = dev_with_root(50, 3);
        let mut cluster = Cluster::new(2);
        cluster.add_slot(ClusterSlot::new(d0, r0));
        cluster.add_slot(ClusterSlot::new(d1, r1));
        cluster.resolve_focus().unwrap();
        assert!(cluster.status().contains(ClusterStatus::MSYNCED));
        assert!(!cluster.slot_divergent(1));
    }

    #[test]
    fn divergent_slot_detected() {
        let (d0, r0) = dev_with_root(50, 9);
        let (d1, r1) = dev_with_root(50, 3);
        let mut cluster = Cluster::new(1);
        cluster.add_slot(ClusterSlot::new(d0, r0));
        cluster.add_slot(ClusterSlot::new(d1, r1));
        cluster.resolve_focus().unwrap();
        assert!(cluster.slot_divergent(1));
    }
}
