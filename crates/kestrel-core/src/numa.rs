//! NUMA topology of a compute host.
//!
//! A topology is one [`NumaNode`] per physical locality domain. Each node
//! tracks which logical CPUs exist (`cpuset`), which of them are dedicated
//! to containers (`pinned_cpus`), and how much memory is left.
//!
//! `pinned_cpus ⊆ cpuset` holds after every call; a rejected pin/unpin
//! leaves the node untouched.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{NumaError, NumaResult};

/// One NUMA cell of a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NumaNode {
    pub id: u32,
    /// Logical CPU ids local to this node.
    pub cpuset: BTreeSet<u32>,
    /// CPUs currently dedicated to containers.
    #[serde(default)]
    pub pinned_cpus: BTreeSet<u32>,
    /// Total memory local to this node (MiB).
    pub mem_total: u64,
    /// Memory not yet promised to pinned containers (MiB).
    pub mem_available: u64,
}

impl NumaNode {
    pub fn new(id: u32, cpuset: impl IntoIterator<Item = u32>, mem_total: u64) -> Self {
        Self {
            id,
            cpuset: cpuset.into_iter().collect(),
            pinned_cpus: BTreeSet::new(),
            mem_total,
            mem_available: mem_total,
        }
    }

    /// CPUs that are not pinned.
    pub fn free_cpus(&self) -> BTreeSet<u32> {
        self.cpuset.difference(&self.pinned_cpus).copied().collect()
    }

    /// Number of CPUs that can still be pinned.
    pub fn avail_cpus(&self) -> usize {
        self.cpuset.len() - self.pinned_cpus.len()
    }

    /// Dedicate `cpus` to a container.
    pub fn pin_cpus(&mut self, cpus: &BTreeSet<u32>) -> NumaResult<()> {
        if !cpus.is_subset(&self.cpuset) {
            return Err(NumaError::CpuPinningUnknown {
                requested: cpus.clone(),
                cpuset: self.cpuset.clone(),
            });
        }
        if !cpus.is_disjoint(&self.pinned_cpus) {
            return Err(NumaError::CpuPinningInvalid {
                requested: cpus.clone(),
                free: self.free_cpus(),
            });
        }
        self.pinned_cpus.extend(cpus.iter().copied());
        Ok(())
    }

    /// Return `cpus` to the free pool.
    pub fn unpin_cpus(&mut self, cpus: &BTreeSet<u32>) -> NumaResult<()> {
        if !cpus.is_subset(&self.cpuset) {
            return Err(NumaError::CpuUnpinningUnknown {
                requested: cpus.clone(),
                cpuset: self.cpuset.clone(),
            });
        }
        if !cpus.is_subset(&self.pinned_cpus) {
            return Err(NumaError::CpuUnpinningInvalid {
                requested: cpus.clone(),
                pinned: self.pinned_cpus.clone(),
            });
        }
        self.pinned_cpus.retain(|cpu| !cpus.contains(cpu));
        Ok(())
    }

    /// Charge (`sign > 0`) or refund (`sign < 0`) memory against this node.
    pub fn adjust_memory(&mut self, mem: u64, sign: i8) {
        self.mem_available = if sign >= 0 {
            self.mem_available.saturating_sub(mem)
        } else {
            self.mem_available.saturating_add(mem).min(self.mem_total)
        };
    }

    /// Whether a dedicated container of this shape fits on the node.
    pub fn can_fit(&self, cpus: usize, mem: u64) -> bool {
        self.avail_cpus() >= cpus && self.mem_available >= mem
    }
}

/// The NUMA layout of a host, in probe order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NumaTopology {
    pub nodes: Vec<NumaNode>,
}

impl NumaTopology {
    pub fn new(nodes: Vec<NumaNode>) -> Self {
        Self { nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: u32) -> Option<&NumaNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: u32) -> NumaResult<&mut NumaNode> {
        self.nodes
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or(NumaError::NodeNotFound(id))
    }

    /// First node, in iteration order, with enough free CPUs and memory.
    pub fn first_fit(&self, cpus: usize, mem: u64) -> Option<&NumaNode> {
        self.nodes.iter().find(|n| n.can_fit(cpus, mem))
    }

    pub fn pin_cpus(&mut self, node_id: u32, cpus: &BTreeSet<u32>) -> NumaResult<()> {
        self.node_mut(node_id)?.pin_cpus(cpus)
    }

    pub fn unpin_cpus(&mut self, node_id: u32, cpus: &BTreeSet<u32>) -> NumaResult<()> {
        self.node_mut(node_id)?.unpin_cpus(cpus)
    }

    /// Total pinned CPUs across all nodes.
    pub fn pinned_count(&self) -> usize {
        self.nodes.iter().map(|n| n.pinned_cpus.len()).sum()
    }

    /// Drop all pinning and memory charges.
    pub fn reset_usage(&mut self) {
        for node in &mut self.nodes {
            node.pinned_cpus.clear();
            node.mem_available = node.mem_total;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(cpus: &[u32]) -> BTreeSet<u32> {
        cpus.iter().copied().collect()
    }

    fn two_node_topology() -> NumaTopology {
        NumaTopology::new(vec![
            NumaNode::new(0, [0, 1, 2, 3], 4096),
            NumaNode::new(1, [4, 5, 6, 7], 4096),
        ])
    }

    #[test]
    fn pin_and_unpin_roundtrip() {
        let mut node = NumaNode::new(0, [0, 1, 2, 3], 1024);
        node.pin_cpus(&set(&[1, 2])).unwrap();
        assert_eq!(node.pinned_cpus, set(&[1, 2]));
        assert_eq!(node.free_cpus(), set(&[0, 3]));
        assert_eq!(node.avail_cpus(), 2);

        node.unpin_cpus(&set(&[1])).unwrap();
        assert_eq!(node.pinned_cpus, set(&[2]));
    }

    #[test]
    fn pin_unknown_cpu_fails_without_mutation() {
        let mut node = NumaNode::new(0, [0, 1], 1024);
        node.pin_cpus(&set(&[0])).unwrap();

        let err = node.pin_cpus(&set(&[1, 9])).unwrap_err();
        assert!(matches!(err, NumaError::CpuPinningUnknown { .. }));
        assert_eq!(node.pinned_cpus, set(&[0]));
    }

    #[test]
    fn pin_already_pinned_cpu_is_invalid() {
        let mut node = NumaNode::new(0, [0, 1, 2], 1024);
        node.pin_cpus(&set(&[0, 1])).unwrap();

        let err = node.pin_cpus(&set(&[1, 2])).unwrap_err();
        assert_eq!(
            err,
            NumaError::CpuPinningInvalid {
                requested: set(&[1, 2]),
                free: set(&[2]),
            }
        );
        assert_eq!(node.pinned_cpus, set(&[0, 1]));
    }

    #[test]
    fn unpin_rejects_unknown_and_unpinned() {
        let mut node = NumaNode::new(0, [0, 1, 2], 1024);
        node.pin_cpus(&set(&[0])).unwrap();

        assert!(matches!(
            node.unpin_cpus(&set(&[7])),
            Err(NumaError::CpuUnpinningUnknown { .. })
        ));
        assert!(matches!(
            node.unpin_cpus(&set(&[0, 1])),
            Err(NumaError::CpuUnpinningInvalid { .. })
        ));
        assert_eq!(node.pinned_cpus, set(&[0]));
    }

    #[test]
    fn pinned_stays_subset_of_cpuset() {
        let mut node = NumaNode::new(0, 0..8, 1024);
        let attempts: [&[u32]; 6] = [&[0, 1], &[1, 2], &[8], &[2, 3, 4], &[0], &[5, 12]];
        for cpus in attempts {
            let _ = node.pin_cpus(&set(cpus));
            assert!(node.pinned_cpus.is_subset(&node.cpuset));
            let _ = node.unpin_cpus(&set(&cpus[..1]));
            assert!(node.pinned_cpus.is_subset(&node.cpuset));
        }
    }

    #[test]
    fn memory_adjustment_is_clamped() {
        let mut node = NumaNode::new(0, [0], 1000);
        node.adjust_memory(400, 1);
        assert_eq!(node.mem_available, 600);
        node.adjust_memory(900, 1);
        assert_eq!(node.mem_available, 0);
        node.adjust_memory(5000, -1);
        assert_eq!(node.mem_available, 1000);
    }

    #[test]
    fn first_fit_follows_node_order() {
        let mut topo = two_node_topology();
        topo.pin_cpus(0, &set(&[0, 1, 2])).unwrap();

        let node = topo.first_fit(2, 1024).unwrap();
        assert_eq!(node.id, 1);

        let node = topo.first_fit(1, 1024).unwrap();
        assert_eq!(node.id, 0);

        assert!(topo.first_fit(5, 0).is_none());
    }

    #[test]
    fn unknown_node_is_reported() {
        let mut topo = two_node_topology();
        assert_eq!(
            topo.pin_cpus(3, &set(&[0])),
            Err(NumaError::NodeNotFound(3))
        );
    }
}
