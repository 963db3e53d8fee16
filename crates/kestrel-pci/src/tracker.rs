//! Per-node PCI tracker.
//!
//! Ties the device tree, the pools and container ownership together. The
//! tree is the source of truth for device status; pools only ever hold
//! devices the tree considers `available`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use kestrel_core::{Container, PciRequest};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::device::{PciDevice, PciDeviceStatus, ProbedPciDevice};
use crate::error::{PciError, PciResult};
use crate::stats::{PciDevicePool, PciDeviceStats};
use crate::tree::PciDeviceTree;
use crate::whitelist::PciWhitelist;

/// Device rows that need writing after a batch of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirtyDevices {
    /// Rows to insert or overwrite.
    pub upserts: Vec<PciDevice>,
    /// Addresses of `removed` rows to delete from storage.
    pub removed: Vec<String>,
}

impl DirtyDevices {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PciDevTracker {
    node_uuid: Uuid,
    whitelist: Arc<PciWhitelist>,
    tree: PciDeviceTree,
    stats: PciDeviceStats,
    /// Container → addresses claimed but not yet allocated.
    claims: HashMap<Uuid, Vec<String>>,
    /// Container → copies of allocated devices.
    allocations: HashMap<Uuid, Vec<PciDevice>>,
}

impl PciDevTracker {
    /// Build from persisted rows.
    pub fn new(node_uuid: Uuid, whitelist: Arc<PciWhitelist>, devices: Vec<PciDevice>) -> Self {
        let mut stats = PciDeviceStats::new(whitelist.clone());
        let mut claims: HashMap<Uuid, Vec<String>> = HashMap::new();
        let mut allocations: HashMap<Uuid, Vec<PciDevice>> = HashMap::new();

        for dev in &devices {
            match (dev.status, dev.container_uuid) {
                (PciDeviceStatus::Available, _) => stats.add_device(dev),
                (PciDeviceStatus::Claimed, Some(owner)) => {
                    claims.entry(owner).or_default().push(dev.address.clone());
                }
                (PciDeviceStatus::Allocated, Some(owner)) => {
                    allocations.entry(owner).or_default().push(dev.clone());
                }
                _ => {}
            }
        }

        Self {
            node_uuid,
            whitelist,
            tree: PciDeviceTree::build(devices),
            stats,
            claims,
            allocations,
        }
    }

    pub fn node_uuid(&self) -> Uuid {
        self.node_uuid
    }

    pub fn devices(&self) -> &[PciDevice] {
        self.tree.devices()
    }

    pub fn get(&self, address: &str) -> Option<&PciDevice> {
        self.tree.get(address)
    }

    pub fn stats(&self) -> &PciDeviceStats {
        &self.stats
    }

    /// Pool summaries for the compute node record.
    pub fn pools(&self) -> Vec<PciDevicePool> {
        self.stats.pools()
    }

    /// Devices claimed or allocated by `container`.
    pub fn container_devices(&self, container: Uuid) -> Vec<PciDevice> {
        let claimed = self
            .claims
            .get(&container)
            .into_iter()
            .flatten()
            .filter_map(|addr| self.tree.get(addr).cloned());
        let allocated = self.allocations.get(&container).into_iter().flatten().cloned();
        claimed.chain(allocated).collect()
    }

    /// Containers currently holding devices.
    pub fn owners(&self) -> HashSet<Uuid> {
        self.claims
            .keys()
            .chain(self.allocations.keys())
            .copied()
            .collect()
    }

    // ── Inventory ─────────────────────────────────────────────────

    /// Reconcile the tree with a fresh probe.
    ///
    /// Functions not on the whitelist are ignored. New functions start
    /// `available`; vanished `available` ones become `removed`; vanished
    /// functions still in use are kept until their owner lets go.
    pub fn update_devices_from_probe(&mut self, probed: &[ProbedPciDevice]) -> PciResult<()> {
        let probed: Vec<(&ProbedPciDevice, PciDevice)> = probed
            .iter()
            .map(|p| (p, PciDevice::from_probe(self.node_uuid, p)))
            .filter(|(_, d)| self.whitelist.device_assignable(d))
            .collect();
        let seen: HashSet<&str> = probed.iter().map(|(p, _)| p.address.as_str()).collect();

        let vanished: Vec<PciDevice> = self
            .tree
            .devices()
            .iter()
            .filter(|d| d.status.is_live() && !seen.contains(d.address.as_str()))
            .cloned()
            .collect();
        for dev in vanished {
            if dev.status == PciDeviceStatus::Available {
                self.stats.remove_device(&dev)?;
                self.tree.remove(&dev.address)?;
                info!(address = %dev.address, node = %self.node_uuid, "PCI device removed");
            } else {
                warn!(
                    address = %dev.address,
                    status = %dev.status,
                    container = ?dev.container_uuid,
                    "PCI device in use disappeared from the host"
                );
            }
        }

        let mut relink = false;
        for (probe, fresh) in probed {
            let existing = self.tree.get(&probe.address).filter(|d| d.status.is_live()).cloned();
            match existing {
                Some(current) => {
                    let mut updated = current.clone();
                    if !updated.update_from_probe(probe) {
                        continue;
                    }
                    if current.status == PciDeviceStatus::Available {
                        self.stats.remove_device(&current)?;
                        self.stats.add_device(&updated);
                    }
                    if let Some(slot) = self.tree.get_mut(&probe.address) {
                        *slot = updated;
                    }
                    relink = true;
                }
                None => {
                    debug!(address = %fresh.address, node = %self.node_uuid, "new PCI device");
                    self.stats.add_device(&fresh);
                    self.tree.insert(fresh);
                }
            }
        }
        if relink {
            self.tree.relink();
        }
        Ok(())
    }

    // ── Ownership ─────────────────────────────────────────────────

    /// Claim devices for every request of `container`.
    ///
    /// Either all requests are claimed or nothing changes.
    pub fn claim_container(
        &mut self,
        container: Uuid,
        requests: &[PciRequest],
    ) -> PciResult<Vec<PciDevice>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let saved_tree = self.tree.clone();
        let saved_stats = self.stats.clone();

        let picked = self
            .stats
            .consume_requests(requests)
            .ok_or(PciError::ClaimFailed)?;

        let mut claimed = Vec::with_capacity(picked.len());
        for dev in &picked {
            if let Err(e) = self.tree.claim(&dev.address, container) {
                self.tree = saved_tree;
                self.stats = saved_stats;
                return Err(e);
            }
            if let Some(d) = self.tree.get(&dev.address) {
                claimed.push(d.clone());
            }
        }

        self.claims
            .entry(container)
            .or_default()
            .extend(claimed.iter().map(|d| d.address.clone()));
        debug!(%container, count = claimed.len(), "PCI devices claimed");
        Ok(claimed)
    }

    /// Move every device claimed by `container` to `allocated`.
    pub fn allocate_container(&mut self, container: Uuid) -> PciResult<Vec<PciDevice>> {
        let Some(addresses) = self.claims.remove(&container) else {
            return Ok(Vec::new());
        };

        let mut allocated = Vec::with_capacity(addresses.len());
        for (i, address) in addresses.iter().enumerate() {
            match self.tree.allocate(address, container) {
                Ok(dev) => allocated.push(dev),
                Err(e) => {
                    self.claims.insert(container, addresses[i..].to_vec());
                    self.allocations
                        .entry(container)
                        .or_default()
                        .extend(allocated);
                    return Err(e);
                }
            }
        }

        self.allocations
            .entry(container)
            .or_default()
            .extend(allocated.iter().cloned());
        Ok(allocated)
    }

    /// Free one device and return everything that became available to
    /// the pools.
    pub fn free_device(&mut self, address: &str, container: Option<Uuid>) -> PciResult<()> {
        let owner = self.tree.get(address).and_then(|d| d.container_uuid);
        let freed = self.tree.free(address, container)?;
        for dev in &freed {
            self.stats.add_device(dev);
        }

        if let Some(owner) = owner {
            if let Some(addrs) = self.claims.get_mut(&owner) {
                addrs.retain(|a| a != address);
                if addrs.is_empty() {
                    self.claims.remove(&owner);
                }
            }
            if let Some(devs) = self.allocations.get_mut(&owner) {
                devs.retain(|d| d.address != address);
                if devs.is_empty() {
                    self.allocations.remove(&owner);
                }
            }
        }
        Ok(())
    }

    /// Free everything `container` holds.
    pub fn free_container(&mut self, container: Uuid) -> PciResult<()> {
        let addresses: Vec<String> = self
            .container_devices(container)
            .into_iter()
            .map(|d| d.address)
            .collect();
        for address in addresses {
            self.free_device(&address, Some(container))?;
        }
        self.claims.remove(&container);
        self.allocations.remove(&container);
        Ok(())
    }

    /// Apply a container's device usage: `sign > 0` allocates what it
    /// claimed, `sign < 0` frees everything it holds.
    pub fn update_pci_for_container(&mut self, container: &Container, sign: i8) -> PciResult<()> {
        if sign < 0 {
            self.free_container(container.uuid)
        } else if sign > 0 {
            self.allocate_container(container.uuid).map(|_| ())
        } else {
            Ok(())
        }
    }

    /// Free devices owned by containers not in `live`.
    pub fn clean_usage(&mut self, live: &HashSet<Uuid>) -> PciResult<()> {
        let stale: Vec<Uuid> = self
            .owners()
            .into_iter()
            .filter(|owner| !live.contains(owner))
            .collect();
        for owner in stale {
            warn!(container = %owner, node = %self.node_uuid, "releasing PCI devices of unknown container");
            self.free_container(owner)?;
        }
        Ok(())
    }

    // ── Persistence ───────────────────────────────────────────────

    /// Drain changed rows.
    pub fn take_dirty(&mut self) -> DirtyDevices {
        let (removed, upserts): (Vec<_>, Vec<_>) = self
            .tree
            .take_dirty()
            .into_iter()
            .partition(|d| d.status == PciDeviceStatus::Removed);
        DirtyDevices {
            upserts,
            removed: removed.into_iter().map(|d| d.address).collect(),
        }
    }

    /// Drop `removed` records whose rows storage has deleted.
    pub fn finish_removal(&mut self, addresses: &[String]) -> PciResult<()> {
        for address in addresses {
            self.tree.mark_deleted(address)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::PciDeviceType;
    use std::collections::BTreeMap;

    const PF: &str = "0000:81:00.0";
    const VF1: &str = "0000:81:00.1";
    const VF2: &str = "0000:81:00.2";

    fn probed(address: &str, dev_type: PciDeviceType, parent: Option<&str>) -> ProbedPciDevice {
        ProbedPciDevice {
            address: address.to_string(),
            vendor_id: "8086".to_string(),
            product_id: "1520".to_string(),
            dev_type,
            parent_addr: parent.map(str::to_string),
            numa_node: Some(0),
            extra_info: BTreeMap::new(),
        }
    }

    fn inventory() -> Vec<ProbedPciDevice> {
        vec![
            probed(PF, PciDeviceType::SriovPf, None),
            probed(VF1, PciDeviceType::SriovVf, Some(PF)),
            probed(VF2, PciDeviceType::SriovVf, Some(PF)),
        ]
    }

    fn tracker() -> PciDevTracker {
        let entry: BTreeMap<String, String> =
            [("vendor_id".to_string(), "8086".to_string())].into();
        let whitelist = Arc::new(PciWhitelist::from_config(&[entry]).unwrap());
        let mut tracker = PciDevTracker::new(Uuid::new_v4(), whitelist, Vec::new());
        tracker.update_devices_from_probe(&inventory()).unwrap();
        tracker
    }

    fn vf_request(count: u32) -> PciRequest {
        PciRequest {
            count,
            spec: vec![[("dev_type".to_string(), "type-VF".to_string())].into()],
            alias_name: None,
        }
    }

    #[test]
    fn probe_populates_tree_and_pools() {
        let mut tracker = tracker();
        assert_eq!(tracker.devices().len(), 3);
        assert_eq!(tracker.stats().free_count(), 3);

        let dirty = tracker.take_dirty();
        assert_eq!(dirty.upserts.len(), 3);
        assert!(dirty.removed.is_empty());
        assert!(tracker.take_dirty().is_empty());
    }

    #[test]
    fn claim_allocate_free_cycle() {
        let mut tracker = tracker();
        let owner = Uuid::new_v4();

        let claimed = tracker.claim_container(owner, &[vf_request(1)]).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(tracker.get(PF).unwrap().status, PciDeviceStatus::Unclaimable);
        // The PF left the pool together with the claimed VF.
        assert_eq!(tracker.stats().free_count(), 1);

        let allocated = tracker.allocate_container(owner).unwrap();
        assert_eq!(allocated[0].status, PciDeviceStatus::Allocated);
        assert_eq!(tracker.container_devices(owner).len(), 1);

        tracker.free_container(owner).unwrap();
        assert!(tracker.container_devices(owner).is_empty());
        assert_eq!(tracker.get(PF).unwrap().status, PciDeviceStatus::Available);
        assert_eq!(tracker.stats().free_count(), 3);
    }

    fn vendor_request(count: u32) -> PciRequest {
        PciRequest {
            count,
            spec: vec![[("vendor_id".to_string(), "8086".to_string())].into()],
            alias_name: None,
        }
    }

    #[test]
    fn vendor_only_claim_takes_vfs_not_the_pf() {
        let mut tracker = tracker();
        assert!(!tracker.stats().support_requests(&[vendor_request(3)]));
        assert!(tracker.stats().support_requests(&[vendor_request(2)]));

        let owner = Uuid::new_v4();
        let claimed = tracker.claim_container(owner, &[vendor_request(2)]).unwrap();
        let mut addresses: Vec<&str> = claimed.iter().map(|d| d.address.as_str()).collect();
        addresses.sort();
        assert_eq!(addresses, vec![VF1, VF2]);
        assert_eq!(tracker.get(PF).unwrap().status, PciDeviceStatus::Unclaimable);
        assert_eq!(tracker.stats().free_count(), 0);

        tracker.free_container(owner).unwrap();
        let single = tracker
            .claim_container(Uuid::new_v4(), &[vendor_request(1)])
            .unwrap();
        assert_eq!(single[0].dev_type, PciDeviceType::SriovVf);
        assert_eq!(tracker.stats().free_count(), 1);
    }

    #[test]
    fn failed_claim_changes_nothing() {
        let mut tracker = tracker();
        let err = tracker
            .claim_container(Uuid::new_v4(), &[vf_request(3)])
            .unwrap_err();
        assert_eq!(err, PciError::ClaimFailed);
        assert_eq!(tracker.stats().free_count(), 3);
        assert!(tracker.owners().is_empty());
    }

    #[test]
    fn vanished_device_is_removed_then_deleted() {
        let mut tracker = tracker();
        tracker.take_dirty();

        let owner = Uuid::new_v4();
        tracker.claim_container(owner, &[vf_request(1)]).unwrap();
        let held = tracker.container_devices(owner)[0].address.clone();
        let free_vf = if held == VF1 { VF2 } else { VF1 };

        // Host now reports only the PF and the VF in use.
        let remaining: Vec<_> = inventory()
            .into_iter()
            .filter(|p| p.address != free_vf)
            .collect();
        tracker.update_devices_from_probe(&remaining).unwrap();
        assert_eq!(tracker.get(free_vf).unwrap().status, PciDeviceStatus::Removed);

        let dirty = tracker.take_dirty();
        assert_eq!(dirty.removed, vec![free_vf.to_string()]);
        tracker.finish_removal(&dirty.removed).unwrap();
        assert!(tracker.get(free_vf).is_none());

        // A device in use survives its own disappearance.
        tracker.update_devices_from_probe(&[]).unwrap();
        assert_eq!(tracker.get(&held).unwrap().status, PciDeviceStatus::Claimed);
    }

    #[test]
    fn changed_numa_node_moves_pool() {
        let mut tracker = tracker();
        let mut moved = inventory();
        for p in &mut moved {
            p.numa_node = Some(1);
        }
        tracker.update_devices_from_probe(&moved).unwrap();
        let pools = tracker.pools();
        assert!(pools.iter().all(|p| p.numa_node == Some(1)));
        assert_eq!(tracker.stats().free_count(), 3);
    }

    #[test]
    fn clean_usage_frees_unknown_owners() {
        let mut tracker = tracker();
        let keep = Uuid::new_v4();
        let gone = Uuid::new_v4();
        tracker.claim_container(keep, &[vf_request(1)]).unwrap();
        tracker.claim_container(gone, &[vf_request(1)]).unwrap();

        tracker.clean_usage(&HashSet::from([keep])).unwrap();
        assert_eq!(tracker.owners(), HashSet::from([keep]));
        assert_eq!(tracker.container_devices(keep).len(), 1);
    }

    #[test]
    fn rebuilds_ownership_from_rows() {
        let mut tracker = tracker();
        let owner = Uuid::new_v4();
        tracker.claim_container(owner, &[vf_request(1)]).unwrap();
        tracker.allocate_container(owner).unwrap();

        let rows = tracker.devices().to_vec();
        let reloaded = PciDevTracker::new(
            tracker.node_uuid(),
            Arc::new(PciWhitelist::from_config(&[[("vendor_id".to_string(), "8086".to_string())].into()]).unwrap()),
            rows,
        );
        assert_eq!(reloaded.container_devices(owner).len(), 1);
        assert_eq!(reloaded.stats().free_count(), 1);
    }
}
