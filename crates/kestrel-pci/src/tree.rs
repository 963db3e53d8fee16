//! PF/VF device tree and the allocation state machine.
//!
//! Devices live in a flat arena indexed by slot. Parent/child relations
//! are slot indices rebuilt from `parent_addr` whenever the inventory
//! changes; they are never persisted.
//!
//! Every transition validates the device and its relatives first and only
//! then mutates, so a rejected transition leaves all statuses and owners
//! unchanged.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;
use uuid::Uuid;

use crate::device::{PciDevice, PciDeviceStatus, PciDeviceType};
use crate::error::{PciError, PciResult};

use PciDeviceStatus::*;

/// Arena of PCI functions for one compute node.
#[derive(Debug, Clone, Default)]
pub struct PciDeviceTree {
    devices: Vec<PciDevice>,
    /// Address → slot.
    index: HashMap<String, usize>,
    /// PF slot → VF slots.
    children: HashMap<usize, Vec<usize>>,
    /// VF slot → PF slot.
    parent: HashMap<usize, usize>,
    /// Addresses whose record changed since the last `take_dirty`.
    dirty: BTreeSet<String>,
}

impl PciDeviceTree {
    pub fn build(devices: Vec<PciDevice>) -> Self {
        let mut tree = Self {
            devices,
            ..Default::default()
        };
        tree.relink();
        tree
    }

    /// Recompute the address index and PF/VF links.
    ///
    /// Removed and deleted functions are indexed but never linked.
    pub fn relink(&mut self) {
        self.index.clear();
        self.children.clear();
        self.parent.clear();

        for (slot, dev) in self.devices.iter().enumerate() {
            self.index.insert(dev.address.clone(), slot);
        }

        for (slot, dev) in self.devices.iter().enumerate() {
            if dev.dev_type != PciDeviceType::SriovVf || !dev.status.is_live() {
                continue;
            }
            let Some(parent_addr) = dev.parent_addr.as_deref() else {
                continue;
            };
            let Some(&pslot) = self.index.get(parent_addr) else {
                continue;
            };
            let pf = &self.devices[pslot];
            if pf.dev_type == PciDeviceType::SriovPf
                && pf.status.is_live()
                && pf.compute_node_uuid == dev.compute_node_uuid
            {
                self.parent.insert(slot, pslot);
                self.children.entry(pslot).or_default().push(slot);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[PciDevice] {
        &self.devices
    }

    pub fn get(&self, address: &str) -> Option<&PciDevice> {
        self.index.get(address).map(|&slot| &self.devices[slot])
    }

    pub fn parent_of(&self, address: &str) -> Option<&PciDevice> {
        let slot = *self.index.get(address)?;
        self.parent.get(&slot).map(|&p| &self.devices[p])
    }

    pub fn children_of(&self, address: &str) -> Vec<&PciDevice> {
        self.index
            .get(address)
            .and_then(|slot| self.children.get(slot))
            .map(|slots| slots.iter().map(|&s| &self.devices[s]).collect())
            .unwrap_or_default()
    }

    /// Add a device, replacing any removed/deleted record at the same address.
    ///
    /// Returns false if a live device already occupies the address.
    pub fn insert(&mut self, device: PciDevice) -> bool {
        let address = device.address.clone();
        match self.index.get(&address) {
            Some(&slot) if self.devices[slot].status.is_live() => return false,
            Some(&slot) => self.devices[slot] = device,
            None => self.devices.push(device),
        }
        self.dirty.insert(address);
        self.relink();
        true
    }

    /// Mutable access for probe-driven attribute refreshes.
    ///
    /// Callers must `relink` afterwards if `parent_addr` or type changed.
    pub fn get_mut(&mut self, address: &str) -> Option<&mut PciDevice> {
        let slot = *self.index.get(address)?;
        self.dirty.insert(address.to_string());
        Some(&mut self.devices[slot])
    }

    /// Drain the set of changed records.
    pub fn take_dirty(&mut self) -> Vec<PciDevice> {
        std::mem::take(&mut self.dirty)
            .into_iter()
            .filter_map(|addr| self.get(&addr).cloned())
            .collect()
    }

    fn slot(&self, address: &str) -> PciResult<usize> {
        self.index
            .get(address)
            .copied()
            .ok_or_else(|| PciError::DeviceNotFound(address.to_string()))
    }

    fn set_status(&mut self, slot: usize, status: PciDeviceStatus) {
        let dev = &mut self.devices[slot];
        if dev.status != status {
            dev.status = status;
            self.dirty.insert(dev.address.clone());
        }
    }

    fn set_owner(&mut self, slot: usize, owner: Option<Uuid>) {
        let dev = &mut self.devices[slot];
        if dev.container_uuid != owner {
            dev.container_uuid = owner;
            self.dirty.insert(dev.address.clone());
        }
    }

    fn check_status(&self, slot: usize, hopestatus: &[PciDeviceStatus]) -> PciResult<()> {
        let dev = &self.devices[slot];
        if hopestatus.contains(&dev.status) {
            Ok(())
        } else {
            Err(PciError::InvalidStatus {
                address: dev.address.clone(),
                status: dev.status,
                hopestatus: hopestatus.to_vec(),
            })
        }
    }

    /// All VFs of PF `slot` must be in `ok`.
    fn check_children(&self, slot: usize, ok: &[PciDeviceStatus]) -> PciResult<Vec<usize>> {
        let vfs = self.children.get(&slot).cloned().unwrap_or_default();
        for &vf in &vfs {
            let vf_dev = &self.devices[vf];
            if !ok.contains(&vf_dev.status) {
                return Err(PciError::VfInvalidStatus {
                    address: self.devices[slot].address.clone(),
                    vf_address: vf_dev.address.clone(),
                    vf_status: vf_dev.status,
                });
            }
        }
        Ok(vfs)
    }

    /// The PF of VF `slot`, if any, must be in `ok`.
    fn check_parent(&self, slot: usize, ok: &[PciDeviceStatus]) -> PciResult<Option<usize>> {
        let Some(&pslot) = self.parent.get(&slot) else {
            return Ok(None);
        };
        let pf = &self.devices[pslot];
        if ok.contains(&pf.status) {
            Ok(Some(pslot))
        } else {
            Err(PciError::PfInvalidStatus {
                address: pf.address.clone(),
                vf_address: self.devices[slot].address.clone(),
                status: pf.status,
                hopestatus: ok.to_vec(),
            })
        }
    }

    /// `available → claimed` on behalf of `container`.
    pub fn claim(&mut self, address: &str, container: Uuid) -> PciResult<()> {
        let slot = self.slot(address)?;
        self.check_status(slot, &[Available])?;

        match self.devices[slot].dev_type {
            PciDeviceType::SriovPf => {
                let vfs = self.check_children(slot, &[Available])?;
                for vf in vfs {
                    self.set_status(vf, Unclaimable);
                }
            }
            PciDeviceType::SriovVf => {
                if let Some(pf) =
                    self.check_parent(slot, &[Available, Unclaimable, Unavailable])?
                {
                    if self.devices[pf].status == Available {
                        self.set_status(pf, Unclaimable);
                    }
                }
            }
            PciDeviceType::Standard => {}
        }

        self.set_status(slot, Claimed);
        self.set_owner(slot, Some(container));
        debug!(%address, %container, "PCI device claimed");
        Ok(())
    }

    /// `available | claimed → allocated`. Returns a copy for the owner's
    /// device list.
    pub fn allocate(&mut self, address: &str, container: Uuid) -> PciResult<PciDevice> {
        let slot = self.slot(address)?;
        self.check_status(slot, &[Available, Claimed])?;

        let dev = &self.devices[slot];
        if dev.status == Claimed && dev.container_uuid != Some(container) {
            return Err(PciError::InvalidOwner {
                address: dev.address.clone(),
                owner: dev.container_uuid,
                hopeowner: container,
            });
        }

        match dev.dev_type {
            PciDeviceType::SriovPf => {
                let vfs = self.check_children(slot, &[Available, Unclaimable])?;
                for vf in vfs {
                    self.set_status(vf, Unavailable);
                }
            }
            PciDeviceType::SriovVf => {
                if let Some(pf) =
                    self.check_parent(slot, &[Available, Unclaimable, Unavailable])?
                {
                    self.set_status(pf, Unavailable);
                }
            }
            PciDeviceType::Standard => {}
        }

        self.set_status(slot, Allocated);
        self.set_owner(slot, Some(container));
        debug!(%address, %container, "PCI device allocated");
        Ok(self.devices[slot].clone())
    }

    /// `allocated | claimed → available`.
    ///
    /// Returns every device that became available: the device itself, all
    /// VFs of a freed PF, and the PF of a VF once all its VFs are free.
    pub fn free(&mut self, address: &str, container: Option<Uuid>) -> PciResult<Vec<PciDevice>> {
        let slot = self.slot(address)?;
        self.check_status(slot, &[Allocated, Claimed])?;

        let dev = &self.devices[slot];
        if let Some(expected) = container {
            if dev.container_uuid != Some(expected) {
                return Err(PciError::InvalidOwner {
                    address: dev.address.clone(),
                    owner: dev.container_uuid,
                    hopeowner: expected,
                });
            }
        }

        let mut freed_slots = Vec::new();
        match dev.dev_type {
            PciDeviceType::SriovPf => {
                let vfs = self.children.get(&slot).cloned().unwrap_or_default();
                for vf in vfs {
                    self.set_status(vf, Available);
                    freed_slots.push(vf);
                }
            }
            PciDeviceType::SriovVf => {
                if let Some(&pf) = self.parent.get(&slot) {
                    let siblings_free = self.children.get(&pf).is_some_and(|vfs| {
                        vfs.iter()
                            .filter(|&&vf| vf != slot)
                            .all(|&vf| self.devices[vf].status == Available)
                    });
                    if siblings_free && self.devices[pf].status != Available {
                        self.set_status(pf, Available);
                        freed_slots.push(pf);
                    }
                }
            }
            PciDeviceType::Standard => {}
        }

        self.set_status(slot, Available);
        self.set_owner(slot, None);
        freed_slots.push(slot);
        debug!(%address, "PCI device freed");

        Ok(freed_slots
            .into_iter()
            .map(|s| self.devices[s].clone())
            .collect())
    }

    /// `available → removed` for a function that vanished from the host.
    pub fn remove(&mut self, address: &str) -> PciResult<PciDevice> {
        let slot = self.slot(address)?;
        self.check_status(slot, &[Available])?;
        self.set_status(slot, Removed);
        self.set_owner(slot, None);
        self.relink();
        Ok(self.devices[slot].clone())
    }

    /// `removed → deleted` once storage has dropped the row; the record
    /// leaves the arena.
    pub fn mark_deleted(&mut self, address: &str) -> PciResult<()> {
        let slot = self.slot(address)?;
        self.check_status(slot, &[Removed])?;
        self.devices.remove(slot);
        self.dirty.remove(address);
        self.relink();
        Ok(())
    }
}
