//! Device pools.
//!
//! Available devices are grouped by vendor, product, NUMA node, device
//! type and whitelist tags. The compute node exports pool summaries; the
//! scheduler matches requests against those counts.

use std::collections::BTreeMap;
use std::sync::Arc;

use kestrel_core::PciRequest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::{PciDevice, PciDeviceType};
use crate::error::{PciError, PciResult};
use crate::whitelist::{DeviceSpec, PciWhitelist};

const PF_DEV_TYPE: &str = "type-PF";

/// A group of interchangeable devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevicePool {
    pub vendor_id: String,
    pub product_id: String,
    pub numa_node: Option<u32>,
    /// Whitelist tags plus `dev_type`.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub count: u32,
    /// Member devices. Only populated on the compute side.
    #[serde(skip)]
    pub devices: Vec<PciDevice>,
}

impl PciDevicePool {
    fn for_device(device: &PciDevice, spec: &DeviceSpec) -> Self {
        let mut tags = spec.tags.clone();
        tags.insert("dev_type".to_string(), device.dev_type.as_str().to_string());
        Self {
            vendor_id: device.vendor_id.clone(),
            product_id: device.product_id.clone(),
            numa_node: device.numa_node,
            tags,
            count: 0,
            devices: Vec::new(),
        }
    }

    fn same_key(&self, other: &PciDevicePool) -> bool {
        self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
            && self.numa_node == other.numa_node
            && self.tags == other.tags
    }

    /// Whether every key of `spec` equals the pool's attribute or tag.
    pub fn matches(&self, spec: &BTreeMap<String, String>) -> bool {
        spec.iter().all(|(key, want)| match key.as_str() {
            "vendor_id" => self.vendor_id.eq_ignore_ascii_case(want),
            "product_id" => self.product_id.eq_ignore_ascii_case(want),
            "numa_node" => self.numa_node.map(|n| n.to_string()).as_deref() == Some(want),
            _ => self.tags.get(key) == Some(want),
        })
    }

    fn is_pf(&self) -> bool {
        self.tags.get("dev_type").map(String::as_str) == Some(PF_DEV_TYPE)
    }

    /// Whether the pool can serve a request with `specs`. PF pools only
    /// serve specs that ask for `dev_type = type-PF`.
    fn serves(&self, specs: &[BTreeMap<String, String>]) -> bool {
        specs.iter().any(|spec| {
            self.matches(spec)
                && (!self.is_pf() || spec.get("dev_type").map(String::as_str) == Some(PF_DEV_TYPE))
        })
    }

    /// Flat map with tags inlined next to the key attributes.
    pub fn to_dict(&self) -> Map<String, Value> {
        let mut dict = Map::new();
        for (key, value) in &self.tags {
            dict.insert(key.clone(), Value::String(value.clone()));
        }
        dict.insert("vendor_id".into(), Value::String(self.vendor_id.clone()));
        dict.insert("product_id".into(), Value::String(self.product_id.clone()));
        dict.insert(
            "numa_node".into(),
            self.numa_node.map_or(Value::Null, Value::from),
        );
        dict.insert("count".into(), Value::from(self.count));
        dict
    }

    /// Inverse of [`to_dict`](Self::to_dict). Keys other than the key
    /// attributes and `count` become tags.
    pub fn from_dict(mut dict: Map<String, Value>) -> PciResult<Self> {
        let take_str = |dict: &mut Map<String, Value>, key: &str| -> PciResult<String> {
            match dict.remove(key) {
                Some(Value::String(s)) => Ok(s),
                other => Err(PciError::InvalidPoolDict(format!("{key}: {other:?}"))),
            }
        };

        let vendor_id = take_str(&mut dict, "vendor_id")?;
        let product_id = take_str(&mut dict, "product_id")?;
        let numa_node = match dict.remove("numa_node") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => Some(
                n.as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| PciError::InvalidPoolDict(format!("numa_node: {n}")))?,
            ),
            Some(other) => return Err(PciError::InvalidPoolDict(format!("numa_node: {other}"))),
        };
        let count = dict
            .remove("count")
            .and_then(|v| v.as_u64())
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| PciError::InvalidPoolDict("count".to_string()))?;

        let tags = dict
            .into_iter()
            .map(|(key, value)| match value {
                Value::String(s) => Ok((key, s)),
                other => Err(PciError::InvalidPoolDict(format!("{key}: {other}"))),
            })
            .collect::<PciResult<BTreeMap<_, _>>>()?;

        Ok(Self {
            vendor_id,
            product_id,
            numa_node,
            tags,
            count,
            devices: Vec::new(),
        })
    }

    fn take_device(&mut self, address: &str) -> bool {
        let Some(pos) = self.devices.iter().position(|d| d.address == address) else {
            return false;
        };
        self.devices.remove(pos);
        self.count = self.count.saturating_sub(1);
        true
    }
}

/// Pools of available devices for one node.
#[derive(Debug, Clone, Default)]
pub struct PciDeviceStats {
    whitelist: Arc<PciWhitelist>,
    pools: Vec<PciDevicePool>,
}

impl PciDeviceStats {
    pub fn new(whitelist: Arc<PciWhitelist>) -> Self {
        Self {
            whitelist,
            pools: Vec::new(),
        }
    }

    /// Rebuild from exported summaries, as the scheduler does.
    pub fn from_pools(pools: Vec<PciDevicePool>) -> Self {
        Self {
            whitelist: Arc::default(),
            pools,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Summaries without member lists.
    pub fn pools(&self) -> Vec<PciDevicePool> {
        self.pools
            .iter()
            .map(|pool| PciDevicePool {
                devices: Vec::new(),
                ..pool.clone()
            })
            .collect()
    }

    /// Total number of pooled devices.
    pub fn free_count(&self) -> u32 {
        self.pools.iter().map(|p| p.count).sum()
    }

    /// Count `device` into its pool. Devices no whitelist entry matches are
    /// not pooled.
    pub fn add_device(&mut self, device: &PciDevice) {
        let Some(spec) = self.whitelist.device_spec(device) else {
            return;
        };
        let key = PciDevicePool::for_device(device, spec);
        let pool = match self.pools.iter().position(|p| p.same_key(&key)) {
            Some(pos) => &mut self.pools[pos],
            None => {
                self.pools.push(key);
                let last = self.pools.len() - 1;
                &mut self.pools[last]
            }
        };
        pool.count += 1;
        pool.devices.push(device.clone());
    }

    /// Take `device` out of its pool. A pool left empty is dropped.
    pub fn remove_device(&mut self, device: &PciDevice) -> PciResult<()> {
        let Some(spec) = self.whitelist.device_spec(device) else {
            return Ok(());
        };
        let key = PciDevicePool::for_device(device, spec);
        let pos = self
            .pools
            .iter()
            .position(|p| p.same_key(&key) && p.count > 0)
            .ok_or_else(|| PciError::PoolEmpty {
                address: device.address.clone(),
            })?;

        let pool = &mut self.pools[pos];
        pool.count -= 1;
        pool.devices.retain(|d| d.address != device.address);
        if pool.count == 0 {
            self.pools.remove(pos);
        }
        Ok(())
    }

    /// Whether every request fits.
    ///
    /// With member devices known (the compute side) the devices are picked
    /// on a scratch copy, so PF/VF relatives are never counted twice. From
    /// summaries alone (the scheduler side) only counts are compared.
    pub fn support_requests(&self, requests: &[PciRequest]) -> bool {
        if self.has_members() {
            return Self::pick(self.pools.clone(), requests).is_some();
        }
        let mut scratch = self.pools.clone();
        Self::decrement(&mut scratch, requests).is_ok()
    }

    /// Subtract requests from pool counts. On failure nothing changes.
    pub fn apply_requests(&mut self, requests: &[PciRequest]) -> PciResult<()> {
        let mut scratch = self.pools.clone();
        Self::decrement(&mut scratch, requests)?;
        self.pools = scratch;
        Ok(())
    }

    fn has_members(&self) -> bool {
        self.pools.iter().any(|p| !p.devices.is_empty())
    }

    fn decrement(pools: &mut [PciDevicePool], requests: &[PciRequest]) -> PciResult<()> {
        for request in requests {
            let available: u32 = pools
                .iter()
                .filter(|p| p.serves(&request.spec))
                .map(|p| p.count)
                .sum();
            if available < request.count {
                return Err(PciError::ClaimFailed);
            }

            let mut remaining = request.count;
            for pool in pools.iter_mut().filter(|p| p.serves(&request.spec)) {
                let take = remaining.min(pool.count);
                pool.count -= take;
                remaining -= take;
                if remaining == 0 {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Pick concrete devices for `requests` and take them out of the
    /// pools, along with the other side of any PF/VF relation.
    ///
    /// Returns `None` without changes if the requests do not fit.
    pub fn consume_requests(&mut self, requests: &[PciRequest]) -> Option<Vec<PciDevice>> {
        let (pools, picked) = Self::pick(self.pools.clone(), requests)?;
        self.pools = pools;
        Some(picked)
    }

    /// Pick device by device. Each pick drops its relatives from every
    /// pool, so a PF and one of its VFs are never picked together.
    fn pick(
        mut pools: Vec<PciDevicePool>,
        requests: &[PciRequest],
    ) -> Option<(Vec<PciDevicePool>, Vec<PciDevice>)> {
        let mut picked = Vec::new();

        for request in requests {
            let mut remaining = request.count;
            while remaining > 0 {
                let pool = pools
                    .iter_mut()
                    .find(|p| p.count > 0 && !p.devices.is_empty() && p.serves(&request.spec))?;
                let device = pool.devices.remove(0);
                pool.count -= 1;
                Self::drop_relatives(&mut pools, &device);
                picked.push(device);
                remaining -= 1;
            }
        }

        Some((pools, picked))
    }

    fn drop_relatives(pools: &mut [PciDevicePool], device: &PciDevice) {
        if device.dev_type == PciDeviceType::Standard {
            return;
        }
        for pool in pools.iter_mut() {
            let relatives: Vec<String> = pool
                .devices
                .iter()
                .filter(|d| {
                    d.parent_addr.as_deref() == Some(device.address.as_str())
                        || device.parent_addr.as_deref() == Some(d.address.as_str())
                })
                .map(|d| d.address.clone())
                .collect();
            for address in relatives {
                pool.take_device(&address);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{PciDeviceStatus, PciDeviceType};
    use uuid::Uuid;

    fn whitelist() -> Arc<PciWhitelist> {
        let entry: BTreeMap<String, String> = [
            ("vendor_id".to_string(), "8086".to_string()),
            ("physical_network".to_string(), "physnet1".to_string()),
        ]
        .into();
        Arc::new(PciWhitelist::from_config(&[entry]).unwrap())
    }

    fn device(address: &str, dev_type: PciDeviceType, parent: Option<&str>, numa: u32) -> PciDevice {
        PciDevice {
            uuid: Uuid::new_v4(),
            compute_node_uuid: Uuid::nil(),
            address: address.to_string(),
            vendor_id: "8086".to_string(),
            product_id: "1520".to_string(),
            dev_type,
            status: PciDeviceStatus::Available,
            container_uuid: None,
            parent_addr: parent.map(str::to_string),
            numa_node: Some(numa),
            extra_info: BTreeMap::new(),
        }
    }

    fn vf(address: &str, numa: u32) -> PciDevice {
        device(address, PciDeviceType::SriovVf, None, numa)
    }

    fn request(count: u32, pairs: &[(&str, &str)]) -> PciRequest {
        PciRequest {
            count,
            spec: vec![pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()],
            alias_name: None,
        }
    }

    #[test]
    fn devices_group_by_numa_node() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&vf("0000:81:00.1", 0));
        stats.add_device(&vf("0000:81:00.2", 0));
        stats.add_device(&vf("0000:82:00.1", 1));

        let pools = stats.pools();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[0].count, 2);
        assert_eq!(pools[0].tags["dev_type"], "type-VF");
        assert_eq!(pools[0].tags["physical_network"], "physnet1");
        assert!(pools.iter().all(|p| p.devices.is_empty()));
        assert_eq!(stats.free_count(), 3);
    }

    #[test]
    fn unlisted_devices_are_not_pooled() {
        let mut stats = PciDeviceStats::new(whitelist());
        let mut other = vf("0000:05:00.0", 0);
        other.vendor_id = "10de".to_string();
        stats.add_device(&other);
        assert!(stats.is_empty());
        assert!(stats.remove_device(&other).is_ok());
    }

    #[test]
    fn second_remove_after_single_add_is_pool_empty() {
        let mut stats = PciDeviceStats::new(whitelist());
        let dev = vf("0000:81:00.1", 0);
        stats.add_device(&dev);

        stats.remove_device(&dev).unwrap();
        let err = stats.remove_device(&dev).unwrap_err();
        assert_eq!(
            err,
            PciError::PoolEmpty {
                address: "0000:81:00.1".to_string()
            }
        );
    }

    #[test]
    fn support_checks_aggregate_counts_across_pools() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&vf("0000:81:00.1", 0));
        stats.add_device(&vf("0000:82:00.1", 1));

        assert!(stats.support_requests(&[request(2, &[("vendor_id", "8086")])]));
        assert!(!stats.support_requests(&[request(3, &[("vendor_id", "8086")])]));
        assert!(stats.support_requests(&[request(1, &[("numa_node", "1")])]));
        assert!(!stats.support_requests(&[request(2, &[("numa_node", "1")])]));
        assert!(!stats.support_requests(&[
            request(1, &[("vendor_id", "8086")]),
            request(2, &[("physical_network", "physnet1")]),
        ]));
        // Support never mutates.
        assert_eq!(stats.free_count(), 2);
    }

    #[test]
    fn apply_is_all_or_nothing() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&vf("0000:81:00.1", 0));
        stats.add_device(&vf("0000:81:00.2", 0));

        let err = stats
            .apply_requests(&[request(1, &[]), request(5, &[("dev_type", "type-VF")])])
            .unwrap_err();
        assert_eq!(err, PciError::ClaimFailed);
        assert_eq!(stats.free_count(), 2);

        stats.apply_requests(&[request(2, &[("dev_type", "type-VF")])]).unwrap();
        assert_eq!(stats.free_count(), 0);
    }

    #[test]
    fn consume_pf_drops_its_vfs() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&device("0000:81:00.0", PciDeviceType::SriovPf, None, 0));
        stats.add_device(&device("0000:81:00.1", PciDeviceType::SriovVf, Some("0000:81:00.0"), 0));
        stats.add_device(&device("0000:81:00.2", PciDeviceType::SriovVf, Some("0000:81:00.0"), 0));

        let picked = stats
            .consume_requests(&[request(1, &[("dev_type", "type-PF")])])
            .unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].address, "0000:81:00.0");
        assert_eq!(stats.free_count(), 0);
    }

    #[test]
    fn consume_vf_drops_parent_and_failure_changes_nothing() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&device("0000:81:00.0", PciDeviceType::SriovPf, None, 0));
        stats.add_device(&device("0000:81:00.1", PciDeviceType::SriovVf, Some("0000:81:00.0"), 0));
        stats.add_device(&device("0000:81:00.2", PciDeviceType::SriovVf, Some("0000:81:00.0"), 0));

        assert!(stats
            .consume_requests(&[request(3, &[("dev_type", "type-VF")])])
            .is_none());
        assert_eq!(stats.free_count(), 3);

        let picked = stats
            .consume_requests(&[request(1, &[("dev_type", "type-VF")])])
            .unwrap();
        assert_eq!(picked.len(), 1);
        // One VF left, the PF went with the consumed VF.
        assert_eq!(stats.free_count(), 1);
        assert!(!stats.support_requests(&[request(1, &[("dev_type", "type-PF")])]));
    }

    #[test]
    fn vendor_only_request_skips_the_pf() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&device("0000:81:00.0", PciDeviceType::SriovPf, None, 0));
        stats.add_device(&device("0000:81:00.1", PciDeviceType::SriovVf, Some("0000:81:00.0"), 0));
        stats.add_device(&device("0000:81:00.2", PciDeviceType::SriovVf, Some("0000:81:00.0"), 0));

        assert!(!stats.support_requests(&[request(3, &[("vendor_id", "8086")])]));
        assert!(stats.support_requests(&[request(2, &[("vendor_id", "8086")])]));

        let picked = stats
            .consume_requests(&[request(1, &[("vendor_id", "8086")])])
            .unwrap();
        assert_eq!(picked[0].dev_type, PciDeviceType::SriovVf);
        // The sibling VF is still free; the PF went with the picked VF.
        assert_eq!(stats.free_count(), 1);
        assert!(stats.support_requests(&[request(1, &[("vendor_id", "8086")])]));
    }

    #[test]
    fn pf_and_its_vf_are_never_picked_together() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&device("0000:81:00.0", PciDeviceType::SriovPf, None, 0));
        stats.add_device(&device("0000:81:00.1", PciDeviceType::SriovVf, Some("0000:81:00.0"), 0));

        let pf_and_vf = [
            request(1, &[("dev_type", "type-PF")]),
            request(1, &[("dev_type", "type-VF")]),
        ];
        assert!(!stats.support_requests(&pf_and_vf));
        assert!(stats.consume_requests(&pf_and_vf).is_none());
        assert_eq!(stats.free_count(), 2);
    }

    #[test]
    fn summary_counts_leave_pf_pools_to_explicit_requests() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&device("0000:81:00.0", PciDeviceType::SriovPf, None, 0));
        stats.add_device(&device("0000:81:00.1", PciDeviceType::SriovVf, Some("0000:81:00.0"), 0));
        let remote = PciDeviceStats::from_pools(stats.pools());

        assert!(!remote.support_requests(&[request(2, &[("vendor_id", "8086")])]));
        assert!(remote.support_requests(&[request(1, &[("vendor_id", "8086")])]));
        assert!(remote.support_requests(&[request(1, &[("dev_type", "type-PF")])]));
    }

    #[test]
    fn pool_dict_roundtrip() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&vf("0000:81:00.1", 1));
        stats.add_device(&vf("0000:81:00.2", 1));
        let pool = stats.pools().remove(0);

        let dict = pool.to_dict();
        assert_eq!(dict["physical_network"], "physnet1");
        assert_eq!(dict["count"], 2);

        let restored = PciDevicePool::from_dict(dict).unwrap();
        assert_eq!(restored.vendor_id, pool.vendor_id);
        assert_eq!(restored.product_id, pool.product_id);
        assert_eq!(restored.numa_node, Some(1));
        assert_eq!(restored.count, 2);
        assert_eq!(restored.tags, pool.tags);
    }

    #[test]
    fn from_dict_rejects_missing_keys() {
        let mut dict = Map::new();
        dict.insert("vendor_id".into(), Value::from("8086"));
        dict.insert("count".into(), Value::from(1));
        assert!(matches!(
            PciDevicePool::from_dict(dict),
            Err(PciError::InvalidPoolDict(_))
        ));
    }

    #[test]
    fn scheduler_side_stats_from_summaries() {
        let mut stats = PciDeviceStats::new(whitelist());
        stats.add_device(&vf("0000:81:00.1", 0));
        let mut remote = PciDeviceStats::from_pools(stats.pools());

        assert!(remote.support_requests(&[request(1, &[("product_id", "1520")])]));
        remote.apply_requests(&[request(1, &[("product_id", "1520")])]).unwrap();
        assert!(!remote.support_requests(&[request(1, &[("product_id", "1520")])]));
    }
}
