//! PCI function records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PciDeviceType {
    #[serde(rename = "type-PCI")]
    Standard,
    #[serde(rename = "type-PF")]
    SriovPf,
    #[serde(rename = "type-VF")]
    SriovVf,
}

impl PciDeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PciDeviceType::Standard => "type-PCI",
            PciDeviceType::SriovPf => "type-PF",
            PciDeviceType::SriovVf => "type-VF",
        }
    }
}

impl fmt::Display for PciDeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allocation status of a PCI function.
///
/// ```text
/// available ──claim──▶ claimed ──allocate──▶ allocated
///     │   ▲                │                     │
///     │   └──────free──────┴─────────────────────┘
///     └──remove──▶ removed ──▶ deleted
/// ```
///
/// `unclaimable` and `unavailable` are set on the other side of a PF/VF
/// relation while its peer is claimed or allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PciDeviceStatus {
    Available,
    Claimed,
    Allocated,
    Unclaimable,
    Unavailable,
    Removed,
    Deleted,
}

impl PciDeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PciDeviceStatus::Available => "available",
            PciDeviceStatus::Claimed => "claimed",
            PciDeviceStatus::Allocated => "allocated",
            PciDeviceStatus::Unclaimable => "unclaimable",
            PciDeviceStatus::Unavailable => "unavailable",
            PciDeviceStatus::Removed => "removed",
            PciDeviceStatus::Deleted => "deleted",
        }
    }

    /// Whether the device still exists on the host as far as tracking goes.
    pub fn is_live(&self) -> bool {
        !matches!(self, PciDeviceStatus::Removed | PciDeviceStatus::Deleted)
    }
}

impl fmt::Display for PciDeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A PCI function as reported by the host probe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbedPciDevice {
    pub address: String,
    pub vendor_id: String,
    pub product_id: String,
    pub dev_type: PciDeviceType,
    #[serde(default)]
    pub parent_addr: Option<String>,
    #[serde(default)]
    pub numa_node: Option<u32>,
    #[serde(default)]
    pub extra_info: BTreeMap<String, String>,
}

/// One tracked PCI function.
///
/// PF/VF relations are expressed only through `parent_addr`; the device
/// tree resolves them into indices.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PciDevice {
    pub uuid: Uuid,
    pub compute_node_uuid: Uuid,
    pub address: String,
    pub vendor_id: String,
    pub product_id: String,
    pub dev_type: PciDeviceType,
    pub status: PciDeviceStatus,
    pub container_uuid: Option<Uuid>,
    pub parent_addr: Option<String>,
    pub numa_node: Option<u32>,
    #[serde(default)]
    pub extra_info: BTreeMap<String, String>,
}

impl PciDevice {
    /// Create an `available` record for a newly discovered function.
    pub fn from_probe(compute_node_uuid: Uuid, probed: &ProbedPciDevice) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            compute_node_uuid,
            address: probed.address.clone(),
            vendor_id: probed.vendor_id.clone(),
            product_id: probed.product_id.clone(),
            dev_type: probed.dev_type,
            status: PciDeviceStatus::Available,
            container_uuid: None,
            parent_addr: probed.parent_addr.clone(),
            numa_node: probed.numa_node,
            extra_info: probed.extra_info.clone(),
        }
    }

    /// Refresh probe-owned attributes. Returns true if anything changed.
    pub fn update_from_probe(&mut self, probed: &ProbedPciDevice) -> bool {
        let updated = PciDevice {
            vendor_id: probed.vendor_id.clone(),
            product_id: probed.product_id.clone(),
            dev_type: probed.dev_type,
            parent_addr: probed.parent_addr.clone(),
            numa_node: probed.numa_node,
            extra_info: probed.extra_info.clone(),
            ..self.clone()
        };
        let changed = updated != *self;
        *self = updated;
        changed
    }

    /// Storage key, unique per compute node.
    pub fn table_key(&self) -> String {
        format!("{}/{}", self.compute_node_uuid, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probed(addr: &str) -> ProbedPciDevice {
        ProbedPciDevice {
            address: addr.to_string(),
            vendor_id: "8086".to_string(),
            product_id: "1520".to_string(),
            dev_type: PciDeviceType::SriovVf,
            parent_addr: Some("0000:81:00.0".to_string()),
            numa_node: Some(0),
            extra_info: BTreeMap::new(),
        }
    }

    #[test]
    fn new_device_is_available_and_unowned() {
        let node = Uuid::new_v4();
        let dev = PciDevice::from_probe(node, &probed("0000:81:00.1"));
        assert_eq!(dev.status, PciDeviceStatus::Available);
        assert!(dev.container_uuid.is_none());
        assert_eq!(dev.table_key(), format!("{node}/0000:81:00.1"));
    }

    #[test]
    fn update_from_probe_reports_changes() {
        let mut dev = PciDevice::from_probe(Uuid::new_v4(), &probed("0000:81:00.1"));
        assert!(!dev.update_from_probe(&probed("0000:81:00.1")));

        let mut moved = probed("0000:81:00.1");
        moved.numa_node = Some(1);
        assert!(dev.update_from_probe(&moved));
        assert_eq!(dev.numa_node, Some(1));
    }

    #[test]
    fn type_serializes_with_legacy_names() {
        let json = serde_json::to_string(&PciDeviceType::SriovPf).unwrap();
        assert_eq!(json, "\"type-PF\"");
        let status = serde_json::to_string(&PciDeviceStatus::Unclaimable).unwrap();
        assert_eq!(status, "\"unclaimable\"");
    }
}
