//! Driver probe interface.
//!
//! The audit asks a [`ResourceProbe`] what the host actually has. The
//! daemon ships [`InventoryProbe`], which reads a static TOML description
//! of the host.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use kestrel_core::{NumaNode, NumaTopology};
use kestrel_pci::ProbedPciDevice;
use kestrel_state::ComputeNode;
use serde::{Deserialize, Serialize};

/// Source of truth for a host's capacity.
pub trait ResourceProbe: Send + Sync {
    /// Fill capacity, topology and OS fields of `node`. Usage fields are
    /// left to the tracker.
    fn get_available_resources(&self, node: &mut ComputeNode) -> anyhow::Result<()>;

    /// PCI functions currently present on the host.
    fn pci_passthrough_devices(&self) -> anyhow::Result<Vec<ProbedPciDevice>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryNumaNode {
    pub id: u32,
    pub cpus: Vec<u32>,
    pub mem_mb: u64,
}

/// Static description of a host.
///
/// ```toml
/// cpus = 8
/// mem_total_mb = 16384
/// disk_total_gb = 200
/// runtimes = ["runc"]
/// enable_cpu_pinning = true
///
/// [[numa_nodes]]
/// id = 0
/// cpus = [0, 1, 2, 3]
/// mem_mb = 8192
///
/// [[pci_devices]]
/// address = "0000:81:00.0"
/// vendor_id = "8086"
/// product_id = "1521"
/// dev_type = "type-PF"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct HostInventory {
    pub cpus: f64,
    pub mem_total_mb: u64,
    pub disk_total_gb: u64,
    pub runtimes: Vec<String>,
    pub disk_quota_supported: bool,
    pub enable_cpu_pinning: bool,
    pub labels: HashMap<String, String>,
    pub availability_zone: Option<String>,
    pub os_type: Option<String>,
    pub os: Option<String>,
    pub kernel_version: Option<String>,
    pub architecture: Option<String>,
    pub numa_nodes: Vec<InventoryNumaNode>,
    pub pci_devices: Vec<ProbedPciDevice>,
}

/// Probe backed by a [`HostInventory`].
#[derive(Debug, Clone)]
pub struct InventoryProbe {
    inventory: HostInventory,
}

impl InventoryProbe {
    pub fn new(inventory: HostInventory) -> Self {
        Self { inventory }
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading host inventory {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let inventory: HostInventory = toml::from_str(content)?;
        if inventory.cpus < 0.0 {
            anyhow::bail!("cpus must not be negative");
        }
        Ok(Self { inventory })
    }

    pub fn inventory(&self) -> &HostInventory {
        &self.inventory
    }
}

impl ResourceProbe for InventoryProbe {
    fn get_available_resources(&self, node: &mut ComputeNode) -> anyhow::Result<()> {
        let inv = &self.inventory;
        node.cpus = inv.cpus;
        node.mem_total = inv.mem_total_mb;
        node.mem_free = inv.mem_total_mb;
        node.mem_available = inv.mem_total_mb;
        node.disk_total = inv.disk_total_gb;
        node.runtimes = inv.runtimes.clone();
        node.disk_quota_supported = inv.disk_quota_supported;
        node.enable_cpu_pinning = inv.enable_cpu_pinning;
        node.labels = inv.labels.clone();
        node.availability_zone = inv.availability_zone.clone();
        node.os_type = inv.os_type.clone();
        node.os = inv.os.clone();
        node.kernel_version = inv.kernel_version.clone();
        node.architecture = inv.architecture.clone();
        node.numa_topology = NumaTopology::new(
            inv.numa_nodes
                .iter()
                .map(|n| NumaNode::new(n.id, n.cpus.iter().copied(), n.mem_mb))
                .collect(),
        );
        Ok(())
    }

    fn pci_passthrough_devices(&self) -> anyhow::Result<Vec<ProbedPciDevice>> {
        Ok(self.inventory.pci_devices.clone())
    }
}
