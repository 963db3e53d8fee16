//! Scheduler-side view of one compute host.

use std::collections::HashMap;

use kestrel_core::{Container, Limits, NumaTopology, epoch_millis};
use kestrel_pci::{PciDeviceStats, PciError};
use kestrel_state::{ComputeNode, ServiceRecord};
use tracing::{debug, error};

/// Mutable resource snapshot of a host used while filtering.
///
/// `limits` is scratch space: filters record the ceilings and sub-resource
/// choices they made for the request being filtered.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub hostname: String,
    pub nodename: Option<String>,
    pub mem_total: u64,
    pub mem_used: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub cpus: f64,
    pub cpu_used: f64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_quota_supported: bool,
    pub runtimes: Vec<String>,
    pub enable_cpu_pinning: bool,
    pub numa_topology: NumaTopology,
    pub labels: HashMap<String, String>,
    pub availability_zone: Option<String>,
    /// Absent when the host reports no PCI pools.
    pub pci_stats: Option<PciDeviceStats>,
    pub service: Option<ServiceRecord>,
    /// Epoch millis of the snapshot this state reflects.
    pub updated: Option<u64>,
    pub limits: Limits,
}

impl HostState {
    pub fn new(hostname: impl Into<String>, nodename: Option<String>) -> Self {
        Self {
            hostname: hostname.into(),
            nodename,
            ..Default::default()
        }
    }

    /// Merge a compute node row and/or service row.
    ///
    /// A compute node older than the state already held is ignored. The
    /// service row always replaces the previous one.
    pub fn update(&mut self, node: Option<&ComputeNode>, service: Option<&ServiceRecord>) {
        if let Some(node) = node {
            self.update_from_compute_node(node);
        }
        if let Some(service) = service {
            self.service = Some(service.clone());
        }
    }

    fn update_from_compute_node(&mut self, node: &ComputeNode) {
        if let (Some(held), Some(incoming)) = (self.updated, node.updated_at) {
            if held > incoming {
                debug!(host = %self.hostname, held, incoming, "ignoring stale compute node snapshot");
                return;
            }
        }

        self.mem_total = node.mem_total;
        self.mem_used = node.mem_used;
        self.mem_free = node.mem_free;
        self.mem_available = node.mem_available;
        self.cpus = node.cpus;
        self.cpu_used = node.cpu_used;
        self.disk_total = node.disk_total;
        self.disk_used = node.disk_used;
        self.disk_quota_supported = node.disk_quota_supported;
        self.runtimes = node.runtimes.clone();
        self.enable_cpu_pinning = node.enable_cpu_pinning;
        self.numa_topology = node.numa_topology.clone();
        self.labels = node.labels.clone();
        self.availability_zone = node.availability_zone.clone();
        self.pci_stats = if node.pci_device_pools.is_empty() {
            None
        } else {
            Some(PciDeviceStats::from_pools(node.pci_device_pools.clone()))
        };
        self.updated = node.updated_at;
    }

    /// Account for `container` having been placed here.
    ///
    /// Failures are logged and leave `updated` untouched so the next
    /// compute node snapshot replaces this state.
    pub fn consume_from_request(&mut self, container: &Container) {
        match self.consume(container) {
            Ok(()) => self.updated = Some(epoch_millis()),
            Err(e) => {
                error!(host = %self.hostname, container = %container.uuid, error = %e, "failed to consume resources from host state");
            }
        }
    }

    fn consume(&mut self, container: &Container) -> Result<(), PciError> {
        if !container.pci_requests.is_empty() {
            self.pci_stats
                .as_mut()
                .ok_or(PciError::ClaimFailed)?
                .apply_requests(&container.pci_requests)?;
        }

        self.mem_used += container.memory_mb();
        self.cpu_used += container.vcpus();
        self.disk_used += container.disk_gb();
        self.mem_free = self.mem_total.saturating_sub(self.mem_used);
        self.mem_available = self.mem_free;
        Ok(())
    }

    pub fn free_memory(&self) -> u64 {
        self.mem_total.saturating_sub(self.mem_used)
    }

    pub fn free_vcpus(&self) -> f64 {
        self.cpus - self.cpu_used
    }

    pub fn free_disk(&self) -> u64 {
        self.disk_total.saturating_sub(self.disk_used)
    }
}
