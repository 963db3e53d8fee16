//! Persisted records.

use std::collections::HashMap;

use kestrel_core::NumaTopology;
use kestrel_pci::PciDevicePool;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Binary name the compute daemon registers its service row under.
pub const COMPUTE_BINARY: &str = "kestrel-compute";

// ── Compute node ──────────────────────────────────────────────────

/// One physical or virtual host's capacity and usage.
///
/// Memory is MiB, disk GiB, CPU in vCPUs. Timestamps are epoch
/// milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ComputeNode {
    pub uuid: Uuid,
    pub hostname: String,
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub mem_used: u64,
    pub cpus: f64,
    pub cpu_used: f64,
    pub disk_total: u64,
    pub disk_used: u64,
    #[serde(default)]
    pub numa_topology: NumaTopology,
    #[serde(default)]
    pub pci_device_pools: Vec<PciDevicePool>,
    #[serde(default)]
    pub runtimes: Vec<String>,
    #[serde(default)]
    pub disk_quota_supported: bool,
    #[serde(default)]
    pub enable_cpu_pinning: bool,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    #[serde(default)]
    pub os_type: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub kernel_version: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub total_containers: u32,
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: Option<u64>,
}

impl ComputeNode {
    pub fn new(uuid: Uuid, hostname: impl Into<String>, created_at: u64) -> Self {
        Self {
            uuid,
            hostname: hostname.into(),
            created_at,
            ..Default::default()
        }
    }

    pub fn table_key(&self) -> String {
        self.uuid.to_string()
    }

    /// Names of the fields that differ from `old`, ignoring the
    /// identity and timestamp columns.
    pub fn changed_fields(&self, old: &ComputeNode) -> Vec<&'static str> {
        let mut changed = Vec::new();
        macro_rules! diff {
            ($($field:ident),* $(,)?) => {
                $(if self.$field != old.$field {
                    changed.push(stringify!($field));
                })*
            };
        }
        diff!(
            hostname,
            mem_total,
            mem_free,
            mem_available,
            mem_used,
            cpus,
            cpu_used,
            disk_total,
            disk_used,
            numa_topology,
            pci_device_pools,
            runtimes,
            disk_quota_supported,
            enable_cpu_pinning,
            labels,
            availability_zone,
            os_type,
            os,
            kernel_version,
            architecture,
            total_containers,
        );
        changed
    }
}

// ── Services ──────────────────────────────────────────────────────

/// Heartbeat row of one service on one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    pub host: String,
    pub binary: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub disabled_reason: Option<String>,
    #[serde(default)]
    pub forced_down: bool,
    #[serde(default)]
    pub last_seen_up: Option<u64>,
    pub created_at: u64,
}

impl ServiceRecord {
    pub fn new(host: impl Into<String>, binary: impl Into<String>, created_at: u64) -> Self {
        Self {
            host: host.into(),
            binary: binary.into(),
            disabled: false,
            disabled_reason: None,
            forced_down: false,
            last_seen_up: None,
            created_at,
        }
    }

    pub fn table_key(&self) -> String {
        service_key(&self.host, &self.binary)
    }
}

pub fn service_key(host: &str, binary: &str) -> String {
    format!("{host}/{binary}")
}
