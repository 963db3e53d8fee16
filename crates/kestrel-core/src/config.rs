//! kestrel.toml configuration parser.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Default set of scheduler filters, in evaluation order.
pub const DEFAULT_FILTERS: &[&str] = &[
    "AvailabilityZoneFilter",
    "ComputeFilter",
    "RamFilter",
    "CPUFilter",
    "CpuSetFilter",
    "DiskFilter",
    "LabelFilter",
    "PciPassthroughFilter",
    "RuntimeFilter",
];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct KestrelConfig {
    pub scheduler: SchedulerConfig,
    pub compute: ComputeConfig,
    pub pci: PciConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// `filter_scheduler` or `chance_scheduler`.
    pub driver: String,
    pub enabled_filters: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            driver: "filter_scheduler".to_string(),
            enabled_filters: DEFAULT_FILTERS.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    /// Hostname this compute service reports as.
    pub host: String,
    /// When false every claim is a no-op.
    pub resource_tracking: bool,
    pub update_resources_interval_secs: u64,
    pub report_interval_secs: u64,
    pub default_availability_zone: String,
    /// Heartbeat age after which a service counts as down.
    pub service_down_time_secs: u64,
    /// Host inventory file for the static resource probe.
    pub inventory: Option<PathBuf>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            resource_tracking: true,
            update_resources_interval_secs: 60,
            report_interval_secs: 10,
            default_availability_zone: "nova".to_string(),
            service_down_time_secs: 60,
            inventory: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PciConfig {
    /// Device specs allowed for passthrough. Keys other than
    /// `vendor_id`, `product_id` and `address` become pool tags.
    pub passthrough_whitelist: Vec<BTreeMap<String, String>>,
    pub alias: Vec<PciAliasConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PciAliasConfig {
    pub name: String,
    pub vendor_id: String,
    pub product_id: String,
    #[serde(default)]
    pub device_type: Option<String>,
}

impl KestrelConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        let compute = &self.compute;
        for (key, value) in [
            ("update_resources_interval_secs", compute.update_resources_interval_secs),
            ("report_interval_secs", compute.report_interval_secs),
            ("service_down_time_secs", compute.service_down_time_secs),
        ] {
            if value == 0 {
                bail!("compute.{key} must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
