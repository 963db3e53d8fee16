//! Request and response shapes shared by the scheduler and compute crates.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::SpecError;

/// Unique identifier of a container or capsule.
pub type ContainerId = Uuid;

// ── Container ─────────────────────────────────────────────────────

/// CPU placement policy requested by a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CpuPolicy {
    #[default]
    Shared,
    Dedicated,
}

/// Lifecycle status of a container as far as resource tracking cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    #[default]
    Creating,
    Created,
    Running,
    Stopped,
    Error,
    Deleted,
}

/// CPUs and NUMA node dedicated to a container with `dedicated` policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerCpuset {
    pub node: u32,
    pub cpus: BTreeSet<u32>,
}

/// One PCI passthrough request: `count` devices matching any of `spec`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PciRequest {
    pub count: u32,
    /// Alternatives; a pool satisfies the request if it matches any entry.
    pub spec: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub alias_name: Option<String>,
}

/// A container or capsule being scheduled or tracked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Container {
    pub uuid: ContainerId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_id: Option<String>,
    /// Requested vCPUs.
    #[serde(default)]
    pub cpu: Option<f64>,
    /// Requested memory (MiB). Accepts `512`, `"512"`, `"512M"`, `"1G"`.
    #[serde(default, deserialize_with = "deserialize_memory")]
    pub memory: Option<u64>,
    /// Requested disk (GiB).
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub cpu_policy: CpuPolicy,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub pci_requests: Vec<PciRequest>,
    /// Host the container was placed on, once claimed.
    #[serde(default)]
    pub host: Option<String>,
    /// Dedicated CPUs, once claimed.
    #[serde(default)]
    pub cpuset: Option<ContainerCpuset>,
    #[serde(default)]
    pub status: ContainerStatus,
}

impl Container {
    pub fn new(uuid: ContainerId) -> Self {
        Self {
            uuid,
            ..Default::default()
        }
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory.unwrap_or(0)
    }

    pub fn vcpus(&self) -> f64 {
        self.cpu.unwrap_or(0.0)
    }

    pub fn disk_gb(&self) -> u64 {
        self.disk.unwrap_or(0)
    }

    /// Number of whole CPUs a `dedicated` container needs pinned.
    pub fn dedicated_cpu_count(&self) -> usize {
        self.vcpus().ceil().max(0.0) as usize
    }

    pub fn is_dedicated(&self) -> bool {
        self.cpu_policy == CpuPolicy::Dedicated
    }

    /// Whether two containers ask for the same memory and cpu, the shape
    /// an update claim resizes.
    pub fn same_resources_as(&self, other: &Container) -> bool {
        self.memory_mb() == other.memory_mb() && self.vcpus() == other.vcpus()
    }
}

/// Parse a memory amount into MiB.
///
/// Bare numbers are MiB; `M`/`MB`/`MiB` and `G`/`GB`/`GiB` suffixes are
/// accepted case-insensitively.
pub fn parse_memory_mb(raw: &str) -> Result<u64, SpecError> {
    let s = raw.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| SpecError::InvalidMemory(raw.to_string()))?;
    let factor = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "m" | "mb" | "mib" => 1,
        "g" | "gb" | "gib" => 1024,
        _ => return Err(SpecError::InvalidMemory(raw.to_string())),
    };
    value
        .checked_mul(factor)
        .ok_or_else(|| SpecError::InvalidMemory(raw.to_string()))
}

fn deserialize_memory<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Str(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(v)) => Ok(Some(v)),
        Some(Raw::Str(s)) => parse_memory_mb(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

// ── Scheduling hints ──────────────────────────────────────────────

/// Free-form request metadata carried next to a scheduling request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExtraSpec {
    #[serde(default)]
    pub hints: HashMap<String, String>,
    #[serde(default)]
    pub availability_zone: Option<String>,
    /// Placement-style keys (`resources1:VCPU`, `trait:HW_NIC_SRIOV`, ...).
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, String>,
}

/// Whether a trait is demanded or excluded by a request group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraitRequirement {
    Required,
    Forbidden,
}

/// One numbered (or the unnumbered) placement request group.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestGroup {
    pub resources: BTreeMap<String, u64>,
    pub required_traits: BTreeSet<String>,
    pub forbidden_traits: BTreeSet<String>,
}

impl ExtraSpec {
    /// Requested availability zone: the hint wins over the top-level key.
    pub fn requested_availability_zone(&self) -> Option<&str> {
        self.hints
            .get("availability_zone")
            .or(self.availability_zone.as_ref())
            .map(String::as_str)
            .filter(|az| !az.is_empty())
    }

    /// `label:<key>=<value>` hints as `(key, value)` pairs.
    pub fn label_hints(&self) -> impl Iterator<Item = (&str, &str)> {
        self.hints.iter().filter_map(|(k, v)| {
            k.strip_prefix("label:")
                .map(|key| (key, v.as_str()))
        })
    }

    pub fn reservation(&self) -> Option<&str> {
        self.hints.get("reservation").map(String::as_str)
    }

    /// Parse `resources[N]:<CLASS>` and `trait[N]:<NAME>` keys into groups.
    ///
    /// The unnumbered group is keyed by `None`.
    pub fn request_groups(&self) -> Result<BTreeMap<Option<u32>, RequestGroup>, SpecError> {
        let mut groups: BTreeMap<Option<u32>, RequestGroup> = BTreeMap::new();

        for (key, value) in &self.extra {
            let (kind, rest) = if let Some(rest) = key.strip_prefix("resources") {
                ("resources", rest)
            } else if let Some(rest) = key.strip_prefix("trait") {
                ("trait", rest)
            } else {
                continue;
            };

            let invalid = |reason: &str| SpecError::InvalidExtraSpec {
                key: key.clone(),
                reason: reason.to_string(),
            };

            let (suffix, name) = rest
                .split_once(':')
                .ok_or_else(|| invalid("missing ':' separator"))?;
            if name.is_empty() {
                return Err(invalid("empty resource class or trait name"));
            }
            let suffix = if suffix.is_empty() {
                None
            } else {
                Some(
                    suffix
                        .parse::<u32>()
                        .map_err(|_| invalid("group suffix must be numeric"))?,
                )
            };

            let group = groups.entry(suffix).or_default();
            if kind == "resources" {
                let amount = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| invalid("resource amount must be a non-negative integer"))?;
                group.resources.insert(name.to_string(), amount);
            } else {
                match value.trim() {
                    "required" => {
                        group.required_traits.insert(name.to_string());
                    }
                    "forbidden" => {
                        group.forbidden_traits.insert(name.to_string());
                    }
                    _ => return Err(invalid("trait value must be 'required' or 'forbidden'")),
                }
            }
        }

        Ok(groups)
    }
}

// ── Scheduling response ───────────────────────────────────────────

/// The NUMA node a filter picked for a dedicated container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CpusetLimit {
    pub node: u32,
    pub cpuset_cpu: BTreeSet<u32>,
    pub cpuset_cpu_pinned: BTreeSet<u32>,
    pub cpuset_mem: u64,
}

/// Soft caps and sub-resource choices recorded by filters.
///
/// `None` means unconstrained for that resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Limits {
    /// Memory ceiling (MiB).
    #[serde(default)]
    pub memory: Option<u64>,
    /// vCPU ceiling.
    #[serde(default)]
    pub cpu: Option<f64>,
    /// Disk ceiling (GiB).
    #[serde(default)]
    pub disk: Option<u64>,
    #[serde(default)]
    pub cpuset: Option<CpusetLimit>,
}

/// Where one container of a batch should run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Destination {
    pub host: String,
    pub nodename: Option<String>,
    pub limits: Limits,
}
