//! Passthrough whitelist.
//!
//! Each `[[pci.passthrough_whitelist]]` entry selects devices by vendor,
//! product and an optional address pattern. Every other key of the entry
//! is a tag that ends up on the pool the device is counted in.

use std::collections::BTreeMap;

use crate::device::PciDevice;
use crate::error::{PciError, PciResult};

const ANY: &str = "*";

/// `domain:bus:slot.function` with per-part wildcards. `None` matches anything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressPattern {
    pub domain: Option<u32>,
    pub bus: Option<u32>,
    pub slot: Option<u32>,
    pub function: Option<u32>,
}

impl AddressPattern {
    /// Parse a pattern. Missing leading parts are wildcards, so `"81:00.*"`
    /// is `*:81:00.*`.
    pub fn parse(raw: &str) -> PciResult<Self> {
        let invalid = || PciError::InvalidDeviceSpec(format!("invalid address {raw:?}"));

        let (head, function) = match raw.rsplit_once('.') {
            Some((head, function)) => (head, function),
            None => (raw, ANY),
        };
        let mut parts: Vec<&str> = head.split(':').collect();
        if parts.len() > 3 {
            return Err(invalid());
        }
        while parts.len() < 3 {
            parts.insert(0, ANY);
        }

        let field = |s: &str, max: u32| -> PciResult<Option<u32>> {
            let s = s.trim();
            if s.is_empty() || s == ANY {
                return Ok(None);
            }
            match u32::from_str_radix(s, 16) {
                Ok(v) if v <= max => Ok(Some(v)),
                _ => Err(invalid()),
            }
        };

        Ok(Self {
            domain: field(parts[0], 0xffff)?,
            bus: field(parts[1], 0xff)?,
            slot: field(parts[2], 0x1f)?,
            function: field(function, 0x7)?,
        })
    }

    pub fn matches(&self, address: &str) -> bool {
        let Ok(concrete) = Self::parse(address) else {
            return false;
        };
        let part = |want: Option<u32>, have: Option<u32>| want.is_none() || want == have;
        part(self.domain, concrete.domain)
            && part(self.bus, concrete.bus)
            && part(self.slot, concrete.slot)
            && part(self.function, concrete.function)
    }
}

/// One whitelist entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceSpec {
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub address: Option<AddressPattern>,
    pub tags: BTreeMap<String, String>,
}

impl DeviceSpec {
    pub fn from_map(entry: &BTreeMap<String, String>) -> PciResult<Self> {
        let mut spec = DeviceSpec::default();
        for (key, value) in entry {
            let wildcard = value.trim() == ANY;
            match key.as_str() {
                "vendor_id" => {
                    if !wildcard {
                        spec.vendor_id = Some(normalize_id(value)?);
                    }
                }
                "product_id" => {
                    if !wildcard {
                        spec.product_id = Some(normalize_id(value)?);
                    }
                }
                "address" => spec.address = Some(AddressPattern::parse(value)?),
                "devname" => {
                    return Err(PciError::InvalidDeviceSpec(
                        "devname is not supported".to_string(),
                    ));
                }
                _ => {
                    spec.tags.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(spec)
    }

    pub fn matches(&self, device: &PciDevice) -> bool {
        let id_matches = |want: &Option<String>, have: &str| {
            want.as_deref()
                .is_none_or(|w| w.eq_ignore_ascii_case(have))
        };
        id_matches(&self.vendor_id, &device.vendor_id)
            && id_matches(&self.product_id, &device.product_id)
            && self
                .address
                .as_ref()
                .is_none_or(|pattern| pattern.matches(&device.address))
    }
}

fn normalize_id(raw: &str) -> PciResult<String> {
    let id = raw.trim().to_ascii_lowercase();
    if id.len() == 4 && id.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(id)
    } else {
        Err(PciError::InvalidDeviceSpec(format!("invalid id {raw:?}")))
    }
}

/// The set of devices eligible for passthrough.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciWhitelist {
    specs: Vec<DeviceSpec>,
}

impl PciWhitelist {
    pub fn new(specs: Vec<DeviceSpec>) -> Self {
        Self { specs }
    }

    pub fn from_config(entries: &[BTreeMap<String, String>]) -> PciResult<Self> {
        let specs = entries
            .iter()
            .map(DeviceSpec::from_map)
            .collect::<PciResult<Vec<_>>>()?;
        Ok(Self { specs })
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// First entry matching `device`.
    pub fn device_spec(&self, device: &PciDevice) -> Option<&DeviceSpec> {
        self.specs.iter().find(|spec| spec.matches(device))
    }

    pub fn device_assignable(&self, device: &PciDevice) -> bool {
        self.device_spec(device).is_some()
    }
}
