//! PCI aliases.
//!
//! An alias names one or more device specs so a request can say
//! `"nic:2,gpu"` instead of spelling out vendor and product ids.

use std::collections::BTreeMap;

use kestrel_core::PciRequest;
use kestrel_core::config::PciAliasConfig;

use crate::device::PciDeviceType;
use crate::error::{PciError, PciResult};

/// Alias name → alternative request specs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciAliases {
    aliases: BTreeMap<String, Vec<BTreeMap<String, String>>>,
}

impl PciAliases {
    /// Entries sharing a name become alternatives; they must agree on
    /// `device_type`.
    pub fn from_config(entries: &[PciAliasConfig]) -> PciResult<Self> {
        let mut aliases: BTreeMap<String, Vec<BTreeMap<String, String>>> = BTreeMap::new();

        for entry in entries {
            if entry.name.is_empty() {
                return Err(PciError::InvalidAlias("alias name is empty".to_string()));
            }

            let mut spec = BTreeMap::new();
            spec.insert("vendor_id".to_string(), entry.vendor_id.to_ascii_lowercase());
            spec.insert("product_id".to_string(), entry.product_id.to_ascii_lowercase());
            if let Some(device_type) = &entry.device_type {
                let known = [
                    PciDeviceType::Standard,
                    PciDeviceType::SriovPf,
                    PciDeviceType::SriovVf,
                ];
                if !known.iter().any(|t| t.as_str() == device_type) {
                    return Err(PciError::InvalidAlias(format!(
                        "{}: unknown device_type {device_type:?}",
                        entry.name
                    )));
                }
                spec.insert("dev_type".to_string(), device_type.clone());
            }

            let specs = aliases.entry(entry.name.clone()).or_default();
            if let Some(first) = specs.first() {
                if first.get("dev_type") != spec.get("dev_type") {
                    return Err(PciError::InvalidAlias(format!(
                        "{}: entries disagree on device_type",
                        entry.name
                    )));
                }
            }
            specs.push(spec);
        }

        Ok(Self { aliases })
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Translate `"name[:count],..."` into requests. Count defaults to 1.
    pub fn translate(&self, expression: &str) -> PciResult<Vec<PciRequest>> {
        let mut requests = Vec::new();

        for item in expression.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (name, count) = match item.split_once(':') {
                Some((name, count)) => {
                    let count = count
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|c| *c > 0)
                        .ok_or_else(|| {
                            PciError::InvalidAlias(format!("{item}: count must be a positive integer"))
                        })?;
                    (name.trim(), count)
                }
                None => (item, 1),
            };

            let spec = self
                .aliases
                .get(name)
                .ok_or_else(|| PciError::InvalidAlias(format!("{name}: alias not defined")))?;

            requests.push(PciRequest {
                count,
                spec: spec.clone(),
                alias_name: Some(name.to_string()),
            });
        }

        Ok(requests)
    }
}
