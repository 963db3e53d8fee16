//! PCI passthrough filter.

use kestrel_core::{Container, ExtraSpec};

use super::HostFilter;
use crate::host_state::HostState;

/// Containers with PCI requests need a host whose pools can satisfy all
/// of them. A host without pools fails.
pub struct PciPassthroughFilter;

impl HostFilter for PciPassthroughFilter {
    fn name(&self) -> &'static str {
        "PciPassthroughFilter"
    }

    fn host_passes(&self, host: &mut HostState, container: &Container, _extra_spec: &ExtraSpec) -> bool {
        if container.pci_requests.is_empty() {
            return true;
        }
        host.pci_stats
            .as_ref()
            .is_some_and(|stats| stats.support_requests(&container.pci_requests))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::testing::{container, host};
    use kestrel_core::PciRequest;
    use kestrel_pci::{PciDevicePool, PciDeviceStats};
    use std::collections::BTreeMap;

    fn request(count: u32) -> PciRequest {
        PciRequest {
            count,
            spec: vec![BTreeMap::from([
                ("vendor_id".to_string(), "8086".to_string()),
                ("product_id".to_string(), "1520".to_string()),
            ])],
            alias_name: None,
        }
    }

    fn stats(count: u32) -> PciDeviceStats {
        PciDeviceStats::from_pools(vec![PciDevicePool {
            vendor_id: "8086".to_string(),
            product_id: "1520".to_string(),
            numa_node: Some(0),
            tags: BTreeMap::new(),
            count,
            devices: Vec::new(),
        }])
    }

    #[test]
    fn no_requests_pass_anywhere() {
        let mut h = host("h1");
        assert!(PciPassthroughFilter.host_passes(&mut h, &container(), &ExtraSpec::default()));
    }

    #[test]
    fn host_without_pools_fails() {
        let mut h = host("h1");
        let mut c = container();
        c.pci_requests = vec![request(1)];
        assert!(!PciPassthroughFilter.host_passes(&mut h, &c, &ExtraSpec::default()));
    }

    #[test]
    fn counts_are_honoured() {
        let mut h = host("h1");
        h.pci_stats = Some(stats(2));
        let mut c = container();
        c.pci_requests = vec![request(2)];
        assert!(PciPassthroughFilter.host_passes(&mut h, &c, &ExtraSpec::default()));

        c.pci_requests = vec![request(2), request(1)];
        assert!(!PciPassthroughFilter.host_passes(&mut h, &c, &ExtraSpec::default()));
    }
}
