//! Disk filter.

use kestrel_core::{Container, ExtraSpec};

use super::HostFilter;
use crate::host_state::HostState;

/// Containers asking for disk need a host with disk quota support and
/// enough free disk. The host's disk ceiling goes to `limits.disk`.
pub struct DiskFilter;

impl HostFilter for DiskFilter {
    fn name(&self) -> &'static str {
        "DiskFilter"
    }

    fn host_passes(&self, host: &mut HostState, container: &Container, _extra_spec: &ExtraSpec) -> bool {
        let requested = container.disk_gb();
        if requested == 0 {
            return true;
        }
        if !host.disk_quota_supported || host.free_disk() < requested {
            return false;
        }
        host.limits.disk = Some(host.disk_total);
        true
    }
}
