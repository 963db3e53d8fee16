//! Compute service filter.

use kestrel_core::{Container, ExtraSpec};
use tracing::debug;

use super::HostFilter;
use crate::host_state::HostState;
use crate::servicegroup::ServiceGroup;

/// Passes hosts whose compute service is enabled and heartbeating.
pub struct ComputeFilter {
    servicegroup: ServiceGroup,
}

impl ComputeFilter {
    pub fn new(servicegroup: ServiceGroup) -> Self {
        Self { servicegroup }
    }
}

impl HostFilter for ComputeFilter {
    fn name(&self) -> &'static str {
        "ComputeFilter"
    }

    fn host_passes(&self, host: &mut HostState, _container: &Container, _extra_spec: &ExtraSpec) -> bool {
        let Some(service) = &host.service else {
            debug!(host = %host.hostname, "no compute service record");
            return false;
        };
        if service.disabled {
            debug!(host = %host.hostname, reason = ?service.disabled_reason, "compute service disabled");
            return false;
        }
        if !self.servicegroup.service_is_up(service) {
            debug!(host = %host.hostname, "compute service is down");
            return false;
        }
        true
    }
}
