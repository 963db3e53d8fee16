//! Memory filter.

use kestrel_core::{Container, ExtraSpec};

use super::HostFilter;
use crate::host_state::HostState;

/// Passes hosts with enough free memory and records the memory ceiling in
/// `limits.memory`.
pub struct RamFilter;

impl HostFilter for RamFilter {
    fn name(&self) -> &'static str {
        "RamFilter"
    }

    fn host_passes(&self, host: &mut HostState, container: &Container, _extra_spec: &ExtraSpec) -> bool {
        let Some(requested) = container.memory else {
            return true;
        };
        if host.free_memory() < requested {
            return false;
        }
        host.limits.memory = Some(host.mem_total);
        true
    }
}
