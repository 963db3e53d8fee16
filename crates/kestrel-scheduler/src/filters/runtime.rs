//! Container runtime filter.

use kestrel_core::{Container, ExtraSpec};

use super::HostFilter;
use crate::host_state::HostState;

/// Containers naming a runtime need a host that supports it.
pub struct RuntimeFilter;

impl HostFilter for RuntimeFilter {
    fn name(&self) -> &'static str {
        "RuntimeFilter"
    }

    fn host_passes(&self, host: &mut HostState, container: &Container, _extra_spec: &ExtraSpec) -> bool {
        match &container.runtime {
            None => true,
            Some(runtime) => host.runtimes.iter().any(|r| r == runtime),
        }
    }
}
