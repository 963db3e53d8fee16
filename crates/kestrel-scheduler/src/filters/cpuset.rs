//! Dedicated CPU filter.

use kestrel_core::{Container, CpuPolicy, CpusetLimit, ExtraSpec};

use super::HostFilter;
use crate::host_state::HostState;

/// Dedicated containers need a pinning host with a NUMA node that has
/// enough free CPUs and memory; the first such node is recorded in
/// `limits.cpuset`. Shared containers are kept off pinning hosts.
pub struct CpuSetFilter;

impl HostFilter for CpuSetFilter {
    fn name(&self) -> &'static str {
        "CpuSetFilter"
    }

    fn host_passes(&self, host: &mut HostState, container: &Container, _extra_spec: &ExtraSpec) -> bool {
        match container.cpu_policy {
            CpuPolicy::Shared => !host.enable_cpu_pinning,
            CpuPolicy::Dedicated => {
                if !host.enable_cpu_pinning {
                    return false;
                }
                let Some(node) = host
                    .numa_topology
                    .first_fit(container.dedicated_cpu_count(), container.memory_mb())
                else {
                    return false;
                };
                host.limits.cpuset = Some(CpusetLimit {
                    node: node.id,
                    cpuset_cpu: node.cpuset.clone(),
                    cpuset_cpu_pinned: node.pinned_cpus.clone(),
                    cpuset_mem: node.mem_available,
                });
                true
            }
        }
    }
}
