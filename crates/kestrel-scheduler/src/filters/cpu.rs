//! vCPU filter.

use kestrel_core::{Container, ExtraSpec};

use super::HostFilter;
use crate::host_state::HostState;

/// Passes hosts with enough free vCPUs and records the host's vCPU
/// ceiling in `limits.cpu`.
pub struct CpuFilter;

impl HostFilter for CpuFilter {
    fn name(&self) -> &'static str {
        "CPUFilter"
    }

    fn host_passes(&self, host: &mut HostState, container: &Container, _extra_spec: &ExtraSpec) -> bool {
        let Some(requested) = container.cpu else {
            return true;
        };
        if requested > host.free_vcpus() {
            return false;
        }
        host.limits.cpu = Some(host.cpus);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::testing::{container, host};

    #[test]
    fn fits_and_records_ceiling() {
        let mut h = host("h1");
        h.cpus = 8.0;
        h.cpu_used = 0.0;
        let mut c = container();
        c.cpu = Some(5.0);
        assert!(CpuFilter.host_passes(&mut h, &c, &ExtraSpec::default()));
        assert_eq!(h.limits.cpu, Some(8.0));
    }

    #[test]
    fn too_many_vcpus_fails() {
        let mut h = host("h1");
        h.cpus = 5.0;
        h.cpu_used = 2.0;
        let mut c = container();
        c.cpu = Some(8.0);
        assert!(!CpuFilter.host_passes(&mut h, &c, &ExtraSpec::default()));
        assert_eq!(h.limits.cpu, None);
    }

    #[test]
    fn exact_fit_passes() {
        let mut h = host("h1");
        h.cpus = 4.0;
        h.cpu_used = 1.5;
        let mut c = container();
        c.cpu = Some(2.5);
        assert!(CpuFilter.host_passes(&mut h, &c, &ExtraSpec::default()));
    }

    #[test]
    fn no_cpu_request_passes() {
        let mut h = host("h1");
        h.cpu_used = 4.0;
        assert!(CpuFilter.host_passes(&mut h, &container(), &ExtraSpec::default()));
    }
}
