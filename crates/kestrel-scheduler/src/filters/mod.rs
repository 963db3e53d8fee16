//! Host filters.
//!
//! Each filter is a predicate over a [`HostState`] for one container
//! request. Filters are looked up by name in a closed registry when the
//! scheduler is built, so a misspelled name fails at startup.

pub mod availability_zone;
pub mod compute;
pub mod cpu;
pub mod cpuset;
pub mod disk;
pub mod label;
pub mod pci_passthrough;
pub mod ram;
pub mod runtime;

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_core::{Container, ExtraSpec};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};
use crate::host_state::HostState;
use crate::servicegroup::ServiceGroup;

pub use availability_zone::AvailabilityZoneFilter;
pub use compute::ComputeFilter;
pub use cpu::CpuFilter;
pub use cpuset::CpuSetFilter;
pub use disk::DiskFilter;
pub use label::LabelFilter;
pub use pci_passthrough::PciPassthroughFilter;
pub use ram::RamFilter;
pub use runtime::RuntimeFilter;

pub trait HostFilter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `host` is acceptable. May record choices in `host.limits`.
    fn host_passes(&self, host: &mut HostState, container: &Container, extra_spec: &ExtraSpec) -> bool;

    /// Evaluate once per category and reuse the verdict for every other
    /// host in the same category during a pass.
    fn run_filter_once_per_request(&self) -> bool {
        false
    }

    /// Category of `host` for run-once filters.
    fn category(&self, host: &HostState) -> String {
        host.hostname.clone()
    }
}

/// Settings filters are built with.
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub default_availability_zone: String,
    pub servicegroup: ServiceGroup,
}

/// Build the filter called `name`.
pub fn build_filter(name: &str, ctx: &FilterContext) -> SchedulerResult<Arc<dyn HostFilter>> {
    let filter: Arc<dyn HostFilter> = match name {
        "AvailabilityZoneFilter" => Arc::new(AvailabilityZoneFilter::new(
            ctx.default_availability_zone.clone(),
        )),
        "ComputeFilter" => Arc::new(ComputeFilter::new(ctx.servicegroup)),
        "RamFilter" => Arc::new(RamFilter),
        "CPUFilter" => Arc::new(CpuFilter),
        "CpuSetFilter" => Arc::new(CpuSetFilter),
        "DiskFilter" => Arc::new(DiskFilter),
        "LabelFilter" => Arc::new(LabelFilter),
        "PciPassthroughFilter" => Arc::new(PciPassthroughFilter),
        "RuntimeFilter" => Arc::new(RuntimeFilter),
        other => return Err(SchedulerError::HostFilterNotFound(other.to_string())),
    };
    Ok(filter)
}

pub fn build_filters(names: &[String], ctx: &FilterContext) -> SchedulerResult<Vec<Arc<dyn HostFilter>>> {
    names.iter().map(|name| build_filter(name, ctx)).collect()
}

/// Lazily yield the hosts `filter` accepts.
///
/// `cache` holds run-once verdicts by category for the current pass.
pub fn filter_all<'a, I>(
    filter: &'a dyn HostFilter,
    hosts: I,
    container: &'a Container,
    extra_spec: &'a ExtraSpec,
    cache: &'a mut HashMap<String, bool>,
) -> impl Iterator<Item = HostState> + 'a
where
    I: IntoIterator<Item = HostState>,
    I::IntoIter: 'a,
{
    let once = filter.run_filter_once_per_request();
    hosts.into_iter().filter_map(move |mut host| {
        let passes = if once {
            let category = filter.category(&host);
            match cache.get(&category) {
                Some(&verdict) => verdict,
                None => {
                    let verdict = filter.host_passes(&mut host, container, extra_spec);
                    cache.insert(category, verdict);
                    verdict
                }
            }
        } else {
            filter.host_passes(&mut host, container, extra_spec)
        };
        passes.then_some(host)
    })
}

/// Run `filters` in order over `hosts`. A host dropped by one filter is
/// not shown to the next.
pub fn get_filtered_hosts(
    filters: &[Arc<dyn HostFilter>],
    hosts: Vec<HostState>,
    container: &Container,
    extra_spec: &ExtraSpec,
) -> Vec<HostState> {
    let mut remaining = hosts;
    for filter in filters {
        let before = remaining.len();
        let mut cache = HashMap::new();
        remaining = filter_all(filter.as_ref(), remaining, container, extra_spec, &mut cache).collect();
        debug!(
            filter = filter.name(),
            container = %container.uuid,
            before,
            after = remaining.len(),
            "filter applied"
        );
        if remaining.is_empty() {
            break;
        }
    }
    remaining
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use testing::{container, host};

    fn ctx() -> FilterContext {
        FilterContext {
            default_availability_zone: "nova".to_string(),
            servicegroup: ServiceGroup::new(Duration::from_secs(60)),
        }
    }

    struct CountingAzFilter {
        calls: AtomicUsize,
    }

    impl HostFilter for CountingAzFilter {
        fn name(&self) -> &'static str {
            "CountingAzFilter"
        }

        fn host_passes(&self, host: &mut HostState, _: &Container, _: &ExtraSpec) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            host.availability_zone.as_deref() == Some("az1")
        }

        fn run_filter_once_per_request(&self) -> bool {
            true
        }

        fn category(&self, host: &HostState) -> String {
            host.availability_zone.clone().unwrap_or_default()
        }
    }

    #[test]
    fn unknown_filter_fails_at_build() {
        let names = vec!["CPUFilter".to_string(), "NoSuchFilter".to_string()];
        let err = build_filters(&names, &ctx()).err().unwrap();
        assert!(matches!(err, SchedulerError::HostFilterNotFound(name) if name == "NoSuchFilter"));
    }

    #[test]
    fn default_filters_all_build() {
        let names: Vec<String> = kestrel_core::config::DEFAULT_FILTERS
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(build_filters(&names, &ctx()).unwrap().len(), names.len());
    }

    #[test]
    fn run_once_filter_evaluates_each_category_once() {
        let filter = CountingAzFilter {
            calls: AtomicUsize::new(0),
        };
        let hosts: Vec<HostState> = ["a", "b", "c", "d"]
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut h = host(name);
                h.availability_zone = Some(if i % 2 == 0 { "az1" } else { "az2" }.to_string());
                h
            })
            .collect();

        let c = container();
        let extra = ExtraSpec::default();
        let mut cache = HashMap::new();
        let passed: Vec<String> = filter_all(&filter, hosts, &c, &extra, &mut cache)
            .map(|h| h.hostname)
            .collect();

        assert_eq!(passed, vec!["a", "c"]);
        assert_eq!(filter.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pipeline_drops_hosts_filter_by_filter() {
        let filters = build_filters(&["RamFilter".to_string(), "CPUFilter".to_string()], &ctx()).unwrap();
        let mut small = host("small");
        small.mem_used = 4000;
        let mut busy = host("busy");
        busy.cpu_used = 4.0;
        let roomy = host("roomy");

        let mut c = container();
        c.memory = Some(512);
        c.cpu = Some(1.0);

        let passed = get_filtered_hosts(&filters, vec![small, busy, roomy], &c, &ExtraSpec::default());
        assert_eq!(passed.len(), 1);
        assert_eq!(passed[0].hostname, "roomy");
        assert_eq!(passed[0].limits.memory, Some(4096));
        assert_eq!(passed[0].limits.cpu, Some(4.0));
    }
}
