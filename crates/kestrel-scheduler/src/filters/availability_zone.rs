//! Availability zone filter.

use kestrel_core::{Container, ExtraSpec};

use super::HostFilter;
use crate::host_state::HostState;

/// Passes hosts in the requested availability zone. Hosts without a zone
/// belong to the default zone.
pub struct AvailabilityZoneFilter {
    default_zone: String,
}

impl AvailabilityZoneFilter {
    pub fn new(default_zone: impl Into<String>) -> Self {
        Self {
            default_zone: default_zone.into(),
        }
    }

    fn host_zone<'a>(&'a self, host: &'a HostState) -> &'a str {
        host.availability_zone
            .as_deref()
            .filter(|az| !az.is_empty())
            .unwrap_or(self.default_zone.as_str())
    }
}

impl HostFilter for AvailabilityZoneFilter {
    fn name(&self) -> &'static str {
        "AvailabilityZoneFilter"
    }

    fn host_passes(&self, host: &mut HostState, _container: &Container, extra_spec: &ExtraSpec) -> bool {
        match extra_spec.requested_availability_zone() {
            None => true,
            Some(requested) => requested == self.host_zone(host),
        }
    }

    fn run_filter_once_per_request(&self) -> bool {
        true
    }

    fn category(&self, host: &HostState) -> String {
        self.host_zone(host).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::testing::{container, host};

    fn spec(az: Option<&str>) -> ExtraSpec {
        ExtraSpec {
            availability_zone: az.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn no_requested_zone_passes() {
        let filter = AvailabilityZoneFilter::new("nova");
        let mut h = host("h1");
        h.availability_zone = Some("az1".to_string());
        assert!(filter.host_passes(&mut h, &container(), &spec(None)));
    }

    #[test]
    fn zone_must_match() {
        let filter = AvailabilityZoneFilter::new("nova");
        let mut h = host("h1");
        h.availability_zone = Some("az1".to_string());
        assert!(filter.host_passes(&mut h, &container(), &spec(Some("az1"))));
        assert!(!filter.host_passes(&mut h, &container(), &spec(Some("az2"))));
    }

    #[test]
    fn zoneless_host_is_in_default_zone() {
        let filter = AvailabilityZoneFilter::new("nova");
        let mut h = host("h1");
        assert!(filter.host_passes(&mut h, &container(), &spec(Some("nova"))));
        assert!(!filter.host_passes(&mut h, &container(), &spec(Some("az1"))));
        assert_eq!(filter.category(&h), "nova");
    }

    #[test]
    fn hint_overrides_top_level_zone() {
        let filter = AvailabilityZoneFilter::new("nova");
        let mut h = host("h1");
        h.availability_zone = Some("az1".to_string());
        let mut extra = spec(Some("az2"));
        extra.hints.insert("availability_zone".to_string(), "az1".to_string());
        assert!(filter.host_passes(&mut h, &container(), &extra));
    }
}
