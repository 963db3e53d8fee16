//! Label filter.

use kestrel_core::{Container, ExtraSpec};

use super::HostFilter;
use crate::host_state::HostState;

/// Every `label:<key>=<value>` hint must match the host's labels exactly.
pub struct LabelFilter;

impl HostFilter for LabelFilter {
    fn name(&self) -> &'static str {
        "LabelFilter"
    }

    fn host_passes(&self, host: &mut HostState, _container: &Container, extra_spec: &ExtraSpec) -> bool {
        extra_spec
            .label_hints()
            .all(|(key, value)| host.labels.get(key).is_some_and(|v| v == value))
    }
}
