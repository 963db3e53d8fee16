//! kestrel-scheduler — host selection for container batches.
//!
//! # Components
//!
//! - **`host_state`**: per-host resource snapshot with freshness-ordered updates
//! - **`host_manager`**: host state cache behind per-host locks
//! - **`filters`**: `HostFilter` predicates, the name registry and the pipeline
//! - **`servicegroup`**: heartbeat-based service liveness
//! - **`driver`**: filter and chance drivers producing `Destination`s
//!
//! ```text
//! SchedulerDriver::select_destinations
//!   ├── services up (ServiceGroup)
//!   ├── compute nodes ∩ up hosts ──▶ HostManager snapshot
//!   ├── per container: filters ──▶ pick (candidate or random)
//!   └── consume on the chosen HostStates
//! ```

pub mod driver;
pub mod error;
pub mod filters;
pub mod host_manager;
pub mod host_state;
pub mod servicegroup;

pub use driver::{DriverKind, PCI_ALIAS_HINT, SchedulerDriver};
pub use error::{SchedulerError, SchedulerResult};
pub use filters::{FilterContext, HostFilter, build_filter, build_filters, get_filtered_hosts};
pub use host_manager::HostManager;
pub use host_state::HostState;
pub use servicegroup::ServiceGroup;
