//! kestrel-pci — PCI passthrough bookkeeping for a compute node.
//!
//! # Components
//!
//! - **`device`**: PCI function records and their status/type enums
//! - **`tree`**: arena of devices with PF/VF links and the claim/allocate/free state machine
//! - **`stats`**: device pools keyed by vendor/product/NUMA/tags, request matching
//! - **`whitelist`**: passthrough device specs and address patterns
//! - **`alias`**: alias names → PCI request specs
//! - **`tracker`**: per-node tracker tying the tree, pools and container ownership together
//!
//! ```text
//! PciDevTracker
//!   ├── PciDeviceTree (devices by address, parent/child indices)
//!   ├── PciDeviceStats (pools of available devices)
//!   └── claims / allocations per container
//! ```

pub mod alias;
pub mod device;
pub mod error;
pub mod stats;
pub mod tracker;
pub mod tree;
pub mod whitelist;

pub use alias::PciAliases;
pub use device::{PciDevice, PciDeviceStatus, PciDeviceType, ProbedPciDevice};
pub use error::{PciError, PciResult};
pub use stats::{PciDevicePool, PciDeviceStats};
pub use tracker::{DirtyDevices, PciDevTracker};
pub use tree::PciDeviceTree;
pub use whitelist::{DeviceSpec, PciWhitelist};
