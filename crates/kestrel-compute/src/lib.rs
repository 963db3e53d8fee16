//! kestrel-compute — resource tracking on a compute node.
//!
//! # Components
//!
//! - **`tracker`**: `ComputeNodeTracker`, the lock-guarded ledger of one host
//! - **`claims`**: `ResourceClaim` (`Nop` / `Create` / `Update`) and the feasibility test
//! - **`probe`**: driver probe interface and the static inventory probe
//! - **`audit`**: periodic `update_available_resource` loop
//! - **`service`**: service heartbeat reporter
//!
//! ```text
//! container_claim ──▶ claim_test ──▶ consume ──▶ ResourceClaim
//!                                                  ├── commit
//!                                                  └── abort ──▶ release
//! ```

pub mod audit;
pub mod claims;
pub mod error;
pub mod probe;
pub mod service;
pub mod tracker;

pub use audit::ResourceAuditor;
pub use claims::{Claim, ResourceClaim, ResourceDelta, UpdateClaim, claim_test};
pub use error::{ComputeError, ComputeResult};
pub use probe::{HostInventory, InventoryProbe, ResourceProbe};
pub use service::ServiceReporter;
pub use tracker::ComputeNodeTracker;
