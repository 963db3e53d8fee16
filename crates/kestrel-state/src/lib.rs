//! kestrel-state — persistence repository for the Kestrel control plane.
//!
//! Backed by [redb](https://docs.rs/redb). Compute nodes, PCI device rows,
//! service heartbeats and container placements are JSON-serialized into
//! `&[u8]` value columns under string keys:
//!
//! | table | key |
//! |---|---|
//! | `compute_nodes` | `{uuid}` |
//! | `pci_devices` | `{compute_node_uuid}/{address}` |
//! | `services` | `{host}/{binary}` |
//! | `containers` | `{uuid}` |
//!
//! `StateStore` is `Clone + Send + Sync` and can be shared across tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
