//! kestrel-core — shared building blocks for the Kestrel control plane.
//!
//! - **`types`**: container request shape, scheduling hints, destinations
//! - **`numa`**: NUMA topology with cpuset pinning
//! - **`lock`**: keyed mutex map used to serialize per-host mutations
//! - **`config`**: `kestrel.toml` parsing

pub mod config;
pub mod error;
pub mod lock;
pub mod numa;
pub mod types;

pub use config::KestrelConfig;
pub use error::{NumaError, NumaResult, SpecError};
pub use lock::KeyedMutex;
pub use numa::{NumaNode, NumaTopology};
pub use types::*;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
