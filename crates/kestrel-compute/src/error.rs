//! Error types for compute-side resource tracking.

use kestrel_core::NumaError;
use kestrel_pci::PciError;
use kestrel_state::StateError;
use thiserror::Error;

/// Result type alias for compute operations.
pub type ComputeResult<T> = Result<T, ComputeError>;

#[derive(Debug, Error)]
pub enum ComputeError {
    /// The request does not fit; `reason` joins every failed constraint.
    #[error("insufficient compute resources: {reason}")]
    ResourcesUnavailable { reason: String },

    #[error(transparent)]
    Pci(#[from] PciError),

    #[error(transparent)]
    Numa(#[from] NumaError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("resource probe failed: {0:#}")]
    Probe(anyhow::Error),

    #[error("compute node {0} has not been initialized")]
    NodeNotInitialized(String),
}
