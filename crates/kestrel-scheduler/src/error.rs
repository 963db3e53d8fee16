//! Scheduler error types.

use kestrel_core::SpecError;
use kestrel_pci::PciError;
use kestrel_state::StateError;
use thiserror::Error;

/// Errors that can occur while building a scheduler or placing containers.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No valid host was found. {reason}")]
    NoValidHost { reason: String },

    #[error("scheduler host filter {0} could not be found")]
    HostFilterNotFound(String),

    #[error("unknown scheduler driver: {0}")]
    UnknownDriver(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    /// Malformed placement keys in the request's extra spec.
    #[error(transparent)]
    Spec(#[from] SpecError),

    /// Bad PCI alias configuration or alias hint.
    #[error(transparent)]
    Pci(#[from] PciError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
