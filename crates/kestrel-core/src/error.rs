//! Error types shared across Kestrel crates.

use std::collections::BTreeSet;

use thiserror::Error;

/// Result type alias for NUMA topology operations.
pub type NumaResult<T> = Result<T, NumaError>;

/// Errors raised when a pin/unpin request disagrees with a node's cpuset.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NumaError {
    #[error("cannot pin CPUs {requested:?}: not a subset of known CPUs {cpuset:?}")]
    CpuPinningUnknown {
        requested: BTreeSet<u32>,
        cpuset: BTreeSet<u32>,
    },

    #[error("cannot pin CPUs {requested:?}: free CPUs are {free:?}")]
    CpuPinningInvalid {
        requested: BTreeSet<u32>,
        free: BTreeSet<u32>,
    },

    #[error("cannot unpin CPUs {requested:?}: not a subset of known CPUs {cpuset:?}")]
    CpuUnpinningUnknown {
        requested: BTreeSet<u32>,
        cpuset: BTreeSet<u32>,
    },

    #[error("cannot unpin CPUs {requested:?}: pinned CPUs are {pinned:?}")]
    CpuUnpinningInvalid {
        requested: BTreeSet<u32>,
        pinned: BTreeSet<u32>,
    },

    #[error("NUMA node {0} not found")]
    NodeNotFound(u32),
}

/// Malformed scheduling request metadata.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("invalid extra spec key {key:?}: {reason}")]
    InvalidExtraSpec { key: String, reason: String },

    #[error("invalid memory value {0:?}")]
    InvalidMemory(String),
}
