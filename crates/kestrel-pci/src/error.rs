//! PCI error types.

use thiserror::Error;

use crate::device::PciDeviceStatus;

/// Result type alias for PCI operations.
pub type PciResult<T> = Result<T, PciError>;

/// Errors raised by the device state machine, pools and config parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PciError {
    #[error(
        "PCI device {address} is {status} instead of {}",
        join_statuses(.hopestatus)
    )]
    InvalidStatus {
        address: String,
        status: PciDeviceStatus,
        hopestatus: Vec<PciDeviceStatus>,
    },

    #[error("PCI device {address} is owned by {} instead of {hopeowner}", fmt_owner(.owner))]
    InvalidOwner {
        address: String,
        owner: Option<uuid::Uuid>,
        hopeowner: uuid::Uuid,
    },

    #[error(
        "physical function {address}, related to VF {vf_address}, is {status} instead of {}",
        join_statuses(.hopestatus)
    )]
    PfInvalidStatus {
        address: String,
        vf_address: String,
        status: PciDeviceStatus,
        hopestatus: Vec<PciDeviceStatus>,
    },

    #[error("not all virtual functions of PF {address} are free: {vf_address} is {vf_status}")]
    VfInvalidStatus {
        address: String,
        vf_address: String,
        vf_status: PciDeviceStatus,
    },

    #[error("attempt to consume PCI device {address} from an empty pool")]
    PoolEmpty { address: String },

    #[error("PCI device {0} not found")]
    DeviceNotFound(String),

    #[error("PCI request could not be satisfied by the available pools")]
    ClaimFailed,

    #[error("invalid PCI pool: {0}")]
    InvalidPoolDict(String),

    #[error("invalid PCI alias: {0}")]
    InvalidAlias(String),

    #[error("invalid PCI device spec: {0}")]
    InvalidDeviceSpec(String),
}

fn join_statuses(statuses: &[PciDeviceStatus]) -> String {
    statuses
        .iter()
        .map(PciDeviceStatus::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_owner(owner: &Option<uuid::Uuid>) -> String {
    owner.map_or_else(|| "nobody".to_string(), |o| o.to_string())
}
