//! Crate-wide error type.

use crate::addr::Addr;

pub type Result<T> = std::result::Result<T, VfdError>;

#[derive(Debug, thiserror::Error)]
pub enum VfdError {
    /// Null/empty name, zero or undefined maximum address, invalid flag
    /// combination and similar caller mistakes.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// A driver class descriptor broke the registration contract.
    #[error("driver contract violation: {0}")]
    DriverContractViolation(&'static str),

    /// Both the tentative and the full low-level open attempts failed, or an
    /// open conflicts with an already-open shared file.
    #[error("open failed: {reason}: '{name}'")]
    OpenFailed { name: String, reason: &'static str },

    /// A later opener requested a close degree incompatible with the degree
    /// already resolved for the shared file.
    #[error("file close degree doesn't match")]
    CloseDegreeConflict,

    /// SEMI close degree with objects still open on the file. The only close
    /// failure a caller can see; the handle stays open.
    #[error("can't close file, there are objects still open")]
    CloseRejected,

    /// Allocation or region arithmetic exceeded the representable or maximum
    /// address.
    #[error("address overflow at {addr:#x} (+{size})")]
    AddressOverflow { addr: Addr, size: u64 },

    /// Zero-size or otherwise unsatisfiable allocation request.
    #[error("no space: {0}")]
    NoSpace(&'static str),

    /// Driver-level read/write/flush/truncate failure.
    #[error("driver I/O failure: {0}")]
    IoFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
