//! Virtual file driver layer and file handle lifecycle for hierarchical
//! binary containers.
//!
//! The crate splits into:
//! - `addr`: fixed-width address codec and checked address arithmetic.
//! - `vfd`: the driver contract ([`vfd::DriverClass`] / [`vfd::DriverFile`]),
//!   the process-wide registry and the dispatch layer.
//! - `space`: address-space allocator (free lists, aggregators, metadata
//!   write accumulator).
//! - `file`: the [`file::FileManager`] arena owning shared file states and
//!   file handles, with close degrees and mount hierarchy.
//! - bundled backends: `sec2` (local disk), `memory`, and the collective
//!   `dsm` conformance driver.

pub mod addr;
pub mod cache;
pub mod config;
pub mod error;
pub mod file;
pub mod space;
pub mod vfd;

pub use config::FileAccessConfig;
pub use error::{Result, VfdError};
pub use file::{FileId, FileManager, ObjectId};
pub use vfd::{CloseDegree, MemType, OpenFlags};
