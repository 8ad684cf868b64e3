//! File access configuration.
//!
//! The configuration object the generic property-list mechanism would carry
//! in the full library, rendered as a plain cloneable struct: which driver
//! to open with, driver-specific options, alignment hints, aggregator block
//! sizes and an optional initial in-memory file image.

use std::sync::Arc;

use crate::vfd::registry::DriverId;
use crate::vfd::{CloseDegree, DriverOptions};

/// Default metadata aggregator block size (bytes).
pub const DEFAULT_META_BLOCK_SIZE: u64 = 2048;
/// Default small-data aggregator block size (bytes).
pub const DEFAULT_SDATA_BLOCK_SIZE: u64 = 2048;

#[derive(Clone)]
pub struct FileAccessConfig {
    /// Driver class to open the file with.
    pub driver: DriverId,
    /// Driver-specific configuration blob, if any.
    pub driver_options: Option<Box<dyn DriverOptions>>,
    /// Allocations of at least `alignment_threshold` bytes are aligned to
    /// `alignment` bytes. An alignment of 0 or 1 disables the hint.
    pub alignment_threshold: u64,
    pub alignment: u64,
    /// Metadata aggregation block size; 0 disables the aggregator.
    pub meta_block_size: u64,
    /// Small-data aggregation block size; 0 disables the aggregator.
    pub small_data_block_size: u64,
    /// Initial file image installed into drivers that advertise
    /// `ALLOW_FILE_IMAGE`.
    pub file_image: Option<Arc<[u8]>>,
    /// Requested close degree; `Default` resolves to the driver class's.
    pub close_degree: CloseDegree,
    /// Advisory file locking on first open, for drivers that support it.
    pub use_file_locking: bool,
}

impl FileAccessConfig {
    pub fn new(driver: DriverId) -> Self {
        FileAccessConfig {
            driver,
            driver_options: None,
            alignment_threshold: 1,
            alignment: 1,
            meta_block_size: DEFAULT_META_BLOCK_SIZE,
            small_data_block_size: DEFAULT_SDATA_BLOCK_SIZE,
            file_image: None,
            close_degree: CloseDegree::Default,
            use_file_locking: true,
        }
    }

    pub fn with_close_degree(mut self, degree: CloseDegree) -> Self {
        self.close_degree = degree;
        self
    }

    pub fn with_file_image(mut self, image: Arc<[u8]>) -> Self {
        self.file_image = Some(image);
        self
    }

    pub fn with_alignment(mut self, threshold: u64, alignment: u64) -> Self {
        self.alignment_threshold = threshold;
        self.alignment = alignment;
        self
    }
}
