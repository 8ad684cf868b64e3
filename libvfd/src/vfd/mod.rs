//! Virtual file driver (VFD) contract.
//!
//! A storage backend is described by a [`DriverClass`] (one per backend kind,
//! registered process-wide) which opens [`DriverFile`] instances (one per
//! open low-level file). The C-style callback table becomes a trait pair:
//! mandatory callbacks are required trait methods, optional ones carry
//! default implementations. Backends with collective (MPI-style) semantics
//! additionally expose the [`CollectiveFile`] capability.

pub mod dispatch;
pub mod dsm;
pub mod memory;
pub mod registry;
pub mod sec2;

use std::any::Any;

use crate::addr::Addr;
use crate::config::FileAccessConfig;
use crate::error::{Result, VfdError};

/// Memory-usage categories for allocation requests.
///
/// The category selects a free list or aggregation block; drivers may remap
/// categories through their [`FreeListMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    /// "Don't care" category; maps to itself in every free-list map.
    Default,
    Superblock,
    Btree,
    /// Raw (dataset) data.
    Raw,
    GlobalHeap,
    LocalHeap,
    ObjectHeader,
}

pub const N_MEM_TYPES: usize = 7;

impl MemType {
    pub const ALL: [MemType; N_MEM_TYPES] = [
        MemType::Default,
        MemType::Superblock,
        MemType::Btree,
        MemType::Raw,
        MemType::GlobalHeap,
        MemType::LocalHeap,
        MemType::ObjectHeader,
    ];

    #[inline]
    pub fn index(self) -> usize {
        match self {
            MemType::Default => 0,
            MemType::Superblock => 1,
            MemType::Btree => 2,
            MemType::Raw => 3,
            MemType::GlobalHeap => 4,
            MemType::LocalHeap => 5,
            MemType::ObjectHeader => 6,
        }
    }

    /// Whether this category counts as metadata for aggregation purposes.
    #[inline]
    pub fn is_metadata(self) -> bool {
        !matches!(self, MemType::Raw)
    }
}

/// One entry of a driver's free-list mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeListEntry {
    /// The category uses its own free list (identity mapping).
    Own,
    /// The category shares another category's free list.
    Alias(MemType),
    /// No free-list treatment; deallocations of this category leak at the
    /// VFD layer.
    NoList,
}

/// Per-category free-list mapping table carried by a driver class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeListMap {
    entries: [FreeListEntry; N_MEM_TYPES],
}

impl FreeListMap {
    /// Every category keeps its own free list.
    pub const IDENTITY: FreeListMap = FreeListMap {
        entries: [FreeListEntry::Own; N_MEM_TYPES],
    };

    /// No category gets a free list.
    pub const NO_LISTS: FreeListMap = FreeListMap {
        entries: [FreeListEntry::NoList; N_MEM_TYPES],
    };

    pub fn new(entries: [FreeListEntry; N_MEM_TYPES]) -> Self {
        FreeListMap { entries }
    }

    /// Resolve a category to the category whose free list serves it, or
    /// `None` when the category opts out of free lists.
    pub fn map(&self, mt: MemType) -> Option<MemType> {
        match self.entries[mt.index()] {
            FreeListEntry::Own => Some(mt),
            FreeListEntry::Alias(target) => Some(target),
            FreeListEntry::NoList => None,
        }
    }

    /// Registration-time validation: alias targets must own their list, so
    /// a lookup never chases chains.
    pub fn validate(&self) -> Result<()> {
        for mt in MemType::ALL {
            if let FreeListEntry::Alias(target) = self.entries[mt.index()] {
                if self.entries[target.index()] != FreeListEntry::Own {
                    return Err(VfdError::DriverContractViolation(
                        "free-list alias target must own its list",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Close-degree policy for a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDegree {
    /// Resolve to the driver class default at open time. Invalid once a
    /// shared file has been created.
    Default,
    /// Defer destruction until every file and object in the hierarchy closes.
    Weak,
    /// Refuse to close while objects are open on the file itself.
    Semi,
    /// Force-close open objects, then close.
    Strong,
}

bitflags::bitflags! {
    /// File open flags. The empty set means read-only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const RDWR  = 1 << 0;
        const TRUNC = 1 << 1;
        const EXCL  = 1 << 2;
        const CREAT = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Feature flags a driver reports through `query`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FeatureFlags: u32 {
        /// Metadata allocations may be aggregated into larger blocks.
        const AGGREGATE_METADATA = 1 << 0;
        /// Small metadata writes may be buffered in the accumulator.
        const ACCUMULATE_METADATA = 1 << 1;
        /// Small raw-data allocations may be aggregated into larger blocks.
        const AGGREGATE_SMALLDATA = 1 << 2;
        /// Driver uses collective (MPI-style) semantics.
        const HAS_MPI = 1 << 3;
        /// Driver allocates backing storage eagerly.
        const ALLOCATE_EARLY = 1 << 4;
        /// Driver accepts a caller-supplied initial file image.
        const ALLOW_FILE_IMAGE = 1 << 5;
    }
}

/// Driver-specific configuration blob carried inside a
/// [`FileAccessConfig`]. The clone hook mirrors the descriptor's
/// property-list copy callback.
pub trait DriverOptions: Any + Send + Sync {
    fn clone_options(&self) -> Box<dyn DriverOptions>;
    fn as_any(&self) -> &dyn Any;
}

impl Clone for Box<dyn DriverOptions> {
    fn clone(&self) -> Self {
        self.clone_options()
    }
}

/// A driver class descriptor: immutable, process-wide, shared by every open
/// instance of the backend.
///
/// `name`, `maxaddr`, `open` and the mandatory [`DriverFile`] methods are
/// the required part of the contract; everything else defaults.
pub trait DriverClass: Send + Sync {
    /// Short identifying name ("sec2", "memory", ...).
    fn name(&self) -> &str;

    /// Largest address the backend can represent.
    fn maxaddr(&self) -> Addr;

    /// Open a low-level file. `maxaddr` is the effective cap already
    /// clamped by the dispatch layer.
    fn open(
        &self,
        name: &str,
        flags: OpenFlags,
        config: &FileAccessConfig,
        maxaddr: Addr,
    ) -> Result<Box<dyn DriverFile>>;

    /// Close degree applied when the opener asks for `Default`.
    fn default_close_degree(&self) -> CloseDegree {
        CloseDegree::Weak
    }

    fn free_list_map(&self) -> FreeListMap {
        FreeListMap::IDENTITY
    }

    /// File-inspecific feature flags.
    fn query(&self) -> FeatureFlags {
        FeatureFlags::empty()
    }

    /// Whether instances of this class can detect that two opens refer to
    /// the same underlying file (i.e. provide [`DriverFile::cmp_key`]).
    /// Drives the tentative-open path in the lifecycle manager.
    fn is_comparable(&self) -> bool {
        false
    }

    /// Whether instances support advisory locking.
    fn supports_locking(&self) -> bool {
        false
    }
}

/// An open low-level file. All addresses are in the driver's own relative
/// space; the dispatch layer handles base-address normalization.
pub trait DriverFile: Send {
    fn read(&mut self, mem: MemType, addr: Addr, buf: &mut [u8]) -> Result<()>;
    fn write(&mut self, mem: MemType, addr: Addr, buf: &[u8]) -> Result<()>;

    /// End-of-allocation marker: high-water mark of everything allocated.
    fn get_eoa(&self, mem: MemType) -> Addr;
    fn set_eoa(&mut self, mem: MemType, addr: Addr) -> Result<()>;

    /// Actual extent of the underlying storage.
    fn get_eof(&self) -> Addr;

    /// Release driver resources. Called exactly once, via the dispatch
    /// layer; the instance is invalid afterwards.
    fn close(&mut self) -> Result<()>;

    /// Ordered identity key for same-class comparison; `None` when the
    /// driver cannot distinguish files.
    fn cmp_key(&self) -> Option<Box<[u8]>> {
        None
    }

    fn flush(&mut self, _closing: bool) -> Result<()> {
        Ok(())
    }

    fn truncate(&mut self, _closing: bool) -> Result<()> {
        Ok(())
    }

    fn lock(&mut self, _exclusive: bool) -> Result<()> {
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        Ok(())
    }

    /// Driver-level allocation hook. `Ok(None)` means "not handled, use the
    /// generic free-list/EOA path".
    fn alloc(&mut self, _mem: MemType, _size: u64) -> Result<Option<Addr>> {
        Ok(None)
    }

    /// Driver-level deallocation hook. `Ok(false)` means "not handled".
    fn free(&mut self, _mem: MemType, _addr: Addr, _size: u64) -> Result<bool> {
        Ok(false)
    }

    /// Collective capability query. Non-collective drivers return `None`;
    /// the dispatch layer never assumes MPI semantics without asking.
    fn collective(&self) -> Option<&dyn CollectiveFile> {
        None
    }
}

/// Capability trait for drivers with collective semantics: open, close,
/// flush and EOA changes must be called by every process of the
/// communicator, in the same order, with matching arguments.
pub trait CollectiveFile {
    fn mpi_rank(&self) -> u32;
    fn mpi_size(&self) -> u32;
    /// Opaque communicator identity.
    fn communicator(&self) -> u64;
}
