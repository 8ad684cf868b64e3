//! Metadata cache collaborator interface.
//!
//! The eviction engine itself lives outside this crate; the lifecycle
//! manager only needs to flush it before teardown and destroy it during
//! teardown, always in that order.

use crate::error::Result;

pub trait MetadataCache: Send {
    /// Write back dirty entries.
    fn flush(&mut self) -> Result<()>;

    /// Tear the cache down. Called at most once, after the final flush.
    fn destroy(&mut self) -> Result<()>;

    fn is_clean(&self) -> bool {
        true
    }
}

/// Cache stub for files opened without an external metadata cache.
#[derive(Debug, Default)]
pub struct NoopCache;

impl MetadataCache for NoopCache {
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        Ok(())
    }
}
