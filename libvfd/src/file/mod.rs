//! File handle lifecycle manager.
//!
//! Owns every open file in two arenas: shared file states (one per distinct
//! underlying file) and file handles (one per open call), both keyed by
//! generated ids. Handles refer to their shared state by id, never by
//! pointer, so deferral and teardown are plain map operations.
//!
//! Handle states: tentative-open, open, closing, destroyed, plus a deferred
//! sub-state of closing used when a close degree postpones destruction.

pub mod mount;

use std::collections::{HashMap, HashSet};

use log::{debug, error, warn};

use crate::addr::{ADDR_UNDEF, Addr};
use crate::cache::{MetadataCache, NoopCache};
use crate::config::FileAccessConfig;
use crate::error::{Result, VfdError};
use crate::space::FileSpace;
use crate::space::accum::Accumulator;
use crate::vfd::dispatch::DriverHandle;
use crate::vfd::registry::DriverRegistry;
use crate::vfd::{CloseDegree, DriverClass, FeatureFlags, MemType, OpenFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId(u64);

/// Opaque id for an object (group, dataset, ...) opened within a file. The
/// object model itself lives outside this crate; only the counts matter
/// here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SharedId(u64);

/// Per-underlying-file state, shared by every handle opened on it.
struct SharedFileState {
    /// `None` only while the state is being torn down.
    handle: Option<DriverHandle>,
    name: String,
    flags: OpenFlags,
    /// Resolved at first open; never `Default` afterwards.
    degree: CloseDegree,
    nrefs: u32,
    space: FileSpace,
    accum: Accumulator,
    cache: Box<dyn MetadataCache>,
    locked: bool,
}

struct FileRecord {
    shared: SharedId,
    open_name: String,
    objects: HashSet<ObjectId>,
    /// Re-entrancy guard: the close decision for this handle was entered.
    closing: bool,
    /// External id released but destruction postponed by the close degree.
    deferred: bool,
    parent: Option<FileId>,
    children: Vec<FileId>,
}

pub struct FileManager {
    shared: HashMap<SharedId, SharedFileState>,
    handles: HashMap<FileId, FileRecord>,
    next_shared: u64,
    next_file: u64,
    next_object: u64,
}

impl Default for FileManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileManager {
    pub fn new() -> Self {
        FileManager {
            shared: HashMap::new(),
            handles: HashMap::new(),
            next_shared: 0,
            next_file: 0,
            next_object: 0,
        }
    }

    /// Open a file, deduplicating against already-open shared states.
    ///
    /// For comparable driver classes the first attempt is tentative, with
    /// creation/truncation/exclusivity stripped, so an existing file can be
    /// matched against the open shared states. When no match exists and the
    /// stripped flags differ from the requested ones, the tentative instance
    /// is closed and the open is redone with the full flags.
    pub fn open(
        &mut self,
        name: &str,
        flags: OpenFlags,
        config: &FileAccessConfig,
    ) -> Result<FileId> {
        if name.is_empty() {
            return Err(VfdError::BadArgument("empty file name"));
        }
        if flags.contains(OpenFlags::EXCL) && !flags.contains(OpenFlags::CREAT) {
            return Err(VfdError::BadArgument("exclusive open without create"));
        }
        let class = DriverRegistry::global().resolve(config.driver)?;

        let mut tent_flags = flags;
        let mut tentative = None;
        if class.is_comparable() {
            tent_flags.remove(OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::EXCL);
            match DriverHandle::open(name, tent_flags, config, ADDR_UNDEF) {
                Ok(h) => tentative = Some(h),
                // Nothing on disk to compare against; fall through to the
                // full open below.
                Err(_) => tent_flags = flags,
            }
        }

        if let Some(tent) = tentative {
            let found = self.shared.iter().find_map(|(sid, st)| {
                let h = st.handle.as_ref()?;
                (DriverHandle::cmp_files(Some(h), Some(&tent)) == std::cmp::Ordering::Equal)
                    .then_some(*sid)
            });
            if let Some(sid) = found {
                // Conflicts are decided before the tentative instance is
                // released, but release happens on every path.
                let conflict = self.share_conflict(sid, flags, config);
                let close_res = tent.close();
                if let Some(e) = conflict {
                    return Err(e);
                }
                close_res?;
                self.shared.get_mut(&sid).ok_or(VfdError::BadArgument("stale shared state"))?.nrefs += 1;
                debug!("open '{}': joined existing shared state", name);
                return Ok(self.new_handle(sid, name));
            }
            if tent_flags == flags {
                return self.install_shared(tent, name, flags, config, &class);
            }
            tent.close()?;
        }

        let handle = DriverHandle::open(name, flags, config, ADDR_UNDEF).map_err(|e| {
            debug!("open '{}' failed at the driver: {}", name, e);
            VfdError::OpenFailed { name: name.to_string(), reason: "low-level driver open failed" }
        })?;
        self.install_shared(handle, name, flags, config, &class)
    }

    /// Release a handle's external reference. All close degrees except SEMI
    /// always succeed, possibly by deferring destruction.
    pub fn close(&mut self, file: FileId) -> Result<()> {
        {
            let rec = self
                .handles
                .get(&file)
                .ok_or(VfdError::BadArgument("unknown file handle"))?;
            if rec.closing || rec.deferred {
                return Ok(());
            }
        }
        self.try_close(file, false)?;
        self.sweep();
        Ok(())
    }

    /// New handle on the same shared state: no mount links of its own, no
    /// driver dispatch.
    pub fn reopen(&mut self, file: FileId) -> Result<FileId> {
        let (sid, name) = {
            let rec = self.live(file)?;
            (rec.shared, rec.open_name.clone())
        };
        self.shared
            .get_mut(&sid)
            .ok_or(VfdError::BadArgument("stale shared state"))?
            .nrefs += 1;
        Ok(self.new_handle(sid, &name))
    }

    /// Record an object opened within the file.
    pub fn open_object(&mut self, file: FileId) -> Result<ObjectId> {
        self.live(file)?;
        self.next_object += 1;
        let obj = ObjectId(self.next_object);
        self.handles
            .get_mut(&file)
            .ok_or(VfdError::BadArgument("unknown file handle"))?
            .objects
            .insert(obj);
        Ok(obj)
    }

    /// Release an object. Also works on a deferred handle, since objects
    /// routinely outlive the file id they were opened through; releasing the
    /// last one re-attempts any postponed destruction.
    pub fn close_object(&mut self, file: FileId, obj: ObjectId) -> Result<()> {
        let rec = self
            .handles
            .get_mut(&file)
            .ok_or(VfdError::BadArgument("unknown file handle"))?;
        if !rec.objects.remove(&obj) {
            return Err(VfdError::BadArgument("object is not open on this file"));
        }
        self.sweep();
        Ok(())
    }

    pub fn read(&mut self, file: FileId, mem: MemType, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let st = self.state_mut(file)?;
        let SharedFileState { handle, accum, .. } = st;
        let h = handle.as_mut().ok_or(VfdError::BadArgument("file is closed"))?;
        accum.read(h, mem, addr, buf)
    }

    pub fn write(&mut self, file: FileId, mem: MemType, addr: Addr, data: &[u8]) -> Result<()> {
        let st = self.state_mut(file)?;
        if !st.flags.contains(OpenFlags::RDWR) {
            return Err(VfdError::BadArgument("file is open read-only"));
        }
        let SharedFileState { handle, accum, .. } = st;
        let h = handle.as_mut().ok_or(VfdError::BadArgument("file is closed"))?;
        accum.write(h, mem, addr, data)
    }

    pub fn allocate(&mut self, file: FileId, mem: MemType, size: u64) -> Result<Addr> {
        let st = self.state_mut(file)?;
        let SharedFileState { handle, space, .. } = st;
        let h = handle.as_mut().ok_or(VfdError::BadArgument("file is closed"))?;
        space.allocate(h, mem, size)
    }

    pub fn deallocate(&mut self, file: FileId, mem: MemType, addr: Addr, size: u64) -> Result<()> {
        let st = self.state_mut(file)?;
        let SharedFileState { handle, space, .. } = st;
        let h = handle.as_mut().ok_or(VfdError::BadArgument("file is closed"))?;
        space.deallocate(h, mem, addr, size)
    }

    /// Flush cache, accumulator and driver state for the file.
    pub fn flush(&mut self, file: FileId) -> Result<()> {
        let sid = self.live(file)?.shared;
        self.flush_shared(sid, false)
    }

    pub fn eoa(&self, file: FileId) -> Result<Addr> {
        let st = self.state(file)?;
        let h = st.handle.as_ref().ok_or(VfdError::BadArgument("file is closed"))?;
        Ok(h.get_eoa(MemType::Default))
    }

    pub fn eof(&self, file: FileId) -> Result<Addr> {
        let st = self.state(file)?;
        let h = st.handle.as_ref().ok_or(VfdError::BadArgument("file is closed"))?;
        Ok(h.get_eof())
    }

    pub fn set_eoa(&mut self, file: FileId, addr: Addr) -> Result<()> {
        let st = self.state_mut(file)?;
        let h = st.handle.as_mut().ok_or(VfdError::BadArgument("file is closed"))?;
        h.set_eoa(MemType::Default, addr)
    }

    /// Install an external metadata cache on the file's shared state.
    pub fn set_cache(&mut self, file: FileId, cache: Box<dyn MetadataCache>) -> Result<()> {
        self.state_mut(file)?.cache = cache;
        Ok(())
    }

    /// Reference count of the shared state behind a handle.
    pub fn ref_count(&self, file: FileId) -> Option<u32> {
        let rec = self.handles.get(&file)?;
        self.shared.get(&rec.shared).map(|st| st.nrefs)
    }

    /// Whether the handle is open (not released, not closing).
    pub fn is_open(&self, file: FileId) -> bool {
        self.handles
            .get(&file)
            .is_some_and(|r| !r.deferred && !r.closing)
    }

    /// Number of live shared states, i.e. distinct underlying files whose
    /// driver instance is still open.
    pub fn open_shared_states(&self) -> usize {
        self.shared.len()
    }

    fn share_conflict(
        &self,
        sid: SharedId,
        flags: OpenFlags,
        config: &FileAccessConfig,
    ) -> Option<VfdError> {
        let st = self.shared.get(&sid)?;
        if flags.contains(OpenFlags::TRUNC) {
            return Some(VfdError::OpenFailed {
                name: st.name.clone(),
                reason: "unable to truncate a file which is already open",
            });
        }
        if flags.contains(OpenFlags::EXCL) {
            return Some(VfdError::OpenFailed {
                name: st.name.clone(),
                reason: "file exists and is already open",
            });
        }
        if flags.contains(OpenFlags::RDWR) && !st.flags.contains(OpenFlags::RDWR) {
            return Some(VfdError::OpenFailed {
                name: st.name.clone(),
                reason: "file is already open read-only",
            });
        }
        if config.close_degree != CloseDegree::Default && config.close_degree != st.degree {
            return Some(VfdError::CloseDegreeConflict);
        }
        None
    }

    fn install_shared(
        &mut self,
        mut handle: DriverHandle,
        name: &str,
        flags: OpenFlags,
        config: &FileAccessConfig,
        class: &std::sync::Arc<dyn DriverClass>,
    ) -> Result<FileId> {
        let mut locked = false;
        if config.use_file_locking && class.supports_locking() {
            if let Err(e) = handle.lock(flags.contains(OpenFlags::RDWR)) {
                let _ = handle.close();
                return Err(e);
            }
            locked = true;
        }

        let degree = match config.close_degree {
            CloseDegree::Default => match class.default_close_degree() {
                CloseDegree::Default => CloseDegree::Weak,
                d => d,
            },
            d => d,
        };
        let accumulate = handle.query().contains(FeatureFlags::ACCUMULATE_METADATA);

        self.next_shared += 1;
        let sid = SharedId(self.next_shared);
        self.shared.insert(
            sid,
            SharedFileState {
                handle: Some(handle),
                name: name.to_string(),
                flags,
                degree,
                nrefs: 1,
                space: FileSpace::new(config.meta_block_size, config.small_data_block_size),
                accum: Accumulator::new(accumulate),
                cache: Box::new(NoopCache),
                locked,
            },
        );
        debug!("open '{}': new shared state ({:?})", name, degree);
        Ok(self.new_handle(sid, name))
    }

    fn new_handle(&mut self, sid: SharedId, name: &str) -> FileId {
        self.next_file += 1;
        let id = FileId(self.next_file);
        self.handles.insert(
            id,
            FileRecord {
                shared: sid,
                open_name: name.to_string(),
                objects: HashSet::new(),
                closing: false,
                deferred: false,
                parent: None,
                children: Vec::new(),
            },
        );
        id
    }

    /// Decide the fate of a released handle per the resolved close degree.
    /// `from_sweep` re-attempts deferred handles and must never error.
    fn try_close(&mut self, file: FileId, from_sweep: bool) -> Result<()> {
        let (sid, degree) = {
            let rec = self
                .handles
                .get(&file)
                .ok_or(VfdError::BadArgument("unknown file handle"))?;
            if rec.closing {
                return Ok(());
            }
            let sid = rec.shared;
            let degree = self
                .shared
                .get(&sid)
                .ok_or(VfdError::BadArgument("stale shared state"))?
                .degree;
            (sid, degree)
        };
        self.set_deferred(file, true);

        let top = self.topmost(file);
        let (nfiles, nobjs) = self.count_open(top);

        let proceed = match degree {
            CloseDegree::Default => {
                self.set_deferred(file, false);
                return Err(VfdError::BadArgument("close degree was never resolved"));
            }
            CloseDegree::Weak => nfiles == 0 && nobjs == 0,
            CloseDegree::Semi => {
                if nfiles > 0 || self.other_live_on_shared(file, sid) > 0 {
                    false
                } else if nobjs > 0 {
                    if from_sweep {
                        // Stays deferred; a later object release retries.
                        return Ok(());
                    }
                    self.set_deferred(file, false);
                    return Err(VfdError::CloseRejected);
                } else {
                    true
                }
            }
            CloseDegree::Strong => {
                if nfiles > 0 {
                    false
                } else {
                    // Force-close this file's open objects.
                    if let Some(rec) = self.handles.get_mut(&file) {
                        if !rec.objects.is_empty() {
                            debug!("strong close forcing {} objects closed", rec.objects.len());
                            rec.objects.clear();
                        }
                    }
                    true
                }
            }
        };

        if !proceed {
            // Destruction is postponed but the flush happens now, so failing
            // to close everything is not a data-loss problem.
            if let Err(e) = self.flush_shared(sid, false) {
                warn!("flush on deferred close failed: {}", e);
            }
            debug!("close of handle {:?} deferred ({:?})", file, degree);
            return Ok(());
        }
        self.finalize(file)
    }

    /// Remove the handle and destroy the shared state on last reference.
    fn finalize(&mut self, file: FileId) -> Result<()> {
        if let Some(rec) = self.handles.get_mut(&file) {
            rec.closing = true;
        }
        // Unmount children and detach from the parent; deferred relatives
        // are re-attempted by the caller's sweep.
        let children = match self.handles.get_mut(&file) {
            Some(rec) => std::mem::take(&mut rec.children),
            None => Vec::new(),
        };
        for c in children {
            if let Some(ch) = self.handles.get_mut(&c) {
                ch.parent = None;
            }
        }
        let parent = self.handles.get_mut(&file).and_then(|r| r.parent.take());
        if let Some(p) = parent {
            if let Some(pr) = self.handles.get_mut(&p) {
                pr.children.retain(|x| *x != file);
            }
        }

        let rec = self
            .handles
            .remove(&file)
            .ok_or(VfdError::BadArgument("unknown file handle"))?;
        let st = self
            .shared
            .get_mut(&rec.shared)
            .ok_or(VfdError::BadArgument("stale shared state"))?;
        st.nrefs -= 1;
        if st.nrefs == 0 {
            self.destroy_shared(rec.shared)
        } else {
            Ok(())
        }
    }

    /// Tear a shared state down. Every step runs even when an earlier one
    /// fails; the first error is reported.
    fn destroy_shared(&mut self, sid: SharedId) -> Result<()> {
        let mut st = self
            .shared
            .remove(&sid)
            .ok_or(VfdError::BadArgument("stale shared state"))?;
        let mut first: Option<VfdError> = None;
        if let Err(e) = st.cache.flush() {
            first.get_or_insert(e);
        }
        if let Some(mut handle) = st.handle.take() {
            if let Err(e) = st.accum.flush(&mut handle) {
                first.get_or_insert(e);
            }
            if let Err(e) = st.space.free_aggregators(&mut handle) {
                first.get_or_insert(e);
            }
            if st.flags.contains(OpenFlags::RDWR) {
                if let Err(e) = handle.flush(true) {
                    first.get_or_insert(e);
                }
                // Orderly write-mode close: bring the physical extent down
                // to the allocated size.
                if let Err(e) = handle.truncate(true) {
                    first.get_or_insert(e);
                }
            }
            if let Err(e) = st.cache.destroy() {
                first.get_or_insert(e);
            }
            if st.locked {
                if let Err(e) = handle.unlock() {
                    first.get_or_insert(e);
                }
            }
            if let Err(e) = handle.close() {
                first.get_or_insert(e);
            }
        }
        debug!("destroyed shared state for '{}'", st.name);
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Re-attempt every deferred handle until a pass makes no progress.
    pub(crate) fn sweep(&mut self) {
        loop {
            let deferred: Vec<FileId> = self
                .handles
                .iter()
                .filter(|(_, r)| r.deferred && !r.closing)
                .map(|(id, _)| *id)
                .collect();
            let before = self.handles.len();
            for id in deferred {
                if !self.handles.contains_key(&id) {
                    continue;
                }
                if let Err(e) = self.try_close(id, true) {
                    error!("deferred close of handle {:?} failed: {}", id, e);
                }
            }
            if self.handles.len() == before {
                break;
            }
        }
    }

    fn flush_shared(&mut self, sid: SharedId, closing: bool) -> Result<()> {
        let st = self
            .shared
            .get_mut(&sid)
            .ok_or(VfdError::BadArgument("stale shared state"))?;
        let SharedFileState { handle, accum, cache, .. } = st;
        let h = handle.as_mut().ok_or(VfdError::BadArgument("file is closed"))?;
        cache.flush()?;
        accum.flush(h)?;
        h.flush(closing)
    }

    fn set_deferred(&mut self, file: FileId, deferred: bool) {
        if let Some(rec) = self.handles.get_mut(&file) {
            rec.deferred = deferred;
        }
    }

    /// Live handles other than `file` sharing the same underlying file.
    fn other_live_on_shared(&self, file: FileId, sid: SharedId) -> usize {
        self.handles
            .iter()
            .filter(|(id, r)| {
                **id != file && r.shared == sid && !r.deferred && !r.closing
            })
            .count()
    }

    fn live(&self, file: FileId) -> Result<&FileRecord> {
        let rec = self
            .handles
            .get(&file)
            .ok_or(VfdError::BadArgument("unknown file handle"))?;
        if rec.deferred || rec.closing {
            return Err(VfdError::BadArgument("file handle is closed"));
        }
        Ok(rec)
    }

    fn state(&self, file: FileId) -> Result<&SharedFileState> {
        let rec = self.live(file)?;
        self.shared
            .get(&rec.shared)
            .ok_or(VfdError::BadArgument("stale shared state"))
    }

    fn state_mut(&mut self, file: FileId) -> Result<&mut SharedFileState> {
        let sid = self.live(file)?.shared;
        self.shared
            .get_mut(&sid)
            .ok_or(VfdError::BadArgument("stale shared state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::vfd::memory::MemoryDriver;
    use crate::vfd::sec2::Sec2Driver;

    fn mem_config() -> FileAccessConfig {
        let id = DriverRegistry::global()
            .register(Arc::new(MemoryDriver::new()))
            .unwrap();
        FileAccessConfig::new(id)
    }

    fn sec2_config() -> FileAccessConfig {
        let id = DriverRegistry::global()
            .register(Arc::new(Sec2Driver::new()))
            .unwrap();
        FileAccessConfig::new(id)
    }

    #[test]
    fn test_open_close_roundtrip() {
        let mut mgr = FileManager::new();
        let cfg = mem_config();
        let f = mgr.open("f", OpenFlags::CREAT | OpenFlags::RDWR, &cfg).unwrap();
        assert!(mgr.is_open(f));
        assert_eq!(mgr.ref_count(f), Some(1));
        mgr.close(f).unwrap();
        assert!(!mgr.is_open(f));
        assert_eq!(mgr.open_shared_states(), 0);
    }

    #[test]
    fn test_reopen_shares_state() {
        let mut mgr = FileManager::new();
        let cfg = mem_config();
        let f = mgr.open("f", OpenFlags::CREAT | OpenFlags::RDWR, &cfg).unwrap();
        let g = mgr.reopen(f).unwrap();
        assert_ne!(f, g);
        assert_eq!(mgr.ref_count(f), Some(2));
        assert_eq!(mgr.open_shared_states(), 1);
        mgr.close(f).unwrap();
        assert_eq!(mgr.ref_count(g), Some(1));
        mgr.close(g).unwrap();
        assert_eq!(mgr.open_shared_states(), 0);
    }

    #[test]
    fn test_write_on_readonly_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ro.bin");
        std::fs::write(&path, b"x").unwrap();
        let mut mgr = FileManager::new();
        let cfg = sec2_config();
        let f = mgr.open(path.to_str().unwrap(), OpenFlags::empty(), &cfg).unwrap();
        let err = mgr.write(f, MemType::Default, 0, b"y").unwrap_err();
        assert!(matches!(err, VfdError::BadArgument(_)));
        mgr.close(f).unwrap();
    }

    #[test]
    fn test_exclusive_without_create_rejected() {
        let mut mgr = FileManager::new();
        let cfg = mem_config();
        let err = mgr.open("f", OpenFlags::EXCL | OpenFlags::RDWR, &cfg).unwrap_err();
        assert!(matches!(err, VfdError::BadArgument(_)));
    }

    #[test]
    fn test_io_through_manager() {
        let mut mgr = FileManager::new();
        let cfg = mem_config();
        let f = mgr.open("f", OpenFlags::CREAT | OpenFlags::RDWR, &cfg).unwrap();
        let addr = mgr.allocate(f, MemType::Btree, 64).unwrap();
        mgr.write(f, MemType::Btree, addr, &[0x5a; 64]).unwrap();
        mgr.flush(f).unwrap();
        let mut buf = [0u8; 64];
        mgr.read(f, MemType::Btree, addr, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 64]);
        mgr.close(f).unwrap();
    }

    #[test]
    fn test_close_unknown_handle() {
        let mut mgr = FileManager::new();
        assert!(mgr.close(FileId(42)).is_err());
    }
}
