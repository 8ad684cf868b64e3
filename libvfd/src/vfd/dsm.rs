//! Distributed shared-memory conformance driver.
//!
//! Validates that the VFD contract generalizes to collective, multi-process
//! backends: a paged memory region shared by N ranks of a communicator.
//! Open, close, flush and end-of-allocation changes are collective: every
//! rank must perform them in the same order with matching arguments. The
//! driver enforces this through a shared call ledger, where a real MPI
//! transport would instead deadlock or diverge. Rank 0 performs the authoritative
//! page-table updates; other ranks observe the result through the shared
//! region, standing in for a broadcast. A dirty flag is max-reduced across
//! ranks at close so any rank's write reaches the notification step.

use std::any::Any;
use std::sync::{Arc, Mutex};

use log::warn;

use crate::addr::{ADDR_UNDEF, Addr};
use crate::config::FileAccessConfig;
use crate::error::{Result, VfdError};
use crate::vfd::{
    CollectiveFile, DriverClass, DriverFile, DriverOptions, FeatureFlags, MemType, OpenFlags,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Collective {
    Open,
    SetEoa(Addr),
    Flush,
    Close,
}

struct DsmState {
    page_size: u64,
    pages: Vec<Vec<u8>>,
    /// Page-list assignment, maintained by rank 0 (round-robin ownership).
    page_owner: Vec<u32>,
    eoa: Addr,
    comm_size: u32,
    /// Ranks that have passed the creation barrier.
    ranks_open: u32,
    /// Max-reduction of every rank's dirty flag, gathered at close.
    dirty: bool,
    /// Set by the last rank out when the reduced dirty flag is raised.
    notified: bool,
    /// Collective call ledger: the op sequence plus each rank's progress.
    calls: Vec<Collective>,
    progress: Vec<usize>,
}

/// Handle on one shared region; clone one per rank.
#[derive(Clone)]
pub struct DsmRegion {
    state: Arc<Mutex<DsmState>>,
    comm: u64,
    comm_size: u32,
}

impl DsmRegion {
    /// Collectively create a region for `comm_size` ranks.
    pub fn create(comm: u64, comm_size: u32, page_size: u64) -> DsmRegion {
        assert!(comm_size >= 1 && page_size >= 1);
        DsmRegion {
            state: Arc::new(Mutex::new(DsmState {
                page_size,
                pages: Vec::new(),
                page_owner: Vec::new(),
                eoa: 0,
                comm_size,
                ranks_open: 0,
                dirty: false,
                notified: false,
                calls: Vec::new(),
                progress: vec![0; comm_size as usize],
            })),
            comm,
            comm_size,
        }
    }

    /// Per-rank driver options for this region.
    pub fn options(&self, rank: u32) -> DsmOptions {
        assert!(rank < self.comm_size);
        DsmOptions { region: self.clone(), rank }
    }

    /// Whether any rank's write survived to the close-time notification.
    pub fn notified(&self) -> bool {
        self.state.lock().unwrap().notified
    }

    /// Current page ownership table (index = page, value = owning rank).
    pub fn page_owners(&self) -> Vec<u32> {
        self.state.lock().unwrap().page_owner.clone()
    }
}

#[derive(Clone)]
pub struct DsmOptions {
    region: DsmRegion,
    rank: u32,
}

impl DriverOptions for DsmOptions {
    fn clone_options(&self) -> Box<dyn DriverOptions> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DsmDriver;

impl DsmDriver {
    pub fn new() -> Self {
        DsmDriver
    }
}

impl Default for DsmDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverClass for DsmDriver {
    fn name(&self) -> &str {
        "dsm"
    }

    fn maxaddr(&self) -> Addr {
        ADDR_UNDEF - 1
    }

    fn query(&self) -> FeatureFlags {
        FeatureFlags::HAS_MPI | FeatureFlags::ALLOCATE_EARLY
    }

    fn open(
        &self,
        _name: &str,
        _flags: OpenFlags,
        config: &FileAccessConfig,
        _maxaddr: Addr,
    ) -> Result<Box<dyn DriverFile>> {
        let opts = config
            .driver_options
            .as_ref()
            .and_then(|o| o.as_any().downcast_ref::<DsmOptions>())
            .ok_or(VfdError::BadArgument("dsm driver requires DsmOptions"))?
            .clone();
        let mut file = DsmFile {
            region: opts.region,
            rank: opts.rank,
            local_dirty: false,
            closed: false,
        };
        file.enter_collective(Collective::Open)?;
        {
            let mut st = file.region.state.lock().unwrap();
            st.ranks_open += 1;
        }
        Ok(Box::new(file))
    }
}

struct DsmFile {
    region: DsmRegion,
    rank: u32,
    local_dirty: bool,
    closed: bool,
}

impl DsmFile {
    /// Enter a collective call. The first rank to arrive at a slot defines
    /// the expected operation; any rank arriving with a different one has
    /// diverged from the communicator.
    fn enter_collective(&mut self, op: Collective) -> Result<()> {
        let mut st = self.region.state.lock().unwrap();
        let i = st.progress[self.rank as usize];
        if i == st.calls.len() {
            st.calls.push(op);
        } else if st.calls[i] != op {
            warn!(
                "dsm rank {} diverged: expected {:?}, called {:?}",
                self.rank, st.calls[i], op
            );
            return Err(VfdError::IoFailure(format!(
                "collective divergence on rank {}",
                self.rank
            )));
        }
        st.progress[self.rank as usize] = i + 1;
        Ok(())
    }

    /// All ranks must pass the creation barrier before any I/O proceeds.
    fn check_barrier(st: &DsmState) -> Result<()> {
        if st.ranks_open < st.comm_size {
            return Err(VfdError::IoFailure(
                "I/O before all ranks passed the creation barrier".into(),
            ));
        }
        Ok(())
    }
}

impl DriverFile for DsmFile {
    fn read(&mut self, _mem: MemType, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let st = self.region.state.lock().unwrap();
        Self::check_barrier(&st)?;
        let page_size = st.page_size;
        let mut off = addr;
        let mut cursor = 0usize;
        while cursor < buf.len() {
            let page = (off / page_size) as usize;
            let in_page = (off % page_size) as usize;
            let take = buf.len() - cursor;
            let take = take.min(page_size as usize - in_page);
            match st.pages.get(page) {
                Some(p) => buf[cursor..cursor + take].copy_from_slice(&p[in_page..in_page + take]),
                None => buf[cursor..cursor + take].fill(0),
            }
            cursor += take;
            off += take as u64;
        }
        Ok(())
    }

    fn write(&mut self, _mem: MemType, addr: Addr, buf: &[u8]) -> Result<()> {
        let mut st = self.region.state.lock().unwrap();
        Self::check_barrier(&st)?;
        let page_size = st.page_size;
        let mut off = addr;
        let mut cursor = 0usize;
        while cursor < buf.len() {
            let page = (off / page_size) as usize;
            let in_page = (off % page_size) as usize;
            let take = (buf.len() - cursor).min(page_size as usize - in_page);
            let p = st
                .pages
                .get_mut(page)
                .ok_or(VfdError::AddressOverflow { addr: off, size: (buf.len() - cursor) as u64 })?;
            p[in_page..in_page + take].copy_from_slice(&buf[cursor..cursor + take]);
            cursor += take;
            off += take as u64;
        }
        self.local_dirty = true;
        Ok(())
    }

    fn get_eoa(&self, _mem: MemType) -> Addr {
        self.region.state.lock().unwrap().eoa
    }

    /// Collective: growing the region may request more backing pages, so
    /// every rank must participate with the same target address.
    fn set_eoa(&mut self, _mem: MemType, addr: Addr) -> Result<()> {
        self.enter_collective(Collective::SetEoa(addr))?;
        let mut st = self.region.state.lock().unwrap();
        if self.rank == 0 {
            // Authoritative page-table update; other ranks see the result
            // through the shared region (the broadcast step).
            let pages_needed = addr.div_ceil(st.page_size) as usize;
            let page_size = st.page_size as usize;
            let comm_size = st.comm_size;
            while st.pages.len() < pages_needed {
                let owner = (st.pages.len() as u32) % comm_size;
                st.pages.push(vec![0u8; page_size]);
                st.page_owner.push(owner);
            }
            st.eoa = addr;
        }
        Ok(())
    }

    fn get_eof(&self) -> Addr {
        let st = self.region.state.lock().unwrap();
        st.pages.len() as u64 * st.page_size
    }

    fn flush(&mut self, _closing: bool) -> Result<()> {
        self.enter_collective(Collective::Flush)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.enter_collective(Collective::Close)?;
        self.closed = true;
        let mut st = self.region.state.lock().unwrap();
        // Dirty flag max-reduce: any rank's write must reach the
        // notification step regardless of which rank performed it.
        st.dirty |= self.local_dirty;
        st.ranks_open -= 1;
        if st.ranks_open == 0 && st.dirty {
            st.notified = true;
        }
        Ok(())
    }

    fn collective(&self) -> Option<&dyn CollectiveFile> {
        Some(self)
    }
}

impl CollectiveFile for DsmFile {
    fn mpi_rank(&self) -> u32 {
        self.rank
    }

    fn mpi_size(&self) -> u32 {
        self.region.comm_size
    }

    fn communicator(&self) -> u64 {
        self.region.comm
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_ranks(region: &DsmRegion, n: u32) -> Vec<Box<dyn DriverFile>> {
        let drv = DsmDriver::new();
        let reg = crate::vfd::registry::DriverRegistry::global();
        (0..n)
            .map(|r| {
                let id = reg.register(std::sync::Arc::new(DsmDriver::new())).unwrap();
                let mut cfg = FileAccessConfig::new(id);
                cfg.driver_options = Some(Box::new(region.options(r)));
                drv.open("dsm", OpenFlags::RDWR, &cfg, ADDR_UNDEF).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_barrier_blocks_io_until_all_open() {
        let region = DsmRegion::create(7, 2, 64);
        let drv = DsmDriver::new();
        let reg = crate::vfd::registry::DriverRegistry::global();
        let id = reg.register(std::sync::Arc::new(DsmDriver::new())).unwrap();
        let mut cfg = FileAccessConfig::new(id);
        cfg.driver_options = Some(Box::new(region.options(0)));
        let mut r0 = drv.open("dsm", OpenFlags::RDWR, &cfg, ADDR_UNDEF).unwrap();
        let mut buf = [0u8; 4];
        assert!(r0.read(MemType::Default, 0, &mut buf).is_err());

        cfg.driver_options = Some(Box::new(region.options(1)));
        let mut r1 = drv.open("dsm", OpenFlags::RDWR, &cfg, ADDR_UNDEF).unwrap();
        r0.set_eoa(MemType::Default, 128).unwrap();
        r1.set_eoa(MemType::Default, 128).unwrap();
        assert!(r0.read(MemType::Default, 0, &mut buf).is_ok());
    }

    #[test]
    fn test_rank0_page_assignment_broadcast() {
        let region = DsmRegion::create(9, 3, 64);
        let mut ranks = open_ranks(&region, 3);
        for f in ranks.iter_mut() {
            f.set_eoa(MemType::Default, 300).unwrap();
        }
        // 300 bytes over 64-byte pages -> 5 pages, owners round-robin.
        assert_eq!(region.page_owners(), vec![0, 1, 2, 0, 1]);
        // Every rank observes the grown region.
        for f in ranks.iter() {
            assert_eq!(f.get_eoa(MemType::Default), 300);
            assert_eq!(f.get_eof(), 5 * 64);
        }
    }

    #[test]
    fn test_collective_divergence_detected() {
        let region = DsmRegion::create(3, 2, 64);
        let mut ranks = open_ranks(&region, 2);
        ranks[0].set_eoa(MemType::Default, 128).unwrap();
        // Rank 1 calls set_eoa with a different size: divergence.
        let err = ranks[1].set_eoa(MemType::Default, 256).unwrap_err();
        assert!(matches!(err, VfdError::IoFailure(_)));
        // Rank 1 calling flush instead of the pending set_eoa also diverges.
        assert!(ranks[1].flush(false).is_err());
    }

    #[test]
    fn test_dirty_flag_reduced_at_close() {
        let region = DsmRegion::create(5, 2, 64);
        let mut ranks = open_ranks(&region, 2);
        for f in ranks.iter_mut() {
            f.set_eoa(MemType::Default, 128).unwrap();
        }
        // Only rank 1 writes.
        ranks[1].write(MemType::Default, 10, b"dirty").unwrap();
        for f in ranks.iter_mut() {
            f.close().unwrap();
        }
        assert!(region.notified());

        // A clean region produces no notification.
        let clean = DsmRegion::create(6, 2, 64);
        let mut ranks = open_ranks(&clean, 2);
        for f in ranks.iter_mut() {
            f.close().unwrap();
        }
        assert!(!clean.notified());
    }

    #[test]
    fn test_collective_capability_reported() {
        let region = DsmRegion::create(11, 2, 64);
        let ranks = open_ranks(&region, 2);
        let c = ranks[1].collective().expect("dsm is collective");
        assert_eq!(c.mpi_rank(), 1);
        assert_eq!(c.mpi_size(), 2);
        assert_eq!(c.communicator(), 11);
    }
}
