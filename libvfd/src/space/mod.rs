//! Address-space allocator.
//!
//! Sits between the file lifecycle layer and VFD dispatch and hands out
//! `[addr, addr+size)` ranges of the format address space. Requests are
//! tried against, in order: the driver's own allocation hook, the mapped
//! category's free list, the metadata or small-data aggregator block, and
//! finally a plain extension of the end-of-allocation marker. All
//! arithmetic is overflow checked; a failed request leaves the marker
//! untouched.

pub mod accum;

use log::debug;

use crate::addr::{ADDR_UNDEF, Addr, addr_checked_add};
use crate::error::{Result, VfdError};
use crate::vfd::dispatch::DriverHandle;
use crate::vfd::{FeatureFlags, FreeListMap, MemType, N_MEM_TYPES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    addr: Addr,
    size: u64,
}

/// One aggregation block: a span carved at EOA that small requests are
/// packed into, so metadata and raw data interleave less on disk.
struct Aggregator {
    block_size: u64,
    addr: Addr,
    left: u64,
}

impl Aggregator {
    fn new(block_size: u64) -> Self {
        Aggregator { block_size, addr: ADDR_UNDEF, left: 0 }
    }

    fn reset(&mut self) {
        self.addr = ADDR_UNDEF;
        self.left = 0;
    }
}

/// Per-file allocation state: two aggregators plus one free list per
/// mapped allocation category.
pub struct FileSpace {
    meta_aggr: Aggregator,
    sdata_aggr: Aggregator,
    free_lists: [Vec<FreeBlock>; N_MEM_TYPES],
}

impl FileSpace {
    pub fn new(meta_block_size: u64, small_data_block_size: u64) -> Self {
        FileSpace {
            meta_aggr: Aggregator::new(meta_block_size),
            sdata_aggr: Aggregator::new(small_data_block_size),
            free_lists: Default::default(),
        }
    }

    /// Allocate `size` bytes for `mem`, returning the start address.
    pub fn allocate(&mut self, handle: &mut DriverHandle, mem: MemType, size: u64) -> Result<Addr> {
        if size == 0 {
            return Err(VfdError::NoSpace("zero-size allocation"));
        }

        // Drivers that manage their own address space go first.
        if let Some(addr) = handle.driver_alloc(mem, size)? {
            return Ok(addr);
        }

        let map = handle.class().free_list_map();
        if let Some(addr) = self.free_list_take(&map, mem, size) {
            return Ok(addr);
        }

        let flags = handle.query();
        if mem.is_metadata() && flags.contains(FeatureFlags::AGGREGATE_METADATA) {
            self.aggr_alloc(true, handle, &map, mem, size)
        } else if mem == MemType::Raw && flags.contains(FeatureFlags::AGGREGATE_SMALLDATA) {
            self.aggr_alloc(false, handle, &map, mem, size)
        } else {
            let (addr, frag) = eoa_alloc(handle, size)?;
            self.recycle(&map, mem, frag);
            Ok(addr)
        }
    }

    /// Return a range to its category's free list. The driver's own
    /// deallocation hook is consulted first, mirroring the allocation
    /// order. Categories outside the class's mapping leak the space at
    /// this layer; a higher-level free space manager may reclaim it from
    /// the file format's own structures.
    pub fn deallocate(
        &mut self,
        handle: &mut DriverHandle,
        mem: MemType,
        addr: Addr,
        size: u64,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        addr_checked_add(addr, size)?;
        if handle.driver_free(mem, addr, size)? {
            return Ok(());
        }
        let map = handle.class().free_list_map();
        self.recycle(&map, mem, Some(FreeBlock { addr, size }));
        Ok(())
    }

    /// Hand both aggregator tails back before close. A tail that abuts EOA
    /// shrinks the marker so truncation lands on the true allocated size;
    /// anything else goes to the free lists. Every step runs even if an
    /// earlier one fails; the first error is reported.
    pub fn free_aggregators(&mut self, handle: &mut DriverHandle) -> Result<()> {
        let mut first_err = None;
        for meta in [true, false] {
            let (addr, left) = {
                let a = if meta { &self.meta_aggr } else { &self.sdata_aggr };
                (a.addr, a.left)
            };
            if left > 0 {
                let eoa = handle.get_eoa(MemType::Default);
                if addr + left == eoa {
                    if let Err(e) = handle.set_eoa(MemType::Default, addr) {
                        first_err.get_or_insert(e);
                    }
                } else {
                    let map = handle.class().free_list_map();
                    let mem = if meta { MemType::Default } else { MemType::Raw };
                    self.recycle(&map, mem, Some(FreeBlock { addr, size: left }));
                }
            }
            let a = if meta { &mut self.meta_aggr } else { &mut self.sdata_aggr };
            a.reset();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// First fit with split against the mapped category's free list.
    fn free_list_take(&mut self, map: &FreeListMap, mem: MemType, size: u64) -> Option<Addr> {
        let cat = map.map(mem)?;
        let list = &mut self.free_lists[cat.index()];
        let i = list.iter().position(|b| b.size >= size)?;
        let block = list[i];
        if block.size == size {
            list.remove(i);
        } else {
            list[i].addr += size;
            list[i].size -= size;
        }
        Some(block.addr)
    }

    fn recycle(&mut self, map: &FreeListMap, mem: MemType, block: Option<FreeBlock>) {
        let Some(block) = block else { return };
        match map.map(mem) {
            Some(cat) => self.free_lists[cat.index()].push(block),
            None => debug!(
                "leaking {} bytes at {:#x}: no free list for {:?}",
                block.size, block.addr, mem
            ),
        }
    }

    fn aggr_alloc(
        &mut self,
        meta: bool,
        handle: &mut DriverHandle,
        map: &FreeListMap,
        mem: MemType,
        size: u64,
    ) -> Result<Addr> {
        let block_size = if meta { self.meta_aggr.block_size } else { self.sdata_aggr.block_size };

        // Oversized requests bypass the aggregator entirely.
        if size >= block_size {
            let (addr, frag) = eoa_alloc(handle, size)?;
            self.recycle(map, mem, frag);
            return Ok(addr);
        }

        let (cur_addr, cur_left) = {
            let a = if meta { &self.meta_aggr } else { &self.sdata_aggr };
            (a.addr, a.left)
        };
        if cur_left < size {
            let (blk, frag) = eoa_alloc(handle, block_size)?;
            self.recycle(map, mem, frag);
            let a = if meta { &mut self.meta_aggr } else { &mut self.sdata_aggr };
            if cur_left > 0 && cur_addr + cur_left == blk {
                // The old block sat at EOA; the new span extends it in place.
                a.left += block_size;
            } else {
                a.addr = blk;
                a.left = block_size;
                if cur_left > 0 {
                    self.recycle(map, mem, Some(FreeBlock { addr: cur_addr, size: cur_left }));
                }
            }
        }

        let a = if meta { &mut self.meta_aggr } else { &mut self.sdata_aggr };
        let out = a.addr;
        a.addr += size;
        a.left -= size;
        Ok(out)
    }
}

/// Extend the end-of-allocation marker by `size`, honoring the alignment
/// hints, and return the prior (possibly aligned-up) marker plus any
/// alignment fragment. Failure leaves the marker untouched.
fn eoa_alloc(handle: &mut DriverHandle, size: u64) -> Result<(Addr, Option<FreeBlock>)> {
    let eoa = handle.get_eoa(MemType::Default);
    let alignment = handle.alignment();
    let (addr, frag) = if alignment > 1 && size >= handle.alignment_threshold() {
        let mis = eoa % alignment;
        if mis != 0 {
            let pad = alignment - mis;
            (addr_checked_add(eoa, pad)?, Some(FreeBlock { addr: eoa, size: pad }))
        } else {
            (eoa, None)
        }
    } else {
        (eoa, None)
    };
    let end = addr_checked_add(addr, size)?;
    handle.set_eoa(MemType::Default, end)?;
    Ok((addr, frag))
}
