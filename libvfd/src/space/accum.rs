//! Metadata write accumulator.
//!
//! Buffers small metadata writes in one in-memory dirty region so repeated
//! superblock and header updates do not each hit the driver. Contiguous or
//! overlapping writes merge into the region; a disjoint write flushes the
//! region first. Reads are overlaid with the buffered bytes. Only active
//! for drivers that advertise `ACCUMULATE_METADATA`.

use crate::addr::{Addr, addr_checked_add};
use crate::error::Result;
use crate::vfd::dispatch::DriverHandle;
use crate::vfd::MemType;

/// Regions past this size are written through instead of buffered.
const MAX_REGION: u64 = 1 << 20;

pub struct Accumulator {
    enabled: bool,
    addr: Addr,
    buf: Vec<u8>,
    mem: MemType,
    dirty: bool,
}

impl Accumulator {
    pub fn new(enabled: bool) -> Self {
        Accumulator {
            enabled,
            addr: 0,
            buf: Vec::new(),
            mem: MemType::Default,
            dirty: false,
        }
    }

    pub fn write(
        &mut self,
        handle: &mut DriverHandle,
        mem: MemType,
        addr: Addr,
        data: &[u8],
    ) -> Result<()> {
        if !self.enabled || !mem.is_metadata() {
            return handle.write(mem, addr, data);
        }
        let w_end = addr_checked_add(addr, data.len() as u64)?;
        if data.len() as u64 >= MAX_REGION {
            self.flush(handle)?;
            return handle.write(mem, addr, data);
        }

        if self.buf.is_empty() {
            self.start_region(mem, addr, data);
            return Ok(());
        }

        let r_start = self.addr;
        let r_end = self.addr + self.buf.len() as u64;
        if addr <= r_end && w_end >= r_start {
            let new_start = r_start.min(addr);
            let new_end = r_end.max(w_end);
            if new_end - new_start > MAX_REGION {
                self.flush(handle)?;
                self.start_region(mem, addr, data);
                return Ok(());
            }
            let mut merged = vec![0u8; (new_end - new_start) as usize];
            let r_off = (r_start - new_start) as usize;
            merged[r_off..r_off + self.buf.len()].copy_from_slice(&self.buf);
            let w_off = (addr - new_start) as usize;
            merged[w_off..w_off + data.len()].copy_from_slice(data);
            self.addr = new_start;
            self.buf = merged;
            self.dirty = true;
        } else {
            self.flush(handle)?;
            self.start_region(mem, addr, data);
        }
        Ok(())
    }

    /// Read through the accumulator: the driver result is overlaid with any
    /// overlap of the buffered region.
    pub fn read(
        &mut self,
        handle: &mut DriverHandle,
        mem: MemType,
        addr: Addr,
        out: &mut [u8],
    ) -> Result<()> {
        handle.read(mem, addr, out)?;
        if !self.enabled || self.buf.is_empty() || !mem.is_metadata() {
            return Ok(());
        }
        let r_start = self.addr;
        let r_end = self.addr + self.buf.len() as u64;
        let o_start = addr;
        let o_end = addr + out.len() as u64;
        if o_start < r_end && o_end > r_start {
            let start = r_start.max(o_start);
            let end = r_end.min(o_end);
            let src = (start - r_start) as usize..(end - r_start) as usize;
            let dst = (start - o_start) as usize..(end - o_start) as usize;
            out[dst].copy_from_slice(&self.buf[src.clone()]);
        }
        Ok(())
    }

    /// Write the dirty region out. The clean buffer is kept for reads.
    pub fn flush(&mut self, handle: &mut DriverHandle) -> Result<()> {
        if self.dirty && !self.buf.is_empty() {
            handle.write(self.mem, self.addr, &self.buf)?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Drop the buffered region without writing it.
    pub fn reset(&mut self) {
        self.buf = Vec::new();
        self.dirty = false;
    }

    fn start_region(&mut self, mem: MemType, addr: Addr, data: &[u8]) {
        self.addr = addr;
        self.buf = data.to_vec();
        self.mem = mem;
        self.dirty = true;
    }
}
