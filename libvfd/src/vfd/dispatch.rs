//! VFD dispatch layer.
//!
//! [`DriverHandle`] wraps one open driver instance and routes every
//! operation to the registered class's callbacks. Callers use absolute
//! addresses; the per-instance base address is subtracted before a driver
//! sees an address and added back to anything the driver returns.

use std::cmp::Ordering;
use std::sync::Arc;

use log::debug;

use crate::addr::{Addr, addr_checked_add, addr_defined};
use crate::config::FileAccessConfig;
use crate::error::{Result, VfdError};
use crate::vfd::registry::{DriverId, DriverRegistry};
use crate::vfd::{CollectiveFile, DriverClass, DriverFile, FeatureFlags, MemType, OpenFlags};

/// One open low-level file, dispatching through its driver class.
pub struct DriverHandle {
    file: Box<dyn DriverFile>,
    class: Arc<dyn DriverClass>,
    driver_id: DriverId,
    maxaddr: Addr,
    base_addr: Addr,
    alignment: u64,
    alignment_threshold: u64,
    feature_flags: FeatureFlags,
    serial: u64,
}

impl DriverHandle {
    /// Open a file through the driver named by `config`.
    ///
    /// `maxaddr_cap` caps the address space; pass
    /// [`ADDR_UNDEF`](crate::addr::ADDR_UNDEF) to use the class's own
    /// maximum.
    pub fn open(
        name: &str,
        flags: OpenFlags,
        config: &FileAccessConfig,
        maxaddr_cap: Addr,
    ) -> Result<DriverHandle> {
        if name.is_empty() {
            return Err(VfdError::BadArgument("empty file name"));
        }
        let registry = DriverRegistry::global();
        let class = registry.resolve(config.driver)?;

        // File-inspecific flags gate the initial-image feature before the
        // driver ever sees the image.
        let class_flags = class.query();
        if config.file_image.is_some() && !class_flags.contains(FeatureFlags::ALLOW_FILE_IMAGE) {
            return Err(VfdError::DriverContractViolation(
                "file image set, but not supported by driver",
            ));
        }

        let maxaddr = if addr_defined(maxaddr_cap) {
            maxaddr_cap.min(class.maxaddr())
        } else {
            class.maxaddr()
        };
        if maxaddr == 0 {
            return Err(VfdError::BadArgument("zero format address range"));
        }

        let file = class.open(name, flags, config, maxaddr)?;

        // The instance keeps the class id alive for as long as it is open.
        registry.inc_ref(config.driver)?;
        let serial = registry.next_serial();
        debug!("vfd open '{}' driver={} serial={}", name, class.name(), serial);

        Ok(DriverHandle {
            file,
            class,
            driver_id: config.driver,
            maxaddr,
            // Changed later, once the superblock is located.
            base_addr: 0,
            alignment: config.alignment.max(1),
            alignment_threshold: config.alignment_threshold.max(1),
            feature_flags: class_flags,
            serial,
        })
    }

    /// Close the instance. Teardown is maximally effective: the registry
    /// hold is released and the driver close callback runs even if an
    /// earlier step failed; the first error wins.
    pub fn close(mut self) -> Result<()> {
        debug!("vfd close driver={} serial={}", self.class.name(), self.serial);
        let mut first_err = None;
        if let Err(e) = DriverRegistry::global().dec_ref(self.driver_id) {
            first_err.get_or_insert(e);
        }
        if let Err(e) = self.file.close() {
            first_err.get_or_insert(e);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Total-order comparison of two (possibly absent) instances. Never
    /// fails: no driver sorts first, then class identity, then the driver's
    /// comparison key, then instance serial number.
    pub fn cmp_files(a: Option<&DriverHandle>, b: Option<&DriverHandle>) -> Ordering {
        let (a, b) = match (a, b) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(a), Some(b)) => (a, b),
        };
        match a.driver_id.cmp(&b.driver_id) {
            Ordering::Equal => {}
            other => return other,
        }
        match (a.file.cmp_key(), b.file.cmp_key()) {
            (Some(ka), Some(kb)) => ka.cmp(&kb),
            _ => a.serial.cmp(&b.serial),
        }
    }

    pub fn query(&self) -> FeatureFlags {
        self.feature_flags
    }

    pub fn read(&mut self, mem: MemType, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let rel = self.check_region(mem, addr, buf.len() as u64)?;
        self.file.read(mem, rel, buf)
    }

    pub fn write(&mut self, mem: MemType, addr: Addr, buf: &[u8]) -> Result<()> {
        let rel = self.check_region(mem, addr, buf.len() as u64)?;
        self.file.write(mem, rel, buf)
    }

    /// End-of-allocation marker, as an absolute address.
    pub fn get_eoa(&self, mem: MemType) -> Addr {
        let eoa = self.file.get_eoa(mem);
        if addr_defined(eoa) { eoa + self.base_addr } else { eoa }
    }

    pub fn set_eoa(&mut self, mem: MemType, addr: Addr) -> Result<()> {
        if !addr_defined(addr) {
            return Err(VfdError::BadArgument("undefined end-of-allocation"));
        }
        let rel = self.to_relative(addr)?;
        if rel > self.maxaddr {
            return Err(VfdError::AddressOverflow { addr, size: 0 });
        }
        self.file.set_eoa(mem, rel)
    }

    /// Actual extent of the underlying storage, as an absolute address.
    pub fn get_eof(&self) -> Addr {
        let eof = self.file.get_eof();
        if addr_defined(eof) { eof + self.base_addr } else { eof }
    }

    pub fn flush(&mut self, closing: bool) -> Result<()> {
        self.file.flush(closing)
    }

    pub fn truncate(&mut self, closing: bool) -> Result<()> {
        self.file.truncate(closing)
    }

    pub fn lock(&mut self, exclusive: bool) -> Result<()> {
        self.file.lock(exclusive)
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.file.unlock()
    }

    /// Driver-level allocation hook, base-address compensated.
    pub fn driver_alloc(&mut self, mem: MemType, size: u64) -> Result<Option<Addr>> {
        Ok(self.file.alloc(mem, size)?.map(|rel| rel + self.base_addr))
    }

    /// Driver-level deallocation hook, base-address compensated.
    pub fn driver_free(&mut self, mem: MemType, addr: Addr, size: u64) -> Result<bool> {
        let rel = self.to_relative(addr)?;
        self.file.free(mem, rel, size)
    }

    pub fn collective(&self) -> Option<&dyn CollectiveFile> {
        self.file.collective()
    }

    pub fn class(&self) -> &Arc<dyn DriverClass> {
        &self.class
    }

    pub fn driver_id(&self) -> DriverId {
        self.driver_id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn maxaddr(&self) -> Addr {
        self.maxaddr
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    pub fn alignment_threshold(&self) -> u64 {
        self.alignment_threshold
    }

    pub fn base_addr(&self) -> Addr {
        self.base_addr
    }

    /// Relocate the instance's address space (set once the superblock is
    /// located).
    pub fn set_base_addr(&mut self, addr: Addr) -> Result<()> {
        if !addr_defined(addr) {
            return Err(VfdError::BadArgument("undefined base address"));
        }
        self.base_addr = addr;
        Ok(())
    }

    fn to_relative(&self, addr: Addr) -> Result<Addr> {
        if !addr_defined(addr) {
            return Err(VfdError::BadArgument("undefined address"));
        }
        addr.checked_sub(self.base_addr)
            .ok_or(VfdError::BadArgument("address below instance base address"))
    }

    /// Validate an I/O region against EOA and return the driver-relative
    /// start address.
    fn check_region(&self, mem: MemType, addr: Addr, len: u64) -> Result<Addr> {
        let rel = self.to_relative(addr)?;
        let end = addr_checked_add(rel, len)?;
        let eoa = self.file.get_eoa(mem);
        if !addr_defined(eoa) || end > eoa {
            return Err(VfdError::AddressOverflow { addr, size: len });
        }
        Ok(rel)
    }
}
