//! In-memory driver: a growable buffer backend for development and tests.
//!
//! Every open creates a fresh buffer, so the driver cannot detect that two
//! opens refer to the same file and reports itself as non-comparable. It is
//! the only bundled driver that accepts an initial file image.

use crate::addr::{ADDR_UNDEF, Addr, addr_defined};
use crate::config::FileAccessConfig;
use crate::error::{Result, VfdError};
use crate::vfd::{DriverClass, DriverFile, FeatureFlags, MemType, OpenFlags};

pub struct MemoryDriver {
    maxaddr: Addr,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver { maxaddr: ADDR_UNDEF - 1 }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverClass for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn maxaddr(&self) -> Addr {
        self.maxaddr
    }

    fn query(&self) -> FeatureFlags {
        FeatureFlags::AGGREGATE_METADATA
            | FeatureFlags::ACCUMULATE_METADATA
            | FeatureFlags::AGGREGATE_SMALLDATA
            | FeatureFlags::ALLOW_FILE_IMAGE
    }

    fn open(
        &self,
        _name: &str,
        flags: OpenFlags,
        config: &FileAccessConfig,
        _maxaddr: Addr,
    ) -> Result<Box<dyn DriverFile>> {
        let buf = match (&config.file_image, flags.contains(OpenFlags::TRUNC)) {
            (Some(image), false) => image.to_vec(),
            _ => Vec::new(),
        };
        Ok(Box::new(MemoryFile {
            buf,
            eoa: 0,
            writable: flags.contains(OpenFlags::RDWR),
        }))
    }
}

struct MemoryFile {
    buf: Vec<u8>,
    eoa: Addr,
    writable: bool,
}

impl DriverFile for MemoryFile {
    fn read(&mut self, _mem: MemType, addr: Addr, buf: &mut [u8]) -> Result<()> {
        let start = addr as usize;
        let end = start + buf.len();
        // Reads past the written extent return zeroes (unwritten holes).
        let avail = self.buf.len().clamp(start, end);
        buf[..avail - start].copy_from_slice(&self.buf[start..avail]);
        buf[avail - start..].fill(0);
        Ok(())
    }

    fn write(&mut self, _mem: MemType, addr: Addr, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(VfdError::IoFailure("write on read-only memory file".into()));
        }
        let start = addr as usize;
        let end = start + buf.len();
        if self.buf.len() < end {
            self.buf.resize(end, 0);
        }
        self.buf[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn get_eoa(&self, _mem: MemType) -> Addr {
        self.eoa
    }

    fn set_eoa(&mut self, _mem: MemType, addr: Addr) -> Result<()> {
        self.eoa = addr;
        Ok(())
    }

    fn get_eof(&self) -> Addr {
        self.buf.len() as Addr
    }

    fn close(&mut self) -> Result<()> {
        self.buf = Vec::new();
        Ok(())
    }

    fn truncate(&mut self, _closing: bool) -> Result<()> {
        if !addr_defined(self.eoa) {
            return Err(VfdError::BadArgument("undefined end-of-allocation"));
        }
        self.buf.truncate(self.eoa as usize);
        if (self.buf.len() as Addr) < self.eoa {
            self.buf.resize(self.eoa as usize, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn open_rw(config: &FileAccessConfig) -> Box<dyn DriverFile> {
        MemoryDriver::new()
            .open("m", OpenFlags::CREAT | OpenFlags::RDWR, config, ADDR_UNDEF)
            .unwrap()
    }

    #[test]
    fn test_holes_read_zero() {
        let config = FileAccessConfig::new(crate::vfd::registry::DriverRegistry::global()
            .register(Arc::new(MemoryDriver::new()))
            .unwrap());
        let mut f = open_rw(&config);
        f.write(MemType::Default, 100, b"xyz").unwrap();
        let mut buf = [1u8; 8];
        f.read(MemType::Default, 0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
        let mut buf = [0u8; 3];
        f.read(MemType::Default, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn test_file_image_is_initial_contents() {
        let reg = crate::vfd::registry::DriverRegistry::global();
        let id = reg.register(Arc::new(MemoryDriver::new())).unwrap();
        let config = FileAccessConfig::new(id)
            .with_file_image(Arc::from(b"seeded".to_vec().into_boxed_slice()));
        let mut f = open_rw(&config);
        assert_eq!(f.get_eof(), 6);
        let mut buf = [0u8; 6];
        f.read(MemType::Default, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"seeded");
        // Truncating opens discard the image.
        let mut f = MemoryDriver::new()
            .open("m", OpenFlags::RDWR | OpenFlags::TRUNC, &config, ADDR_UNDEF)
            .unwrap();
        assert_eq!(f.get_eof(), 0);
        f.close().unwrap();
    }

    #[test]
    fn test_truncate_to_eoa() {
        let config = FileAccessConfig::new(crate::vfd::registry::DriverRegistry::global()
            .register(Arc::new(MemoryDriver::new()))
            .unwrap());
        let mut f = open_rw(&config);
        f.write(MemType::Default, 0, &[7u8; 256]).unwrap();
        f.set_eoa(MemType::Default, 64).unwrap();
        f.truncate(true).unwrap();
        assert_eq!(f.get_eof(), 64);
    }
}
