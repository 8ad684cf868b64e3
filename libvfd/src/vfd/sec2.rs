//! Local-disk driver: unbuffered positional I/O over a POSIX file.
//!
//! Comparable across instances through the (device, inode) pair, which is
//! what lets the lifecycle manager detect two opens of one physical file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;

use crate::addr::{ADDR_UNDEF, Addr, addr_defined};
use crate::config::FileAccessConfig;
use crate::error::{Result, VfdError};
use crate::vfd::{CloseDegree, DriverClass, DriverFile, FeatureFlags, MemType, OpenFlags};

pub struct Sec2Driver {
    maxaddr: Addr,
}

impl Sec2Driver {
    pub fn new() -> Self {
        Sec2Driver { maxaddr: ADDR_UNDEF - 1 }
    }
}

impl Default for Sec2Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverClass for Sec2Driver {
    fn name(&self) -> &str {
        "sec2"
    }

    fn maxaddr(&self) -> Addr {
        self.maxaddr
    }

    fn default_close_degree(&self) -> CloseDegree {
        CloseDegree::Weak
    }

    fn query(&self) -> FeatureFlags {
        FeatureFlags::AGGREGATE_METADATA
            | FeatureFlags::ACCUMULATE_METADATA
            | FeatureFlags::AGGREGATE_SMALLDATA
    }

    fn is_comparable(&self) -> bool {
        true
    }

    fn supports_locking(&self) -> bool {
        true
    }

    fn open(
        &self,
        name: &str,
        flags: OpenFlags,
        _config: &FileAccessConfig,
        _maxaddr: Addr,
    ) -> Result<Box<dyn DriverFile>> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(flags.contains(OpenFlags::RDWR));
        if flags.contains(OpenFlags::EXCL) {
            opts.create_new(true);
        } else if flags.contains(OpenFlags::CREAT) {
            opts.create(true);
        }
        if flags.contains(OpenFlags::TRUNC) {
            opts.truncate(true);
        }
        let file = opts.open(name)?;
        let meta = file.metadata()?;
        Ok(Box::new(Sec2File {
            eoa: 0,
            eof: meta.len(),
            device: meta.dev(),
            inode: meta.ino(),
            file,
        }))
    }
}

struct Sec2File {
    file: File,
    eoa: Addr,
    eof: Addr,
    device: u64,
    inode: u64,
}

impl DriverFile for Sec2File {
    fn read(&mut self, _mem: MemType, addr: Addr, buf: &mut [u8]) -> Result<()> {
        // Reads past the physical EOF are legal while addr+len stays under
        // EOA; the missing tail reads as zeroes.
        let mut off = addr;
        let mut rest = &mut buf[..];
        while !rest.is_empty() {
            let n = self.file.read_at(rest, off)?;
            if n == 0 {
                rest.fill(0);
                break;
            }
            off += n as Addr;
            rest = &mut rest[n..];
        }
        Ok(())
    }

    fn write(&mut self, _mem: MemType, addr: Addr, buf: &[u8]) -> Result<()> {
        self.file.write_all_at(buf, addr)?;
        self.eof = self.eof.max(addr + buf.len() as Addr);
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
        self.eof
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn cmp_key(&self) -> Option<Box<[u8]>> {
        let mut key = Vec::with_capacity(16);
        key.extend_from_slice(&self.device.to_be_bytes());
        key.extend_from_slice(&self.inode.to_be_bytes());
        Some(key.into_boxed_slice())
    }

    fn truncate(&mut self, _closing: bool) -> Result<()> {
        if !addr_defined(self.eoa) {
            return Err(VfdError::BadArgument("undefined end-of-allocation"));
        }
        if self.eof != self.eoa {
            self.file.set_len(self.eoa)?;
            self.eof = self.eoa;
        }
        Ok(())
    }

    fn flush(&mut self, _closing: bool) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn lock(&mut self, exclusive: bool) -> Result<()> {
        let op = if exclusive { libc::LOCK_EX } else { libc::LOCK_SH } | libc::LOCK_NB;
        // SAFETY: fd is owned by `self.file` and valid for its lifetime.
        if unsafe { libc::flock(self.file.as_raw_fd(), op) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    fn unlock(&mut self) -> Result<()> {
        // SAFETY: as above.
        if unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) } < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FileAccessConfig {
        use crate::vfd::registry::DriverRegistry;
        use std::sync::Arc;
        let id = DriverRegistry::global()
            .register(Arc::new(Sec2Driver::new()))
            .unwrap();
        FileAccessConfig::new(id)
    }

    #[test]
    fn test_create_write_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.bin");
        let cfg = config();
        let drv = Sec2Driver::new();
        let mut f = drv
            .open(
                path.to_str().unwrap(),
                OpenFlags::CREAT | OpenFlags::RDWR,
                &cfg,
                ADDR_UNDEF,
            )
            .unwrap();
        f.write(MemType::Default, 10, b"hello").unwrap();
        assert_eq!(f.get_eof(), 15);
        let mut buf = [0u8; 5];
        f.read(MemType::Default, 10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        // Past-EOF tail reads as zeroes.
        let mut buf = [0xffu8; 8];
        f.read(MemType::Default, 12, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"llo");
        assert_eq!(&buf[3..], &[0u8; 5]);
        f.close().unwrap();
    }

    #[test]
    fn test_cmp_key_matches_same_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("same.bin");
        let cfg = config();
        let drv = Sec2Driver::new();
        let a = drv
            .open(path.to_str().unwrap(), OpenFlags::CREAT | OpenFlags::RDWR, &cfg, ADDR_UNDEF)
            .unwrap();
        let b = drv
            .open(path.to_str().unwrap(), OpenFlags::RDWR, &cfg, ADDR_UNDEF)
            .unwrap();
        assert_eq!(a.cmp_key(), b.cmp_key());
        let other = tmp.path().join("other.bin");
        let c = drv
            .open(other.to_str().unwrap(), OpenFlags::CREAT | OpenFlags::RDWR, &cfg, ADDR_UNDEF)
            .unwrap();
        assert_ne!(a.cmp_key(), c.cmp_key());
    }

    #[test]
    fn test_excl_refuses_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.bin");
        std::fs::write(&path, b"").unwrap();
        let cfg = config();
        let err = Sec2Driver::new()
            .open(
                path.to_str().unwrap(),
                OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::RDWR,
                &cfg,
                ADDR_UNDEF,
            )
            .err()
            .unwrap();
        assert!(matches!(err, VfdError::Io(_)));
    }

    #[test]
    fn test_truncate_shrinks_to_eoa() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t.bin");
        let cfg = config();
        let mut f = Sec2Driver::new()
            .open(path.to_str().unwrap(), OpenFlags::CREAT | OpenFlags::RDWR, &cfg, ADDR_UNDEF)
            .unwrap();
        f.write(MemType::Default, 0, &[1u8; 100]).unwrap();
        f.set_eoa(MemType::Default, 40).unwrap();
        f.truncate(true).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 40);
    }
}
