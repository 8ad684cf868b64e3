//! Process-wide driver class registry.
//!
//! Driver classes register once and are handed out by opaque integer id.
//! The registry keeps its own reference on each class; every open driver
//! instance holds another, so unregistering a driver has no effect on files
//! already open with it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use log::warn;

use crate::addr::addr_defined;
use crate::error::{Result, VfdError};
use crate::vfd::DriverClass;

/// Opaque handle to a registered driver class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DriverId(u64);

struct Entry {
    class: Arc<dyn DriverClass>,
    /// Registry reference plus one per open driver instance.
    refs: u32,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<DriverId, Entry>,
    next_id: u64,
}

/// The registry singleton. All access goes through [`DriverRegistry::global`].
pub struct DriverRegistry {
    inner: Mutex<Inner>,
    serial: AtomicU64,
}

static REGISTRY: OnceLock<DriverRegistry> = OnceLock::new();

impl DriverRegistry {
    pub fn global() -> &'static DriverRegistry {
        REGISTRY.get_or_init(|| DriverRegistry {
            inner: Mutex::new(Inner::default()),
            serial: AtomicU64::new(0),
        })
    }

    /// Register a driver class, validating the descriptor invariants.
    ///
    /// Mandatory callbacks are trait methods and thus checked by the
    /// compiler; what remains is the descriptor data itself.
    pub fn register(&self, class: Arc<dyn DriverClass>) -> Result<DriverId> {
        if class.name().is_empty() {
            return Err(VfdError::DriverContractViolation("empty driver name"));
        }
        if class.maxaddr() == 0 || !addr_defined(class.maxaddr()) {
            return Err(VfdError::DriverContractViolation(
                "zero or undefined driver maximum address",
            ));
        }
        class.free_list_map().validate()?;

        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = DriverId(inner.next_id);
        inner.entries.insert(id, Entry { class, refs: 1 });
        Ok(id)
    }

    /// Drop the registry's reference on a class. Open files keep it alive
    /// through their own references.
    pub fn unregister(&self, id: DriverId) -> Result<()> {
        self.dec_ref(id)
    }

    /// Look up a class by id without taking a reference.
    pub fn resolve(&self, id: DriverId) -> Result<Arc<dyn DriverClass>> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&id)
            .map(|e| Arc::clone(&e.class))
            .ok_or(VfdError::BadArgument("unknown driver id"))
    }

    /// Take an open-instance reference on a class, keeping its id alive for
    /// the lifetime of the instance.
    pub fn inc_ref(&self, id: DriverId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(VfdError::BadArgument("unknown driver id"))?;
        entry.refs += 1;
        Ok(())
    }

    /// Release a reference; the id disappears when the count hits zero.
    pub fn dec_ref(&self, id: DriverId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(VfdError::BadArgument("unknown driver id"))?;
        entry.refs -= 1;
        if entry.refs == 0 {
            let entry = inner.entries.remove(&id).unwrap();
            if Arc::strong_count(&entry.class) > 1 {
                warn!(
                    "driver class '{}' released from registry while still referenced",
                    entry.class.name()
                );
            }
        }
        Ok(())
    }

    /// Next process-wide instance serial number. Disambiguates instances
    /// when a driver cannot itself detect "same file".
    pub fn next_serial(&self) -> u64 {
        self.serial.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfd::memory::MemoryDriver;

    #[test]
    fn test_register_resolve_unregister() {
        let reg = DriverRegistry::global();
        let id = reg.register(Arc::new(MemoryDriver::new())).unwrap();
        assert_eq!(reg.resolve(id).unwrap().name(), "memory");
        reg.unregister(id).unwrap();
        assert!(reg.resolve(id).is_err());
    }

    #[test]
    fn test_open_instance_ref_outlives_unregister() {
        let reg = DriverRegistry::global();
        let id = reg.register(Arc::new(MemoryDriver::new())).unwrap();
        reg.inc_ref(id).unwrap();
        reg.unregister(id).unwrap();
        // Still resolvable: an "open instance" holds a reference.
        assert!(reg.resolve(id).is_ok());
        reg.dec_ref(id).unwrap();
        assert!(reg.resolve(id).is_err());
    }

    #[test]
    fn test_serials_are_unique() {
        let reg = DriverRegistry::global();
        let a = reg.next_serial();
        let b = reg.next_serial();
        assert_ne!(a, b);
    }
}
