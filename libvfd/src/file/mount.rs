//! Mount hierarchy.
//!
//! Files can be mounted under other files, forming a rooted tree: the
//! parent owns the child links, the child keeps a non-owning back-reference
//! to its parent. Close-degree decisions count open files and objects over
//! the whole tree, starting from the topmost parent, so a deferral anywhere
//! in the hierarchy is observed everywhere.

use crate::error::{Result, VfdError};
use crate::file::{FileId, FileManager};

impl FileManager {
    /// Mount `child` under `parent`. A file can sit under at most one
    /// parent, and the tree stays acyclic by construction.
    pub fn mount(&mut self, parent: FileId, child: FileId) -> Result<()> {
        if parent == child {
            return Err(VfdError::BadArgument("cannot mount a file under itself"));
        }
        self.live(parent)?;
        if self.live(child)?.parent.is_some() {
            return Err(VfdError::BadArgument("file is already mounted"));
        }
        // Walk the ancestors of the parent; meeting the child would close a
        // cycle.
        let mut cur = Some(parent);
        while let Some(id) = cur {
            if id == child {
                return Err(VfdError::BadArgument("mount would create a cycle"));
            }
            cur = self.handles.get(&id).and_then(|r| r.parent);
        }
        if let Some(p) = self.handles.get_mut(&parent) {
            p.children.push(child);
        }
        if let Some(c) = self.handles.get_mut(&child) {
            c.parent = Some(parent);
        }
        Ok(())
    }

    /// Detach `child` from `parent`. Unmounting can unblock a deferred
    /// close elsewhere in the old hierarchy, so deferred handles are
    /// re-attempted afterwards.
    pub fn unmount(&mut self, parent: FileId, child: FileId) -> Result<()> {
        {
            let c = self
                .handles
                .get(&child)
                .ok_or(VfdError::BadArgument("unknown file handle"))?;
            if c.parent != Some(parent) {
                return Err(VfdError::BadArgument("file is not mounted under that parent"));
            }
        }
        if let Some(c) = self.handles.get_mut(&child) {
            c.parent = None;
        }
        if let Some(p) = self.handles.get_mut(&parent) {
            p.children.retain(|x| *x != child);
        }
        self.sweep();
        Ok(())
    }

    /// Root of the mount tree containing `file`.
    pub(crate) fn topmost(&self, file: FileId) -> FileId {
        let mut cur = file;
        while let Some(p) = self.handles.get(&cur).and_then(|r| r.parent) {
            cur = p;
        }
        cur
    }

    /// Count open file handles and open objects across the tree rooted at
    /// `top`. Released (deferred, closing) handles don't count as open
    /// files, but their objects still pin the hierarchy.
    pub(crate) fn count_open(&self, top: FileId) -> (u32, u32) {
        let mut files = 0;
        let mut objs = 0;
        let mut stack = vec![top];
        while let Some(id) = stack.pop() {
            if let Some(rec) = self.handles.get(&id) {
                if !rec.deferred && !rec.closing {
                    files += 1;
                }
                objs += rec.objects.len() as u32;
                stack.extend(rec.children.iter().copied());
            }
        }
        (files, objs)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::FileAccessConfig;
    use crate::file::FileManager;
    use crate::vfd::memory::MemoryDriver;
    use crate::vfd::registry::DriverRegistry;
    use crate::vfd::OpenFlags;

    fn mgr_with_files(n: usize) -> (FileManager, Vec<crate::file::FileId>) {
        let id = DriverRegistry::global()
            .register(Arc::new(MemoryDriver::new()))
            .unwrap();
        let cfg = FileAccessConfig::new(id);
        let mut mgr = FileManager::new();
        let files = (0..n)
            .map(|i| {
                mgr.open(&format!("f{}", i), OpenFlags::CREAT | OpenFlags::RDWR, &cfg)
                    .unwrap()
            })
            .collect();
        (mgr, files)
    }

    #[test]
    fn test_mount_links_and_counts() {
        let (mut mgr, f) = mgr_with_files(3);
        mgr.mount(f[0], f[1]).unwrap();
        mgr.mount(f[1], f[2]).unwrap();
        assert_eq!(mgr.topmost(f[2]), f[0]);
        assert_eq!(mgr.count_open(f[0]), (3, 0));
        let obj = mgr.open_object(f[2]).unwrap();
        assert_eq!(mgr.count_open(f[0]), (3, 1));
        mgr.close_object(f[2], obj).unwrap();
        assert_eq!(mgr.count_open(f[0]), (3, 0));
    }

    #[test]
    fn test_double_mount_rejected() {
        let (mut mgr, f) = mgr_with_files(3);
        mgr.mount(f[0], f[2]).unwrap();
        assert!(mgr.mount(f[1], f[2]).is_err());
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut mgr, f) = mgr_with_files(3);
        mgr.mount(f[0], f[1]).unwrap();
        mgr.mount(f[1], f[2]).unwrap();
        assert!(mgr.mount(f[2], f[0]).is_err());
        assert!(mgr.mount(f[0], f[0]).is_err());
    }

    #[test]
    fn test_unmount_requires_matching_parent() {
        let (mut mgr, f) = mgr_with_files(3);
        mgr.mount(f[0], f[1]).unwrap();
        assert!(mgr.unmount(f[2], f[1]).is_err());
        mgr.unmount(f[0], f[1]).unwrap();
        assert_eq!(mgr.topmost(f[1]), f[1]);
    }
}
