/// Mount table and filesystem mounting
///
/// Manages mounted filesystems and provides root access.

use super::inode::{Ino, Inode};
use crate::lib::error::Errno;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::string::String;
use alloc::vec::Vec;
use spin::RwLock;

/// Mount point
#[derive(Clone)]
pub struct Mount {
    pub fs_type: &'static str,
    pub root: Arc<Inode>,
    pub mountpoint: String,
}

impl Mount {
    pub fn new(fs_type: &'static str, root: Arc<Inode>, mountpoint: String) -> Self {
        Self {
            fs_type,
            root,
            mountpoint,
        }
    }
}

/// Global mount table
pub struct MountTable {
    mounts: Vec<Mount>,
    root: Option<Arc<Inode>>,
    /// Maps the `Ino` of the directory a filesystem is mounted over to
    /// the mounted filesystem's root inode, so the path resolver can
    /// cross into it (`vfs::mod::resolve_path`'s `mountpointof` lookup).
    mountpoints: BTreeMap<Ino, Arc<Inode>>,
}

impl MountTable {
    fn new() -> Self {
        Self {
            mounts: Vec::new(),
            root: None,
            mountpoints: BTreeMap::new(),
        }
    }

    /// Mount a filesystem. `mountpoint_dir` is the resolved directory
    /// inode being mounted over (ignored for the "/" root mount).
    pub fn mount(&mut self, mount: Mount, mountpoint_dir: Option<Arc<Inode>>) -> Result<(), Errno> {
        if mount.mountpoint == "/" {
            if let Some(old_root) = &self.root {
                mount.root.set_parent(old_root);
            } else {
                mount.root.set_parent(&mount.root);
            }
            self.root = Some(mount.root.clone());
        } else {
            let dir = mountpoint_dir.ok_or(Errno::ENOENT)?;
            mount.root.set_parent(&dir);
            self.mountpoints.insert(dir.ino(), mount.root.clone());
        }
        crate::info!("VFS: mounted {} at {}", mount.fs_type, mount.mountpoint);
        self.mounts.push(mount);
        Ok(())
    }

    /// Get root inode
    pub fn root(&self) -> Option<Arc<Inode>> {
        self.root.clone()
    }

    /// List all mounts
    pub fn list(&self) -> Vec<Mount> {
        self.mounts.clone()
    }

    fn mountpointof(&self, dir_ino: Ino) -> Option<Arc<Inode>> {
        self.mountpoints.get(&dir_ino).cloned()
    }
}

/// Global VFS state
static VFS: RwLock<Option<MountTable>> = RwLock::new(None);

/// Initialize VFS
pub fn init_vfs() {
    let mut vfs = VFS.write();
    *vfs = Some(MountTable::new());
    crate::info!("VFS initialized");
}

/// Mounts a filesystem at `mountpoint`. Resolves `mountpoint` through
/// the current root (mount-crossing, no symlink following -- you can't
/// mount onto a symlink) for anything other than `/`.
pub fn mount(fs_type: &'static str, root: Arc<Inode>, mountpoint: &str) -> Result<(), Errno> {
    let mountpoint_dir = if mountpoint == "/" {
        None
    } else {
        let current_root = get_root().ok_or(Errno::ENODEV)?;
        Some(super::resolve_path(&current_root, &current_root, mountpoint, true)?)
    };

    let mut vfs = VFS.write();
    if let Some(ref mut table) = *vfs {
        let mount = Mount::new(fs_type, root, mountpoint.into());
        table.mount(mount, mountpoint_dir)
    } else {
        Err(Errno::ENODEV)
    }
}

/// Returns the mounted filesystem's root if `dir_ino` is a mountpoint.
pub fn mountpointof(dir_ino: Ino) -> Option<Arc<Inode>> {
    let vfs = VFS.read();
    vfs.as_ref().and_then(|t| t.mountpointof(dir_ino))
}

/// Get root inode
pub fn get_root() -> Option<Arc<Inode>> {
    let vfs = VFS.read();
    vfs.as_ref().and_then(|t| t.root())
}

/// Get mount table for /proc/mounts
pub fn get_mounts() -> Vec<Mount> {
    let vfs = VFS.read();
    vfs.as_ref().map(|t| t.list()).unwrap_or_default()
}

/// Set root inode (used during initialization)
pub fn set_root(root: Arc<Inode>) {
    let mut vfs = VFS.write();
    if let Some(ref mut table) = *vfs {
        table.root = Some(root);
    }
}
