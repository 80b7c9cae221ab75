/// Inode - represents a file system object
///
/// Core VFS abstraction for files, directories, and device nodes.

use crate::lib::error::Errno;
use alloc::sync::{Arc, Weak};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::RwLock;

/// Inode number type
pub type Ino = u64;

/// Global inode number allocator
static NEXT_INO: AtomicU64 = AtomicU64::new(2); // 1 is root

/// Allocate a new inode number
pub fn alloc_ino() -> Ino {
    NEXT_INO.fetch_add(1, Ordering::SeqCst)
}

/// Inode type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeType {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Symlink,
}

impl InodeType {
    /// Convert to mode bits
    pub fn to_mode_bits(&self) -> u32 {
        match self {
            InodeType::Regular => crate::vfs::S_IFREG,
            InodeType::Directory => crate::vfs::S_IFDIR,
            InodeType::CharDevice => crate::vfs::S_IFCHR,
            InodeType::BlockDevice => crate::vfs::S_IFBLK,
            InodeType::Symlink => crate::vfs::S_IFLNK,
        }
    }
}

/// Inode metadata
pub struct InodeMeta {
    pub ino: Ino,
    pub itype: InodeType,
    pub mode: u32,      // Permission bits
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,     // Number of hard links
    pub size: u64,
    pub atime: u64,     // Access time
    pub mtime: u64,     // Modification time
    pub ctime: u64,     // Change time
}

impl InodeMeta {
    pub fn new(itype: InodeType, mode: u32) -> Self {
        Self {
            ino: alloc_ino(),
            itype,
            mode: itype.to_mode_bits() | (mode & 0o777),
            uid: 0,
            gid: 0,
            nlink: if matches!(itype, InodeType::Directory) { 2 } else { 1 },
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
        }
    }
}

/// Directory entry returned by readdir
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub ino: Ino,
    pub name: String,
    pub itype: InodeType,
}

/// Inode operations trait
pub trait InodeOps: Send + Sync {
    /// Lookup a child by name (for directories)
    fn lookup(&self, name: &str) -> Result<Arc<Inode>, Errno>;

    /// Create a new file/directory (for directories)
    fn create(&self, name: &str, mode: u32) -> Result<Arc<Inode>, Errno>;

    /// Read from inode
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno>;

    /// Write to inode
    fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, Errno>;

    /// Read directory entries
    fn readdir(&self) -> Result<Vec<DirEntry>, Errno>;

    /// Get attributes
    fn getattr(&self) -> Result<InodeMeta, Errno>;

    /// Truncate to size
    fn truncate(&self, size: u64) -> Result<(), Errno> {
        let _ = size;
        Err(Errno::ENOSYS)
    }
    /// Unlink (remove) a child entry (for directories)
    fn unlink(&self, name: &str) -> Result<(), Errno> {
        let _ = name;
        Err(Errno::ENOSYS)
    }

    /// Create a subdirectory (for directories)
    fn mkdir(&self, name: &str, mode: u32) -> Result<Arc<Inode>, Errno> {
        let _ = (name, mode);
        Err(Errno::ENOSYS)
    }

    /// Create a hard link named `name` pointing at `target` (for directories)
    fn link(&self, name: &str, target: &Arc<Inode>) -> Result<(), Errno> {
        let _ = (name, target);
        Err(Errno::ENOSYS)
    }

    /// Create a symlink named `name` whose contents are `target` (for directories)
    fn symlink(&self, name: &str, target: &str) -> Result<Arc<Inode>, Errno> {
        let _ = (name, target);
        Err(Errno::ENOSYS)
    }

    /// Read the target of a symlink
    fn readlink(&self) -> Result<alloc::string::String, Errno> {
        Err(Errno::ENOSYS)
    }

    /// Device/tty control. Distinct from `FileOps::ioctl` in that this
    /// one lives on the vnode, so it's reachable regardless of which
    /// `File`/`FileOps` a particular open happens to be wearing.
    fn ioctl(&self, cmd: u32, arg: usize) -> Result<isize, Errno> {
        let _ = (cmd, arg);
        Err(Errno::ENOTTY)
    }

    /// True if this vnode is a terminal device.
    fn isatty(&self) -> bool {
        false
    }

    /// Vnode-generic control (mount/unmount hooks, filesystem-specific
    /// commands that don't fit `ioctl`'s device-control shape).
    fn vnctl(&self, cmd: u32, arg: usize) -> Result<isize, Errno> {
        let _ = (cmd, arg);
        Err(Errno::ENOSYS)
    }

    /// Called when a `File` is opened against this vnode, before any
    /// read/write; lets a device do first-open setup (e.g. a tty
    /// claiming its controlling-terminal slot).
    fn open(&self, flags: u32) -> Result<(), Errno> {
        let _ = flags;
        Ok(())
    }

    /// Computes the current readiness bitmask against `events` (a
    /// `PollEvents` bitmask), matching `poll(2)`'s `revents` semantics.
    /// The default always reports ready for read and write, which is
    /// correct for anything that never blocks (regular files, tmpfs).
    fn poll(&self, events: u16) -> Result<u16, Errno> {
        Ok(events & (super::poll::PollEvents::POLLIN.bits() | super::poll::PollEvents::POLLOUT.bits()))
    }

    /// The wait list `sys_poll` should register on to be woken when this
    /// vnode's readiness changes. `None` means the vnode is never going
    /// to transition from not-ready to ready on its own (poll should
    /// treat the default-ready `poll()` result as final).
    fn poll_head(&self) -> Option<Arc<super::poll::PollHead>> {
        None
    }
}

/// Inode structure
pub struct Inode {
    pub meta: RwLock<InodeMeta>,
    pub ops: &'static dyn InodeOps,
    /// Directory this inode was last reached through. Built lazily by
    /// the path resolver (and by `mount()` for a mounted filesystem's
    /// root) rather than tracked by each filesystem, since this VFS has
    /// no separate dentry cache to hold real parent links. Good enough
    /// for `..` to walk back the way a path actually came in, including
    /// out of a mounted filesystem into its mountpoint.
    parent: RwLock<Option<Weak<Inode>>>,
}

impl Inode {
    /// Create a new inode
    pub fn new(itype: InodeType, mode: u32, ops: &'static dyn InodeOps) -> Self {
        Self {
            meta: RwLock::new(InodeMeta::new(itype, mode)),
            ops,
            parent: RwLock::new(None),
        }
    }

    /// Returns the last-known parent directory, if any has been recorded.
    pub fn parent(&self) -> Option<Arc<Inode>> {
        self.parent.read().as_ref().and_then(|w| w.upgrade())
    }

    /// Records `parent` as this inode's parent directory.
    pub fn set_parent(&self, parent: &Arc<Inode>) {
        *self.parent.write() = Some(Arc::downgrade(parent));
    }

    /// Lookup child (for directories)
    pub fn lookup(&self, name: &str) -> Result<Arc<Inode>, Errno> {
        self.ops.lookup(name)
    }

    /// Create child (for directories)
    pub fn create(&self, name: &str, mode: u32) -> Result<Arc<Inode>, Errno> {
        self.ops.create(name, mode)
    }

    /// Read from inode
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, Errno> {
        self.ops.read(offset, buf)
    }

    /// Write to inode
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, Errno> {
        self.ops.write(offset, buf)
    }

    /// Read directory entries
    pub fn readdir(&self) -> Result<Vec<DirEntry>, Errno> {
        self.ops.readdir()
    }

    /// Get metadata
    pub fn getattr(&self) -> Result<InodeMeta, Errno> {
        self.ops.getattr()
    }

    /// Get inode number
    pub fn ino(&self) -> Ino {
        self.meta.read().ino
    }

    /// Get inode type
    pub fn itype(&self) -> InodeType {
        self.meta.read().itype
    }

    /// Get size
    pub fn size(&self) -> u64 {
        self.meta.read().size
    }

    /// Set size
    pub fn set_size(&self, size: u64) {
        self.meta.write().size = size;
    }

    /// Is directory?
    pub fn is_dir(&self) -> bool {
        self.itype() == InodeType::Directory
    }

    /// Unlink a child (for directories)
    pub fn unlink(&self, name: &str) -> Result<(), Errno> {
        self.ops.unlink(name)
    }

    pub fn mkdir(&self, name: &str, mode: u32) -> Result<Arc<Inode>, Errno> {
        self.ops.mkdir(name, mode)
    }

    pub fn link(&self, name: &str, target: &Arc<Inode>) -> Result<(), Errno> {
        self.ops.link(name, target)
    }

    pub fn symlink(&self, name: &str, target: &str) -> Result<Arc<Inode>, Errno> {
        self.ops.symlink(name, target)
    }

    pub fn readlink(&self) -> Result<String, Errno> {
        self.ops.readlink()
    }

    pub fn ioctl(&self, cmd: u32, arg: usize) -> Result<isize, Errno> {
        self.ops.ioctl(cmd, arg)
    }

    pub fn isatty(&self) -> bool {
        self.ops.isatty()
    }

    pub fn vnctl(&self, cmd: u32, arg: usize) -> Result<isize, Errno> {
        self.ops.vnctl(cmd, arg)
    }

    pub fn open(&self, flags: u32) -> Result<(), Errno> {
        self.ops.open(flags)
    }

    pub fn poll(&self, events: u16) -> Result<u16, Errno> {
        self.ops.poll(events)
    }

    pub fn poll_head(&self) -> Option<Arc<super::poll::PollHead>> {
        self.ops.poll_head()
    }

    /// Is this inode a symlink?
    pub fn is_symlink(&self) -> bool {
        self.itype() == InodeType::Symlink
    }
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let meta = self.meta.read();
        f.debug_struct("Inode")
            .field("ino", &meta.ino)
            .field("type", &meta.itype)
            .field("mode", &format_args!("{:#o}", meta.mode))
            .field("size", &meta.size)
            .finish()
    }
}
