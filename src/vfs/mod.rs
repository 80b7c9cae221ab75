/// Virtual File System (VFS) layer
///
/// Phase A1 minimal implementation supporting:
/// - tmpfs (in-memory filesystem)
/// - devfs (device nodes)
/// - procfs (process information)

pub mod inode;
pub mod file;
pub mod mount;
pub mod pipe;
pub mod poll;
pub mod tmpfs;
pub mod devfs;

pub use inode::{Inode, InodeType, InodeOps, DirEntry};
pub use file::{File, FileOps, OpenFlags};
pub use mount::{Mount, MountTable, init_vfs, mount, get_root};
pub use poll::{PollHead, Poller, PollEvents};

use crate::lib::error::Errno;
use alloc::sync::Arc;
use alloc::string::String;
use alloc::vec::Vec;

/// File mode bits
pub const S_IFMT: u32 = 0o170000;   // File type mask
pub const S_IFREG: u32 = 0o100000;  // Regular file
pub const S_IFDIR: u32 = 0o040000;  // Directory
pub const S_IFCHR: u32 = 0o020000;  // Character device
pub const S_IFBLK: u32 = 0o060000;  // Block device
pub const S_IFLNK: u32 = 0o120000;  // Symbolic link
pub const S_IRUSR: u32 = 0o000400;  // Owner read
pub const S_IWUSR: u32 = 0o000200;  // Owner write
pub const S_IXUSR: u32 = 0o000100;  // Owner execute

/// Cap on symlink hops a single resolution may take before giving up
/// with `ELOOP`, matching a conservative Linux-ish value.
pub const MAX_SYMLINKS: u32 = 40;

/// Returns the calling task's cwd, or the VFS root if called from a
/// context with no task (early boot, kernel-only threads).
fn current_cwd_or_root(root: &Arc<Inode>) -> Arc<Inode> {
    crate::process::current_task().map(|t| t.cwd()).unwrap_or_else(|| root.clone())
}

/// Resolves `path` to an inode, per spec §4.10: absolute paths start at
/// `root`, relative paths start at `cwd`; `.`/`..` are handled without
/// consulting the filesystem; crossing a mountpoint switches to the
/// mounted filesystem's root; symlinks are followed (the last component
/// only if `follow_last_symlink`), capped at [`MAX_SYMLINKS`] hops.
pub fn resolve_path(root: &Arc<Inode>, cwd: &Arc<Inode>, path: &str, follow_last_symlink: bool) -> Result<Arc<Inode>, Errno> {
    let mut depth = 0u32;
    resolve_path_inner(root, cwd, path, follow_last_symlink, &mut depth)
}

fn cross_mount(inode: Arc<Inode>) -> Arc<Inode> {
    mount::mountpointof(inode.ino()).unwrap_or(inode)
}

fn resolve_path_inner(
    root: &Arc<Inode>,
    cwd: &Arc<Inode>,
    path: &str,
    follow_last_symlink: bool,
    depth: &mut u32,
) -> Result<Arc<Inode>, Errno> {
    if path.is_empty() {
        return Err(Errno::ENOENT);
    }

    let mut current = if path.starts_with('/') { root.clone() } else { cwd.clone() };
    current = cross_mount(current);

    let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let last_index = components.len().saturating_sub(1);

    for (i, component) in components.iter().enumerate() {
        match *component {
            "." => continue,
            ".." => {
                current = current.parent().unwrap_or_else(|| current.clone());
            }
            name => {
                if !current.is_dir() {
                    return Err(Errno::ENOTDIR);
                }
                let found = current.lookup(name)?;
                found.set_parent(&current);
                let found = cross_mount(found);

                let is_last = i == last_index;
                if found.is_symlink() && (!is_last || follow_last_symlink) {
                    *depth += 1;
                    if *depth > MAX_SYMLINKS {
                        return Err(Errno::ELOOP);
                    }
                    let target = found.readlink()?;
                    current = resolve_path_inner(root, &current, &target, true, depth)?;
                } else {
                    current = found;
                }
            }
        }
    }

    Ok(current)
}

/// Opens a file by path, relative to the calling task's cwd (or the VFS
/// root with no task). Follows a trailing symlink.
pub fn open(path: &str, flags: OpenFlags) -> Result<Arc<File>, Errno> {
    let root = get_root().ok_or(Errno::ENOENT)?;
    let cwd = current_cwd_or_root(&root);
    let inode = resolve_path(&root, &cwd, path, true)?;
    inode.open(flags.bits())?;
    let file = File::new(inode, flags);
    Ok(Arc::new(file))
}

/// Creates a new regular file (or returns the existing one, matching
/// the split-then-create shape most creat-on-open callers want).
pub fn create(path: &str, mode: u32) -> Result<Arc<Inode>, Errno> {
    let root = get_root().ok_or(Errno::ENOENT)?;
    let cwd = current_cwd_or_root(&root);
    let (parent_path, name) = split_path(path)?;
    let parent = resolve_path(&root, &cwd, parent_path, true)?;
    parent.create(name, mode)
}

/// Split path into (parent, name)
fn split_path(path: &str) -> Result<(&str, &str), Errno> {
    if path.is_empty() {
        return Err(Errno::EINVAL);
    }

    if path == "/" {
        return Err(Errno::EISDIR);
    }

    if let Some(pos) = path.rfind('/') {
        let parent = if pos == 0 { "/" } else { &path[..pos] };
        let name = &path[pos + 1..];
        if name.is_empty() {
            return Err(Errno::EINVAL);
        }
        Ok((parent, name))
    } else {
        Ok((".", path))
    }
}
