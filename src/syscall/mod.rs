//! Syscall entry point and handlers.
//!
//! `dispatch` is a dense `match` over the x86_64 Linux syscall ABI
//! (syscall number in the arch trap path's `rax`, arguments in
//! `rdi,rsi,rdx,r10,r8,r9`): every handler below takes already-unpacked
//! arguments and returns the same `Result<isize>` the rest of the
//! kernel uses, with `Err(e)` converted to `-errno` at the boundary.

pub mod futex;
pub mod itimer;
pub mod mm;
pub mod poll;
pub mod uaccess;
pub mod validation;

use crate::lib::error::{Errno, Result};
use crate::process::task::{Pid, Task};
use crate::vfs::inode::InodeMeta;
use crate::vfs::{File, Inode, OpenFlags};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

const AT_FDCWD: i32 = -100;
const MAX_PATH_LEN: usize = validation::MAX_PATH_LEN;
const MAX_ARGV: usize = 1024;

/// Dispatches one syscall. `args` is `[rdi, rsi, rdx, r10, r8, r9]`.
pub fn dispatch(nr: usize, args: &[u64; 6]) -> isize {
    let result = match nr {
        0 => sys_read(args[0] as i32, args[1] as *mut u8, args[2] as usize),
        1 => sys_write(args[0] as i32, args[1] as *const u8, args[2] as usize),
        2 => sys_openat(AT_FDCWD, args[0], args[1] as i32, args[2] as u32),
        3 => sys_close(args[0] as i32),
        4 => sys_stat(args[0], args[1] as *mut u8),
        5 => sys_fstat(args[0] as i32, args[1] as *mut u8),
        7 => sys_poll(args[0], args[1] as usize, args[2] as i64),
        8 => sys_lseek(args[0] as i32, args[1] as i64, args[2] as i32),
        9 => mm::sys_mmap(args[0], args[1] as usize, args[2] as u32, args[3] as u32, args[4] as i32, args[5]),
        11 => mm::sys_munmap(args[0], args[1] as usize),
        12 => mm::sys_brk(args[0]),
        13 => sys_rt_sigaction(args[0] as i32, args[1], args[2], args[3] as usize),
        14 => sys_rt_sigprocmask(args[0] as i32, args[1], args[2], args[3] as usize),
        15 => sys_rt_sigreturn(),
        16 => sys_ioctl(args[0] as i32, args[1] as u32, args[2] as usize),
        33 => sys_dup2(args[0] as i32, args[1] as i32),
        36 => itimer::sys_getitimer(args[0] as i32, args[1]),
        38 => itimer::sys_setitimer(args[0] as i32, args[1], args[2]),
        39 => sys_getpid(),
        57 => sys_fork(),
        59 => sys_execve(args[0], args[1], args[2]),
        60 => sys_exit(args[0] as i32),
        61 => sys_wait4(args[0] as i32, args[1], args[2] as i32, args[3]),
        62 => sys_kill(args[0] as i32, args[1] as u8),
        102 => sys_getuid(),
        109 => sys_setpgid(args[0] as i32, args[1] as i32),
        110 => sys_getppid(),
        112 => sys_setsid(),
        121 => sys_getpgid(args[0] as i32),
        158 => sys_arch_prctl(args[0] as i32, args[1]),
        202 => futex::sys_futex(args[0], args[1] as u32, args[2] as u32),
        217 => sys_getdents64(args[0] as i32, args[1] as *mut u8, args[2] as usize),
        231 => sys_exit(args[0] as i32),
        257 => sys_openat(args[0] as i32, args[1], args[2] as i32, args[3] as u32),
        267 => sys_readlinkat(args[0] as i32, args[1], args[2] as *mut u8, args[3] as usize),
        _ => {
            crate::warn!("syscall: unimplemented nr={}", nr);
            Err(Errno::ENOSYS)
        }
    };

    match result {
        Ok(ret) => ret,
        Err(e) => e.as_isize(),
    }
}

fn current_task() -> Result<Arc<Task>> {
    crate::process::current_task().ok_or(Errno::ESRCH)
}

fn dirfd_inode(task: &Arc<Task>, dirfd: i32) -> Result<Arc<Inode>> {
    let file = task.files.lock().get(dirfd).ok_or(Errno::EBADF)?;
    file.inode.clone().ok_or(Errno::ENOTDIR)
}

/// Splits `path` into (parent, name), same shape as `vfs::split_path`
/// but usable against an arbitrary `dirfd`-relative start point.
fn split_last(path: &str) -> Result<(&str, &str)> {
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

/// Resolves `path` for an `*at` syscall: absolute paths ignore `dirfd`
/// entirely, `AT_FDCWD` uses the calling task's cwd, anything else uses
/// that fd's inode as the relative start.
fn resolve_at(task: &Arc<Task>, dirfd: i32, path: &str, follow: bool) -> Result<Arc<Inode>> {
    let root = crate::vfs::get_root().ok_or(Errno::ENOENT)?;
    let start = if path.starts_with('/') {
        root.clone()
    } else if dirfd == AT_FDCWD {
        task.cwd()
    } else {
        dirfd_inode(task, dirfd)?
    };
    crate::vfs::resolve_path(&root, &start, path, follow)
}

fn copy_path(ptr: u64) -> Result<String> {
    if ptr == 0 {
        return Err(Errno::EFAULT);
    }
    uaccess::validate_user_read(ptr as *const u8, 1)?;
    uaccess::copy_string_from_user(ptr as *const u8, MAX_PATH_LEN)
}

fn fill_stat(buf: *mut u8, meta: &InodeMeta) -> Result<isize> {
    if buf.is_null() {
        return Err(Errno::EFAULT);
    }
    uaccess::validate_user_write(buf, 144)?;
    let stat = unsafe { core::slice::from_raw_parts_mut(buf, 144) };
    stat.fill(0);
    unsafe {
        *(buf.add(8) as *mut u64) = meta.ino;
        *(buf.add(16) as *mut u64) = meta.nlink as u64;
        *(buf.add(24) as *mut u32) = meta.mode;
        *(buf.add(28) as *mut u32) = meta.uid;
        *(buf.add(32) as *mut u32) = meta.gid;
        *(buf.add(48) as *mut u64) = meta.size;
        *(buf.add(72) as *mut u64) = meta.atime;
        *(buf.add(88) as *mut u64) = meta.mtime;
        *(buf.add(104) as *mut u64) = meta.ctime;
    }
    Ok(0)
}

// ---- file descriptor / VFS syscalls ----------------------------------

pub fn sys_read(fd: i32, buf: *mut u8, count: usize) -> Result<isize> {
    if count == 0 {
        return Ok(0);
    }
    uaccess::validate_user_write(buf, count)?;
    let task = current_task()?;
    let file = task.files.lock().get(fd).ok_or(Errno::EBADF)?;
    let data = unsafe { core::slice::from_raw_parts_mut(buf, count) };
    Ok(file.read(data)? as isize)
}

pub fn sys_write(fd: i32, buf: *const u8, count: usize) -> Result<isize> {
    if count == 0 {
        return Ok(0);
    }
    uaccess::validate_user_read(buf, count)?;
    let task = current_task()?;
    let file = task.files.lock().get(fd).ok_or(Errno::EBADF)?;
    let data = unsafe { core::slice::from_raw_parts(buf, count) };
    Ok(file.write(data)? as isize)
}

fn open_existing_or_create(task: &Arc<Task>, dirfd: i32, path: &str, flags: OpenFlags, mode: u32) -> Result<Arc<File>> {
    if path == "/dev/ptmx" {
        return Ok(Arc::new(crate::vfs::ptmx::open_ptmx()?));
    }

    let inode = match resolve_at(task, dirfd, path, true) {
        Ok(inode) => inode,
        Err(Errno::ENOENT) if flags.contains(OpenFlags::O_CREAT) => {
            let (parent_path, name) = split_last(path)?;
            let parent = resolve_at(task, dirfd, parent_path, true)?;
            parent.create(name, mode)?
        }
        Err(e) => return Err(e),
    };

    inode.open(flags.bits())?;
    if flags.contains(OpenFlags::O_TRUNC) && inode.itype() == crate::vfs::InodeType::Regular {
        inode.truncate(0)?;
    }
    Ok(Arc::new(File::new(inode, flags)))
}

pub fn sys_openat(dirfd: i32, path_ptr: u64, flags: i32, mode: u32) -> Result<isize> {
    let task = current_task()?;
    let path = copy_path(path_ptr)?;
    let open_flags = OpenFlags::from_bits_truncate(flags as u32);

    let file = open_existing_or_create(&task, dirfd, &path, open_flags, mode)?;
    let fd = task.files.lock().install(file, open_flags.contains(OpenFlags::O_CLOEXEC))?;
    Ok(fd as isize)
}

pub fn sys_close(fd: i32) -> Result<isize> {
    let task = current_task()?;
    task.files.lock().close(fd)?;
    Ok(0)
}

pub fn sys_lseek(fd: i32, offset: i64, whence: i32) -> Result<isize> {
    let task = current_task()?;
    let file = task.files.lock().get(fd).ok_or(Errno::EBADF)?;
    Ok(file.lseek(offset, whence)? as isize)
}

pub fn sys_dup2(old_fd: i32, new_fd: i32) -> Result<isize> {
    let task = current_task()?;
    let mut files = task.files.lock();
    if old_fd == new_fd {
        return if files.get(old_fd).is_some() { Ok(new_fd as isize) } else { Err(Errno::EBADF) };
    }
    let _ = files.close(new_fd);
    Ok(files.duplicate(old_fd, new_fd)? as isize)
}

pub fn sys_ioctl(fd: i32, cmd: u32, arg: usize) -> Result<isize> {
    let task = current_task()?;
    let file = task.files.lock().get(fd).ok_or(Errno::EBADF)?;
    file.ioctl(cmd, arg)
}

pub fn sys_stat(path_ptr: u64, buf: *mut u8) -> Result<isize> {
    let task = current_task()?;
    let path = copy_path(path_ptr)?;
    let inode = resolve_at(&task, AT_FDCWD, &path, true)?;
    fill_stat(buf, &inode.getattr()?)
}

pub fn sys_fstat(fd: i32, buf: *mut u8) -> Result<isize> {
    let task = current_task()?;
    let file = task.files.lock().get(fd).ok_or(Errno::EBADF)?;
    let inode = file.inode.as_ref().ok_or(Errno::EBADF)?;
    fill_stat(buf, &inode.getattr()?)
}

pub fn sys_getdents64(fd: i32, dirp: *mut u8, count: usize) -> Result<isize> {
    if dirp.is_null() {
        return Err(Errno::EFAULT);
    }
    uaccess::validate_user_write(dirp, count)?;

    let task = current_task()?;
    let file = task.files.lock().get(fd).ok_or(Errno::EBADF)?;
    let inode = file.inode.as_ref().ok_or(Errno::ENOTDIR)?;
    if !inode.is_dir() {
        return Err(Errno::ENOTDIR);
    }

    let entries = inode.readdir()?;
    let mut offset = 0usize;
    for entry in entries {
        let name_bytes = entry.name.as_bytes();
        let reclen = ((19 + name_bytes.len() + 1 + 7) & !7) as u16;
        if offset + reclen as usize > count {
            break;
        }
        unsafe {
            let p = dirp.add(offset);
            *(p as *mut u64) = entry.ino;
            *(p.add(8) as *mut i64) = 0;
            *(p.add(16) as *mut u16) = reclen;
            *p.add(18) = match entry.itype {
                crate::vfs::InodeType::Regular => 8,
                crate::vfs::InodeType::Directory => 4,
                crate::vfs::InodeType::CharDevice => 2,
                crate::vfs::InodeType::BlockDevice => 6,
                crate::vfs::InodeType::Symlink => 10,
            };
            core::ptr::copy_nonoverlapping(name_bytes.as_ptr(), p.add(19), name_bytes.len());
            *p.add(19 + name_bytes.len()) = 0;
        }
        offset += reclen as usize;
    }
    Ok(offset as isize)
}

pub fn sys_readlinkat(dirfd: i32, path_ptr: u64, buf: *mut u8, bufsiz: usize) -> Result<isize> {
    let task = current_task()?;
    let path = copy_path(path_ptr)?;
    let inode = resolve_at(&task, dirfd, &path, false)?;
    let target = inode.readlink()?;
    let bytes = target.as_bytes();
    let n = bytes.len().min(bufsiz);
    uaccess::validate_user_write(buf, n)?;
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), buf, n) };
    Ok(n as isize)
}

pub fn sys_poll(fds_ptr: u64, nfds: usize, timeout_ms: i64) -> Result<isize> {
    if fds_ptr == 0 && nfds > 0 {
        return Err(Errno::EFAULT);
    }
    let len = core::mem::size_of::<poll::PollFd>() * nfds;
    uaccess::validate_user_write(fds_ptr as *mut u8, len)?;
    let fds = unsafe { core::slice::from_raw_parts_mut(fds_ptr as *mut poll::PollFd, nfds) };
    poll::sys_poll(fds, timeout_ms)
}

// ---- process lifecycle -------------------------------------------------

pub fn sys_getpid() -> Result<isize> {
    Ok(crate::process::current_pid() as isize)
}

pub fn sys_getppid() -> Result<isize> {
    Ok(current_task()?.ppid() as isize)
}

pub fn sys_getuid() -> Result<isize> {
    Ok(current_task()?.cred.lock().uid as isize)
}

pub fn sys_fork() -> Result<isize> {
    let parent = current_task()?;
    Ok(crate::process::fork::do_fork(&parent)? as isize)
}

fn copy_c_string_array(ptr: u64) -> Result<Vec<String>> {
    if ptr == 0 {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for i in 0..MAX_ARGV {
        let entry_ptr = ptr + (i * core::mem::size_of::<u64>()) as u64;
        uaccess::validate_user_read(entry_ptr as *const u8, 8)?;
        let str_ptr = unsafe { core::ptr::read(entry_ptr as *const u64) };
        if str_ptr == 0 {
            break;
        }
        out.push(uaccess::copy_string_from_user(str_ptr as *const u8, MAX_PATH_LEN)?);
    }
    Ok(out)
}

pub fn sys_execve(path_ptr: u64, argv_ptr: u64, envp_ptr: u64) -> Result<isize> {
    let task = current_task()?;
    let path = copy_path(path_ptr)?;
    let argv = copy_c_string_array(argv_ptr)?;
    let envp = copy_c_string_array(envp_ptr)?;

    crate::process::exec::do_execve(&task, &path, &argv, &envp)?;
    Ok(0)
}

pub fn sys_exit(code: i32) -> ! {
    let task = crate::process::current_task();
    match task {
        Some(task) => crate::process::wait::do_exit(&task, code),
        None => {
            crate::warn!("sys_exit: no current task, halting");
            loop {
                crate::process::scheduler::yield_now();
            }
        }
    }
}

pub fn sys_wait4(pid: i32, wstatus_ptr: u64, options: i32, _rusage: u64) -> Result<isize> {
    let task = current_task()?;
    let mut wstatus = 0i32;
    let child = crate::process::wait::do_wait4(&task, pid, &mut wstatus, options)?;
    if wstatus_ptr != 0 {
        uaccess::validate_user_write(wstatus_ptr as *mut u8, 4)?;
        unsafe { core::ptr::write(wstatus_ptr as *mut i32, wstatus) };
    }
    Ok(child as isize)
}

pub fn sys_getpgid(pid: i32) -> Result<isize> {
    let task = if pid == 0 { current_task()? } else { crate::process::pid::lookup(pid as Pid).ok_or(Errno::ESRCH)? };
    let group = task.group().ok_or(Errno::ESRCH)?;
    Ok(group.pgid as isize)
}

pub fn sys_setpgid(pid: i32, pgid: i32) -> Result<isize> {
    let task = current_task()?;
    let target_pid = if pid == 0 { task.pid } else { pid as Pid };
    let target = crate::process::pid::lookup(target_pid).ok_or(Errno::ESRCH)?;

    let pgid = if pgid == 0 { target_pid } else { pgid as Pid };
    if crate::process::pid::join_group(&target, pgid).is_none() {
        crate::process::pid::new_group(&target, false);
    }
    Ok(0)
}

pub fn sys_setsid() -> Result<isize> {
    let task = current_task()?;
    if task.group().is_some_and(|g| g.pgid == task.pid) {
        return Err(Errno::EPERM);
    }
    crate::process::pid::new_group(&task, true);
    Ok(task.pid as isize)
}

// ---- signals -------------------------------------------------------------

pub fn sys_kill(pid: i32, sig: u8) -> Result<isize> {
    if pid > 0 {
        crate::process::signal::send_to_process(pid as Pid, sig)?;
    } else if pid == 0 {
        let task = current_task()?;
        let pgid = task.group().ok_or(Errno::ESRCH)?.pgid;
        crate::process::signal::send_to_group(pgid, sig)?;
    } else if pid == -1 {
        return Err(Errno::EPERM);
    } else {
        crate::process::signal::send_to_group((-pid) as Pid, sig)?;
    }
    Ok(0)
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct UserSigaction {
    handler: u64,
    flags: u32,
    restorer: u64,
    mask: u64,
}

pub fn sys_rt_sigaction(sig: i32, new_ptr: u64, old_ptr: u64, sigsetsize: usize) -> Result<isize> {
    if sigsetsize != 8 || sig < 0 || sig > 255 {
        return Err(Errno::EINVAL);
    }
    let task = current_task()?;
    let sig = sig as u8;

    if old_ptr != 0 {
        let old = task.signals.action(sig);
        uaccess::validate_user_write(old_ptr as *mut u8, core::mem::size_of::<UserSigaction>())?;
        let out = UserSigaction { handler: old.handler, flags: old.flags, restorer: old.restorer, mask: old.mask };
        unsafe { core::ptr::write(old_ptr as *mut UserSigaction, out) };
    }

    if new_ptr != 0 {
        uaccess::validate_user_read(new_ptr as *const u8, core::mem::size_of::<UserSigaction>())?;
        let new = unsafe { core::ptr::read(new_ptr as *const UserSigaction) };
        task.signals.set_action(
            sig,
            crate::process::signal::SigAction { handler: new.handler, mask: new.mask, flags: new.flags, restorer: new.restorer },
        )?;
    }
    Ok(0)
}

pub fn sys_rt_sigprocmask(how: i32, set_ptr: u64, old_ptr: u64, sigsetsize: usize) -> Result<isize> {
    if sigsetsize != 8 {
        return Err(Errno::EINVAL);
    }
    let task = current_task()?;
    let how = match how {
        0 => crate::process::signal::SigmaskHow::Block,
        1 => crate::process::signal::SigmaskHow::Unblock,
        2 => crate::process::signal::SigmaskHow::Set,
        _ => return Err(Errno::EINVAL),
    };

    let set = if set_ptr != 0 {
        uaccess::validate_user_read(set_ptr as *const u8, 8)?;
        Some(unsafe { core::ptr::read(set_ptr as *const u64) })
    } else {
        None
    };

    let mut old = 0u64;
    task.signals.set_mask(how, set, &mut old);

    if old_ptr != 0 {
        uaccess::validate_user_write(old_ptr as *mut u8, 8)?;
        unsafe { core::ptr::write(old_ptr as *mut u64, old) };
    }
    Ok(0)
}

/// Restores the trap frame stashed before a signal handler was invoked.
/// Until the user-mode delivery trampoline lands, this only undoes
/// state this kernel itself pushed via `Task::saved_frame`.
pub fn sys_rt_sigreturn() -> Result<isize> {
    let task = current_task()?;
    let restored = task.saved_frame.lock().take().ok_or(Errno::EINVAL)?;
    *task.trap_frame.lock() = restored;
    Ok(0)
}

// ---- misc ------------------------------------------------------------

const ARCH_SET_FS: i32 = 0x1002;
const ARCH_GET_FS: i32 = 0x1003;
const IA32_FS_BASE: u32 = 0xC000_0100;

/// `arch_prctl`: used by libc's thread-local-storage setup
/// (`ARCH_SET_FS`) rather than a dedicated `set_tls` number on x86_64.
/// Only the running CPU's MSR is touched -- surviving a context switch
/// back to this thread needs the scheduler to reload it, which isn't
/// wired yet.
pub fn sys_arch_prctl(code: i32, addr: u64) -> Result<isize> {
    match code {
        ARCH_SET_FS => {
            unsafe { crate::arch::x86_64::wrmsr(IA32_FS_BASE, addr) };
            Ok(0)
        }
        ARCH_GET_FS => {
            let fs = unsafe { crate::arch::x86_64::rdmsr(IA32_FS_BASE) };
            uaccess::validate_user_write(addr as *mut u8, 8)?;
            unsafe { core::ptr::write(addr as *mut u64, fs) };
            Ok(0)
        }
        _ => Err(Errno::EINVAL),
    }
}
