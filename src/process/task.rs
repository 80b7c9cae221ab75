//! Process control blocks: a `Task` is the process-level state shared by
//! all threads of a process (address space, file table, credentials,
//! process group). Per-thread execution state (registers, kernel stack,
//! run-queue linkage) lives in [`super::scheduler::Thread`] instead --
//! a `Task` only tracks which `Tid`s belong to it.

use crate::arch::x86_64::TrapFrame;
use crate::lib::error::Errno;
use crate::mm::VmmContext;
use crate::process::scheduler::{Tid, WaitQueue};
use crate::vfs::{File, Inode};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub type Pid = u32;

pub const OPEN_MAX: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Ready,
    Sleeping,
    Stopped,
    Zombie,
}

#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
}

impl Credentials {
    pub const fn root() -> Self {
        Self { uid: 0, gid: 0, euid: 0, egid: 0 }
    }
}

#[derive(Clone)]
struct FileDesc {
    file: Arc<File>,
    cloexec: bool,
}

/// Per-process file descriptor table. `next_fd` is a hint, not an
/// invariant: it is refreshed by `update_hint` after every open/close.
pub struct FileTable {
    fds: Vec<Option<FileDesc>>,
    next_fd: usize,
}

impl FileTable {
    pub fn new() -> Self {
        let mut fds = Vec::with_capacity(OPEN_MAX);
        fds.resize_with(OPEN_MAX, || None);
        Self { fds, next_fd: 0 }
    }

    fn update_hint(&mut self) {
        for (i, slot) in self.fds.iter().enumerate().skip(self.next_fd) {
            if slot.is_none() {
                self.next_fd = i;
                return;
            }
        }
        for (i, slot) in self.fds.iter().enumerate() {
            if slot.is_none() {
                self.next_fd = i;
                return;
            }
        }
        self.next_fd = OPEN_MAX;
    }

    pub fn install(&mut self, file: Arc<File>, cloexec: bool) -> Result<i32, Errno> {
        let fd = self.next_fd;
        if fd >= OPEN_MAX {
            return Err(Errno::EMFILE);
        }
        self.fds[fd] = Some(FileDesc { file, cloexec });
        self.next_fd += 1;
        self.update_hint();
        Ok(fd as i32)
    }

    pub fn get(&self, fd: i32) -> Option<Arc<File>> {
        let fd = usize::try_from(fd).ok()?;
        self.fds.get(fd)?.as_ref().map(|d| d.file.clone())
    }

    pub fn duplicate(&mut self, old_fd: i32, new_fd: i32) -> Result<i32, Errno> {
        let old = usize::try_from(old_fd).map_err(|_| Errno::EBADF)?;
        let mut target = usize::try_from(new_fd).map_err(|_| Errno::EINVAL)?;
        let desc = self.fds.get(old).and_then(|d| d.clone()).ok_or(Errno::EBADF)?;
        while target < OPEN_MAX && self.fds[target].is_some() {
            target += 1;
        }
        if target >= OPEN_MAX {
            return Err(Errno::EMFILE);
        }
        self.fds[target] = Some(FileDesc { file: desc.file, cloexec: false });
        self.update_hint();
        Ok(target as i32)
    }

    pub fn close(&mut self, fd: i32) -> Result<(), Errno> {
        let fd = usize::try_from(fd).map_err(|_| Errno::EBADF)?;
        let slot = self.fds.get_mut(fd).ok_or(Errno::EBADF)?;
        if slot.take().is_none() {
            return Err(Errno::EBADF);
        }
        if fd < self.next_fd {
            self.next_fd = fd;
        }
        Ok(())
    }

    /// Used by `fork`: every open file is shared (not duplicated) with
    /// the child, matching POSIX fd-table-copy semantics.
    pub fn fork_copy(&self) -> Self {
        let mut fds = Vec::with_capacity(OPEN_MAX);
        for slot in &self.fds {
            fds.push(slot.clone());
        }
        Self { fds, next_fd: self.next_fd }
    }

    /// Drops every descriptor flagged `FD_CLOEXEC`, for use after `execve`.
    pub fn close_on_exec(&mut self) {
        for slot in self.fds.iter_mut() {
            if slot.as_ref().is_some_and(|d| d.cloexec) {
                *slot = None;
            }
        }
        self.next_fd = 0;
        self.update_hint();
    }

    fn close_all(&mut self) {
        for slot in self.fds.iter_mut() {
            *slot = None;
        }
        self.next_fd = 0;
    }
}

/// A process group: processes created by the same job-control session,
/// targeted together by `kill(-pgid, sig)` and by the controlling tty.
pub struct ProcessGroup {
    pub pgid: Pid,
    pub sid: Pid,
    members: Mutex<Vec<Pid>>,
}

impl ProcessGroup {
    pub fn members(&self) -> Vec<Pid> {
        self.members.lock().clone()
    }
}

struct TaskState {
    process_state: ProcessState,
    exit_code: i32,
    exited: bool,
    stop_signal: Option<u8>,
    stop_notified: bool,
    did_execve: bool,
    name: String,
    cwd: Arc<Inode>,
    root: Arc<Inode>,
    group: Option<Arc<ProcessGroup>>,
}

pub struct Task {
    pub pid: Pid,
    ppid: core::sync::atomic::AtomicU32,
    pub cred: Mutex<Credentials>,
    vmm: Mutex<Arc<VmmContext>>,
    pub files: Mutex<FileTable>,
    pub trap_frame: Mutex<TrapFrame>,
    /// Trap frame stashed by signal delivery before a handler's sigframe
    /// was installed, popped by `sigreturn`.
    pub saved_frame: Mutex<Option<TrapFrame>>,
    pub signals: super::signal::SignalState,
    pub itimer: Mutex<super::itimer::ItimerState>,
    pub brk: Mutex<super::brk::BrkState>,
    pub waitpid_waitlist: WaitQueue,
    state: Mutex<TaskState>,
    threads: Mutex<Vec<Tid>>,
    main_tid: Tid,
}

impl Task {
    pub fn new(
        pid: Pid,
        ppid: Pid,
        vmm: Arc<VmmContext>,
        root: Arc<Inode>,
        cwd: Arc<Inode>,
        cred: Credentials,
        name: String,
        main_tid: Tid,
    ) -> Arc<Self> {
        Arc::new(Self {
            pid,
            ppid: core::sync::atomic::AtomicU32::new(ppid),
            cred: Mutex::new(cred),
            vmm: Mutex::new(vmm),
            files: Mutex::new(FileTable::new()),
            trap_frame: Mutex::new(TrapFrame::default()),
            saved_frame: Mutex::new(None),
            signals: super::signal::SignalState::new(),
            itimer: Mutex::new(super::itimer::ItimerState::new()),
            brk: Mutex::new(super::brk::BrkState::new()),
            waitpid_waitlist: WaitQueue::new(),
            state: Mutex::new(TaskState {
                process_state: ProcessState::Ready,
                exit_code: 0,
                exited: false,
                stop_signal: None,
                stop_notified: false,
                did_execve: false,
                name,
                cwd,
                root,
                group: None,
            }),
            threads: Mutex::new(alloc::vec![main_tid]),
            main_tid,
        })
    }

    pub fn main_tid(&self) -> Tid {
        self.main_tid
    }

    pub fn vmm(&self) -> Arc<VmmContext> {
        self.vmm.lock().clone()
    }

    /// Installs a new address space, for `execve`, returning the old
    /// one so the caller can queue it for teardown.
    pub fn set_vmm(&self, new: Arc<VmmContext>) -> Arc<VmmContext> {
        core::mem::replace(&mut *self.vmm.lock(), new)
    }

    pub fn ppid(&self) -> Pid {
        self.ppid.load(core::sync::atomic::Ordering::Acquire)
    }

    pub fn set_ppid(&self, ppid: Pid) {
        self.ppid.store(ppid, core::sync::atomic::Ordering::Release);
    }

    pub fn add_thread(&self, tid: Tid) {
        self.threads.lock().push(tid);
    }

    pub fn remove_thread(&self, tid: Tid) {
        self.threads.lock().retain(|&t| t != tid);
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn process_state(&self) -> ProcessState {
        self.state.lock().process_state
    }

    pub fn set_process_state(&self, state: ProcessState) {
        self.state.lock().process_state = state;
    }

    pub fn is_zombie(&self) -> bool {
        self.state.lock().exited
    }

    pub fn exit_code(&self) -> i32 {
        self.state.lock().exit_code
    }

    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    pub fn cwd(&self) -> Arc<Inode> {
        self.state.lock().cwd.clone()
    }

    pub fn root(&self) -> Arc<Inode> {
        self.state.lock().root.clone()
    }

    pub fn set_cwd(&self, cwd: Arc<Inode>) {
        self.state.lock().cwd = cwd;
    }

    pub fn group(&self) -> Option<Arc<ProcessGroup>> {
        self.state.lock().group.clone()
    }

    pub fn stop_signal(&self) -> Option<u8> {
        self.state.lock().stop_signal
    }

    /// Marks the process stopped by `signal` unless it is already
    /// stopped, so a flurry of `SIGSTOP`s doesn't re-trigger delivery
    /// to every thread each time.
    pub fn begin_stop(&self, signal: u8) -> bool {
        let mut state = self.state.lock();
        if state.stop_signal.is_some() {
            return false;
        }
        state.stop_signal = Some(signal);
        state.stop_notified = false;
        true
    }

    pub fn clear_stop(&self) {
        let mut state = self.state.lock();
        state.stop_signal = None;
        state.stop_notified = false;
    }

    pub fn join_group(self: &Arc<Self>, group: Arc<ProcessGroup>) {
        let mut members = group.members.lock();
        if !members.contains(&self.pid) {
            members.push(self.pid);
        }
        drop(members);
        self.state.lock().group = Some(group);
    }

    pub fn leave_group(&self) {
        let mut state = self.state.lock();
        if let Some(group) = state.group.take() {
            group.members.lock().retain(|&p| p != self.pid);
        }
    }

    pub fn mark_did_execve(&self) {
        self.state.lock().did_execve = true;
    }

    /// Marks the process exited and releases its open files. Does not
    /// remove it from the process table -- the parent still needs to
    /// read `exit_code` via `wait`.
    pub fn mark_exited(&self, exit_code: i32) {
        self.files.lock().close_all();
        super::itimer::clear(self);
        let mut state = self.state.lock();
        state.exited = true;
        state.exit_code = exit_code;
        state.process_state = ProcessState::Zombie;
    }
}
