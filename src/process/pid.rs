//! Global process table: PID allocation and the `Pid -> Arc<Task>` and
//! `Pgid -> Arc<ProcessGroup>` lookups every other process subsystem
//! goes through.
//!
//! A flat `Vec` indexed directly by PID stands in for the two-level
//! radix tree this is grounded on: with `MAX_PIDS` capped well below
//! what a radix tree is needed for, a dense vector of pointer-sized
//! slots is simpler and just as fast to look up.

use super::task::{Pid, ProcessGroup, Task};
use crate::lib::error::KernelError;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

const MAX_PIDS: usize = 32768;

static NEXT_PID: AtomicU32 = AtomicU32::new(2); // PID 1 is init

pub struct PidTable {
    entries: Vec<Option<Arc<Task>>>,
    groups: BTreeMap<Pid, Arc<ProcessGroup>>,
}

impl PidTable {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(MAX_PIDS);
        entries.resize_with(MAX_PIDS, || None);
        Self { entries, groups: BTreeMap::new() }
    }

    pub fn alloc_pid(&self) -> Result<Pid, KernelError> {
        let pid = NEXT_PID.fetch_add(1, Ordering::SeqCst);
        if pid as usize >= MAX_PIDS {
            return Err(KernelError::OutOfMemory);
        }
        Ok(pid)
    }

    pub fn insert(&mut self, task: Arc<Task>) -> Result<(), KernelError> {
        let pid = task.pid as usize;
        if pid >= MAX_PIDS {
            return Err(KernelError::InvalidArgument);
        }
        self.entries[pid] = Some(task);
        Ok(())
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Task>> {
        self.entries.get(pid as usize)?.clone()
    }

    pub fn remove(&mut self, pid: Pid) -> Option<Arc<Task>> {
        self.entries.get_mut(pid as usize)?.take()
    }

    /// Direct children of `ppid` still present in the table (including
    /// zombies awaiting reap).
    pub fn find_children(&self, ppid: Pid) -> Vec<Pid> {
        self.entries
            .iter()
            .filter_map(|e| e.as_ref())
            .filter(|t| t.ppid() == ppid)
            .map(|t| t.pid)
            .collect()
    }

    pub fn reparent_to_init(&mut self, dying_pid: Pid) {
        for task in self.entries.iter().flatten() {
            if task.ppid() == dying_pid {
                task.set_ppid(1);
            }
        }
    }

    pub fn count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn new_group(&mut self, leader: &Arc<Task>, sid: Pid) -> Arc<ProcessGroup> {
        let group = Arc::new(ProcessGroup { pgid: leader.pid, sid, members: Mutex::new(Vec::new()) });
        self.groups.insert(group.pgid, group.clone());
        group
    }

    pub fn get_group(&self, pgid: Pid) -> Option<Arc<ProcessGroup>> {
        self.groups.get(&pgid).cloned()
    }

    pub fn drop_empty_group(&mut self, pgid: Pid) {
        if self.groups.get(&pgid).is_some_and(|g| g.members().is_empty()) {
            self.groups.remove(&pgid);
        }
    }
}

static PROCESS_TABLE: Mutex<Option<PidTable>> = Mutex::new(None);

pub fn init() {
    *PROCESS_TABLE.lock() = Some(PidTable::new());
    crate::info!("process table initialized (max {} pids)", MAX_PIDS);
}

fn with_table<R>(f: impl FnOnce(&mut PidTable) -> R) -> Option<R> {
    PROCESS_TABLE.lock().as_mut().map(f)
}

pub fn alloc_pid() -> Result<Pid, KernelError> {
    with_table(|t| t.alloc_pid()).ok_or(KernelError::NotInitialized)?
}

pub fn insert_task(task: Arc<Task>) -> Result<(), KernelError> {
    with_table(|t| t.insert(task)).ok_or(KernelError::NotInitialized)?
}

pub fn lookup(pid: Pid) -> Option<Arc<Task>> {
    with_table(|t| t.get(pid))?
}

pub fn remove_task(pid: Pid) -> Option<Arc<Task>> {
    with_table(|t| t.remove(pid))?
}

pub fn find_children(ppid: Pid) -> Vec<Pid> {
    with_table(|t| t.find_children(ppid)).unwrap_or_default()
}

pub fn reparent_to_init(dying_pid: Pid) {
    with_table(|t| t.reparent_to_init(dying_pid));
}

pub fn lookup_group(pgid: Pid) -> Option<Arc<ProcessGroup>> {
    with_table(|t| t.get_group(pgid))?
}

/// Starts a new process group led by `leader`, optionally starting a
/// new session (`new_session = true`, as `setsid()` does).
pub fn new_group(leader: &Arc<Task>, new_session: bool) -> Arc<ProcessGroup> {
    let sid = if new_session { leader.pid } else { leader.group().map(|g| g.sid).unwrap_or(leader.pid) };
    let old_pgid = leader.group().map(|g| g.pgid);
    let group = with_table(|t| t.new_group(leader, sid)).expect("process table not initialized");
    leader.join_group(group.clone());
    if let Some(pgid) = old_pgid {
        with_table(|t| t.drop_empty_group(pgid));
    }
    group
}

pub fn join_group(task: &Arc<Task>, pgid: Pid) -> Option<()> {
    let group = lookup_group(pgid)?;
    let old_pgid = task.group().map(|g| g.pgid);
    task.join_group(group);
    if let Some(old) = old_pgid {
        with_table(|t| t.drop_empty_group(old));
    }
    Some(())
}

pub fn count() -> usize {
    with_table(|t| t.count()).unwrap_or(0)
}
