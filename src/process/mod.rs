pub mod brk;
pub mod exec;
pub mod fork;
pub mod itimer;
pub mod pid;
pub mod scheduler;
pub mod signal;
pub mod task;
pub mod wait;

pub use task::{Pid, ProcessState, Task};

/// PID of the process owning the thread currently running on this CPU.
pub fn current_pid() -> Pid {
    scheduler::current_thread().pid
}

/// `Task` of the process currently running on this CPU, or `None` for
/// kernel-only threads (idle, the VMM reaper) that have no process.
pub fn current_task() -> Option<alloc::sync::Arc<Task>> {
    pid::lookup(current_pid())
}

/// Brings up the process subsystem: the PID table and PID 1 (`init`),
/// running in the kernel's own address space until it execs a real
/// init program.
pub fn init() {
    pid::init();

    let vmm = crate::mm::vmm::new_context(None).expect("out of memory creating init's address space");
    let root = crate::vfs::get_root().expect("vfs must be mounted before process::init");
    let main_tid = scheduler::spawn(1, init_entry as usize as u64, 0);
    let init_task = Task::new(1, 0, vmm, root.clone(), root, task::Credentials::root(), alloc::string::String::from("init"), main_tid);
    pid::insert_task(init_task.clone()).expect("process table must have room for pid 1");
    pid::new_group(&init_task, true);
}

extern "C" fn init_entry() -> ! {
    crate::info!("init: no user-mode init program wired yet, idling");
    loop {
        scheduler::yield_now();
    }
}
