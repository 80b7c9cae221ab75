//! `execve`: replace a process's address space and register state with
//! a freshly loaded ELF image.

pub mod elf;

use super::task::Task;
use crate::arch::x86_64::gdt;
use crate::lib::error::Errno;
use crate::process::scheduler;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use elf::ElfError;

impl From<ElfError> for Errno {
    fn from(e: ElfError) -> Self {
        match e {
            ElfError::Io(errno) => errno,
            ElfError::NotFound => Errno::ENOENT,
            ElfError::NotRegular => Errno::EACCES,
            ElfError::BadMagic | ElfError::WrongClass | ElfError::WrongMachine => Errno::ENOEXEC,
            ElfError::Truncated => Errno::EIO,
        }
    }
}

/// Loads `path` into a new address space and installs it into `task`,
/// replacing its current one. Only valid for the calling thread's own
/// task: it reaches into the live `CR3` as part of the swap, the same
/// way `fork`'s child thread reaches into its own trap frame.
pub fn do_execve(task: &Arc<Task>, path: &str, argv: &[String], envp: &[String]) -> Result<(), Errno> {
    let prepared = elf::prepare_proc(path, argv, envp)?;

    let old_vmm = task.set_vmm(prepared.vmm);
    scheduler::switch_current_address_space(task.vmm().phys());
    crate::mm::vmm::destroy_context(old_vmm);

    task.files.lock().close_on_exec();
    task.mark_did_execve();

    let mut frame = *task.trap_frame.lock();
    frame.rip = prepared.entry;
    frame.rsp = prepared.stack_pointer;
    frame.cs = gdt::user_code_selector().0 as u64;
    frame.ss = gdt::user_data_selector().0 as u64;
    frame.rflags = 0x202; // reserved bit 1 set, interrupts enabled
    *task.trap_frame.lock() = frame;

    Ok(())
}
