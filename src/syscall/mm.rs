//! `brk(2)`, `mmap(2)`, `munmap(2)`: the VMM operations spec §6 exposes
//! directly to userspace, on top of `mm::vmm`'s `VmmContext`.

use crate::lib::error::{Errno, Result};
use crate::mm::page::PAGE_SIZE;
use crate::mm::vmm::{self, MapFlags};
use crate::process::brk;
use x86_64::structures::paging::PageTableFlags;

pub const PROT_READ: u32 = 0x1;
pub const PROT_WRITE: u32 = 0x2;
pub const PROT_EXEC: u32 = 0x4;

pub const MAP_SHARED: u32 = 0x01;
pub const MAP_PRIVATE: u32 = 0x02;
pub const MAP_FIXED: u32 = 0x10;
pub const MAP_ANONYMOUS: u32 = 0x20;

pub fn sys_brk(addr: u64) -> Result<isize> {
    let task = crate::process::current_task().ok_or(Errno::ESRCH)?;
    let vmm = task.vmm();
    let mut state = task.brk.lock();
    let new_brk = brk::brk(&vmm, &mut state, addr)?;
    Ok(new_brk as isize)
}

/// Anonymous-mapping-only `mmap`: file-backed mappings need a page
/// cache this kernel doesn't have yet, so `fd`/`offset` are rejected
/// unless `MAP_ANONYMOUS` is set.
pub fn sys_mmap(addr: u64, len: usize, prot: u32, flags: u32, fd: i32, _offset: u64) -> Result<isize> {
    if len == 0 {
        return Err(Errno::EINVAL);
    }
    if flags & MAP_ANONYMOUS == 0 {
        let _ = fd;
        return Err(Errno::ENODEV);
    }

    let task = crate::process::current_task().ok_or(Errno::ESRCH)?;
    let vmm = task.vmm();

    let mut mmu_flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
    if prot & PROT_WRITE != 0 {
        mmu_flags |= PageTableFlags::WRITABLE;
    }
    if prot & PROT_EXEC == 0 {
        mmu_flags |= PageTableFlags::NO_EXECUTE;
    }

    let mut vmm_flags = MapFlags::ALLOCATE;
    vmm_flags |= if flags & MAP_SHARED != 0 { MapFlags::SHARED } else { MapFlags::PRIVATE };

    let virt = if flags & MAP_FIXED != 0 {
        if addr == 0 || addr as usize % PAGE_SIZE != 0 {
            return Err(Errno::EINVAL);
        }
        addr
    } else {
        vmm_flags |= MapFlags::NOHINT | MapFlags::ANONYMOUS;
        0
    };

    let mapped = vmm::map(&vmm, virt, 0, len, vmm_flags, mmu_flags).map_err(|_| Errno::ENOMEM)?;
    Ok(mapped as isize)
}

pub fn sys_munmap(addr: u64, len: usize) -> Result<isize> {
    if addr as usize % PAGE_SIZE != 0 || len == 0 {
        return Err(Errno::EINVAL);
    }
    let task = crate::process::current_task().ok_or(Errno::ESRCH)?;
    vmm::unmap(&task.vmm(), addr, len);
    Ok(0)
}
