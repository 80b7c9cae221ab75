//! `brk(2)`/`sbrk`: the flat per-task heap, separate from the anonymous
//! mmap region `vmm` hands out its own addresses for.
//!
//! Growth maps freshly zeroed pages one at a time via `vmm::map`;
//! shrinking unmaps and frees them. Only whole pages are ever
//! mapped/unmapped -- `current` can sit mid-page, `mapped_end` is
//! always page-aligned.

use crate::lib::error::{Errno, Result};
use crate::mm::page::PAGE_SIZE;
use crate::mm::vmm::{self, MapFlags, VmmContext};
use alloc::sync::Arc;
use x86_64::structures::paging::PageTableFlags;

/// Fixed start of the heap region, matching the teacher's old
/// bookkeeping constant so existing userspace expectations don't shift.
pub const HEAP_START: u64 = 0x0000_5555_5600_0000;

/// Cap how far `brk` can grow in one call, in bytes, so a bad argument
/// doesn't have the kernel try to map gigabytes of heap synchronously.
const MAX_GROWTH: u64 = 1 << 34;

pub struct BrkState {
    current: u64,
    mapped_end: u64,
}

impl BrkState {
    pub const fn new() -> Self {
        Self { current: HEAP_START, mapped_end: HEAP_START }
    }
}

fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// `brk(addr)`: `addr == 0` just returns the current break; otherwise
/// grows or shrinks the heap to end at `addr`, returning the new break.
pub fn brk(vmm: &Arc<VmmContext>, state: &mut BrkState, addr: u64) -> Result<u64> {
    if addr == 0 {
        return Ok(state.current);
    }
    if addr < HEAP_START {
        return Err(Errno::EINVAL);
    }
    if addr > state.current && addr - state.current > MAX_GROWTH {
        return Err(Errno::ENOMEM);
    }

    let new_mapped_end = page_align_up(addr);

    if new_mapped_end > state.mapped_end {
        let grow_len = (new_mapped_end - state.mapped_end) as usize;
        let mmu_flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::USER_ACCESSIBLE
            | PageTableFlags::NO_EXECUTE;
        vmm::map(vmm, state.mapped_end, 0, grow_len, MapFlags::ALLOCATE, mmu_flags)
            .map_err(|_| Errno::ENOMEM)?;
    } else if new_mapped_end < state.mapped_end {
        let shrink_len = (state.mapped_end - new_mapped_end) as usize;
        vmm::unmap(vmm, new_mapped_end, shrink_len);
    }

    state.mapped_end = new_mapped_end;
    state.current = addr;
    Ok(state.current)
}
