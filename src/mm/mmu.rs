//! Four-level x86_64 page table engine.
//!
//! Two entry points into the hierarchy, kept deliberately separate:
//! `walk` never allocates and only tells you what is already mapped;
//! `ensure` allocates missing directories as it descends. Fault handling
//! and read-only queries use `walk`; `map` and friends use `ensure`.
//! Intermediate directory frames come from the calling CPU's
//! [`pmm_cache`](crate::mm::pmm_cache), matching the per-CPU cache every
//! other frame consumer uses.

use crate::mm::{pmm, pmm_cache};
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::{PageTable, PageTableFlags, PhysFrame};
pub use x86_64::{PhysAddr as X86PhysAddr, VirtAddr};

pub use pmm::PHYS_MEM_OFFSET;

/// Software-defined bit (available to the OS in any x86_64 PTE): marks a
/// read-only page as "was writable before a CoW fork", so the fault
/// handler knows to actually copy rather than just re-mark writable.
pub const COW_BIT: PageTableFlags = PageTableFlags::BIT_9;

const ENTRIES_PER_TABLE: usize = 512;

#[inline]
pub fn phys_to_virt(pa: u64) -> VirtAddr {
    VirtAddr::new(pa + PHYS_MEM_OFFSET)
}

fn table_at(pa: u64) -> &'static mut PageTable {
    unsafe { &mut *(phys_to_virt(pa).as_u64() as *mut PageTable) }
}

fn indices(virt: VirtAddr) -> [usize; 4] {
    let a = virt.as_u64();
    [
        ((a >> 39) & 0x1FF) as usize,
        ((a >> 30) & 0x1FF) as usize,
        ((a >> 21) & 0x1FF) as usize,
        ((a >> 12) & 0x1FF) as usize,
    ]
}

fn alloc_table_frame() -> Result<u64, crate::lib::error::KernelError> {
    let phys = pmm_cache::alloc()?;
    let table = table_at(phys);
    table.zero();
    Ok(phys)
}

fn free_table_frame(phys: u64) {
    pmm_cache::free(phys);
}

/// An address space: one PML4 per process (or the shared kernel one).
pub struct AddressSpace {
    pml4_phys: u64,
}

impl AddressSpace {
    /// Wraps the page table currently loaded in CR3.
    pub fn current() -> Self {
        let (frame, _) = Cr3::read();
        Self { pml4_phys: frame.start_address().as_u64() }
    }

    pub fn phys(&self) -> u64 {
        self.pml4_phys
    }

    /// Creates a fresh address space, copying the kernel's upper-half
    /// PML4 entries from `kernel_template` (indices 256..512, the
    /// canonical higher-half split) so every process shares kernel
    /// mappings without walking anything below that split.
    pub fn new(kernel_template: &AddressSpace) -> Result<Self, crate::lib::error::KernelError> {
        let pml4_phys = alloc_table_frame()?;
        let new_table = table_at(pml4_phys);
        let template = table_at(kernel_template.pml4_phys);
        for i in 256..ENTRIES_PER_TABLE {
            new_table[i] = template[i].clone();
        }
        Ok(Self { pml4_phys })
    }

    /// Pure walk: returns the leaf PTE only if every intermediate
    /// directory already exists. Never allocates.
    fn walk(&self, virt: VirtAddr) -> Option<&'static mut x86_64::structures::paging::PageTableEntry> {
        let idx = indices(virt);
        let mut table = table_at(self.pml4_phys);
        for level in 0..3 {
            let entry = &mut table[idx[level]];
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                return None;
            }
            table = table_at(entry.addr().as_u64());
        }
        Some(&mut table[idx[3]])
    }

    /// Allocating walk: creates missing directories (read/write/user, so
    /// permission narrowing happens only at the leaf) as it descends.
    fn ensure(&mut self, virt: VirtAddr) -> Result<&'static mut x86_64::structures::paging::PageTableEntry, crate::lib::error::KernelError> {
        let idx = indices(virt);
        let mut table_phys = self.pml4_phys;
        for level in 0..3 {
            let table = table_at(table_phys);
            let entry = &mut table[idx[level]];
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                let child = alloc_table_frame()?;
                entry.set_addr(
                    x86_64::PhysAddr::new(child),
                    PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE,
                );
                table_phys = child;
            } else {
                table_phys = entry.addr().as_u64();
            }
        }
        let table = table_at(table_phys);
        Ok(&mut table[idx[3]])
    }

    /// Maps a single frame. Fails with `AlreadyExists` if the virtual
    /// page is already mapped.
    pub fn map(&mut self, virt: VirtAddr, phys: u64, flags: PageTableFlags) -> Result<(), crate::lib::error::KernelError> {
        let entry = self.ensure(virt)?;
        if entry.flags().contains(PageTableFlags::PRESENT) {
            return Err(crate::lib::error::KernelError::AlreadyExists);
        }
        entry.set_addr(x86_64::PhysAddr::new(phys), flags | PageTableFlags::PRESENT);
        invalidate(virt);
        Ok(())
    }

    /// Overwrites an existing mapping's frame/flags in place (used by
    /// the CoW fault path once a private copy has been made).
    pub fn remap(&mut self, virt: VirtAddr, phys: u64, flags: PageTableFlags) {
        if let Some(entry) = self.walk(virt) {
            entry.set_addr(x86_64::PhysAddr::new(phys), flags | PageTableFlags::PRESENT);
            invalidate(virt);
        }
    }

    /// Unmaps a page, returning the frame that was mapped there (the
    /// caller decides whether to free it -- shared/CoW frames are
    /// refcounted by the VMM, not by the MMU).
    pub fn unmap(&mut self, virt: VirtAddr) -> Option<u64> {
        let entry = self.walk(virt)?;
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        let phys = entry.addr().as_u64();
        entry.set_unused();
        invalidate(virt);
        Some(phys)
    }

    pub fn get_physical(&self, virt: VirtAddr) -> Option<u64> {
        let entry = self.walk(virt)?;
        if !entry.flags().contains(PageTableFlags::PRESENT) {
            return None;
        }
        Some(entry.addr().as_u64() + (virt.as_u64() & 0xFFF))
    }

    pub fn flags_of(&self, virt: VirtAddr) -> Option<PageTableFlags> {
        let entry = self.walk(virt)?;
        entry.flags().contains(PageTableFlags::PRESENT).then(|| entry.flags())
    }

    /// Marks a present mapping read-only and flags it as CoW-eligible
    /// (recording whether it was writable so the fault handler can tell
    /// a real CoW fault from a write to a genuinely read-only page).
    pub fn mark_cow(&mut self, virt: VirtAddr) {
        if let Some(entry) = self.walk(virt) {
            if !entry.flags().contains(PageTableFlags::PRESENT) {
                return;
            }
            let writable = entry.flags().contains(PageTableFlags::WRITABLE);
            let mut flags = entry.flags() & !PageTableFlags::WRITABLE;
            if writable {
                flags |= COW_BIT;
            }
            let phys = entry.addr();
            entry.set_addr(phys, flags);
        }
    }

    /// Recursively duplicates this address space's user-half mappings
    /// into `dst`, bumping every leaf frame's refcount and marking
    /// shareable, writable leaves CoW in both copies. Kernel-half
    /// (indices 256..512) entries are shared verbatim, not duplicated.
    pub fn duplicate_into(&mut self, dst: &mut AddressSpace) -> Result<(), crate::lib::error::KernelError> {
        let src_table = table_at(self.pml4_phys);
        let dst_table = table_at(dst.pml4_phys);
        for i in 0..256 {
            if src_table[i].flags().contains(PageTableFlags::PRESENT) {
                dst_table[i] = duplicate_recursive(src_table[i].addr().as_u64(), src_table[i].flags(), 3)?;
            }
        }
        Ok(())
    }

    /// Tears down the user half of this address space, returning every
    /// owned leaf frame to the PMM (shared frames are just refcount-
    /// dropped via the VMM before this runs). Does not free the PML4
    /// itself; call `destroy` for that.
    pub fn destroy(self) {
        let table = table_at(self.pml4_phys);
        for i in 0..256 {
            if table[i].flags().contains(PageTableFlags::PRESENT) {
                destroy_recursive(table[i].addr().as_u64(), 3);
            }
        }
        free_table_frame(self.pml4_phys);
    }

    /// Loads this address space into CR3.
    ///
    /// # Safety
    /// Caller must ensure the current kernel stack and code remain
    /// mapped in the new address space.
    pub unsafe fn switch(&self) {
        let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(self.pml4_phys));
        Cr3::write(frame, Cr3Flags::empty());
    }
}

fn duplicate_recursive(entry_phys: u64, entry_flags: PageTableFlags, level: usize) -> Result<x86_64::structures::paging::PageTableEntry, crate::lib::error::KernelError> {
    use x86_64::structures::paging::PageTableEntry;

    if level == 0 {
        crate::mm::pmm::frame_get(entry_phys);
        let mut new_entry = PageTableEntry::new();
        let writable = entry_flags.contains(PageTableFlags::WRITABLE);
        let mut flags = entry_flags;
        if !entry_flags.contains(PageTableFlags::BIT_10) {
            // BIT_10: "shared" marker (kept writable+shared, e.g. shmem); anything
            // else loses WRITABLE and gains the CoW marker if it had it.
            flags.remove(PageTableFlags::WRITABLE);
            if writable {
                flags.insert(COW_BIT);
            }
        }
        new_entry.set_addr(x86_64::PhysAddr::new(entry_phys), flags);
        return Ok(new_entry);
    }

    let src = table_at(entry_phys);
    let new_phys = alloc_table_frame()?;
    let dst = table_at(new_phys);

    for i in 0..ENTRIES_PER_TABLE {
        if src[i].flags().contains(PageTableFlags::PRESENT) {
            dst[i] = duplicate_recursive(src[i].addr().as_u64(), src[i].flags(), level - 1)?;
            if level == 1 {
                src[i] = dst[i].clone();
            }
        }
    }

    let mut new_entry = x86_64::structures::paging::PageTableEntry::new();
    new_entry.set_addr(x86_64::PhysAddr::new(new_phys), entry_flags);
    Ok(new_entry)
}

fn destroy_recursive(entry_phys: u64, level: usize) {
    if level == 0 {
        crate::mm::pmm::frame_put(entry_phys);
        return;
    }

    let directory = table_at(entry_phys);
    for i in 0..ENTRIES_PER_TABLE {
        if directory[i].flags().contains(PageTableFlags::PRESENT) {
            destroy_recursive(directory[i].addr().as_u64(), level - 1);
        }
    }
    free_table_frame(entry_phys);
}

/// Loads a raw PML4 physical address into CR3 directly, for callers (the
/// scheduler) that track an address space only by its physical root and
/// don't otherwise need an [`AddressSpace`] handle.
///
/// # Safety
/// Same obligations as [`AddressSpace::switch`].
pub unsafe fn switch_to_phys(pml4_phys: u64) {
    let frame = PhysFrame::containing_address(x86_64::PhysAddr::new(pml4_phys));
    Cr3::write(frame, Cr3Flags::empty());
}

/// Invalidates a single virtual page's TLB entry on this CPU. Shootdown
/// to other CPUs sharing the address space is the caller's job (see
/// [`crate::smp::ipi`]).
pub fn invalidate(virt: VirtAddr) {
    use x86_64::instructions::tlb;
    tlb::flush(virt);
}

/// Full local TLB flush (CR3 reload). Used when invalidating more pages
/// than a handful of `invlpg`s would be worth.
pub fn invalidate_all() {
    use x86_64::instructions::tlb;
    tlb::flush_all();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extraction_matches_canonical_layout() {
        let virt = VirtAddr::new(0xFFFF_8000_0000_1234);
        let idx = indices(virt);
        assert_eq!(idx[3], 0x1); // PT index from bits 12..21
        assert_eq!(virt.as_u64() & 0xFFF, 0x234);
    }
}
