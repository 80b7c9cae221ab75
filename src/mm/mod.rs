/// Memory management subsystem.
///
/// Physical frames come from the bitmap PMM (`pmm`), fronted by a
/// per-CPU LIFO cache (`pmm_cache`). Virtual address spaces are built on
/// the four-level MMU (`mmu`) and owned by VMM contexts (`vmm`), which
/// also handle CoW and demand-zero faults. `slab` layers fixed-size
/// object caches on top of the PMM for kernel allocations below a page.
///
/// `buddy` and `paging` are the teacher's original modules, kept as
/// reference during the rewrite; nothing in this crate calls them
/// anymore. `address_space` and `fault` (the teacher's process-integrated
/// CoW fault path) are superseded outright by `mmu`/`vmm` and are left
/// on disk, unwired, for the same reason.

pub mod page;
pub mod pmm;
pub mod pmm_cache;
pub mod mmu;
pub mod vmm;
pub mod slab;

mod buddy;
mod paging;

// Re-export commonly used items
pub use page::{
    Pfn, Page, PageFlags, PhysAddr,
    pa_to_pfn, pfn_to_pa,
    page_align_down, page_align_up,
    PAGE_SIZE, PAGE_SHIFT,
};

pub use pmm::{MemoryRegion, PmmInfo};

pub use mmu::VirtAddr;

pub use vmm::{VmmContext, FaultKind};
