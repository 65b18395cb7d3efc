//! Memory management.
//!
//! Physical pages are fixed 2 MiB blocks handed out by [`phys`]; virtual
//! space is tracked per process by [`virt`]; [`paging`] walks and edits
//! the x86-64 four-level tables (pages map as PD-level large entries);
//! [`pml4`] keeps the kernel half of every process's top-level table
//! byte-identical.
//!
//! The kernel half of the address space is process independent: any
//! mapping change there is performed under the PML4 registry lock and
//! propagated to every registered table before the lock is released, so
//! no process can observe a partially updated kernel map.

pub mod paging;
pub mod pat;
pub mod phys;
pub mod pml4;
pub mod virt;

use crate::error::{KernelError, Result};
use crate::process::task::Process;
use spin::Mutex;
use virt::RangeMap;

pub use pat::CacheMode;

/// Size of one physical page: 2 MiB, mapped as a PD-level large page.
pub const PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Size of one page table (and of the PML4).
pub const TABLE_SIZE: usize = 4096;

/// Base of the direct mapping of physical memory in the kernel half.
pub const PHYS_MAP_OFFSET: u64 = 0xFFFF_8000_0000_0000;

/// Kernel-space window handed out by `allocate_virtual_range` for the
/// kernel itself (MMIO windows and the like).
pub const KERNEL_VMM_BASE: u64 = 0xFFFF_9000_0000_0000;
pub const KERNEL_VMM_TOP: u64 = 0xFFFF_A000_0000_0000;

/// User-space window handed out for user processes.
pub const USER_VMM_BASE: u64 = 0x0000_0000_4000_0000;
pub const USER_VMM_TOP: u64 = 0x0000_7FFF_0000_0000;

/// Is this address in the kernel half (top bit set)?
#[inline]
pub fn is_kernel_addr(virt: u64) -> bool {
    virt & (1 << 63) != 0
}

/// Physical address of a kernel direct-map pointer. Pure arithmetic; only
/// valid for allocations living inside the direct map (the heap included).
#[inline]
pub fn kernel_virt_to_phys(virt: u64) -> u64 {
    virt.wrapping_sub(PHYS_MAP_OFFSET)
}

/// Kernel direct-map pointer for a physical address.
#[inline]
pub fn phys_to_kernel_virt(phys: u64) -> u64 {
    phys.wrapping_add(PHYS_MAP_OFFSET)
}

static KERNEL_RANGES: Mutex<RangeMap> = Mutex::new(RangeMap::new(KERNEL_VMM_BASE, KERNEL_VMM_TOP));

/// Allocate `pages` contiguous physical pages. The caller owns the block.
pub fn allocate_physical_pages(pages: u64) -> Result<u64> {
    phys::allocate(pages)
}

/// Return a physical block to the free pool.
pub fn free_physical_pages(base: u64, pages: u64) {
    phys::free(base, pages)
}

/// Find an unused, page-aligned virtual range. `process: None` allocates
/// from the kernel window.
pub fn allocate_virtual_range(pages: u64, process: Option<&Process>) -> Result<u64> {
    match process {
        Some(p) => p.mem.ranges.lock().allocate(pages),
        None => KERNEL_RANGES.lock().allocate(pages),
    }
}

/// Reserve a specific virtual range, failing if it overlaps an existing
/// allocation.
pub fn allocate_specific_virtual_range(
    base: u64,
    pages: u64,
    process: Option<&Process>,
) -> Result<()> {
    match process {
        Some(p) => p.mem.ranges.lock().allocate_specific(base, pages),
        None => KERNEL_RANGES.lock().allocate_specific(base, pages),
    }
}

/// Release a previously allocated virtual range, returning its length in
/// pages. `base` must be the exact start of an earlier allocation.
pub fn deallocate_virtual_range(base: u64, process: Option<&Process>) -> Result<u64> {
    match process {
        Some(p) => p.mem.ranges.lock().deallocate(base),
        None => KERNEL_RANGES.lock().deallocate(base),
    }
}

/// Length in pages of the allocation starting at `base`, or None if `base`
/// is not the start of an allocation.
pub fn virtual_allocation_size(base: u64, process: Option<&Process>) -> Option<u64> {
    match process {
        Some(p) => p.mem.ranges.lock().size_of(base),
        None => KERNEL_RANGES.lock().size_of(base),
    }
}

/// Install `pages` mappings from `phys` at `virt` with the given cache
/// mode. Fails with `AlreadyExists` if any target entry is present, in
/// which case nothing was mapped.
///
/// Kernel-half mappings are applied to the master table and synchronized
/// into every registered PML4 before this returns.
pub fn map_range(
    phys_base: u64,
    virt_base: u64,
    pages: u64,
    process: Option<&Process>,
    cache: CacheMode,
) -> Result<()> {
    if virt_base % PAGE_SIZE != 0 || phys_base % PAGE_SIZE != 0 || pages == 0 {
        return Err(KernelError::InvalidParam);
    }
    if is_kernel_addr(virt_base) {
        pml4::with_kernel_half_locked(|master_pml4_phys| {
            paging::map_pages_kernel_arena(master_pml4_phys, virt_base, phys_base, pages, false, cache)
        })
    } else {
        let proc = process.ok_or(KernelError::InvalidParam)?;
        paging::map_pages_kernel_arena(proc.mem.pml4_phys, virt_base, phys_base, pages, true, cache)
    }
}

/// Clear `pages` mappings starting at `virt`. With `free_backing`, each
/// backing page's reference count is dropped and the page returned to the
/// free pool when it reaches zero.
pub fn unmap_range(
    virt_base: u64,
    pages: u64,
    process: Option<&Process>,
    free_backing: bool,
) -> Result<()> {
    if virt_base % PAGE_SIZE != 0 || pages == 0 {
        return Err(KernelError::InvalidParam);
    }
    let unmap = |pml4_phys: u64| -> Result<()> {
        for i in 0..pages {
            let virt = virt_base + i * PAGE_SIZE;
            let phys = paging::unmap_page_kernel_arena(pml4_phys, virt)?;
            if free_backing {
                phys::decref(phys);
            }
        }
        Ok(())
    };
    if is_kernel_addr(virt_base) {
        pml4::with_kernel_half_locked(unmap)
    } else {
        let proc = process.ok_or(KernelError::InvalidParam)?;
        unmap(proc.mem.pml4_phys)
    }
}

/// Walk the tables, returning the physical address backing `virt`, or
/// None if any level is absent.
pub fn get_phys_addr(virt: u64, process: Option<&Process>) -> Option<u64> {
    let pml4_phys = if is_kernel_addr(virt) {
        pml4::master_table_phys()?
    } else {
        process?.mem.pml4_phys
    };
    paging::walk_kernel_arena(pml4_phys, virt)
}

/// Bring up the memory subsystem: PAT, heap, physical pool, table arena.
/// The heap comes first — the pool's bookkeeping lives on it.
///
/// `phys_regions` lists free physical RAM (the boot shim excludes the
/// kernel image and other reserved areas).
pub fn init(phys_regions: &[(u64, u64)]) -> Result<()> {
    pat::init();
    crate::heap::init();
    phys::init(phys_regions);
    paging::init_kernel_arena();

    info!("mem: {} pages in the free pool", phys::free_page_count());
    Ok(())
}
