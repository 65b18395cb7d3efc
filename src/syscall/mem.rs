//! Memory syscalls: backing allocations and cross-process mappings.

use super::{abi, calling_thread, check_um_ptr, is_um_address};
use crate::error::{KernelError, Result};
use crate::mem::{self, PAGE_SIZE};
use crate::objmgr::Handle;
use crate::process::current::current_process;
use crate::process::task::Process;
use alloc::sync::Arc;

pub(super) fn sc_allocate_backing_memory(pages: u64, map_addr: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(allocate_backing_memory(pages, map_addr))
}

/// Back `pages` pages of the calling process with fresh physical RAM.
///
/// `map_addr` points at an in-out slot: if the slot holds null the kernel
/// picks a free range and writes it back; otherwise the slot names the
/// page-aligned base to map. A range with any page already mapped is
/// rejected whole.
pub fn allocate_backing_memory(pages: u64, map_addr: u64) -> Result<()> {
    check_um_ptr(map_addr)?;
    if pages == 0 || pages > (1 << 40) / PAGE_SIZE {
        return Err(KernelError::InvalidParam);
    }
    let process = current_process().ok_or(KernelError::InvalidOp)?;

    let requested = unsafe { (map_addr as *const u64).read() };
    let base = if requested == 0 {
        mem::allocate_virtual_range(pages, Some(&process))?
    } else {
        if requested % PAGE_SIZE != 0
            || !is_um_address(requested)
            || !is_um_address(requested + pages * PAGE_SIZE)
        {
            return Err(KernelError::InvalidParam);
        }
        requested
    };

    // Nothing in the range may be mapped already; check before touching
    // anything so failure leaves no trace.
    for i in 0..pages {
        if mem::get_phys_addr(base + i * PAGE_SIZE, Some(&process)).is_some() {
            if requested == 0 {
                let _ = mem::deallocate_virtual_range(base, Some(&process));
            }
            return Err(KernelError::InvalidOp);
        }
    }
    if requested != 0 {
        mem::allocate_specific_virtual_range(base, pages, Some(&process))?;
    }

    let phys = match mem::allocate_physical_pages(pages) {
        Ok(p) => p,
        Err(e) => {
            let _ = mem::deallocate_virtual_range(base, Some(&process));
            return Err(e);
        }
    };
    if let Err(e) = mem::map_range(phys, base, pages, Some(&process), mem::CacheMode::WriteBack) {
        mem::free_physical_pages(phys, pages);
        let _ = mem::deallocate_virtual_range(base, Some(&process));
        return Err(e);
    }

    unsafe { (map_addr as *mut u64).write(base) };
    Ok(())
}

pub(super) fn sc_release_backing_memory(dealloc_addr: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(release_backing_memory(dealloc_addr))
}

/// Undo an [`allocate_backing_memory`]. The length comes from the
/// process's range table; an address that is not the base of a previous
/// allocation is `NotFound`.
pub fn release_backing_memory(dealloc_addr: u64) -> Result<()> {
    if !is_um_address(dealloc_addr) {
        return Err(KernelError::InvalidOp);
    }
    let process = current_process().ok_or(KernelError::InvalidOp)?;

    let pages = mem::virtual_allocation_size(dealloc_addr, Some(&process))
        .ok_or(KernelError::NotFound)?;
    mem::unmap_range(dealloc_addr, pages, Some(&process), true)?;
    mem::deallocate_virtual_range(dealloc_addr, Some(&process))?;
    Ok(())
}

pub(super) fn sc_map_memory(target_proc: u64, target_addr: u64, length: u64, source_proc: u64, source_addr: u64, _a6: u64) -> u64 {
    abi(map_memory(target_proc, target_addr, length, source_proc, source_addr))
}

/// Map memory already present in one process into another, so both end up
/// sharing the same physical pages. A handle of zero names the calling
/// process on either side.
pub fn map_memory(
    target_proc_handle: Handle,
    target_addr: u64,
    length: u64,
    source_proc_handle: Handle,
    source_addr: u64,
) -> Result<()> {
    if length == 0
        || length % PAGE_SIZE != 0
        || target_addr == 0
        || source_addr == 0
        || !is_um_address(target_addr)
        || !is_um_address(source_addr)
        || target_addr % PAGE_SIZE != 0
        || source_addr % PAGE_SIZE != 0
    {
        return Err(KernelError::InvalidParam);
    }
    let pages = length / PAGE_SIZE;

    let target = resolve_process_handle(target_proc_handle)?;
    let source = resolve_process_handle(source_proc_handle)?;

    // Every target page must be absent and every source page present.
    for i in 0..pages {
        if mem::get_phys_addr(target_addr + i * PAGE_SIZE, Some(&target)).is_some() {
            return Err(KernelError::InvalidOp);
        }
        if mem::get_phys_addr(source_addr + i * PAGE_SIZE, Some(&source)).is_none() {
            return Err(KernelError::InvalidParam);
        }
    }

    mem::allocate_specific_virtual_range(target_addr, pages, Some(&target))?;
    for i in 0..pages {
        let phys = mem::get_phys_addr(source_addr + i * PAGE_SIZE, Some(&source))
            .expect("checked above") & !(PAGE_SIZE - 1);
        crate::mem::phys::incref(phys);
        if let Err(e) = mem::map_range(
            phys,
            target_addr + i * PAGE_SIZE,
            1,
            Some(&target),
            mem::CacheMode::WriteBack,
        ) {
            crate::mem::phys::decref(phys);
            for j in 0..i {
                let _ = mem::unmap_range(target_addr + j * PAGE_SIZE, 1, Some(&target), true);
            }
            let _ = mem::deallocate_virtual_range(target_addr, Some(&target));
            return Err(e);
        }
    }
    Ok(())
}

/// A process handle, or the calling process for handle zero.
fn resolve_process_handle(handle: Handle) -> Result<Arc<Process>> {
    if handle == 0 {
        return current_process().ok_or(KernelError::InvalidOp);
    }
    let thread = calling_thread()?;
    let node = thread
        .handles
        .lock()
        .retrieve_node(handle)
        .ok_or(KernelError::InvalidParam)?;
    let process = node.as_process().ok_or(KernelError::InvalidParam)?;
    Ok(process.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_parameters_fail_before_any_lookup() {
        // No current process in these cases, so parameter validation must
        // come first and report cleanly.
        assert_eq!(
            allocate_backing_memory(1, 0).unwrap_err(),
            KernelError::InvalidParam
        );
        assert_eq!(
            map_memory(0, 0x1000, PAGE_SIZE, 0, 0x2000).unwrap_err(),
            KernelError::InvalidParam
        );
        assert_eq!(
            map_memory(0, PAGE_SIZE, PAGE_SIZE + 1, 0, PAGE_SIZE).unwrap_err(),
            KernelError::InvalidParam
        );
        assert_eq!(
            release_backing_memory(0xFFFF_8000_0000_0000).unwrap_err(),
            KernelError::InvalidOp
        );
    }

    #[test]
    fn zero_pages_is_invalid() {
        let slot = 0u64;
        assert_eq!(
            allocate_backing_memory(0, &slot as *const u64 as u64).unwrap_err(),
            KernelError::InvalidParam
        );
    }
}
