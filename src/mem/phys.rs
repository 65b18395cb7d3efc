//! Physical page pool.
//!
//! Pages are 2 MiB blocks. Every page is owned by exactly one of: the free
//! pool, a process's address space, the kernel, or a shared mapping. A
//! reference count is kept per allocated page so shared mappings keep the
//! backing alive; the count is at least 1 while the page is mapped
//! anywhere.

use crate::error::{KernelError, Result};
use crate::mem::PAGE_SIZE;
use alloc::collections::{BTreeMap, BTreeSet};
use spin::Mutex;

struct Pool {
    free: BTreeSet<u64>,
    /// Reference count per allocated page base.
    allocated: BTreeMap<u64, u32>,
}

static POOL: Mutex<Pool> = Mutex::new(Pool {
    free: BTreeSet::new(),
    allocated: BTreeMap::new(),
});

/// Seed the pool from the boot memory map. Regions are trimmed to whole
/// 2 MiB pages; anything smaller than one page is discarded.
pub fn init(regions: &[(u64, u64)]) {
    let mut pool = POOL.lock();
    for &(base, len) in regions {
        let first = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let end = (base + len) & !(PAGE_SIZE - 1);
        let mut page = first;
        while page < end {
            pool.free.insert(page);
            page += PAGE_SIZE;
        }
    }
    info!("phys: {} pages in pool", pool.free.len());
}

/// Allocate `pages` physically contiguous pages. Returns the base address
/// of the block; the caller becomes the owner (refcount 1 per page).
pub fn allocate(pages: u64) -> Result<u64> {
    if pages == 0 {
        return Err(KernelError::InvalidParam);
    }
    let mut pool = POOL.lock();

    // Scan the ordered free set for a run of `pages` consecutive pages.
    let mut run_start: Option<u64> = None;
    let mut run_len: u64 = 0;
    let mut prev: Option<u64> = None;
    let mut found: Option<u64> = None;
    for &page in pool.free.iter() {
        match prev {
            Some(p) if page == p + PAGE_SIZE => run_len += 1,
            _ => {
                run_start = Some(page);
                run_len = 1;
            }
        }
        prev = Some(page);
        if run_len == pages {
            found = run_start;
            break;
        }
    }

    let base = found.ok_or(KernelError::OutOfResource)?;
    for i in 0..pages {
        let page = base + i * PAGE_SIZE;
        pool.free.remove(&page);
        pool.allocated.insert(page, 1);
    }
    Ok(base)
}

/// Return a block to the pool unconditionally. Used for blocks that were
/// never shared; shared pages go through [`decref`].
pub fn free(base: u64, pages: u64) {
    let mut pool = POOL.lock();
    for i in 0..pages {
        let page = base + i * PAGE_SIZE;
        if pool.allocated.remove(&page).is_none() {
            // Double free of a physical page is a kernel bug.
            drop(pool);
            crate::panic::panic_stop_all("double free of physical page");
        }
        pool.free.insert(page);
    }
}

/// Add a reference to an allocated page (a second mapping shares it).
pub fn incref(page: u64) {
    let mut pool = POOL.lock();
    match pool.allocated.get_mut(&page) {
        Some(rc) => *rc += 1,
        None => {
            drop(pool);
            crate::panic::panic_stop_all("incref of unallocated physical page");
        }
    }
}

/// Drop a reference; the page returns to the pool when the count reaches
/// zero. Returns true if the page was freed.
pub fn decref(page: u64) -> bool {
    let mut pool = POOL.lock();
    match pool.allocated.get_mut(&page) {
        Some(rc) if *rc > 1 => {
            *rc -= 1;
            false
        }
        Some(_) => {
            pool.allocated.remove(&page);
            pool.free.insert(page);
            true
        }
        None => {
            drop(pool);
            crate::panic::panic_stop_all("decref of unallocated physical page");
        }
    }
}

pub fn free_page_count() -> usize {
    POOL.lock().free.len()
}

#[cfg(test)]
pub fn reset_for_test() {
    let mut pool = POOL.lock();
    pool.free.clear();
    pool.allocated.clear();
}
