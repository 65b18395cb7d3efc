//! PML4 registry and kernel-half synchronization.
//!
//! Every process has its own PML4, and the upper 256 entries of each one
//! map the kernel. Editing one table is normally independent of the
//! others, which would let the kernel map something, switch CR3, and no
//! longer be able to see it. So the registry tracks every known PML4 and,
//! after any change to the kernel half, copies the modified upper half
//! into all the others before the lock is released.
//!
//! The single lock here serializes every kernel-half modification; callers
//! go through [`with_kernel_half_locked`] so the modify + synchronize pair
//! is atomic with respect to other processors.

use crate::error::{KernelError, Result};
use crate::mem::{kernel_virt_to_phys, TABLE_SIZE};
use alloc::vec::Vec;
use spin::Mutex;

/// Bytes in the kernel half of a PML4 (upper 256 entries).
pub const KERNEL_HALF_SIZE: usize = TABLE_SIZE / 2;

#[derive(Clone, Copy)]
struct Pml4Entry {
    virt: u64,
    phys: u64,
}

struct Registry {
    initialized: bool,
    tables: Vec<Pml4Entry>,
    /// Staging space so each synchronization reads the source half once.
    copy_buffer: [u8; KERNEL_HALF_SIZE],
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    initialized: false,
    tables: Vec::new(),
    copy_buffer: [0; KERNEL_HALF_SIZE],
});

/// Start tracking PML4 tables, seeding the registry with the boot table
/// that task 0 is already running on. Must only be called once.
pub fn init(boot_table_virt: u64, boot_table_phys: u64) {
    let mut reg = REGISTRY.lock();
    assert!(!reg.initialized, "PML4 registry initialised twice");
    reg.tables.push(Pml4Entry {
        virt: boot_table_virt,
        phys: boot_table_phys,
    });
    reg.initialized = true;
}

/// Allocate and register the PML4 for a new process.
///
/// The new table's kernel half is cloned from an existing table — all
/// registered tables are identical there, so the first one serves. The
/// user half starts empty. Returns (virtual, physical) addresses.
pub fn allocate_for_process() -> Result<(u64, u64)> {
    let table_virt = allocate_table_raw()?;
    let table_phys = kernel_virt_to_phys(table_virt);

    let mut reg = REGISTRY.lock();
    assert!(reg.initialized, "PML4 registry not initialised");
    let master = reg.tables[0];
    unsafe {
        core::ptr::copy_nonoverlapping(
            (master.virt as usize + KERNEL_HALF_SIZE) as *const u8,
            (table_virt as usize + KERNEL_HALF_SIZE) as *mut u8,
            KERNEL_HALF_SIZE,
        );
    }
    reg.tables.push(Pml4Entry {
        virt: table_virt,
        phys: table_phys,
    });
    trace!("pml4: {} tables registered", reg.tables.len());
    Ok((table_virt, table_phys))
}

/// Stop tracking and free the PML4 of a terminating process.
pub fn deallocate_for_process(table_virt: u64) {
    let mut reg = REGISTRY.lock();
    let before = reg.tables.len();
    reg.tables.retain(|t| t.virt != table_virt);
    if reg.tables.len() == before {
        drop(reg);
        crate::panic::panic_stop_all("deallocating an unregistered PML4");
    }
    drop(reg);
    free_table_raw(table_virt);
}

/// Run `f` with the kernel-half lock held, then propagate the master
/// table's upper half to every registered PML4 before releasing it.
///
/// `f` receives the master table's physical address and performs its edits
/// there; no process can observe a partially updated kernel map because
/// the same lock covers both the edit and the copies.
pub fn with_kernel_half_locked<R>(f: impl FnOnce(u64) -> Result<R>) -> Result<R> {
    let mut reg = REGISTRY.lock();
    if !reg.initialized {
        return Err(KernelError::Unknown);
    }
    let master = reg.tables[0];
    let result = f(master.phys)?;
    synchronize_locked(&mut reg, master.virt);
    Ok(result)
}

/// Copy the kernel half of `updated_virt` into every registered table.
/// The caller must guarantee no other PML4 changes until this returns;
/// [`with_kernel_half_locked`] is the usual way in.
pub fn synchronize(updated_virt: u64) {
    let mut reg = REGISTRY.lock();
    synchronize_locked(&mut reg, updated_virt);
}

fn synchronize_locked(reg: &mut Registry, updated_virt: u64) {
    let expected = reg.tables.len();
    unsafe {
        core::ptr::copy_nonoverlapping(
            (updated_virt as usize + KERNEL_HALF_SIZE) as *const u8,
            reg.copy_buffer.as_mut_ptr(),
            KERNEL_HALF_SIZE,
        );
    }
    let mut updated = 0usize;
    for t in reg.tables.iter() {
        unsafe {
            core::ptr::copy_nonoverlapping(
                reg.copy_buffer.as_ptr(),
                (t.virt as usize + KERNEL_HALF_SIZE) as *mut u8,
                KERNEL_HALF_SIZE,
            );
        }
        updated += 1;
    }
    if updated != expected {
        crate::panic::panic_stop_all("PML4 synchronization miscounted");
    }
}

/// Physical address of the master (first registered) table.
pub fn master_table_phys() -> Option<u64> {
    let reg = REGISTRY.lock();
    if reg.initialized {
        reg.tables.first().map(|t| t.phys)
    } else {
        None
    }
}

/// Virtual address of the master table.
pub fn master_table_virt() -> Option<u64> {
    let reg = REGISTRY.lock();
    if reg.initialized {
        reg.tables.first().map(|t| t.virt)
    } else {
        None
    }
}

pub fn registered_count() -> usize {
    REGISTRY.lock().tables.len()
}

/// A zeroed, 4 KiB-aligned table from the kernel heap. The heap lives in
/// the direct map, so the physical address follows by arithmetic.
fn allocate_table_raw() -> Result<u64> {
    let layout = core::alloc::Layout::from_size_align(TABLE_SIZE, TABLE_SIZE).unwrap();
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        return Err(KernelError::OutOfResource);
    }
    Ok(ptr as u64)
}

fn free_table_raw(virt: u64) {
    let layout = core::alloc::Layout::from_size_align(TABLE_SIZE, TABLE_SIZE).unwrap();
    unsafe { alloc::alloc::dealloc(virt as *mut u8, layout) };
}

#[cfg(test)]
pub fn reset_for_test() {
    let mut reg = REGISTRY.lock();
    reg.tables.clear();
    reg.initialized = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::test_support::lock_env;

    fn kernel_half(table_virt: u64) -> &'static [u8] {
        unsafe {
            core::slice::from_raw_parts(
                (table_virt as usize + KERNEL_HALF_SIZE) as *const u8,
                KERNEL_HALF_SIZE,
            )
        }
    }

    fn fresh_boot_table() -> u64 {
        let t = allocate_table_raw().unwrap();
        // Give the boot table a recognisable kernel half.
        unsafe {
            core::ptr::write_bytes((t as usize + KERNEL_HALF_SIZE) as *mut u8, 0xA5, 64);
        }
        t
    }

    #[test]
    fn new_process_inherits_the_kernel_half() {
        let _g = lock_env();
        reset_for_test();
        let boot = fresh_boot_table();
        init(boot, kernel_virt_to_phys(boot));

        let (p1, _) = allocate_for_process().unwrap();
        assert_eq!(kernel_half(p1), kernel_half(boot));
        assert_eq!(registered_count(), 2);
    }

    #[test]
    fn kernel_half_change_propagates_to_all_tables() {
        let _g = lock_env();
        reset_for_test();
        let boot = fresh_boot_table();
        init(boot, kernel_virt_to_phys(boot));
        let (p1, _) = allocate_for_process().unwrap();
        let (p2, _) = allocate_for_process().unwrap();

        // Write a fresh entry into P1's kernel half, then synchronize.
        unsafe {
            let slot = (p1 as usize + KERNEL_HALF_SIZE + 128) as *mut u64;
            slot.write(0xDEAD_BEEF_0000_0083);
        }
        synchronize(p1);

        // The raw bytes of every table's upper half now agree.
        assert_eq!(kernel_half(p1), kernel_half(p2));
        assert_eq!(kernel_half(p1), kernel_half(boot));
        let slot = unsafe { ((p2 as usize + KERNEL_HALF_SIZE + 128) as *const u64).read() };
        assert_eq!(slot, 0xDEAD_BEEF_0000_0083);
    }

    #[test]
    fn locked_edit_synchronizes_on_success() {
        let _g = lock_env();
        reset_for_test();
        let boot = fresh_boot_table();
        init(boot, kernel_virt_to_phys(boot));
        let (p1, _) = allocate_for_process().unwrap();

        let master_virt = boot;
        with_kernel_half_locked(|_master_phys| {
            unsafe {
                let slot = (master_virt as usize + KERNEL_HALF_SIZE + 8) as *mut u64;
                slot.write(0x1234_5678_0000_0001);
            }
            Ok(())
        })
        .unwrap();
        let slot = unsafe { ((p1 as usize + KERNEL_HALF_SIZE + 8) as *const u64).read() };
        assert_eq!(slot, 0x1234_5678_0000_0001);
    }

    #[test]
    fn deallocate_forgets_the_table() {
        let _g = lock_env();
        reset_for_test();
        let boot = fresh_boot_table();
        init(boot, kernel_virt_to_phys(boot));
        let (p1, _) = allocate_for_process().unwrap();
        assert_eq!(registered_count(), 2);
        deallocate_for_process(p1);
        assert_eq!(registered_count(), 1);
    }
}
