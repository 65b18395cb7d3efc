//! Kernel heap.
//!
//! A linked-list allocator over a fixed region in the kernel image. The
//! image is loaded inside the direct map (see [`crate::mem`]), so
//! everything allocated here — page tables included — has a physical
//! address computable by plain arithmetic. Using an image region rather
//! than the page pool breaks the bootstrap cycle: the pool's own
//! bookkeeping lives on this heap.

use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicBool, Ordering};
use linked_list_allocator::LockedHeap;

pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

#[repr(C, align(4096))]
struct HeapRegion([u8; HEAP_SIZE]);

static mut HEAP_REGION: HeapRegion = HeapRegion([0; HEAP_SIZE]);

#[cfg_attr(not(test), global_allocator)]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

static HEAP_READY: AtomicBool = AtomicBool::new(false);

/// Hand the heap region to the allocator. Must run exactly once, before
/// the first allocation.
pub fn init() {
    assert!(!HEAP_READY.load(Ordering::SeqCst), "heap initialised twice");
    unsafe {
        ALLOCATOR
            .lock()
            .init(addr_of_mut!(HEAP_REGION) as *mut u8, HEAP_SIZE);
    }
    HEAP_READY.store(true, Ordering::SeqCst);
}

pub fn is_ready() -> bool {
    HEAP_READY.load(Ordering::SeqCst)
}

/// Bytes currently free in the heap.
pub fn free_bytes() -> usize {
    ALLOCATOR.lock().free()
}
