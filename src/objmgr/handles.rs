// Handle number allocation.
//
// Numbers are handed out in one upward sequence for the whole system and
// retired permanently on close. Nothing here knows what a handle is used
// for; the per-thread tables do.

use core::sync::atomic::{AtomicU64, Ordering};

/// Opaque 64-bit handle. Zero is never allocated and doubles as "no
/// handle" in syscall arguments.
pub type Handle = u64;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh, never-before-used handle number.
pub fn allocate() -> Handle {
    let h = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    if h == u64::MAX {
        crate::panic::panic_stop_all("out of handles");
    }
    h
}

/// Retire a handle number. Numbers are not reused, so this is bookkeeping
/// only; the table owning the handle drops its object reference.
pub fn release(_handle: Handle) {}
