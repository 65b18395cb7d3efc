// Identifying the calling thread.
//
// The kernel-GS MSR on each CPU holds a pointer to the running thread's
// saved-context record; the context points back at its thread. That is
// the whole lookup — no table, no lock, nothing that races with a thread
// migrating between CPUs.

use super::task::{Process, Thread};
use alloc::sync::Arc;

#[cfg(test)]
static TEST_CURRENT: spin::Mutex<Option<Arc<Thread>>> = spin::Mutex::new(None);

/// The thread executing on this CPU, or None before tasking starts.
pub fn current_thread() -> Option<Arc<Thread>> {
    #[cfg(test)]
    {
        TEST_CURRENT.lock().clone()
    }
    #[cfg(not(test))]
    {
        let ctx = crate::arch::x86_64::context::current_context();
        if ctx.is_null() {
            return None;
        }
        let owner = unsafe { (*ctx).owner() };
        if owner.is_null() {
            return None;
        }
        // The context's back-pointer carries no reference count of its
        // own; the per-CPU current slot holds the keep-alive reference
        // for as long as the thread can be "current" here.
        unsafe {
            Arc::increment_strong_count(owner);
            Some(Arc::from_raw(owner))
        }
    }
}

/// The process owning the calling thread.
pub fn current_process() -> Option<Arc<Process>> {
    current_thread().and_then(|t| t.process.upgrade())
}

/// Unit tests stand in for the MSR by naming the calling thread here.
#[cfg(test)]
pub fn set_current_for_test(thread: Option<Arc<Thread>>) {
    *TEST_CURRENT.lock() = thread;
}
