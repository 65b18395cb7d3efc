//! Blocking syscalls over wait-signalable objects.

use super::{abi, calling_thread};
use crate::error::{KernelError, Result};
use crate::objmgr::Handle;

pub(super) fn sc_wait_for_object(handle: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(wait_for_object(handle))
}

/// Block the calling thread until the referenced object signals. The
/// object must advertise the wait capability.
pub fn wait_for_object(handle: Handle) -> Result<()> {
    let thread = calling_thread()?;
    let node = thread
        .handles
        .lock()
        .retrieve_node(handle)
        .ok_or(KernelError::NotFound)?;
    let waitable = node.as_waitable().ok_or(KernelError::InvalidOp)?;
    waitable.wait_for_signal();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::current::set_current_for_test;
    use crate::process::test_support;
    use crate::tree;

    #[test]
    fn non_waitable_objects_are_refused() {
        let _env = test_support::lock_env();
        tree::init();
        let thread = test_support::kernel_thread();
        set_current_for_test(Some(thread.clone()));

        let node = tree::get_node("\\dev\\null").unwrap();
        let handle = thread.handles.lock().store(node);
        assert_eq!(wait_for_object(handle).unwrap_err(), KernelError::InvalidOp);
        assert_eq!(wait_for_object(9_999_999).unwrap_err(), KernelError::NotFound);

        set_current_for_test(None);
    }

    #[test]
    fn latched_signal_lets_the_waiter_straight_through() {
        let _env = test_support::lock_env();
        tree::init();
        let thread = test_support::kernel_thread();
        set_current_for_test(Some(thread.clone()));

        let node = tree::create_node("\\wait\\sc_synch_latched").unwrap();
        // Signal first: the wait consumes the latch without blocking, so
        // this returns.
        node.as_waitable().unwrap().signal_one();
        let handle = thread.handles.lock().store(node);
        wait_for_object(handle).unwrap();

        set_current_for_test(None);
        tree::delete_node("\\wait\\sc_synch_latched").unwrap();
    }
}
