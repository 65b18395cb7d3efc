//! Signal-and-wait objects.
//!
//! A wait object holds a boolean signalled state and a FIFO of blocked
//! threads. Blocking syscalls and pipes are built on it. The queue logic
//! lives in [`WaitCore`], which knows nothing about the scheduler, so the
//! hand-over rules can be tested on their own; [`WaitObject`] adds the
//! actual suspend/resume dance.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use spin::Mutex;

use crate::process::current::current_thread;
use crate::process::scheduler;
use crate::process::task::ThreadRef;
use crate::tree::iface::{TreeNode, Waitable};

/// Scheduler-free state machine of a wait object.
///
/// A signal with no waiter latches; the next wait consumes the latch and
/// does not block. Waiters are released strictly in arrival order.
pub struct WaitCore<T> {
    signalled: bool,
    waiters: VecDeque<T>,
}

impl<T> WaitCore<T> {
    pub const fn new() -> Self {
        Self {
            signalled: false,
            waiters: VecDeque::new(),
        }
    }

    /// Returns true if a latched signal was consumed, meaning the caller
    /// may proceed without blocking.
    pub fn try_consume(&mut self) -> bool {
        if self.signalled {
            self.signalled = false;
            true
        } else {
            false
        }
    }

    pub fn enqueue(&mut self, who: T) {
        self.waiters.push_back(who);
    }

    /// Release the head waiter, or latch the signal if nobody is waiting.
    pub fn signal_one(&mut self) -> Option<T> {
        match self.waiters.pop_front() {
            Some(t) => Some(t),
            None => {
                self.signalled = true;
                None
            }
        }
    }

    /// Release every waiter, or latch the signal if nobody is waiting.
    pub fn signal_all(&mut self) -> Vec<T> {
        if self.waiters.is_empty() {
            self.signalled = true;
            return Vec::new();
        }
        self.waiters.drain(..).collect()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_signalled(&self) -> bool {
        self.signalled
    }
}

/// The kernel-facing wait object.
pub struct WaitObject {
    core: Mutex<WaitCore<ThreadRef>>,
}

impl core::fmt::Debug for WaitObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("WaitObject")
    }
}

impl WaitObject {
    pub const fn new() -> Self {
        Self {
            core: Mutex::new(WaitCore::new()),
        }
    }

    /// Block the calling thread until the object is signalled.
    ///
    /// A latched signal is consumed immediately. Otherwise the thread is
    /// enqueued and marked non-runnable while the internal lock is still
    /// held — releasing the lock first would let a signaller wake us
    /// before we ever went to sleep, losing the wakeup.
    pub fn wait_for_signal(&self) {
        let Some(thread) = current_thread() else {
            // Tasking not running yet; nothing to suspend.
            return;
        };

        let mut core = self.core.lock();
        if core.try_consume() {
            return;
        }
        core.enqueue(ThreadRef(thread.clone()));
        scheduler::pin_current();
        scheduler::stop_thread(&thread);
        drop(core);
        scheduler::unpin_current();
        scheduler::yield_now();
    }

    /// Wake the longest-waiting thread, or latch the signal.
    pub fn signal_one(&self) {
        let woken = self.core.lock().signal_one();
        if let Some(t) = woken {
            scheduler::start_thread(&t.0);
        }
    }

    /// Wake every waiting thread, or latch the signal.
    pub fn signal_all(&self) {
        let woken = self.core.lock().signal_all();
        for t in woken {
            scheduler::start_thread(&t.0);
        }
    }

    pub fn is_signalled(&self) -> bool {
        self.core.lock().is_signalled()
    }
}

impl Default for WaitObject {
    fn default() -> Self {
        Self::new()
    }
}

// A bare wait object can live in the system tree, so user programs can
// open it and block on it with wait_for_object.
impl TreeNode for WaitObject {
    fn as_waitable(&self) -> Option<&dyn Waitable> {
        Some(self)
    }
}

impl Waitable for WaitObject {
    fn wait_for_signal(&self) {
        WaitObject::wait_for_signal(self)
    }

    fn signal_one(&self) {
        WaitObject::signal_one(self)
    }

    fn signal_all(&self) {
        WaitObject::signal_all(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_latches_when_unwaited() {
        let mut core: WaitCore<u32> = WaitCore::new();
        assert!(!core.try_consume());
        assert_eq!(core.signal_one(), None);
        assert!(core.is_signalled());
        assert!(core.try_consume());
        assert!(!core.try_consume());
    }

    #[test]
    fn waiters_release_in_fifo_order() {
        let mut core: WaitCore<u32> = WaitCore::new();
        core.enqueue(1);
        core.enqueue(2);
        core.enqueue(3);
        assert_eq!(core.signal_one(), Some(1));
        assert_eq!(core.signal_one(), Some(2));
        assert_eq!(core.signal_one(), Some(3));
        assert_eq!(core.signal_one(), None);
    }

    #[test]
    fn signal_all_drains_everyone() {
        let mut core: WaitCore<u32> = WaitCore::new();
        core.enqueue(7);
        core.enqueue(8);
        assert_eq!(core.signal_all(), vec![7, 8]);
        assert!(!core.is_signalled());
        // With nobody waiting, a broadcast latches like signal_one.
        assert!(core.signal_all().is_empty());
        assert!(core.is_signalled());
    }
}
