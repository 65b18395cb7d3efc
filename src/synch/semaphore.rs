// Counting semaphore with a FIFO waiter queue.

use alloc::collections::VecDeque;
use spin::Mutex;

use crate::process::current::current_thread;
use crate::process::scheduler;
use crate::process::task::ThreadRef;

use super::mutex::{AcquireResult, WaitMode};

/// Counter and queue bookkeeping, independent of any scheduler.
pub struct SemaphoreCore<T> {
    users: u64,
    max_users: u64,
    waiters: VecDeque<T>,
}

impl<T> SemaphoreCore<T> {
    pub const fn new(max_users: u64, start_users: u64) -> Self {
        assert!(max_users != 0, "semaphore must admit at least one user");
        Self {
            users: start_users,
            max_users,
            waiters: VecDeque::new(),
        }
    }

    /// Take a slot if one is free.
    pub fn try_wait(&mut self) -> bool {
        if self.users < self.max_users {
            self.users += 1;
            true
        } else {
            false
        }
    }

    pub fn enqueue(&mut self, who: T) {
        self.waiters.push_back(who);
    }

    /// Give a slot back. A queued waiter is promoted directly into the
    /// freed slot (the count stays at maximum) and returned for waking.
    pub fn signal(&mut self) -> Option<T> {
        match self.waiters.pop_front() {
            Some(next) => {
                assert!(self.users == self.max_users);
                Some(next)
            }
            None => {
                assert!(self.users > 0, "signalling an idle semaphore");
                self.users -= 1;
                None
            }
        }
    }

    pub fn users(&self) -> u64 {
        self.users
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

/// The kernel semaphore. A thread must not wait on a semaphore it already
/// holds a slot of; it may never be woken.
pub struct KSemaphore {
    core: Mutex<SemaphoreCore<ThreadRef>>,
}

impl KSemaphore {
    pub const fn new(max_users: u64, start_users: u64) -> Self {
        Self {
            core: Mutex::new(SemaphoreCore::new(max_users, start_users)),
        }
    }

    /// Wait for a slot. See [`crate::synch::KMutex::acquire`] for why the
    /// thread is stopped before the internal lock is dropped.
    pub fn wait(&self, mode: WaitMode) -> AcquireResult {
        let Some(thread) = current_thread() else {
            return AcquireResult::Acquired;
        };

        let mut core = self.core.lock();
        if core.try_wait() {
            return AcquireResult::Acquired;
        }
        if mode == WaitMode::Try {
            return AcquireResult::Timeout;
        }

        core.enqueue(ThreadRef(thread.clone()));
        scheduler::pin_current();
        scheduler::stop_thread(&thread);
        drop(core);
        scheduler::unpin_current();
        scheduler::yield_now();

        // Promoted by a signaller; our slot is already counted.
        AcquireResult::Acquired
    }

    /// Release one slot, waking the head waiter if any.
    pub fn signal(&self) {
        let next = self.core.lock().signal();
        if let Some(t) = next {
            scheduler::start_thread(&t.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_up_to_max() {
        let mut core: SemaphoreCore<u32> = SemaphoreCore::new(2, 0);
        assert!(core.try_wait());
        assert!(core.try_wait());
        assert!(!core.try_wait());
        assert_eq!(core.users(), 2);
    }

    #[test]
    fn signal_prefers_waiters_fifo() {
        let mut core: SemaphoreCore<u32> = SemaphoreCore::new(1, 1);
        core.enqueue(10);
        core.enqueue(11);
        assert_eq!(core.signal(), Some(10));
        assert_eq!(core.users(), 1);
        assert_eq!(core.signal(), Some(11));
        assert_eq!(core.signal(), None);
        assert_eq!(core.users(), 0);
    }

    #[test]
    fn start_users_preloads_the_count() {
        let mut core: SemaphoreCore<u32> = SemaphoreCore::new(3, 2);
        assert!(core.try_wait());
        assert!(!core.try_wait());
    }
}
