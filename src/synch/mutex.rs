//! Scheduler-integrated mutex with a FIFO waiter queue.
//!
//! Contended acquires hand the lock over directly: on release, the head of
//! the waiter queue becomes the owner before it even runs again, so the
//! order of successful acquires equals the order of arrival.

use alloc::collections::VecDeque;
use spin::Mutex;

use crate::process::current::current_thread;
use crate::process::scheduler;
use crate::process::task::ThreadRef;

/// How long an acquire may wait. Finite timeouts are not supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Fail immediately if the lock is held.
    Try,
    /// Wait until the lock is handed to us.
    Infinite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired,
    Timeout,
}

/// Ownership and queue bookkeeping, independent of any scheduler.
pub struct MutexCore<T: Clone + PartialEq> {
    locked: bool,
    owner: Option<T>,
    waiters: VecDeque<T>,
}

impl<T: Clone + PartialEq> MutexCore<T> {
    pub const fn new() -> Self {
        Self {
            locked: false,
            owner: None,
            waiters: VecDeque::new(),
        }
    }

    /// Take the lock if it is free.
    pub fn try_acquire(&mut self, who: &T) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        self.owner = Some(who.clone());
        true
    }

    pub fn enqueue(&mut self, who: T) {
        self.waiters.push_back(who);
    }

    /// Release the lock. If a waiter is queued, ownership passes to it and
    /// the new owner is returned so the caller can wake it. Releasing a
    /// lock one does not own is a caller bug.
    pub fn release(&mut self, who: &T) -> Option<T> {
        assert!(self.locked, "releasing an unlocked mutex");
        assert!(
            self.owner.as_ref() == Some(who),
            "releasing a mutex owned by another thread"
        );
        match self.waiters.pop_front() {
            Some(next) => {
                self.owner = Some(next.clone());
                Some(next)
            }
            None => {
                self.locked = false;
                self.owner = None;
                None
            }
        }
    }

    pub fn is_owned_by(&self, who: &T) -> bool {
        self.locked && self.owner.as_ref() == Some(who)
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

/// The kernel mutex.
pub struct KMutex {
    core: Mutex<MutexCore<ThreadRef>>,
}

impl KMutex {
    pub const fn new() -> Self {
        Self {
            core: Mutex::new(MutexCore::new()),
        }
    }

    /// Acquire the mutex for the calling thread.
    ///
    /// With [`WaitMode::Infinite`], a contended caller is queued and
    /// suspended; it resumes only once ownership has been handed to it.
    /// The thread is marked non-runnable while the internal lock is still
    /// held, otherwise the release path could hand us the mutex and wake
    /// us before we ever slept.
    pub fn acquire(&self, mode: WaitMode) -> AcquireResult {
        let Some(thread) = current_thread() else {
            // Tasking is not running yet; there is exactly one execution
            // context, so the lock is trivially ours.
            return AcquireResult::Acquired;
        };
        let me = ThreadRef(thread.clone());

        let mut core = self.core.lock();
        if core.try_acquire(&me) {
            return AcquireResult::Acquired;
        }
        if mode == WaitMode::Try {
            return AcquireResult::Timeout;
        }

        core.enqueue(me.clone());
        scheduler::pin_current();
        scheduler::stop_thread(&thread);
        drop(core);
        scheduler::unpin_current();
        scheduler::yield_now();

        // We were scheduled again, so the releaser handed us ownership.
        let core = self.core.lock();
        assert!(core.is_owned_by(&me), "woken without mutex ownership");
        AcquireResult::Acquired
    }

    /// Release the mutex, waking the next owner if one is queued.
    pub fn release(&self) {
        let next = {
            let mut core = self.core.lock();
            match current_thread() {
                Some(thread) => core.release(&ThreadRef(thread)),
                None => {
                    // Pre-tasking release of a pre-tasking acquire.
                    self::release_ownerless(&mut core)
                }
            }
        };
        if let Some(t) = next {
            scheduler::start_thread(&t.0);
        }
    }
}

fn release_ownerless(core: &mut MutexCore<ThreadRef>) -> Option<ThreadRef> {
    let owner = core.owner.clone();
    match owner {
        Some(o) => core.release(&o),
        None => None,
    }
}

impl Default for KMutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_release() {
        let mut core: MutexCore<u32> = MutexCore::new();
        assert!(core.try_acquire(&1));
        assert!(core.is_owned_by(&1));
        assert!(!core.try_acquire(&2));
        assert_eq!(core.release(&1), None);
        assert!(core.try_acquire(&2));
    }

    #[test]
    fn contended_handover_is_fifo() {
        let mut core: MutexCore<u32> = MutexCore::new();
        assert!(core.try_acquire(&1));
        // B then C arrive while A holds the lock.
        core.enqueue(2);
        core.enqueue(3);
        // A releases: B acquires before C.
        assert_eq!(core.release(&1), Some(2));
        assert!(core.is_owned_by(&2));
        assert_eq!(core.release(&2), Some(3));
        assert!(core.is_owned_by(&3));
        assert_eq!(core.release(&3), None);
        assert!(!core.is_owned_by(&3));
    }

    #[test]
    #[should_panic(expected = "owned by another thread")]
    fn foreign_release_panics() {
        let mut core: MutexCore<u32> = MutexCore::new();
        assert!(core.try_acquire(&1));
        let _ = core.release(&2);
    }
}
