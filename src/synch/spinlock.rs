// Two-state spinlock with a scoped guard.

use core::sync::atomic::{AtomicBool, Ordering};

/// The most basic lock in the kernel: free or held, acquired by busy
/// waiting. Unlike `spin::Mutex` it protects no particular value, which is
/// what the page-table and IPI code need — the guarded state is spread
/// over raw memory.
pub struct RawSpinlock {
    held: AtomicBool,
}

impl RawSpinlock {
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }

    /// Busy-wait until the lock is acquired, returning a guard that
    /// releases on every exit path.
    pub fn lock(&self) -> SpinlockGuard<'_> {
        while self
            .held
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinlockGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<SpinlockGuard<'_>> {
        if self
            .held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(SpinlockGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SpinlockGuard<'a> {
    lock: &'a RawSpinlock,
}

impl Drop for SpinlockGuard<'_> {
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_release() {
        let lock = RawSpinlock::new();
        assert!(!lock.is_held());
        {
            let _guard = lock.lock();
            assert!(lock.is_held());
            assert!(lock.try_lock().is_none());
        }
        assert!(!lock.is_held());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn guard_releases_on_panic_path() {
        let lock = RawSpinlock::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = lock.lock();
            panic!("boom");
        }));
        assert!(result.is_err());
        assert!(!lock.is_held());
    }
}
