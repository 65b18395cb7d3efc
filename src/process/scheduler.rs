//! Round-robin scheduler.
//!
//! One global FIFO of runnable threads, gated per thread by the
//! permit-running flag. The selection path runs on the reschedule
//! interrupt stack ([`crate::arch::x86_64::context`]); picking a thread
//! rotates it to the back of the queue, threads found blocked or
//! suspended fall out of the queue (they return via [`start_thread`]),
//! and terminated threads are dropped so their contexts can finally be
//! freed. When nothing is runnable, each CPU falls back to its own idle
//! thread.

use super::task::{Thread, ThreadState};
use crate::smp::MAX_CPUS;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::{Mutex, Once};

static RUN_QUEUE: Mutex<VecDeque<Arc<Thread>>> = Mutex::new(VecDeque::new());

static CURRENT: [Mutex<Option<Arc<Thread>>>; MAX_CPUS] =
    [const { Mutex::new(None) }; MAX_CPUS];

static PINNED: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

static IDLE_THREADS: Once<Vec<Arc<Thread>>> = Once::new();

/// Allow a thread to be scheduled, queueing it if it is not already
/// queued. Also the wake half of every blocking primitive.
pub fn start_thread(thread: &Arc<Thread>) {
    thread.set_state(ThreadState::Runnable);
    thread.set_permit_running(true);
    if thread.try_mark_queued() {
        RUN_QUEUE.lock().push_back(thread.clone());
    }
}

/// Take a thread out of scheduling (it blocks). The queue entry, if any,
/// is discarded lazily by [`select_next`].
pub fn stop_thread(thread: &Arc<Thread>) {
    thread.set_permit_running(false);
    thread.set_state(ThreadState::Blocked);
}

/// Mark a thread as gone for good. Once the queue forgets it, the last
/// reference drops and the context is freed.
pub fn terminate_thread(thread: &Arc<Thread>) {
    thread.set_permit_running(false);
    thread.set_state(ThreadState::Terminated);
}

/// Pin scheduling on this CPU: until unpinned, [`select_next`] keeps
/// returning the current thread. Used to mark the current thread blocked
/// without being descheduled in the middle of doing so.
pub fn pin_current() {
    PINNED[crate::smp::this_cpu_id()].store(true, Ordering::Release);
}

pub fn unpin_current() {
    PINNED[crate::smp::this_cpu_id()].store(false, Ordering::Release);
}

/// Give the rest of this time slice back to the scheduler.
pub fn yield_now() {
    crate::arch::x86_64::context::yield_now();
}

/// Pick the next thread for this CPU and make it current. Called from the
/// reschedule interrupt only.
pub fn select_next() -> Arc<Thread> {
    let cpu = crate::smp::this_cpu_id();

    if PINNED[cpu].load(Ordering::Acquire) {
        if let Some(current) = CURRENT[cpu].lock().clone() {
            return current;
        }
    }

    let mut queue = RUN_QUEUE.lock();
    loop {
        let Some(thread) = queue.pop_front() else {
            break;
        };
        // Clear the queued mark before looking at the state: a waker
        // observing the mark set would skip its own enqueue, so the mark
        // must never outlive the queue entry.
        thread.clear_queued();
        match thread.state() {
            ThreadState::Runnable if thread.permits_running() => {
                if thread.try_mark_queued() {
                    queue.push_back(thread.clone());
                }
                drop(queue);
                *CURRENT[cpu].lock() = Some(thread.clone());
                return thread;
            }
            ThreadState::Terminated => {
                // Dropped here; context freed once the last Arc goes.
            }
            _ => {
                // Blocked or suspended: out of the queue until restarted.
            }
        }
    }
    drop(queue);

    let idle = idle_thread(cpu);
    *CURRENT[cpu].lock() = Some(idle.clone());
    idle
}

/// The thread currently running on `cpu`, as last chosen by
/// [`select_next`].
pub fn current_on_cpu(cpu: usize) -> Option<Arc<Thread>> {
    CURRENT[cpu].lock().clone()
}

/// Install the per-CPU idle threads. Called once before tasking starts.
pub fn set_idle_threads(threads: Vec<Arc<Thread>>) {
    IDLE_THREADS.call_once(|| threads);
}

fn idle_thread(cpu: usize) -> Arc<Thread> {
    IDLE_THREADS
        .get()
        .expect("idle threads installed before tasking")[cpu]
        .clone()
}

/// How many threads sit in the run queue right now.
pub fn queue_len() -> usize {
    RUN_QUEUE.lock().len()
}

#[cfg(test)]
pub fn drain_queue_for_test() {
    let mut queue = RUN_QUEUE.lock();
    while let Some(t) = queue.pop_front() {
        t.clear_queued();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Queue-discipline tests drive the state transitions directly; the
    // interrupt-driven path is exercised on hardware, not here.

    #[test]
    fn start_is_idempotent_in_the_queue() {
        let _env = crate::process::test_support::lock_env();
        let t = crate::process::test_support::kernel_thread();
        drain_queue_for_test();
        start_thread(&t);
        start_thread(&t);
        assert_eq!(queue_len(), 1);
        drain_queue_for_test();
    }

    #[test]
    fn stop_then_start_requeues() {
        let _env = crate::process::test_support::lock_env();
        let t = crate::process::test_support::kernel_thread();
        drain_queue_for_test();
        start_thread(&t);
        stop_thread(&t);
        assert_eq!(t.state(), ThreadState::Blocked);
        assert!(!t.permits_running());
        // Still queued (lazy removal), so a restart must not double-add.
        start_thread(&t);
        assert_eq!(queue_len(), 1);
        assert_eq!(t.state(), ThreadState::Runnable);
        drain_queue_for_test();
    }
}
