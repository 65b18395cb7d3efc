//! Kernel synchronization primitives.
//!
//! Four layers, from rawest to most structured:
//!
//! - [`spinlock::RawSpinlock`] — two-state busy-wait lock with a scoped
//!   guard. Used where a lock must protect something that is not a single
//!   Rust value (page-table edits, the PML4 registry, IPI slots).
//! - `spin::Mutex` (crate) — the ordinary data lock used throughout.
//! - [`wait::WaitObject`] — signal-and-wait primitive behind blocking
//!   syscalls and pipes.
//! - [`mutex::KMutex`] / [`semaphore::KSemaphore`] — scheduler-integrated
//!   locks with FIFO waiter queues and direct handover.
//!
//! All of these may live in static storage and are initialised exactly
//! once before any concurrent use.

pub mod mutex;
pub mod semaphore;
pub mod spinlock;
pub mod wait;

pub use mutex::{AcquireResult, KMutex, WaitMode};
pub use semaphore::KSemaphore;
pub use spinlock::RawSpinlock;
pub use wait::WaitObject;
