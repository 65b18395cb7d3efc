//! The fatal-error path.
//!
//! Internal-consistency failures and CPU exceptions do not return error
//! codes; they end the system. The panicking CPU logs the reason, asks
//! every other CPU to suspend via the NMI signalling table, and halts.

use core::sync::atomic::AtomicBool;
#[cfg(not(test))]
use core::sync::atomic::Ordering;

static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

/// Log `msg`, stop all other CPUs, halt this one. Never returns.
///
/// Re-entry (a second CPU panicking, or a panic inside the panic path)
/// skips the cross-CPU signalling and just halts.
pub fn panic_stop_all(msg: &str) -> ! {
    error!("kernel panic: {}", msg);

    #[cfg(test)]
    {
        // Under the host test harness there are no other CPUs to stop;
        // surface the failure to the test runner instead.
        panic!("kernel panic: {}", msg);
    }

    #[cfg(not(test))]
    {
        let first = !PANIC_IN_PROGRESS.swap(true, Ordering::SeqCst);
        if first {
            crate::smp::ipi::suspend_all_other_cpus();
        }
        crate::arch::x86_64::stop_this_proc();
    }
}
