//! Processor enumeration and identification.
//!
//! The boot interface leaves the count of active CPUs in a well-known
//! location and the APs halted; [`crate::arch::x86_64::smp`] wakes them.
//! Each CPU is identified by looking its local-APIC ID up in the info
//! block — before the block exists there is exactly one CPU running, so
//! the answer is 0.

pub mod ipi;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub const MAX_CPUS: usize = 8;

pub struct CpuInfo {
    pub lapic_id: AtomicU32,
    pub running: AtomicBool,
}

static CPU_COUNT: AtomicU32 = AtomicU32::new(0);

static CPU_INFO: [CpuInfo; MAX_CPUS] = [const {
    CpuInfo {
        lapic_id: AtomicU32::new(0),
        running: AtomicBool::new(false),
    }
}; MAX_CPUS];

/// Record the processor complement. `lapic_ids[i]` is CPU i's local-APIC
/// ID; the BSP is CPU 0 and is marked running.
pub fn init(lapic_ids: &[u32]) {
    assert!(!lapic_ids.is_empty() && lapic_ids.len() <= MAX_CPUS);
    for (i, &id) in lapic_ids.iter().enumerate() {
        CPU_INFO[i].lapic_id.store(id, Ordering::Relaxed);
        CPU_INFO[i].running.store(i == 0, Ordering::Relaxed);
    }
    CPU_COUNT.store(lapic_ids.len() as u32, Ordering::Release);
    info!("smp: {} cpus known", lapic_ids.len());
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire).max(1) as usize
}

pub fn is_cpu_running(cpu: usize) -> bool {
    cpu < MAX_CPUS && CPU_INFO[cpu].running.load(Ordering::Acquire)
}

pub fn mark_cpu_running(cpu: usize) {
    CPU_INFO[cpu].running.store(true, Ordering::Release);
}

pub fn lapic_id_of(cpu: usize) -> u32 {
    CPU_INFO[cpu].lapic_id.load(Ordering::Relaxed)
}

/// This CPU's index. Resolved through the local APIC; 0 until the info
/// block is filled in.
pub fn this_cpu_id() -> usize {
    if CPU_COUNT.load(Ordering::Acquire) == 0 {
        return 0;
    }
    let lapic = crate::arch::x86_64::apic::local_id() as u32;
    for cpu in 0..cpu_count() {
        if CPU_INFO[cpu].lapic_id.load(Ordering::Relaxed) == lapic {
            return cpu;
        }
    }
    // An APIC ID we never enumerated is a firmware/boot contract breach.
    crate::panic::panic_stop_all("unknown local APIC id");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_cpu_before_init() {
        // CPU_COUNT may have been set by another test; only check the
        // floor behaviour.
        assert!(cpu_count() >= 1);
    }
}
