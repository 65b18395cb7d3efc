//! Boot orchestration.
//!
//! A thin boot shim lands here with the BSP in long mode, paging on, and
//! the APs parked ([`BootConfig`] describes the hand-off). The init
//! order is rigid; each stage assumes everything above it:
//!
//! 1. serial log, GDT/TSS, IDT, FPU/SSE
//! 2. PAT, physical pool, heap, page-table arena
//! 3. PML4 registry seeded with the boot table
//! 4. system tree, interrupt controller selection, IO-APIC, APs
//! 5. syscall MSRs, task manager, timer — scheduling begins

use crate::arch::x86_64 as arch;
use crate::error::Result;
use crate::process::task::Process;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// What the boot shim must tell the kernel about the machine.
pub struct BootConfig {
    /// Free physical RAM as (base, length) pairs; whole 2 MiB pages are
    /// carved out of these. The kernel image itself must be loaded
    /// inside the direct map (virtual = physical + the direct offset)
    /// and excluded from these regions.
    pub phys_regions: &'static [(u64, u64)],
    /// Virtual address of the page table the BSP is running on.
    pub boot_pml4_virt: u64,
    /// Its physical address (CR3 value).
    pub boot_pml4_phys: u64,
    /// Local-APIC IDs, indexed by CPU number; index 0 is the BSP. Leave
    /// empty to trust the boot environment's CPU count with identity
    /// APIC IDs.
    pub lapic_ids: &'static [u32],
}

/// Bring every subsystem up, through waking the APs. Interrupts are still
/// off; call [`kernel_start_tasking`] to begin scheduling.
pub fn kernel_init(config: &BootConfig) -> Result<()> {
    crate::log::init();
    info!("arbor-kernel starting");

    arch::stop_interrupts();
    arch::early_cpu_init();
    arch::gdt::init_cpu(0);
    arch::idt::init();

    crate::mem::init(config.phys_regions)?;
    crate::mem::pml4::init(config.boot_pml4_virt, config.boot_pml4_phys);

    crate::tree::init();

    // Processor complement, then the interrupt fabric.
    let lapic_ids: Vec<u32> = if config.lapic_ids.is_empty() {
        (0..arch::smp::boot_cpu_count()).collect()
    } else {
        config.lapic_ids.to_vec()
    };
    crate::smp::init(&lapic_ids);

    let kind = crate::interrupts::select_controller(lapic_ids.len() as u32);
    if kind == crate::interrupts::PicKind::Apic {
        arch::apic::init_mmio()?;
        crate::interrupts::init_local_controller();
        crate::interrupts::init_global_controllers();
    }

    arch::syscall::init_cpu();

    #[cfg(feature = "smp")]
    if kind == crate::interrupts::PicKind::Apic {
        arch::smp::start_aps();
    }

    info!("kernel_init complete");
    Ok(())
}

/// Install the task switcher and start the timer. The calling code path
/// is not a scheduled thread; once the first tick lands it simply stops
/// running, so anything that must live on belongs in a created process
/// before this call.
pub fn kernel_start_tasking() -> Arc<Process> {
    let task0 = crate::process::init_tasking(
        crate::smp::cpu_count(),
        crate::mem::pml4::master_table_virt().expect("pml4 registry seeded"),
        crate::mem::pml4::master_table_phys().expect("pml4 registry seeded"),
    );
    arch::start_interrupts();
    task0
}
