//! Application-processor startup.
//!
//! The boot environment leaves the APs halted with interrupts disabled
//! and a count of active CPUs in a well-known low-memory slot. The only
//! way to reach a halted AP is an NMI — so the boot loader's NMI handler
//! is overwritten with a small trampoline into [`ap_entry`], Resume
//! messages are staged in the IPI table, and one broadcast NMI wakes
//! everyone.

use crate::mem::phys_to_kernel_virt;
use crate::smp::ipi;

/// Low-memory slot holding the active CPU count (boot interface).
const BOOT_CPU_COUNT_PHYS: u64 = 0x5012;

/// Physical address of the boot IDT's NMI gate (vector 2, 16 bytes per
/// descriptor, table at physical zero).
const BOOT_NMI_GATE_PHYS: u64 = 0x20;

/// CPUs the boot environment reports as active.
pub fn boot_cpu_count() -> u32 {
    let count = unsafe { (phys_to_kernel_virt(BOOT_CPU_COUNT_PHYS) as *const u16).read() };
    (count as u32).clamp(1, crate::smp::MAX_CPUS as u32)
}

/// Decode the handler address out of the boot NMI gate descriptor.
fn boot_nmi_handler_addr() -> u64 {
    let gate = phys_to_kernel_virt(BOOT_NMI_GATE_PHYS) as *const u16;
    let addr = unsafe {
        (gate.read() as u64)
            | ((gate.add(3).read() as u64) << 16)
            | ((gate.add(4).read() as u64) << 32)
            | ((gate.add(5).read() as u64) << 48)
    };
    // The gate was written with identity addressing; reach the same bytes
    // through the direct map.
    phys_to_kernel_virt(addr & 0xFFFF_FFFF)
}

/// `mov rax, imm64; jmp rax` into the AP entry path.
fn write_trampoline(at: u64, target: u64) {
    let mut stub = [0u8; 12];
    stub[0] = 0x48;
    stub[1] = 0xB8;
    stub[2..10].copy_from_slice(&target.to_le_bytes());
    stub[10] = 0xFF;
    stub[11] = 0xE0;
    unsafe {
        core::ptr::copy_nonoverlapping(stub.as_ptr(), at as *mut u8, stub.len());
    }
}

/// Wake every AP. BSP only, after the interrupt controllers and the IPI
/// table are ready.
pub fn start_aps() {
    let cpus = crate::smp::cpu_count();
    if cpus <= 1 {
        return;
    }

    let nmi_handler = boot_nmi_handler_addr();
    write_trampoline(nmi_handler, ap_entry as usize as u64);
    debug!("smp: trampoline over boot NMI handler at {:#x}", nmi_handler);

    for cpu in 1..cpus {
        ipi::post_resume_no_wait(cpu);
    }
    crate::arch::x86_64::apic::send_ipi(
        0,
        crate::arch::x86_64::apic::IpiShorthand::AllExcludingSelf,
        crate::arch::x86_64::apic::IpiDeliveryMode::Nmi,
        0,
        false,
    );
    for cpu in 1..cpus {
        ipi::wait_ack_and_clear(cpu);
    }
    info!("smp: {} application processors running", cpus - 1);
}

/// First kernel code an AP executes. When this returns into the halt
/// loop the AP is fully able to take scheduling interrupts; the first
/// reschedule IPI gives it real work.
extern "C" fn ap_entry() -> ! {
    crate::arch::x86_64::early_cpu_init();
    crate::arch::x86_64::idt::load();
    crate::mem::pat::init();
    crate::arch::x86_64::syscall::init_cpu();

    let cpu = crate::smp::this_cpu_id();
    crate::arch::x86_64::gdt::init_cpu(cpu);
    crate::interrupts::init_local_controller();

    crate::smp::mark_cpu_running(cpu);
    ipi::expect_resume_and_ack(cpu);

    crate::arch::x86_64::start_interrupts();
    loop {
        crate::arch::x86_64::halt();
    }
}
