//! x86-64 processor plumbing.
//!
//! Submodule map:
//!
//! - [`gdt`] — per-CPU GDT, TSS and interrupt stacks
//! - [`idt`] — the interrupt descriptor table and its stubs
//! - [`apic`] / [`ioapic`] / [`pic`] — the interrupt controllers
//! - [`context`] — saved execution contexts and the task-switch path
//! - [`syscall`] — syscall/sysret entry
//! - [`smp`] — application-processor startup

pub mod apic;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod ioapic;
pub mod pic;
pub mod smp;
pub mod syscall;

use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};

/// Early per-CPU setup that must precede everything else: floating point
/// and SSE on (the 512-byte fxsave area in every context presumes it),
/// and a zero current-context pointer so we never mistake boot code for a
/// scheduled thread.
pub fn early_cpu_init() {
    unsafe {
        let mut cr0 = Cr0::read();
        cr0.remove(Cr0Flags::EMULATE_COPROCESSOR);
        cr0.insert(Cr0Flags::MONITOR_COPROCESSOR);
        Cr0::write(cr0);

        let mut cr4 = Cr4::read();
        cr4.insert(Cr4Flags::OSFXSR | Cr4Flags::OSXMMEXCPT_ENABLE);
        Cr4::write(cr4);
    }
    context::clear_current_context();
}

#[inline]
pub fn stop_interrupts() {
    x86_64::instructions::interrupts::disable();
}

#[inline]
pub fn start_interrupts() {
    x86_64::instructions::interrupts::enable();
}

/// Halt this processor until the next interrupt.
#[inline]
pub fn halt() {
    x86_64::instructions::hlt();
}

/// Halt this processor forever, interrupts off.
pub fn stop_this_proc() -> ! {
    loop {
        x86_64::instructions::interrupts::disable();
        x86_64::instructions::hlt();
    }
}
