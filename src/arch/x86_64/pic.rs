// Legacy 8259 PIC pair. Only selected on processors without an APIC,
// which the interrupt layer asserts are single-CPU systems.

use pic8259::ChainedPics;
use spin::Mutex;

use crate::interrupts::IRQ_BASE;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(IRQ_BASE, IRQ_BASE + 8) });

/// Remap the PIC pair onto the IRQ vector block and unmask it.
pub fn init() {
    unsafe { PICS.lock().initialize() };
}

/// Mask everything off; used when the APIC is selected instead.
pub fn disable() {
    unsafe { PICS.lock().disable() };
}

/// End-of-interrupt for the given vector.
pub fn ack(vector: u8) {
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}
