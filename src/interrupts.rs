//! Vector registration, IRQ dispatch and controller selection.
//!
//! The architecture layer owns the IDT and its stubs; everything lands in
//! [`vector_dispatch`], which routes IRQs through their acknowledgement
//! and registered receivers, and other vectors through the plain handler
//! table. Reserved vectors — the CPU exceptions and the IRQ block — can
//! never be registered against.
//!
//! At boot exactly one interrupt controller is chosen: the local APIC
//! (with the IO-APICs programmed once, globally), or the legacy 8259 pair
//! on processors without an APIC, which is only legal on single-CPU
//! systems. Every later acknowledgement and IPI goes through whichever
//! was selected.

use crate::arch::x86_64::{apic, ioapic, pic};
use crate::error::{KernelError, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once, RwLock};

/// First vector of the remapped IRQ block.
pub const IRQ_BASE: u8 = 32;
pub const IRQ_COUNT: u8 = 16;

/// The timer IRQ vector doubles as the reschedule vector; see
/// [`crate::process::scheduler`].
pub const RESCHED_VECTOR: u8 = IRQ_BASE;
/// Reschedule twin without IRQ acknowledgement, used by yield.
pub const RESCHED_SOFT_VECTOR: u8 = 48;

/// A driver's interrupt receiver. The fast path runs with interrupts off
/// and decides whether the slow path is worth invoking.
pub trait InterruptReceiver: Send + Sync {
    fn fast_handler(&self, irq: u8) -> bool;
    fn slow_handler(&self, irq: u8);
}

/// Which interrupt controller the system selected at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PicKind {
    LegacyPic,
    Apic,
}

static SELECTED_PIC: Once<PicKind> = Once::new();

type VectorHandler = fn(u8);

struct Registrations {
    vectors: [Option<VectorHandler>; 256],
}

static REGISTRATIONS: Mutex<Registrations> = Mutex::new(Registrations {
    vectors: [None; 256],
});

struct IrqReceivers {
    slots: [Vec<Arc<dyn InterruptReceiver>>; IRQ_COUNT as usize],
}

static IRQ_RECEIVERS: RwLock<IrqReceivers> = RwLock::new(IrqReceivers {
    slots: [const { Vec::new() }; IRQ_COUNT as usize],
});

/// Select the controller for the whole system, based on CPUID. Called once
/// on the BSP with the CPU count known; legacy PIC systems must be
/// single-CPU.
pub fn select_controller(num_cpus: u32) -> PicKind {
    let kind = detect_pic_kind();
    let selected = match kind {
        DetectedPic::LegacyPic => {
            assert!(num_cpus == 1, "legacy PIC cannot drive an SMP system");
            pic::init();
            PicKind::LegacyPic
        }
        DetectedPic::Apic | DetectedPic::X2Apic => {
            // x2APIC capability is noted but we run in xAPIC mode.
            if kind == DetectedPic::X2Apic {
                debug!("x2apic available; staying in xapic mode");
            }
            pic::disable();
            PicKind::Apic
        }
    };
    SELECTED_PIC.call_once(|| selected);
    info!("interrupts: selected {:?}", selected);
    selected
}

/// The controller chosen at boot.
pub fn selected_controller() -> PicKind {
    *SELECTED_PIC.get().expect("controller selected during boot")
}

/// Per-CPU controller bring-up: each CPU initialises its own local APIC.
/// (The legacy PIC was configured once in [`select_controller`].)
pub fn init_local_controller() {
    match selected_controller() {
        PicKind::LegacyPic => {}
        PicKind::Apic => apic::init_local(),
    }
}

/// One-off global routing: program the IO-APIC redirection entries. With
/// IRQ 2 carrying what the HPET wires as timer output, it is remapped to
/// the vector that would otherwise serve IRQ 0.
pub fn init_global_controllers() {
    if selected_controller() == PicKind::Apic {
        ioapic::init(apic::local_id());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DetectedPic {
    LegacyPic,
    Apic,
    X2Apic,
}

fn detect_pic_kind() -> DetectedPic {
    let cpuid = raw_cpuid::CpuId::new();
    match cpuid.get_feature_info() {
        Some(f) if f.has_x2apic() => DetectedPic::X2Apic,
        Some(f) if f.has_apic() => DetectedPic::Apic,
        _ => DetectedPic::LegacyPic,
    }
}

/// Acknowledge `irq` on the active controller.
pub fn ack_irq(irq: u8) {
    match selected_controller() {
        PicKind::LegacyPic => pic::ack(IRQ_BASE + irq),
        PicKind::Apic => apic::eoi(),
    }
}

/// Register a handler for a free vector. Reserved vectors (exceptions and
/// the IRQ block) are rejected.
pub fn register_vector_handler(vector: u8, handler: VectorHandler) -> Result<()> {
    if vector < IRQ_BASE + IRQ_COUNT || vector == RESCHED_SOFT_VECTOR {
        return Err(KernelError::InvalidParam);
    }
    let mut regs = REGISTRATIONS.lock();
    if regs.vectors[vector as usize].is_some() {
        return Err(KernelError::AlreadyExists);
    }
    regs.vectors[vector as usize] = Some(handler);
    Ok(())
}

/// Attach a driver receiver to an IRQ line.
pub fn register_irq_receiver(irq: u8, receiver: Arc<dyn InterruptReceiver>) -> Result<()> {
    if irq >= IRQ_COUNT {
        return Err(KernelError::InvalidParam);
    }
    IRQ_RECEIVERS.write().slots[irq as usize].push(receiver);
    Ok(())
}

/// Common landing point for every non-exception stub.
///
/// IRQ vectors acknowledge first, then run each registered receiver's
/// fast handler, invoking the slow handler when asked. Anything else goes
/// through the vector handler table; an unhandled vector is logged and
/// dropped.
pub extern "C" fn vector_dispatch(vector: u64) {
    let vector = vector as u8;
    if (IRQ_BASE..IRQ_BASE + IRQ_COUNT).contains(&vector) {
        let irq = vector - IRQ_BASE;
        ack_irq(irq);
        handle_irq(irq);
        return;
    }
    let handler = REGISTRATIONS.lock().vectors[vector as usize];
    match handler {
        Some(h) => h(vector),
        None => debug!("unhandled interrupt vector {}", vector),
    }
}

fn handle_irq(irq: u8) {
    let receivers = IRQ_RECEIVERS.read();
    for receiver in receivers.slots[irq as usize].iter() {
        if receiver.fast_handler(irq) {
            receiver.slow_handler(irq);
        }
    }
}
