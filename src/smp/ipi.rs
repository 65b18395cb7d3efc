//! Cross-CPU control messages over NMI.
//!
//! An NMI carries no payload, so the message travels out of band: the
//! sender takes the target's slot lock, writes the message and flips the
//! state word to waiting, fires the NMI, and spins until the target flips
//! the state word to acknowledged. A target that takes an NMI and finds
//! its state word at "no message" treats it as spurious and ignores it.

use crate::arch::x86_64::apic::{self, IpiDeliveryMode, IpiShorthand};
use crate::smp::MAX_CPUS;
use crate::synch::RawSpinlock;
use core::sync::atomic::{AtomicU32, Ordering};

/// Control messages a CPU can send another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpiMessage {
    Suspend = 0,
    Resume = 1,
    TlbShootdown = 2,
}

const STATE_NO_MSG: u32 = 0;
const STATE_MSG_WAITING: u32 = 1;
const STATE_ACKNOWLEDGED: u32 = 2;

struct SignalSlot {
    message: AtomicU32,
    state: AtomicU32,
    /// Serialises senders targeting this CPU.
    lock: RawSpinlock,
}

static SIGNALS: [SignalSlot; MAX_CPUS] = [const {
    SignalSlot {
        message: AtomicU32::new(IpiMessage::Suspend as u32),
        state: AtomicU32::new(STATE_NO_MSG),
        lock: RawSpinlock::new(),
    }
}; MAX_CPUS];

/// Send `msg` to `cpu` and wait for its acknowledgement.
pub fn signal_processor(cpu: usize, msg: IpiMessage) {
    assert!(cpu < crate::smp::cpu_count());
    let slot = &SIGNALS[cpu];

    let _guard = slot.lock.lock();
    assert_eq!(slot.state.load(Ordering::Acquire), STATE_NO_MSG);
    slot.message.store(msg as u32, Ordering::Relaxed);
    slot.state.store(STATE_MSG_WAITING, Ordering::Release);

    apic::send_ipi(
        crate::smp::lapic_id_of(cpu) as u8,
        IpiShorthand::None,
        IpiDeliveryMode::Nmi,
        0,
        false,
    );

    while slot.state.load(Ordering::Acquire) != STATE_ACKNOWLEDGED {
        core::hint::spin_loop();
    }
    slot.state.store(STATE_NO_MSG, Ordering::Release);
}

/// Ask every other CPU to park itself; the panic path.
pub fn suspend_all_other_cpus() {
    let me = crate::smp::this_cpu_id();
    for cpu in 0..crate::smp::cpu_count() {
        if cpu != me && crate::smp::is_cpu_running(cpu) {
            signal_processor(cpu, IpiMessage::Suspend);
        }
    }
}

/// NMI landing point (see the IDT stub). Decodes this CPU's slot and
/// acts; spurious NMIs fall through.
pub extern "C" fn receive_nmi() {
    let cpu = crate::smp::this_cpu_id();
    let slot = &SIGNALS[cpu];

    if slot.state.load(Ordering::Acquire) != STATE_MSG_WAITING {
        // Not ours (watchdog, glitch); ignore.
        return;
    }

    let msg = slot.message.load(Ordering::Relaxed);
    // Acknowledge before acting on a Suspend, or the sender spins forever
    // against a parked CPU.
    slot.state.store(STATE_ACKNOWLEDGED, Ordering::Release);

    match msg {
        m if m == IpiMessage::Suspend as u32 => {
            crate::arch::x86_64::stop_this_proc();
        }
        m if m == IpiMessage::TlbShootdown as u32 => {
            x86_64::instructions::tlb::flush_all();
        }
        m if m == IpiMessage::Resume as u32 => {
            // Handled by the AP startup path; nothing to do here.
        }
        _ => {}
    }
}

/// Flush the TLB everywhere. The local flush happens first, then every
/// other running CPU is signalled in turn.
pub fn tlb_shootdown_all() {
    x86_64::instructions::tlb::flush_all();
    let me = crate::smp::this_cpu_id();
    for cpu in 0..crate::smp::cpu_count() {
        if cpu != me && crate::smp::is_cpu_running(cpu) {
            signal_processor(cpu, IpiMessage::TlbShootdown);
        }
    }
}

/// Used by the AP startup path to confirm the Resume handshake.
pub fn expect_resume_and_ack(cpu: usize) {
    let slot = &SIGNALS[cpu];
    if slot.state.load(Ordering::Acquire) == STATE_MSG_WAITING
        && slot.message.load(Ordering::Relaxed) == IpiMessage::Resume as u32
    {
        slot.state.store(STATE_ACKNOWLEDGED, Ordering::Release);
    }
}

/// Pre-load a Resume message for `cpu` without waiting, used when waking
/// the parked APs whose acknowledgement arrives via their startup path.
pub fn post_resume_no_wait(cpu: usize) {
    let slot = &SIGNALS[cpu];
    let _guard = slot.lock.lock();
    slot.message.store(IpiMessage::Resume as u32, Ordering::Relaxed);
    slot.state.store(STATE_MSG_WAITING, Ordering::Release);
}

/// Second half of [`post_resume_no_wait`]: spin until the AP acknowledges
/// its Resume, then return the slot to idle.
pub fn wait_ack_and_clear(cpu: usize) {
    let slot = &SIGNALS[cpu];
    while slot.state.load(Ordering::Acquire) != STATE_ACKNOWLEDGED {
        core::hint::spin_loop();
    }
    slot.state.store(STATE_NO_MSG, Ordering::Release);
}
