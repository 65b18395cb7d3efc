//! IO-APIC redirection programming.
//!
//! The IO-APIC is the system-wide half of the APIC pair: it turns wired
//! interrupt lines into vectors on some CPU's local APIC. Routing is
//! programmed exactly once, on the BSP, pointing every legacy IRQ at the
//! BSP. IRQ 2 carries the timer on HPET-routed chipsets, so it is mapped
//! to the vector that would otherwise serve IRQ 0.

use crate::interrupts::{IRQ_BASE, IRQ_COUNT};
use crate::mem::{self, CacheMode};
use core::ptr::{read_volatile, write_volatile};
use spin::Once;

/// Default IO-APIC physical base, as wired on PC chipsets.
const IOAPIC_BASE_ADDR: u64 = 0xFEC0_0000;

const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;

const REG_VERSION: u32 = 0x01;
const REG_REDTBL_BASE: u32 = 0x10;

static MMIO_BASE: Once<u64> = Once::new();

fn select(reg: u32) {
    let base = MMIO_BASE.get().expect("IO-APIC MMIO mapped during boot");
    unsafe { write_volatile((base + IOREGSEL) as *mut u32, reg) };
}

fn read_reg(reg: u32) -> u32 {
    let base = MMIO_BASE.get().expect("IO-APIC MMIO mapped during boot");
    select(reg);
    unsafe { read_volatile((base + IOWIN) as *const u32) }
}

fn write_reg(reg: u32, value: u32) {
    let base = MMIO_BASE.get().expect("IO-APIC MMIO mapped during boot");
    select(reg);
    unsafe { write_volatile((base + IOWIN) as *mut u32, value) };
}

/// Redirection entries this IO-APIC implements.
fn redirection_count() -> u32 {
    ((read_reg(REG_VERSION) >> 16) & 0xFF) + 1
}

/// Vector a legacy IRQ line is routed to.
pub fn vector_for_irq(irq: u8) -> u8 {
    if irq == 2 {
        // HPET quirk: line 2 delivers what the timer would have put on
        // line 0.
        IRQ_BASE
    } else {
        IRQ_BASE + irq
    }
}

fn write_redirection(entry: u32, vector: u8, dest_apic_id: u8) {
    // Fixed delivery, physical destination, edge triggered, active high,
    // unmasked.
    let low = vector as u32;
    let high = (dest_apic_id as u32) << 24;
    write_reg(REG_REDTBL_BASE + entry * 2 + 1, high);
    write_reg(REG_REDTBL_BASE + entry * 2, low);
}

/// Map the register window and program the legacy IRQ block towards the
/// BSP. Once, on the BSP.
pub fn init(bsp_apic_id: u8) {
    let virt = mem::allocate_virtual_range(1, None).expect("kernel window for IO-APIC");
    mem::map_range(IOAPIC_BASE_ADDR, virt, 1, None, CacheMode::Uncacheable)
        .expect("IO-APIC window unmapped at boot");
    MMIO_BASE.call_once(|| virt);

    let entries = redirection_count().min(IRQ_COUNT as u32);
    for irq in 0..entries {
        write_redirection(irq, vector_for_irq(irq as u8), bsp_apic_id);
    }
    info!("ioapic: {} redirection entries programmed", entries);
}
