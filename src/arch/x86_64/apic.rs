//! Local APIC (xAPIC mode).
//!
//! Each CPU initialises its own local APIC; the shared MMIO window is
//! mapped once, uncacheable, into the kernel half. x2APIC capability is
//! detected elsewhere but the kernel always runs the memory-mapped
//! protocol.
//!
//! Register offsets used here:
//!
//! ```text
//! 0x020  ID              0x300  ICR low
//! 0x080  task priority   0x310  ICR high
//! 0x0B0  EOI             0x320  LVT timer
//! 0x0F0  spurious        0x380  timer initial count
//!                        0x3E0  timer divide
//! ```

use crate::error::Result;
use crate::mem::{self, CacheMode};
use core::ptr::{read_volatile, write_volatile};
use spin::Once;
use x86_64::registers::model_specific::Msr;

/// xAPIC base physical address, fixed by the architecture.
const APIC_BASE_ADDR: u64 = 0xFEE0_0000;

const IA32_APIC_BASE: u32 = 0x1B;
const APIC_BASE_ENABLE: u64 = 1 << 11;

const REG_ID: u64 = 0x020;
const REG_TPR: u64 = 0x080;
const REG_EOI: u64 = 0x0B0;
const REG_SPURIOUS: u64 = 0x0F0;
const REG_ICR_LOW: u64 = 0x300;
const REG_ICR_HIGH: u64 = 0x310;
const REG_LVT_TIMER: u64 = 0x320;
const REG_TIMER_INITIAL: u64 = 0x380;
const REG_TIMER_DIVIDE: u64 = 0x3E0;

const SPURIOUS_VECTOR: u32 = 0xFF;
const SPURIOUS_ENABLE: u32 = 1 << 8;
const LVT_TIMER_PERIODIC: u32 = 1 << 17;
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;

/// Roughly timer ticks per scheduling quantum; the exact rate is whatever
/// the bus clock divides down to and is not calibrated here.
const TIMER_INITIAL_COUNT: u32 = 8_000_000;
const TIMER_DIVIDE_BY_16: u32 = 0x3;

static MMIO_BASE: Once<u64> = Once::new();

/// Shorthand destinations for an IPI, mirroring the ICR encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiShorthand {
    None,
    SelfOnly,
    AllIncludingSelf,
    AllExcludingSelf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiDeliveryMode {
    Fixed,
    LowestPriority,
    Smi,
    Nmi,
    Init,
    Startup,
}

impl IpiShorthand {
    fn encode(self) -> u32 {
        match self {
            IpiShorthand::None => 0,
            IpiShorthand::SelfOnly => 1,
            IpiShorthand::AllIncludingSelf => 2,
            IpiShorthand::AllExcludingSelf => 3,
        }
    }
}

impl IpiDeliveryMode {
    fn encode(self) -> u32 {
        match self {
            IpiDeliveryMode::Fixed => 0,
            IpiDeliveryMode::LowestPriority => 1,
            IpiDeliveryMode::Smi => 2,
            IpiDeliveryMode::Nmi => 4,
            IpiDeliveryMode::Init => 5,
            IpiDeliveryMode::Startup => 6,
        }
    }
}

/// Map the register window. Once, on the BSP, before any APIC access; the
/// kernel-half mapping is synchronized into every process.
pub fn init_mmio() -> Result<()> {
    let virt = mem::allocate_virtual_range(1, None)?;
    mem::map_range(APIC_BASE_ADDR, virt, 1, None, CacheMode::Uncacheable)?;
    MMIO_BASE.call_once(|| virt);
    Ok(())
}

fn reg_ptr(offset: u64) -> *mut u32 {
    let base = MMIO_BASE.get().expect("APIC MMIO mapped during boot");
    (base + offset) as *mut u32
}

fn read_reg(offset: u64) -> u32 {
    unsafe { read_volatile(reg_ptr(offset)) }
}

fn write_reg(offset: u64, value: u32) {
    unsafe { write_volatile(reg_ptr(offset), value) }
}

/// Enable and configure the local APIC of the calling CPU.
pub fn init_local() {
    unsafe {
        let mut msr = Msr::new(IA32_APIC_BASE);
        let value = msr.read();
        msr.write(value | APIC_BASE_ENABLE);
    }
    write_reg(REG_SPURIOUS, SPURIOUS_VECTOR | SPURIOUS_ENABLE);
    write_reg(REG_TPR, 0);
    eoi();
}

/// APIC ID of the calling CPU.
pub fn local_id() -> u8 {
    (read_reg(REG_ID) >> 24) as u8
}

/// Signal end-of-interrupt for the in-service interrupt.
pub fn eoi() {
    write_reg(REG_EOI, 0);
}

/// Start the periodic scheduling timer on the calling CPU. Only the BSP
/// does this — other CPUs are rescheduled by IPI.
pub fn init_timer(vector: u8) {
    write_reg(REG_TIMER_DIVIDE, TIMER_DIVIDE_BY_16);
    write_reg(REG_LVT_TIMER, vector as u32 | LVT_TIMER_PERIODIC);
    write_reg(REG_TIMER_INITIAL, TIMER_INITIAL_COUNT);
}

/// Send an inter-processor interrupt.
///
/// `dest` is the target APIC ID and is ignored when a shorthand other
/// than [`IpiShorthand::None`] is given. With `wait_for_delivery`, spins
/// until the APIC reports the interrupt accepted.
pub fn send_ipi(
    dest: u8,
    shorthand: IpiShorthand,
    mode: IpiDeliveryMode,
    vector: u8,
    wait_for_delivery: bool,
) {
    let low = vector as u32
        | (mode.encode() << 8)
        | ICR_LEVEL_ASSERT
        | (shorthand.encode() << 18);
    write_reg(REG_ICR_HIGH, (dest as u32) << 24);
    write_reg(REG_ICR_LOW, low);
    if wait_for_delivery {
        while read_reg(REG_ICR_LOW) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}
