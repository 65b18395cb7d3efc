//! Per-CPU GDT, TSS and interrupt stacks.
//!
//! Every CPU gets its own GDT instance with an identical layout, plus a
//! TSS carrying the ring-0 stack for privilege transitions and the
//! interrupt stack table. The segment layout is fixed so the syscall
//! MSRs and saved contexts can hard-code selectors:
//!
//! ```text
//! 0x08  kernel code        0x18  user data (ring 3)
//! 0x10  kernel data        0x20  user code (ring 3)
//! 0x28+ per-CPU TSS (16-byte descriptor)
//! ```
//!
//! User selectors sit data-before-code because sysret loads SS from
//! STAR.user_base + 8 and CS from + 16.

use crate::smp::MAX_CPUS;
use core::ptr::addr_of;
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::{PrivilegeLevel, VirtAddr};

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_SS: u16 = 0x10;
pub const USER_SS: u16 = 0x18 | 3;
pub const USER_CS: u16 = 0x20 | 3;

/// IST slots, 1-based as the hardware counts them.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 1;
pub const NMI_IST_INDEX: u16 = 2;
pub const RESCHED_IRQ_IST_INDEX: u16 = 3;
pub const RESCHED_SOFT_IST_INDEX: u16 = 4;
pub const MACHINE_CHECK_IST_INDEX: u16 = 5;

const IST_SLOTS: usize = 5;
const IST_STACK_SIZE: usize = 16 * 1024;
const RING0_STACK_SIZE: usize = 16 * 1024;

#[repr(C, align(16))]
struct Stack<const N: usize>([u8; N]);

static mut IST_STACKS: [[Stack<IST_STACK_SIZE>; IST_SLOTS]; MAX_CPUS] =
    unsafe { core::mem::zeroed() };
static mut RING0_STACKS: [Stack<RING0_STACK_SIZE>; MAX_CPUS] = unsafe { core::mem::zeroed() };

static mut TSS: [TaskStateSegment; MAX_CPUS] = {
    const T: TaskStateSegment = TaskStateSegment::new();
    [T; MAX_CPUS]
};

static mut GDTS: [GlobalDescriptorTable; MAX_CPUS] = {
    const G: GlobalDescriptorTable = GlobalDescriptorTable::new();
    [G; MAX_CPUS]
};

/// Build and load this CPU's GDT and TSS. Called once per CPU during its
/// bring-up, before interrupts are enabled.
pub fn init_cpu(cpu: usize) {
    assert!(cpu < MAX_CPUS);

    unsafe {
        let tss = &mut *core::ptr::addr_of_mut!(TSS[cpu]);
        tss.privilege_stack_table[0] =
            VirtAddr::new(addr_of!(RING0_STACKS[cpu]) as u64 + RING0_STACK_SIZE as u64);
        for slot in 0..IST_SLOTS {
            tss.interrupt_stack_table[slot] =
                VirtAddr::new(addr_of!(IST_STACKS[cpu][slot]) as u64 + IST_STACK_SIZE as u64);
        }

        let gdt = &mut *core::ptr::addr_of_mut!(GDTS[cpu]);
        let kcode = gdt.add_entry(Descriptor::kernel_code_segment());
        let kdata = gdt.add_entry(Descriptor::kernel_data_segment());
        let udata = gdt.add_entry(Descriptor::user_data_segment());
        let ucode = gdt.add_entry(Descriptor::user_code_segment());
        assert_eq!(kcode.0, KERNEL_CS);
        assert_eq!(kdata.0, KERNEL_SS);
        assert_eq!(udata.0, USER_SS);
        assert_eq!(ucode.0, USER_CS);
        let tss_sel = gdt.add_entry(Descriptor::tss_segment(&*addr_of!(TSS[cpu])));

        gdt.load_unsafe();
        CS::set_reg(SegmentSelector::new(KERNEL_CS >> 3, PrivilegeLevel::Ring0));
        SS::set_reg(SegmentSelector::new(KERNEL_SS >> 3, PrivilegeLevel::Ring0));
        DS::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
        ES::set_reg(SegmentSelector::new(0, PrivilegeLevel::Ring0));
        load_tss(tss_sel);
    }
}
