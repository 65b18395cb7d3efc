//! Saved execution contexts and the context-switch path.
//!
//! A thread's context is its register file (including the 512-byte
//! FPU/SSE area), segment bases, page-table root and kernel stacks. The
//! reschedule interrupt runs on an interrupt stack; the switch saves the
//! interrupted register image into the outgoing thread's context, asks
//! the scheduler for the next thread, writes that thread's image over the
//! same interrupt stack, and returns — so `iretq` resumes the incoming
//! thread. The kernel half of every page-table root is identical (see
//! [`crate::mem::pml4`]), which is what makes swapping CR3 mid-stub safe.
//!
//! The address of the running thread's context lives in the kernel-GS
//! MSR. That single register is the whole "who am I" mechanism: no list
//! lookup, nothing to race with thread migration.

use crate::error::{KernelError, Result};
use crate::process::task::Thread;
use core::arch::naked_asm;
use core::ptr::NonNull;
use x86_64::registers::model_specific::{FsBase, GsBase, KernelGsBase};
use x86_64::VirtAddr;

use super::gdt::{
    KERNEL_CS, KERNEL_SS, RESCHED_IRQ_IST_INDEX, RESCHED_SOFT_IST_INDEX, USER_CS, USER_SS,
};

// RFLAGS images for freshly created threads; user mode adds IOPL 3.
const DEF_RFLAGS_KERNEL: u64 = 0x0020_0202;
const DEF_RFLAGS_USER: u64 = 0x0020_3202;

/// Vector of the reschedule interrupt fed by the timer IRQ.
pub const RESCHED_IRQ_VECTOR: u8 = crate::interrupts::RESCHED_VECTOR;
/// Software twin used by yield; no IRQ acknowledgement on this path.
pub const RESCHED_SOFT_VECTOR: u8 = crate::interrupts::RESCHED_SOFT_VECTOR;

const KERNEL_STACK_SIZE: usize = 64 * 1024;
const FX_AREA_SIZE: usize = 512;

/// The register image exactly as the switch stub lays it out on the
/// interrupt stack: fxsave area lowest, then the general-purpose
/// registers, then the hardware interrupt frame.
#[repr(C, align(16))]
#[derive(Clone)]
pub struct SavedStack {
    pub fx_state: [u8; FX_AREA_SIZE],
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl SavedStack {
    fn zeroed() -> Self {
        // The fx area must start out all-zero as well.
        unsafe { core::mem::zeroed() }
    }
}

/// Everything the processor needs to resume a thread. The leading fields
/// are at fixed offsets because the syscall entry stub addresses them
/// through GS.
#[repr(C)]
pub struct ExecContext {
    pub saved_stack: SavedStack,
    pub cr3: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub syscall_stack_top: u64,
    pub syscall_rsp_scratch: u64,
    owner_thread: *const Thread,
    syscall_stack: KernelStack,
    kernel_stack: Option<KernelStack>,
    user_stack: Option<(u64, u64)>,
}

pub const CTX_SYSCALL_STACK_TOP_OFFSET: usize =
    core::mem::offset_of!(ExecContext, syscall_stack_top);
pub const CTX_SYSCALL_RSP_SCRATCH_OFFSET: usize =
    core::mem::offset_of!(ExecContext, syscall_rsp_scratch);

/// Where the first thread of a context gets its stack from.
pub enum StackChoice {
    /// Allocate a kernel stack; kernel-mode threads only.
    KernelAuto,
    /// Use this already-prepared stack top. The context does not own it.
    Provided(u64),
    /// Use this stack top and release the backing user range (base,
    /// pages) in the owning process when the thread dies.
    UserOwned { top: u64, base: u64, pages: u64 },
}

impl ExecContext {
    /// Build a context that will begin executing at `entry` with `param`
    /// in the first argument register. Must be called once per thread.
    pub fn new(
        entry: u64,
        param: u64,
        kernel_mode: bool,
        cr3: u64,
        stack: StackChoice,
    ) -> Result<Box<ExecContext>> {
        let syscall_stack = KernelStack::allocate()?;

        let mut kernel_stack = None;
        let mut user_stack = None;
        let stack_top = match stack {
            StackChoice::KernelAuto => {
                if !kernel_mode {
                    return Err(KernelError::InvalidParam);
                }
                let s = KernelStack::allocate()?;
                let top = s.top();
                kernel_stack = Some(s);
                top
            }
            StackChoice::Provided(top) => top,
            StackChoice::UserOwned { top, base, pages } => {
                user_stack = Some((base, pages));
                top
            }
        };

        let mut saved = SavedStack::zeroed();
        saved.rdi = param;
        saved.rip = entry;
        // Offset by 8 to look like a `call entry` just happened, keeping
        // the ABI's stack alignment expectations intact.
        saved.rsp = stack_top - 8;
        if kernel_mode {
            saved.rflags = DEF_RFLAGS_KERNEL;
            saved.cs = KERNEL_CS as u64;
            saved.ss = KERNEL_SS as u64;
        } else {
            saved.rflags = DEF_RFLAGS_USER;
            saved.cs = USER_CS as u64;
            saved.ss = USER_SS as u64;
        }

        let top = syscall_stack.top();
        Ok(Box::new(ExecContext {
            saved_stack: saved,
            cr3,
            fs_base: 0,
            gs_base: 0,
            syscall_stack_top: top,
            syscall_rsp_scratch: 0,
            owner_thread: core::ptr::null(),
            syscall_stack,
            kernel_stack,
            user_stack,
        }))
    }

    pub fn set_owner(&mut self, owner: *const Thread) {
        self.owner_thread = owner;
    }

    pub fn owner(&self) -> *const Thread {
        self.owner_thread
    }

    /// User stack backing to release on thread destruction, if any.
    pub fn user_stack_backing(&self) -> Option<(u64, u64)> {
        self.user_stack
    }

    /// Argument-register slots of a not-yet-started thread; used to set
    /// argc/argv/env for a new process's first thread.
    pub fn set_start_args(&mut self, arg0: u64, arg1: u64, arg2: u64) {
        self.saved_stack.rdi = arg0;
        self.saved_stack.rsi = arg1;
        self.saved_stack.rdx = arg2;
    }
}

use alloc::boxed::Box;

/// An owned, 16-byte-aligned kernel stack.
pub struct KernelStack {
    base: NonNull<u8>,
    layout: core::alloc::Layout,
}

// Raw pointer is an ownership detail; the memory is exclusively ours.
unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

impl KernelStack {
    pub fn allocate() -> Result<Self> {
        let layout = core::alloc::Layout::from_size_align(KERNEL_STACK_SIZE, 16).unwrap();
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(KernelError::OutOfResource)?;
        Ok(Self { base, layout })
    }

    /// Highest usable address; stacks grow down from here.
    pub fn top(&self) -> u64 {
        self.base.as_ptr() as u64 + KERNEL_STACK_SIZE as u64
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Context pointer of the thread running on this CPU, or null before
/// tasking starts.
pub fn current_context() -> *mut ExecContext {
    KernelGsBase::read().as_u64() as *mut ExecContext
}

pub fn set_current_context(ctx: *mut ExecContext) {
    KernelGsBase::write(VirtAddr::new_truncate(ctx as u64));
}

pub fn clear_current_context() {
    KernelGsBase::write(VirtAddr::new_truncate(0));
}

/// The switch itself. Runs on the reschedule interrupt stack with
/// interrupts off; `stack` is the register image the stub just built.
/// Returns the CR3 for the stub to load before it restores the image.
extern "C" fn task_switch_handler(stack: *mut SavedStack, cr3: u64, ack: u64) -> u64 {
    if ack != 0 {
        crate::interrupts::ack_irq(0);
    }

    unsafe {
        let current = current_context();
        if !current.is_null() {
            (*current).saved_stack = core::ptr::read(stack);
            (*current).cr3 = cr3;
            (*current).fs_base = FsBase::read().as_u64();
            (*current).gs_base = GsBase::read().as_u64();
        }

        let next = crate::process::scheduler::select_next();
        let ctx = next.context_ptr();

        core::ptr::write(stack, (*ctx).saved_stack.clone());
        set_current_context(ctx);
        FsBase::write(VirtAddr::new_truncate((*ctx).fs_base));
        GsBase::write(VirtAddr::new_truncate((*ctx).gs_base));

        // Only CPU 0 hears the hardware timer; it forwards the beat to
        // everyone else. No delivery wait — they reschedule when they
        // take the vector.
        #[cfg(feature = "smp")]
        if ack != 0 && crate::smp::this_cpu_id() == 0 && crate::smp::cpu_count() > 1 {
            crate::arch::x86_64::apic::send_ipi(
                0,
                crate::arch::x86_64::apic::IpiShorthand::AllExcludingSelf,
                crate::arch::x86_64::apic::IpiDeliveryMode::Fixed,
                RESCHED_IRQ_VECTOR,
                false,
            );
        }

        (*ctx).cr3
    }
}

macro_rules! task_switch_stub {
    ($name:ident, $ack:literal) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            naked_asm!(
                "push rax",
                "push rbx",
                "push rcx",
                "push rdx",
                "push rsi",
                "push rdi",
                "push rbp",
                "push r8",
                "push r9",
                "push r10",
                "push r11",
                "push r12",
                "push r13",
                "push r14",
                "push r15",
                "sub rsp, 512",
                "fxsave64 [rsp]",
                "mov rdi, rsp",
                "mov rsi, cr3",
                "mov rdx, {ack}",
                "call {handler}",
                "mov cr3, rax",
                "fxrstor64 [rsp]",
                "add rsp, 512",
                "pop r15",
                "pop r14",
                "pop r13",
                "pop r12",
                "pop r11",
                "pop r10",
                "pop r9",
                "pop r8",
                "pop rbp",
                "pop rdi",
                "pop rsi",
                "pop rdx",
                "pop rcx",
                "pop rbx",
                "pop rax",
                "iretq",
                ack = const $ack,
                handler = sym task_switch_handler,
            )
        }
    };
}

task_switch_stub!(task_switch_irq_stub, 1);
task_switch_stub!(task_switch_soft_stub, 0);

/// Point the reschedule vectors at the switch stubs. After this the timer
/// may fire and scheduling begins at an arbitrary moment.
pub fn install_task_switcher() {
    super::idt::configure_entry(
        RESCHED_IRQ_VECTOR,
        RESCHED_IRQ_IST_INDEX,
        task_switch_irq_stub as usize as u64,
        0,
    );
    super::idt::configure_entry(
        RESCHED_SOFT_VECTOR,
        RESCHED_SOFT_IST_INDEX,
        task_switch_soft_stub as usize as u64,
        0,
    );
    super::idt::load();
}

/// Give up the rest of the time slice by taking the reschedule interrupt
/// on this CPU. The scheduler may well pick us again.
pub fn yield_now() {
    const _: () = assert!(RESCHED_SOFT_VECTOR == 0x30);
    unsafe { core::arch::asm!("int 0x30") };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_stack_layout_matches_the_stub() {
        // The stub's fxsave area starts the struct and the iret frame
        // ends it; the switch copies rely on these offsets.
        assert_eq!(core::mem::offset_of!(SavedStack, fx_state), 0);
        assert_eq!(core::mem::offset_of!(SavedStack, r15), 512);
        assert_eq!(core::mem::offset_of!(SavedStack, rax), 512 + 14 * 8);
        assert_eq!(core::mem::offset_of!(SavedStack, rip), 512 + 15 * 8);
        assert_eq!(core::mem::offset_of!(SavedStack, ss), 512 + 19 * 8);
        assert_eq!(core::mem::size_of::<SavedStack>(), 512 + 20 * 8);
        assert_eq!(core::mem::align_of::<SavedStack>(), 16);
    }

    #[test]
    fn new_context_is_zero_initialised_and_entry_shaped() {
        let ctx = ExecContext::new(0x1234, 77, true, 0xAAA000, StackChoice::KernelAuto).unwrap();
        assert!(ctx.saved_stack.fx_state.iter().all(|&b| b == 0));
        assert_eq!(ctx.saved_stack.rdi, 77);
        assert_eq!(ctx.saved_stack.rip, 0x1234);
        assert_eq!(ctx.saved_stack.cs, KERNEL_CS as u64);
        assert_eq!(ctx.saved_stack.rsp % 16, 8);
        assert_eq!(ctx.cr3, 0xAAA000);
    }

    #[test]
    fn user_context_gets_user_selectors() {
        let ctx = ExecContext::new(
            0x40_0000,
            0,
            false,
            0xBBB000,
            StackChoice::Provided(0x5000_0000),
        )
        .unwrap();
        assert_eq!(ctx.saved_stack.cs, USER_CS as u64);
        assert_eq!(ctx.saved_stack.ss, USER_SS as u64);
        assert_eq!(ctx.saved_stack.rsp, 0x5000_0000 - 8);
        assert_eq!(ctx.saved_stack.rflags, DEF_RFLAGS_USER);
    }

    #[test]
    fn kernel_auto_stack_requires_kernel_mode() {
        assert!(ExecContext::new(0, 0, false, 0, StackChoice::KernelAuto).is_err());
    }

    #[test]
    fn start_args_land_in_the_sysv_slots() {
        let mut ctx = ExecContext::new(0, 0, true, 0, StackChoice::KernelAuto).unwrap();
        ctx.set_start_args(2, 0x1000, 0x2000);
        assert_eq!(ctx.saved_stack.rdi, 2);
        assert_eq!(ctx.saved_stack.rsi, 0x1000);
        assert_eq!(ctx.saved_stack.rdx, 0x2000);
    }
}
