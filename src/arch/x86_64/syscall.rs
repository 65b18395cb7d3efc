//! syscall/sysret entry.
//!
//! User code executes `syscall` with the selector in rax and arguments in
//! rdi, rsi, rdx, r10, r8, r9. The stub switches to the calling thread's
//! per-thread kernel syscall stack (found through the kernel-GS context
//! pointer), shuffles the arguments into the C ABI and calls
//! [`crate::syscall::dispatch`]; the error code comes back in rax.

use core::arch::naked_asm;
use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use super::context::{CTX_SYSCALL_RSP_SCRATCH_OFFSET, CTX_SYSCALL_STACK_TOP_OFFSET};
use super::gdt::KERNEL_CS;

/// STAR user base: sysret loads SS from +8 and CS from +16 (RPL forced to
/// 3), landing on the user selectors of [`super::gdt`].
const STAR_USER_BASE: u16 = 0x13;

/// Program the syscall MSRs on the calling CPU. Every CPU runs this once.
pub fn init_cpu() {
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        LStar::write(VirtAddr::new_truncate(syscall_entry as usize as u64));
        Star::write_raw(STAR_USER_BASE, KERNEL_CS);
        // Interrupts stay off until the stub is on a kernel stack.
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}

extern "C" fn dispatch_shim(selector: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64) -> u64 {
    crate::syscall::dispatch(selector, a1, a2, a3, a4, a5, a6)
}

#[unsafe(naked)]
extern "C" fn syscall_entry() {
    naked_asm!(
        // GS now points at the running thread's context record.
        "swapgs",
        "mov gs:[{scratch}], rsp",
        "mov rsp, gs:[{stack_top}]",
        "push qword ptr gs:[{scratch}]", // user rsp
        "push r11",                 // user rflags
        "push rcx",                 // user rip
        "sti",
        // Syscall ABI -> C ABI: dispatch(rax, rdi, rsi, rdx, r10, r8, r9).
        "push r9",                  // seventh argument
        "mov r9, r8",
        "mov r8, r10",
        "mov rcx, rdx",
        "mov rdx, rsi",
        "mov rsi, rdi",
        "mov rdi, rax",
        "call {dispatch}",
        "add rsp, 8",
        "cli",
        "pop rcx",
        "pop r11",
        "pop rsp",
        "swapgs",
        "sysretq",
        scratch = const CTX_SYSCALL_RSP_SCRATCH_OFFSET,
        stack_top = const CTX_SYSCALL_STACK_TOP_OFFSET,
        dispatch = sym dispatch_shim,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_base_reaches_the_user_selectors() {
        use super::super::gdt::{USER_CS, USER_SS};
        // The base already carries RPL 3; sysret adds the offsets.
        assert_eq!(STAR_USER_BASE + 8, USER_SS);
        assert_eq!(STAR_USER_BASE + 16, USER_CS);
    }
}
