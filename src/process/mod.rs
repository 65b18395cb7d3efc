//! The task manager: process/thread lifecycle, start parameters, exit.
//!
//! Creation wires everything together: a process gets an address space
//! with the kernel half cloned (§ [`crate::mem::pml4`]), at least one
//! thread with a saved context, a user stack for user processes plus a
//! separate kernel stack for syscalls, and a node under `\proc`. Nothing
//! runs until [`start_process`] flips the permit-running gates.

pub mod current;
pub mod scheduler;
pub mod task;

use crate::arch::x86_64::context::StackChoice;
use crate::error::{KernelError, Result};
use crate::mem::{self, PAGE_SIZE};
use crate::tree;
use crate::tree::process_node::ProcessNode;
use alloc::collections::BTreeMap;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use task::{Pid, Process, Thread};

static PROCESS_TABLE: Mutex<BTreeMap<Pid, Arc<Process>>> = Mutex::new(BTreeMap::new());

/// Pages for an auto-allocated user stack.
const USER_STACK_PAGES: u64 = 1;

/// Create a process with one thread that will start at `entry`.
///
/// The process is registered in the process table and under
/// `\proc\<pid>`; it does not run until [`start_process`].
pub fn create_process(name: &str, entry: u64, kernel_mode: bool) -> Result<Arc<Process>> {
    let process = Process::create(name, kernel_mode)?;
    create_thread_in(&process, entry, None, 0)?;
    register_process(&process);
    info!("created process {} ({})", process.pid(), name);
    Ok(process)
}

fn register_process(process: &Arc<Process>) {
    PROCESS_TABLE.lock().insert(process.pid(), process.clone());
    let node = Arc::new(ProcessNode::new(process.clone()));
    let _ = tree::add_node(&format!("\\proc\\{}", process.pid()), node);
}

/// Create an additional thread in `process`, starting at `entry` with
/// `param` in the first argument register. Without `stack_top`, a stack
/// is allocated: a kernel stack for kernel processes, or mapped user
/// pages for user processes. Stack allocation failure aborts the whole
/// creation and returns no thread.
pub fn create_thread_in(
    process: &Arc<Process>,
    entry: u64,
    stack_top: Option<u64>,
    param: u64,
) -> Result<Arc<Thread>> {
    let stack = match (stack_top, process.kernel_mode) {
        (Some(top), _) => StackChoice::Provided(top),
        (None, true) => StackChoice::KernelAuto,
        (None, false) => allocate_user_stack(process)?,
    };
    let thread = Thread::new(process, entry, param, stack)?;
    process.add_thread(thread.clone());
    Ok(thread)
}

fn allocate_user_stack(process: &Arc<Process>) -> Result<StackChoice> {
    let base = mem::allocate_virtual_range(USER_STACK_PAGES, Some(process))?;
    let phys = match mem::allocate_physical_pages(USER_STACK_PAGES) {
        Ok(p) => p,
        Err(e) => {
            let _ = mem::deallocate_virtual_range(base, Some(process));
            return Err(e);
        }
    };
    if let Err(e) = mem::map_range(
        phys,
        base,
        USER_STACK_PAGES,
        Some(process),
        mem::CacheMode::WriteBack,
    ) {
        mem::free_physical_pages(phys, USER_STACK_PAGES);
        let _ = mem::deallocate_virtual_range(base, Some(process));
        return Err(e);
    }
    Ok(StackChoice::UserOwned {
        top: base + USER_STACK_PAGES * PAGE_SIZE,
        base,
        pages: USER_STACK_PAGES,
    })
}

/// Write argc/argv/env into the first thread's argument registers. Only
/// legal before the process has begun executing.
pub fn set_start_params(process: &Arc<Process>, argc: u64, argv: u64, env: u64) -> Result<()> {
    if process.has_started() {
        return Err(KernelError::InvalidOp);
    }
    let first = process.first_thread().ok_or(KernelError::InvalidOp)?;
    if first.permits_running() {
        return Err(KernelError::InvalidOp);
    }
    first.with_context(|ctx| ctx.set_start_args(argc, argv, env));
    Ok(())
}

/// Let every thread of the process run.
pub fn start_process(process: &Arc<Process>) {
    process.mark_started();
    for thread in process.threads_snapshot() {
        scheduler::start_thread(&thread);
    }
}

pub fn process_by_pid(pid: Pid) -> Option<Arc<Process>> {
    PROCESS_TABLE.lock().get(&pid).cloned()
}

/// Tear a process out of the registries. Its objects stay alive while
/// references (handles, the scheduler) persist.
fn unregister_process(pid: Pid) {
    PROCESS_TABLE.lock().remove(&pid);
    let _ = tree::delete_node(&format!("\\proc\\{}", pid));
}

/// Terminate the calling thread. If it was the last one, the process goes
/// with it. Exiting cannot fail; this never returns.
pub fn exit_current_thread() -> ! {
    if let Some(thread) = current::current_thread() {
        scheduler::terminate_thread(&thread);
        if let Some(process) = thread.process.upgrade() {
            let remaining = process.remove_thread(thread.tid());
            if remaining == 0 {
                unregister_process(process.pid());
            }
        }
    }
    loop {
        scheduler::yield_now();
    }
}

/// Bring the task manager up and hand this CPU over to the scheduler.
///
/// Task 0 — the kernel's own process, on the boot page table — receives
/// one idle thread per CPU, the reschedule vectors get the switch stubs,
/// and the scheduling timer starts on the BSP. The boot code path simply
/// stops being scheduled once the first timer tick lands.
pub fn init_tasking(cpu_count: usize, boot_pml4_virt: u64, boot_pml4_phys: u64) -> Arc<Process> {
    let task0 = Process::create_task0(boot_pml4_virt, boot_pml4_phys);
    register_process(&task0);

    let mut idle = Vec::new();
    for cpu in 0..cpu_count {
        let thread = Thread::new(&task0, idle_loop as usize as u64, cpu as u64, StackChoice::KernelAuto)
            .expect("idle thread allocation at boot");
        thread.set_permit_running(true);
        task0.add_thread(thread.clone());
        idle.push(thread);
    }
    scheduler::set_idle_threads(idle);

    crate::arch::x86_64::context::install_task_switcher();
    if crate::interrupts::selected_controller() == crate::interrupts::PicKind::Apic {
        crate::arch::x86_64::apic::init_timer(crate::interrupts::RESCHED_VECTOR);
    }
    info!("tasking: {} idle threads, switcher installed", cpu_count);
    task0
}

extern "C" fn idle_loop(_cpu: u64) -> ! {
    loop {
        crate::arch::x86_64::halt();
    }
}

#[cfg(test)]
pub mod test_support {
    //! Shared scaffolding for tests that need live processes or threads.
    //! One lock serialises every test touching the global registries
    //! (PML4 registry, process table, run queue).

    use super::*;
    use crate::mem::pml4;
    use std::sync::{Mutex as StdMutex, MutexGuard};

    pub static ENV_LOCK: StdMutex<()> = StdMutex::new(());

    pub fn lock_env() -> MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make sure the PML4 registry exists, seeding it with a scratch
    /// table when no earlier test has.
    pub fn ensure_pml4() {
        if pml4::master_table_phys().is_none() {
            let table = alloc::vec![0u8; crate::mem::TABLE_SIZE].leak();
            let virt = table.as_ptr() as u64;
            pml4::init(virt, crate::mem::kernel_virt_to_phys(virt));
        }
    }

    pub fn kernel_process() -> Arc<Process> {
        ensure_pml4();
        Process::create("test", true).expect("test process")
    }

    /// Drop a test process out of the registries.
    pub fn drop_process_for_test(pid: Pid) {
        super::unregister_process(pid);
    }

    /// A kernel thread detached from scheduling; the owning process is
    /// intentionally leaked so the weak back-reference stays valid.
    pub fn kernel_thread() -> Arc<Thread> {
        let process = kernel_process();
        let thread = Thread::new(&process, 0x1000, 0, StackChoice::KernelAuto).expect("test thread");
        process.add_thread(thread.clone());
        std::mem::forget(process);
        thread
    }
}
