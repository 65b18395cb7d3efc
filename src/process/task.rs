//! Process and thread objects.
//!
//! A process owns its threads, its address space (PML4 plus virtual range
//! map), its handle-free resources — the message queue — and a name. A
//! thread holds a weak back-reference to its process (the strong edge
//! runs parent to child, so destruction is acyclic), its saved execution
//! context, and its own handle table.

use crate::error::Result;
use crate::ipc::MessageQueue;
use crate::mem::virt::RangeMap;
use crate::mem::{pml4, USER_VMM_BASE, USER_VMM_TOP};
use crate::objmgr::HandleTable;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::arch::x86_64::context::{ExecContext, StackChoice};

pub type Pid = u64;
pub type Tid = u64;

static NEXT_PID: AtomicU64 = AtomicU64::new(1);
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ThreadState {
    Runnable = 0,
    Blocked = 1,
    Suspended = 2,
    Terminated = 3,
}

impl ThreadState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => ThreadState::Runnable,
            1 => ThreadState::Blocked,
            2 => ThreadState::Suspended,
            _ => ThreadState::Terminated,
        }
    }
}

/// Per-process memory bookkeeping. The page tables themselves are edited
/// through [`crate::mem`]; this records what was allocated.
pub struct ProcessMem {
    pub pml4_virt: u64,
    pub pml4_phys: u64,
    pub ranges: Mutex<RangeMap>,
    /// False for task 0, which adopts the boot table instead of owning a
    /// fresh one.
    owns_pml4: bool,
}

pub struct Process {
    pid: Pid,
    pub kernel_mode: bool,
    pub name: String,
    pub mem: ProcessMem,
    pub msgs: MessageQueue,
    threads: Mutex<Vec<Arc<Thread>>>,
    started: AtomicBool,
}

impl Process {
    /// Allocate a process shell: fresh PML4 with the kernel half cloned,
    /// empty range map, no threads yet.
    pub fn create(name: &str, kernel_mode: bool) -> Result<Arc<Self>> {
        let (pml4_virt, pml4_phys) = pml4::allocate_for_process()?;
        Ok(Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            kernel_mode,
            name: String::from(name),
            mem: ProcessMem {
                pml4_virt,
                pml4_phys,
                ranges: Mutex::new(RangeMap::new(USER_VMM_BASE, USER_VMM_TOP)),
                owns_pml4: true,
            },
            msgs: MessageQueue::new(),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    /// The kernel's own process, task 0: runs on the boot page table that
    /// the PML4 registry was seeded with.
    pub fn create_task0(pml4_virt: u64, pml4_phys: u64) -> Arc<Self> {
        Arc::new(Self {
            pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
            kernel_mode: true,
            name: String::from("kernel"),
            mem: ProcessMem {
                pml4_virt,
                pml4_phys,
                ranges: Mutex::new(RangeMap::new(USER_VMM_BASE, USER_VMM_TOP)),
                owns_pml4: false,
            },
            msgs: MessageQueue::new(),
            threads: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn add_thread(&self, thread: Arc<Thread>) {
        self.threads.lock().push(thread);
    }

    /// Drop our reference to a dead thread. Returns how many remain.
    pub fn remove_thread(&self, tid: Tid) -> usize {
        let mut threads = self.threads.lock();
        threads.retain(|t| t.tid() != tid);
        threads.len()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn first_thread(&self) -> Option<Arc<Thread>> {
        self.threads.lock().first().cloned()
    }

    pub fn threads_snapshot(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().clone()
    }

    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.msgs.shutdown();

        // Return every user allocation, then the top-level table itself.
        loop {
            let next = self.mem.ranges.lock().first_allocation();
            let Some((base, pages)) = next else { break };
            let _ = crate::mem::unmap_range(base, pages, Some(self), true);
            let _ = self.mem.ranges.lock().deallocate(base);
        }

        if self.mem.owns_pml4 {
            pml4::deallocate_for_process(self.mem.pml4_virt);
        }
    }
}

pub struct Thread {
    tid: Tid,
    pub process: Weak<Process>,
    state: AtomicU32,
    permit_running: AtomicBool,
    queued: AtomicBool,
    pub handles: Mutex<HandleTable>,
    context: NonNull<ExecContext>,
}

// The context pointer is exclusively owned; everything else is Sync.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Build a thread and its execution context. The thread starts
    /// unqueued with running not yet permitted.
    pub fn new(
        process: &Arc<Process>,
        entry: u64,
        param: u64,
        stack: StackChoice,
    ) -> Result<Arc<Self>> {
        let context = ExecContext::new(
            entry,
            param,
            process.kernel_mode,
            process.mem.pml4_phys,
            stack,
        )?;
        let raw = Box::into_raw(context);
        let thread = Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            process: Arc::downgrade(process),
            state: AtomicU32::new(ThreadState::Runnable as u32),
            permit_running: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            handles: Mutex::new(HandleTable::new()),
            context: NonNull::new(raw).expect("Box::into_raw is never null"),
        });
        // The context points back at its thread so the per-CPU MSR can
        // identify the running thread without a list walk. Plain pointer,
        // no refcount: the scheduler's references keep the thread alive
        // whenever this can be dereferenced.
        unsafe { (*raw).set_owner(Arc::as_ptr(&thread)) };
        Ok(thread)
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn context_ptr(&self) -> *mut ExecContext {
        self.context.as_ptr()
    }

    /// Mutate the saved context of a thread that is not running anywhere.
    pub fn with_context<R>(&self, f: impl FnOnce(&mut ExecContext) -> R) -> R {
        unsafe { f(&mut *self.context.as_ptr()) }
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u32, Ordering::Release);
    }

    pub fn permits_running(&self) -> bool {
        self.permit_running.load(Ordering::Acquire)
    }

    pub fn set_permit_running(&self, permit: bool) {
        self.permit_running.store(permit, Ordering::Release);
    }

    /// Claim the queue slot; false if already queued.
    pub(crate) fn try_mark_queued(&self) -> bool {
        self.queued
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn clear_queued(&self) {
        self.queued.store(false, Ordering::Release);
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Off every queue and not running, or we would still be
        // referenced; the context can go.
        let context = unsafe { Box::from_raw(self.context.as_ptr()) };
        if let Some((base, _pages)) = context.user_stack_backing() {
            if let Some(process) = self.process.upgrade() {
                if let Ok(pages) = process.mem.ranges.lock().deallocate(base) {
                    let _ = crate::mem::unmap_range(base, pages, Some(&process), true);
                }
            }
        }
        drop(context);
    }
}

/// Identity wrapper so waiter queues can compare threads by object, not
/// by value.
#[derive(Clone)]
pub struct ThreadRef(pub Arc<Thread>);

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
