//! The system-call surface.
//!
//! A single entry point ([`dispatch`]) indexes a pointer table with the
//! selector and hands the six raw argument registers to a thin wrapper,
//! which casts them and calls the typed handler. Every syscall returns an
//! error code (`0` = no error); results travel through user out-pointers.
//!
//! Validation happens before anything else: user pointers must have the
//! top bit clear, nulls are rejected unless explicitly permitted, and
//! zero-length buffers are rejected wherever the buffer would actually be
//! dereferenced. A validation failure changes no kernel state.

pub mod handles;
pub mod mem;
pub mod mpi;
pub mod rw;
pub mod synch;

use crate::error::{KernelError, Result, NO_ERROR};
use alloc::string::String;

/// Longest accepted path, in bytes.
pub const MAX_PATH_LEN: u64 = 4096;
/// Longest accepted debug-output write.
const MAX_DEBUG_OUTPUT: u64 = 1024;

pub type SyscallFn = fn(u64, u64, u64, u64, u64, u64) -> u64;

/// Selector-indexed pointer table. Order is ABI.
pub const SYSCALL_TABLE: &[SyscallFn] = &[
    /*  0 */ sc_debug_output,
    /*  1 */ handles::sc_open_handle,
    /*  2 */ handles::sc_close_handle,
    /*  3 */ handles::sc_create_obj_and_handle,
    /*  4 */ handles::sc_delete_object,
    /*  5 */ handles::sc_rename_object,
    /*  6 */ handles::sc_get_object_properties,
    /*  7 */ handles::sc_enum_children,
    /*  8 */ rw::sc_read_handle,
    /*  9 */ rw::sc_write_handle,
    /* 10 */ rw::sc_get_handle_data_len,
    /* 11 */ rw::sc_set_handle_data_len,
    /* 12 */ rw::sc_seek_handle,
    /* 13 */ mem::sc_allocate_backing_memory,
    /* 14 */ mem::sc_release_backing_memory,
    /* 15 */ mem::sc_map_memory,
    /* 16 */ synch::sc_wait_for_object,
    /* 17 */ mpi::sc_register_for_mp,
    /* 18 */ mpi::sc_send_message,
    /* 19 */ mpi::sc_receive_message_details,
    /* 20 */ mpi::sc_receive_message_body,
    /* 21 */ mpi::sc_message_complete,
];

/// Entry from the syscall stub: selector plus the six argument registers.
pub extern "C" fn dispatch(selector: u64, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64, a6: u64) -> u64 {
    let Some(handler) = SYSCALL_TABLE.get(selector as usize) else {
        return KernelError::InvalidParam.code();
    };
    #[cfg(feature = "syscall-verbose")]
    trace!("syscall {} ({:#x}, {:#x}, {:#x}, ...)", selector, a1, a2, a3);
    handler(a1, a2, a3, a4, a5, a6)
}

/// Fold a typed handler result into the ABI code.
pub(crate) fn abi(result: Result<()>) -> u64 {
    match result {
        Ok(()) => NO_ERROR,
        Err(e) => e.code(),
    }
}

/// A user pointer has its top bit clear.
#[inline]
pub fn is_um_address(addr: u64) -> bool {
    addr & (1 << 63) == 0
}

/// Validate a non-null user pointer that will be dereferenced.
pub(crate) fn check_um_ptr(addr: u64) -> Result<()> {
    if addr == 0 || !is_um_address(addr) {
        return Err(KernelError::InvalidParam);
    }
    Ok(())
}

/// Copy a path string out of user memory.
pub(crate) fn copy_path_from_user(path: u64, path_len: u64) -> Result<String> {
    check_um_ptr(path)?;
    if path_len == 0 || path_len > MAX_PATH_LEN {
        return Err(KernelError::InvalidParam);
    }
    let bytes = unsafe { core::slice::from_raw_parts(path as *const u8, path_len as usize) };
    core::str::from_utf8(bytes)
        .map(String::from)
        .map_err(|_| KernelError::InvalidName)
}

/// The calling thread, which every handle operation needs.
pub(crate) fn calling_thread() -> Result<alloc::sync::Arc<crate::process::task::Thread>> {
    crate::process::current::current_thread().ok_or(KernelError::InvalidOp)
}

/// Transcribe up to [`MAX_DEBUG_OUTPUT`] bytes from user space into the
/// kernel log, verbatim. No kernel addresses allowed — nothing may leak
/// kernel bytes to the log on a user program's behalf.
fn sc_debug_output(msg: u64, length: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(debug_output(msg, length))
}

fn debug_output(msg: u64, length: u64) -> Result<()> {
    check_um_ptr(msg)?;
    if length > MAX_DEBUG_OUTPUT {
        return Err(KernelError::InvalidParam);
    }
    let bytes = unsafe { core::slice::from_raw_parts(msg as *const u8, length as usize) };
    if let Ok(text) = core::str::from_utf8(bytes) {
        info!("user: {}", text);
    } else {
        info!("user: {:x?}", bytes);
    }
    Ok(())
}
