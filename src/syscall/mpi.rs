//! Message-passing syscalls.
//!
//! The buffer handed to `send_message` is copied into a kernel-owned
//! allocation at once, so the caller may reuse its memory immediately;
//! the kernel buffer is freed when the recipient completes the message.

use super::{abi, check_um_ptr};
use crate::error::{KernelError, Result};
use crate::ipc::{Message, MessageDetails};
use crate::process::current::current_process;
use crate::process::task::Pid;
use alloc::vec::Vec;

/// Largest accepted message body.
pub const MAX_MESSAGE_LEN: u64 = 1 << 20;

pub(super) fn sc_register_for_mp(_a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(register_for_mp())
}

/// One-shot enable of the calling process's message queue.
pub fn register_for_mp() -> Result<()> {
    let process = current_process().ok_or(KernelError::Unknown)?;
    process.msgs.register()
}

pub(super) fn sc_send_message(target_pid: u64, message_id: u64, message_len: u64, message_ptr: u64, _a5: u64, _a6: u64) -> u64 {
    abi(send_message(target_pid, message_id, message_len, message_ptr))
}

pub fn send_message(target_pid: Pid, message_id: u64, message_len: u64, message_ptr: u64) -> Result<()> {
    if message_len > MAX_MESSAGE_LEN {
        return Err(KernelError::InvalidParam);
    }
    if message_len > 0 {
        check_um_ptr(message_ptr)?;
    }
    let sender = current_process().ok_or(KernelError::Unknown)?;
    let target = crate::process::process_by_pid(target_pid).ok_or(KernelError::NotFound)?;

    let body = if message_len > 0 {
        let src = unsafe {
            core::slice::from_raw_parts(message_ptr as *const u8, message_len as usize)
        };
        Vec::from(src)
    } else {
        Vec::new()
    };

    target.msgs.send(Message {
        sender: sender.pid(),
        id: message_id,
        body,
    })
}

pub(super) fn sc_receive_message_details(sender_out: u64, id_out: u64, len_out: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(receive_message_details(sender_out, id_out, len_out))
}

/// Peek the next message's header and check it out. No further message
/// can be retrieved until this one is completed.
pub fn receive_message_details(sender_out: u64, id_out: u64, len_out: u64) -> Result<()> {
    check_um_ptr(sender_out)?;
    check_um_ptr(id_out)?;
    check_um_ptr(len_out)?;
    let process = current_process().ok_or(KernelError::Unknown)?;

    let details = process.msgs.retrieve_next()?;
    unsafe {
        (sender_out as *mut u64).write(details.sender);
        (id_out as *mut u64).write(details.id);
        (len_out as *mut u64).write(details.len);
    }
    Ok(())
}

pub(super) fn sc_receive_message_body(buffer: u64, buffer_size: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(receive_message_body(buffer, buffer_size))
}

/// Copy the checked-out message's body. A too-small buffer truncates
/// silently.
pub fn receive_message_body(buffer: u64, buffer_size: u64) -> Result<()> {
    check_um_ptr(buffer)?;
    if buffer_size == 0 {
        return Err(KernelError::InvalidParam);
    }
    let process = current_process().ok_or(KernelError::Unknown)?;

    process.msgs.with_current(|msg| {
        let n = (buffer_size as usize).min(msg.body.len());
        unsafe {
            core::ptr::copy_nonoverlapping(msg.body.as_ptr(), buffer as *mut u8, n);
        }
    })
}

pub(super) fn sc_message_complete(sender: u64, id: u64, len: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(message_complete(sender, id, len))
}

/// Finish the checked-out message. The header triple must match what
/// `receive_message_details` reported; the kernel buffer is freed here.
pub fn message_complete(sender: Pid, id: u64, len: u64) -> Result<()> {
    let process = current_process().ok_or(KernelError::Unknown)?;
    process.msgs.complete(MessageDetails { sender, id, len })
}
