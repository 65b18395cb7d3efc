//! Syscalls that move bytes through a handle.
//!
//! Reads and writes address the object at (per-handle cursor + offset)
//! and advance the cursor by what was actually transferred, so sequential
//! calls walk adjacent data. The cursor itself moves with `seek`, whose
//! proposed position must land inside [0, size].

use super::{abi, calling_thread, check_um_ptr};
use crate::error::{KernelError, Result};
use crate::objmgr::Handle;

/// Seek origin. ABI values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum SeekWhence {
    Start = 0,
    End = 1,
    Current = 2,
}

impl SeekWhence {
    fn from_abi(v: u64) -> Result<Self> {
        match v {
            0 => Ok(SeekWhence::Start),
            1 => Ok(SeekWhence::End),
            2 => Ok(SeekWhence::Current),
            _ => Err(KernelError::InvalidParam),
        }
    }
}

pub(super) fn sc_read_handle(handle: u64, offset: u64, len: u64, buf: u64, buflen: u64, bytes_read_out: u64) -> u64 {
    abi(read_handle(handle, offset, len, buf, buflen, bytes_read_out))
}

pub fn read_handle(
    handle: Handle,
    start_offset: u64,
    mut bytes_to_read: u64,
    buffer: u64,
    buffer_size: u64,
    bytes_read_out: u64,
) -> Result<()> {
    check_um_ptr(buffer)?;
    check_um_ptr(bytes_read_out)?;
    if buffer_size == 0 {
        return Err(KernelError::InvalidParam);
    }
    let thread = calling_thread()?;

    let mut handles = thread.handles.lock();
    let entry = handles
        .retrieve_mut(handle)
        .ok_or(KernelError::InvalidParam)?;
    let readable = entry.node.as_readable().ok_or(KernelError::InvalidOp)?;

    if bytes_to_read > buffer_size {
        bytes_to_read = buffer_size;
    }
    let out = unsafe { core::slice::from_raw_parts_mut(buffer as *mut u8, bytes_to_read as usize) };
    let read = readable.read_bytes(entry.seek_position + start_offset, bytes_to_read, out)?;

    // Handles are per thread, so the cursor needs no further locking.
    entry.seek_position += read;
    unsafe { (bytes_read_out as *mut u64).write(read) };
    Ok(())
}

pub(super) fn sc_write_handle(handle: u64, offset: u64, len: u64, buf: u64, buflen: u64, bytes_written_out: u64) -> u64 {
    abi(write_handle(handle, offset, len, buf, buflen, bytes_written_out))
}

pub fn write_handle(
    handle: Handle,
    start_offset: u64,
    mut bytes_to_write: u64,
    buffer: u64,
    buffer_size: u64,
    bytes_written_out: u64,
) -> Result<()> {
    check_um_ptr(buffer)?;
    check_um_ptr(bytes_written_out)?;
    if buffer_size == 0 {
        return Err(KernelError::InvalidParam);
    }
    let thread = calling_thread()?;

    let mut handles = thread.handles.lock();
    let entry = handles
        .retrieve_mut(handle)
        .ok_or(KernelError::InvalidParam)?;
    let writable = entry.node.as_writable().ok_or(KernelError::InvalidOp)?;

    if bytes_to_write > buffer_size {
        bytes_to_write = buffer_size;
    }
    let data = unsafe { core::slice::from_raw_parts(buffer as *const u8, bytes_to_write as usize) };
    let written = writable.write_bytes(entry.seek_position + start_offset, bytes_to_write, data)?;

    entry.seek_position += written;
    unsafe { (bytes_written_out as *mut u64).write(written) };
    Ok(())
}

pub(super) fn sc_get_handle_data_len(handle: u64, out: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(get_handle_data_len(handle, out))
}

/// Data length behind the handle; file-sized leaves only.
pub fn get_handle_data_len(handle: Handle, data_len_out: u64) -> Result<()> {
    check_um_ptr(data_len_out)?;
    let thread = calling_thread()?;
    let node = thread
        .handles
        .lock()
        .retrieve_node(handle)
        .ok_or(KernelError::InvalidParam)?;
    let file = node.as_file().ok_or(KernelError::InvalidOp)?;
    let size = file.get_size()?;
    unsafe { (data_len_out as *mut u64).write(size) };
    Ok(())
}

pub(super) fn sc_set_handle_data_len(handle: u64, len: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(set_handle_data_len(handle, len))
}

pub fn set_handle_data_len(handle: Handle, data_len: u64) -> Result<()> {
    let thread = calling_thread()?;
    let node = thread
        .handles
        .lock()
        .retrieve_node(handle)
        .ok_or(KernelError::NotFound)?;
    let file = node.as_file().ok_or(KernelError::InvalidOp)?;
    file.set_size(data_len)
}

pub(super) fn sc_seek_handle(handle: u64, offset: u64, whence: u64, new_offset_out: u64, _a5: u64, _a6: u64) -> u64 {
    abi(seek_handle(handle, offset as i64, whence, new_offset_out))
}

/// Move the handle's cursor. `new_offset_out` may be null when the caller
/// does not care where it landed.
pub fn seek_handle(handle: Handle, offset: i64, whence: u64, new_offset_out: u64) -> Result<()> {
    if new_offset_out != 0 {
        check_um_ptr(new_offset_out)?;
    }
    let whence = SeekWhence::from_abi(whence)?;
    let thread = calling_thread()?;

    let mut handles = thread.handles.lock();
    let entry = handles
        .retrieve_mut(handle)
        .ok_or(KernelError::InvalidParam)?;
    let file = entry.node.as_file().ok_or(KernelError::InvalidOp)?;
    let size = file.get_size()?;

    let proposed = match whence {
        SeekWhence::Start => offset as i128,
        SeekWhence::End => size as i128 - offset as i128,
        SeekWhence::Current => entry.seek_position as i128 + offset as i128,
    };
    if proposed < 0 || proposed > size as i128 {
        return Err(KernelError::OutOfRange);
    }
    entry.seek_position = proposed as u64;
    if new_offset_out != 0 {
        unsafe { (new_offset_out as *mut u64).write(entry.seek_position) };
    }
    Ok(())
}
