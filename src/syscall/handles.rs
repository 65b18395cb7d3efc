//! Syscalls that create, destroy and inspect handles and tree objects.

use super::{abi, calling_thread, check_um_ptr, copy_path_from_user, is_um_address};
use crate::error::{KernelError, Result};
use crate::objmgr::Handle;
use crate::tree;
use alloc::string::String;
use alloc::vec::Vec;

/// `open` flag: create the object if the path does not resolve.
pub const H_CREATE_IF_NEW: u32 = 1;

/// Capability probe results, laid out for user space.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectProperties {
    pub exists: u8,
    pub is_file: u8,
    pub is_leaf: u8,
    pub readable: u8,
    pub writable: u8,
}

pub(super) fn sc_open_handle(path: u64, path_len: u64, handle_out: u64, flags: u64, _a5: u64, _a6: u64) -> u64 {
    abi(open_handle(path, path_len, handle_out, flags as u32))
}

pub fn open_handle(path: u64, path_len: u64, handle_out: u64, flags: u32) -> Result<()> {
    check_um_ptr(handle_out)?;
    let path = copy_path_from_user(path, path_len)?;
    let thread = calling_thread()?;

    let node = match tree::get_node(&path) {
        Ok(node) => node,
        Err(KernelError::NotFound) if flags & H_CREATE_IF_NEW != 0 => tree::create_node(&path)?,
        Err(e) => return Err(e),
    };

    let handle = thread.handles.lock().store(node);
    unsafe { (handle_out as *mut Handle).write(handle) };
    Ok(())
}

pub(super) fn sc_close_handle(handle: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(close_handle(handle))
}

/// Destroy the handle entry. The object may outlive it; reference
/// counting decides.
pub fn close_handle(handle: Handle) -> Result<()> {
    let thread = calling_thread()?;
    let removed = thread.handles.lock().remove(handle);
    match removed {
        Some(_) => Ok(()),
        None => Err(KernelError::NotFound),
    }
}

pub(super) fn sc_create_obj_and_handle(path: u64, path_len: u64, handle_out: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(create_obj_and_handle(path, path_len, handle_out))
}

/// Create a new object in the tree and open a handle to it. What kind of
/// leaf appears depends on where in the tree it is created; branches that
/// do not manufacture children refuse.
pub fn create_obj_and_handle(path: u64, path_len: u64, handle_out: u64) -> Result<()> {
    check_um_ptr(handle_out)?;
    let path = copy_path_from_user(path, path_len)?;
    let thread = calling_thread()?;

    let node = tree::create_node(&path)?;
    let handle = thread.handles.lock().store(node);
    unsafe { (handle_out as *mut Handle).write(handle) };
    Ok(())
}

pub(super) fn sc_delete_object(path: u64, path_len: u64, _a3: u64, _a4: u64, _a5: u64, _a6: u64) -> u64 {
    abi(delete_object(path, path_len))
}

/// Remove an object from the tree. Handles still open elsewhere keep the
/// object alive until they close.
pub fn delete_object(path: u64, path_len: u64) -> Result<()> {
    let path = copy_path_from_user(path, path_len)?;
    tree::delete_node(&path)
}

pub(super) fn sc_rename_object(old: u64, old_len: u64, new: u64, new_len: u64, _a5: u64, _a6: u64) -> u64 {
    abi(rename_object(old, old_len, new, new_len))
}

pub fn rename_object(old: u64, old_len: u64, new: u64, new_len: u64) -> Result<()> {
    let old = copy_path_from_user(old, old_len)?;
    let new = copy_path_from_user(new, new_len)?;
    tree::rename_node(&old, &new)
}

pub(super) fn sc_get_object_properties(handle: u64, path: u64, path_len: u64, props: u64, _a5: u64, _a6: u64) -> u64 {
    abi(get_object_properties(handle, path, path_len, props))
}

/// Capability probe by handle or by path — exactly one of the two. A
/// missing path still writes the (all-false) property block.
pub fn get_object_properties(handle: Handle, path: u64, path_len: u64, props: u64) -> Result<()> {
    check_um_ptr(props)?;
    let path_is_valid = path != 0 && is_um_address(path) && path_len > 0;
    if (handle != 0) == path_is_valid {
        return Err(KernelError::InvalidParam);
    }

    let out = props as *mut ObjectProperties;
    let node = if handle != 0 {
        let thread = calling_thread()?;
        let node = thread.handles.lock().retrieve_node(handle);
        node.ok_or(KernelError::InvalidParam)?
    } else {
        let path = copy_path_from_user(path, path_len)?;
        match tree::get_node(&path) {
            Ok(node) => node,
            Err(KernelError::NotFound) => {
                unsafe { out.write(ObjectProperties::default()) };
                return Err(KernelError::NotFound);
            }
            Err(e) => return Err(e),
        }
    };

    let properties = ObjectProperties {
        exists: 1,
        is_file: node.as_file().is_some() as u8,
        is_leaf: node.as_branch().is_none() as u8,
        readable: node.as_readable().is_some() as u8,
        writable: node.as_writable().is_some() as u8,
    };
    unsafe { out.write(properties) };
    Ok(())
}

pub(super) fn sc_enum_children(handle: u64, start_from: u64, start_from_len: u64, max: u64, buffer: u64, buffer_size: u64) -> u64 {
    abi(enum_children(handle, start_from, start_from_len, max, buffer, buffer_size))
}

/// Enumerate child names of a branch handle into `buffer`.
///
/// Layout on success: a table of string pointers terminated by a null
/// pointer, then the name strings themselves, NUL terminated, packed. As
/// many names are stored as fit; the required size for the full result is
/// always written back through `buffer_size`, so callers may size-probe
/// with a too-small (or absent) buffer.
pub fn enum_children(
    handle: Handle,
    start_from: u64,
    start_from_len: u64,
    max: u64,
    buffer: u64,
    buffer_size: u64,
) -> Result<()> {
    check_um_ptr(buffer_size)?;
    if buffer != 0 && !is_um_address(buffer) {
        return Err(KernelError::InvalidParam);
    }
    if start_from != 0 && !is_um_address(start_from) {
        return Err(KernelError::InvalidParam);
    }

    let thread = calling_thread()?;
    let node = thread
        .handles
        .lock()
        .retrieve_node(handle)
        .ok_or(KernelError::NotFound)?;
    let branch = node.as_branch().ok_or(KernelError::InvalidOp)?;

    let start = if start_from != 0 && start_from_len > 0 {
        copy_path_from_user(start_from, start_from_len)?
    } else {
        String::new()
    };

    // Stash the size before enumerating so a concurrent writer in the
    // calling process cannot change our arithmetic midway.
    let stored_buffer_size = unsafe { (buffer_size as *const u64).read_unaligned() };
    let names: Vec<String> = branch.enum_children(&start, max)?;

    // One pointer-table slot per stored name plus the null terminator.
    let mut required_size = core::mem::size_of::<u64>() as u64;
    let mut buffer_used = required_size;
    let mut num_to_store = 0usize;
    let mut could_store_more = buffer != 0 && stored_buffer_size >= 8;

    for name in &names {
        let bytes_this_name = name.len() as u64 + core::mem::size_of::<u64>() as u64 + 1;
        required_size += bytes_this_name;
        if could_store_more && buffer_used + bytes_this_name <= stored_buffer_size {
            buffer_used += bytes_this_name;
            num_to_store += 1;
        } else {
            could_store_more = false;
        }
    }

    if buffer != 0 && stored_buffer_size >= 8 {
        // User buffers carry no alignment promise; write the pointer
        // table unaligned.
        unsafe {
            let ptr_table = buffer as *mut u64;
            let mut string_ptr = ptr_table.add(num_to_store + 1) as *mut u8;
            ptr_table.write_unaligned(0);
            for (i, name) in names.iter().take(num_to_store).enumerate() {
                ptr_table.add(i).write_unaligned(string_ptr as u64);
                ptr_table.add(i + 1).write_unaligned(0);
                core::ptr::copy_nonoverlapping(name.as_ptr(), string_ptr, name.len());
                string_ptr = string_ptr.add(name.len());
                string_ptr.write(0);
                string_ptr = string_ptr.add(1);
            }
        }
    }

    unsafe { (buffer_size as *mut u64).write_unaligned(required_size) };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::current::set_current_for_test;
    use crate::process::test_support;

    fn with_thread<R>(f: impl FnOnce() -> R) -> R {
        let thread = test_support::kernel_thread();
        set_current_for_test(Some(thread));
        let r = f();
        set_current_for_test(None);
        r
    }

    fn open(path: &str, flags: u32) -> Result<Handle> {
        let mut handle: Handle = 0;
        open_handle(
            path.as_ptr() as u64,
            path.len() as u64,
            &mut handle as *mut Handle as u64,
            flags,
        )?;
        Ok(handle)
    }

    #[test]
    fn open_close_round_trip_leaves_tree_untouched() {
        let _env = test_support::lock_env();
        tree::init();
        with_thread(|| {
            let before = tree::enum_nodes("\\dev", "", 0).unwrap();
            let h = open("\\dev\\null", 0).unwrap();
            assert!(h != 0);
            close_handle(h).unwrap();
            assert_eq!(close_handle(h).unwrap_err(), KernelError::NotFound);
            assert_eq!(tree::enum_nodes("\\dev", "", 0).unwrap(), before);
        });
    }

    #[test]
    fn open_missing_without_create_flag_fails() {
        let _env = test_support::lock_env();
        tree::init();
        with_thread(|| {
            assert_eq!(
                open("\\mem\\sc_handles_missing", 0).unwrap_err(),
                KernelError::NotFound
            );
            // With the flag the file comes into being.
            let h = open("\\mem\\sc_handles_missing", H_CREATE_IF_NEW).unwrap();
            close_handle(h).unwrap();
            tree::delete_node("\\mem\\sc_handles_missing").unwrap();
        });
    }

    #[test]
    fn create_then_delete_is_a_tree_no_op() {
        let _env = test_support::lock_env();
        tree::init();
        with_thread(|| {
            let path = "\\mem\\sc_handles_create";
            let mut handle: Handle = 0;
            create_obj_and_handle(
                path.as_ptr() as u64,
                path.len() as u64,
                &mut handle as *mut Handle as u64,
            )
            .unwrap();
            assert!(tree::get_node(path).is_ok());
            delete_object(path.as_ptr() as u64, path.len() as u64).unwrap();
            assert!(tree::get_node(path).is_err());
            // The handle still resolves to the (orphaned) object.
            close_handle(handle).unwrap();
        });
    }

    #[test]
    fn properties_probe_capabilities() {
        let _env = test_support::lock_env();
        tree::init();
        with_thread(|| {
            let h = open("\\dev\\null", 0).unwrap();
            let mut props = ObjectProperties::default();
            get_object_properties(h, 0, 0, &mut props as *mut _ as u64).unwrap();
            assert_eq!(props.exists, 1);
            assert_eq!(props.readable, 1);
            assert_eq!(props.writable, 1);
            assert_eq!(props.is_file, 0);
            assert_eq!(props.is_leaf, 1);
            close_handle(h).unwrap();

            // By path: a branch is not a leaf.
            let path = "\\mem";
            let mut props = ObjectProperties::default();
            get_object_properties(
                0,
                path.as_ptr() as u64,
                path.len() as u64,
                &mut props as *mut _ as u64,
            )
            .unwrap();
            assert_eq!(props.is_leaf, 0);

            // Missing objects write exists = 0 and report NotFound.
            let path = "\\mem\\sc_handles_nonexistent";
            let mut props = ObjectProperties {
                exists: 1,
                ..Default::default()
            };
            assert_eq!(
                get_object_properties(
                    0,
                    path.as_ptr() as u64,
                    path.len() as u64,
                    &mut props as *mut _ as u64,
                )
                .unwrap_err(),
                KernelError::NotFound
            );
            assert_eq!(props.exists, 0);

            // Handle and path together are rejected.
            let h = open("\\dev\\null", 0).unwrap();
            assert_eq!(
                get_object_properties(
                    h,
                    path.as_ptr() as u64,
                    path.len() as u64,
                    &mut props as *mut _ as u64
                )
                .unwrap_err(),
                KernelError::InvalidParam
            );
            close_handle(h).unwrap();
        });
    }

    fn decode_enum_buffer(buffer: &[u8]) -> Vec<String> {
        let mut names = Vec::new();
        let base = buffer.as_ptr() as u64;
        let mut i = 0;
        loop {
            let ptr = u64::from_le_bytes(buffer[i * 8..i * 8 + 8].try_into().unwrap());
            if ptr == 0 {
                break;
            }
            let offset = (ptr - base) as usize;
            let end = offset + buffer[offset..].iter().position(|&b| b == 0).unwrap();
            names.push(String::from_utf8(buffer[offset..end].to_vec()).unwrap());
            i += 1;
        }
        names
    }

    #[test]
    fn enum_children_fills_table_and_reports_size() {
        let _env = test_support::lock_env();
        tree::init();
        // A private branch with known children.
        let branch = alloc::sync::Arc::new(crate::tree::branch::SimpleBranch::new());
        for n in ["a", "b", "c", "d", "e"] {
            use crate::tree::iface::Branch;
            branch
                .add_child(n, alloc::sync::Arc::new(crate::tree::dev::NullDevice::new()))
                .unwrap();
        }
        let _ = tree::delete_node("\\sc_enum_branch");
        tree::add_node("\\sc_enum_branch", branch).unwrap();

        with_thread(|| {
            let h = open("\\sc_enum_branch", 0).unwrap();

            // Size probe: null buffer, zero max enumerates everything.
            let mut size: u64 = 0;
            enum_children(h, 0, 0, 0, 0, &mut size as *mut u64 as u64).unwrap();
            // 6 table slots (5 names + null) plus 5 names of 2 bytes each.
            assert_eq!(size, 6 * 8 + 5 * 2);

            // First page of two names.
            let mut buffer = [0u8; 256];
            let mut size = buffer.len() as u64;
            enum_children(
                h,
                0,
                0,
                2,
                buffer.as_mut_ptr() as u64,
                &mut size as *mut u64 as u64,
            )
            .unwrap();
            assert_eq!(decode_enum_buffer(&buffer), vec!["a", "b"]);
            assert_eq!(size, 3 * 8 + 2 * 2);

            // Resume strictly after "b".
            let start = "b";
            let mut buffer = [0u8; 256];
            let mut size = buffer.len() as u64;
            enum_children(
                h,
                start.as_ptr() as u64,
                start.len() as u64,
                2,
                buffer.as_mut_ptr() as u64,
                &mut size as *mut u64 as u64,
            )
            .unwrap();
            assert_eq!(decode_enum_buffer(&buffer), vec!["c", "d"]);

            close_handle(h).unwrap();
        });
        tree::delete_node("\\sc_enum_branch").unwrap();
    }

    #[test]
    fn enum_children_requires_a_branch() {
        let _env = test_support::lock_env();
        tree::init();
        with_thread(|| {
            let h = open("\\dev\\null", 0).unwrap();
            let mut size: u64 = 0;
            assert_eq!(
                enum_children(h, 0, 0, 0, 0, &mut size as *mut u64 as u64).unwrap_err(),
                KernelError::InvalidOp
            );
            close_handle(h).unwrap();
        });
    }

    #[test]
    fn enum_truncates_to_buffer_but_reports_full_size() {
        let _env = test_support::lock_env();
        tree::init();
        let branch = alloc::sync::Arc::new(crate::tree::branch::SimpleBranch::new());
        for n in ["longname1", "longname2"] {
            use crate::tree::iface::Branch;
            branch
                .add_child(n, alloc::sync::Arc::new(crate::tree::dev::NullDevice::new()))
                .unwrap();
        }
        let _ = tree::delete_node("\\sc_enum_trunc");
        tree::add_node("\\sc_enum_trunc", branch).unwrap();

        with_thread(|| {
            let h = open("\\sc_enum_trunc", 0).unwrap();
            // Room for the table of one name plus its string only.
            let mut buffer = [0u8; 2 * 8 + 10];
            let mut size = buffer.len() as u64;
            enum_children(
                h,
                0,
                0,
                0,
                buffer.as_mut_ptr() as u64,
                &mut size as *mut u64 as u64,
            )
            .unwrap();
            assert_eq!(decode_enum_buffer(&buffer), vec!["longname1"]);
            assert_eq!(size, 3 * 8 + 2 * 10);
            close_handle(h).unwrap();
        });
        tree::delete_node("\\sc_enum_trunc").unwrap();
    }
}
