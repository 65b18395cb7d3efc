//! Node and capability traits for the system tree.
//!
//! Every kernel object reachable by name or handle is a [`TreeNode`]. A
//! node advertises its capabilities through the `as_*` probes, which
//! return `None` by default; the syscall layer performs an explicit probe
//! before dispatch and answers `InvalidOp` on a mismatch. This is
//! deliberately composition, not inheritance — a leaf implements exactly
//! the capability traits that mean something for it.

use crate::error::Result;
use crate::process::task::Process;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// Path component separator. Names are nonempty and never contain it.
pub const PATH_DELIMITER: char = '\\';

/// Anything that can live in the system tree or behind a handle.
pub trait TreeNode: Send + Sync + core::fmt::Debug {
    /// Interior node: supports child operations.
    fn as_branch(&self) -> Option<&dyn Branch> {
        None
    }

    /// Byte source.
    fn as_readable(&self) -> Option<&dyn Readable> {
        None
    }

    /// Byte sink.
    fn as_writable(&self) -> Option<&dyn Writable> {
        None
    }

    /// Sized object: has a data length that can be read and set.
    fn as_file(&self) -> Option<&dyn BasicFile> {
        None
    }

    /// Can block a thread until signalled.
    fn as_waitable(&self) -> Option<&dyn Waitable> {
        None
    }

    /// Process object, for process-handle syscalls.
    fn as_process(&self) -> Option<&Arc<Process>> {
        None
    }
}

/// Interior node contract.
///
/// Paths handed to these operations are relative to the branch itself;
/// multi-component paths are forwarded one level at a time. Intermediate
/// components that resolve to a leaf fail the operation.
pub trait Branch: TreeNode {
    /// Walk `path` and return the node it names.
    fn get_child(&self, path: &str) -> Result<Arc<dyn TreeNode>>;

    /// Insert `node` at `path`. The parent of the terminal component must
    /// already exist; a duplicate terminal name is rejected.
    fn add_child(&self, path: &str, node: Arc<dyn TreeNode>) -> Result<()>;

    /// Ask the terminal branch to manufacture a child of its native kind
    /// and insert it. Branches with no native kind refuse.
    fn create_child(&self, path: &str) -> Result<Arc<dyn TreeNode>>;

    /// Rename a child. Both names must refer to direct children of the
    /// same branch; moves between branches are rejected.
    fn rename_child(&self, old_path: &str, new_path: &str) -> Result<()>;

    /// Remove the named node from the tree. References held elsewhere
    /// keep the node itself alive.
    fn delete_child(&self, path: &str) -> Result<()>;

    fn num_children(&self) -> Result<u64>;

    /// Names of children in this branch's order, resuming strictly after
    /// `start_after` (empty = from the beginning); at most `max` names
    /// unless `max` is zero (no limit). Consistent at the point of the
    /// call only.
    fn enum_children(&self, start_after: &str, max: u64) -> Result<Vec<String>>;
}

pub trait Readable: Send + Sync {
    /// Copy up to `buffer.len()` bytes starting at `start` into `buffer`,
    /// returning how many were produced. Zero-length reads succeed with 0.
    fn read_bytes(&self, start: u64, length: u64, buffer: &mut [u8]) -> Result<u64>;
}

pub trait Writable: Send + Sync {
    /// Consume up to `buffer.len()` bytes at `start`, returning how many
    /// were accepted.
    fn write_bytes(&self, start: u64, length: u64, buffer: &[u8]) -> Result<u64>;
}

pub trait BasicFile: Send + Sync {
    fn get_size(&self) -> Result<u64>;
    fn set_size(&self, size: u64) -> Result<()>;
}

pub trait Waitable: Send + Sync {
    /// Block the calling thread until the object signals.
    fn wait_for_signal(&self);
    fn signal_one(&self);
    fn signal_all(&self);
}

/// Split one leading component off a path. Returns the component and the
/// remainder, if any.
pub fn split_path(path: &str) -> (&str, Option<&str>) {
    match path.find(PATH_DELIMITER) {
        Some(pos) => (&path[..pos], Some(&path[pos + 1..])),
        None => (path, None),
    }
}

/// A name usable for a single tree component.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(PATH_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_walks_one_component() {
        assert_eq!(split_path("a"), ("a", None));
        assert_eq!(split_path("a\\b\\c"), ("a", Some("b\\c")));
        assert_eq!(split_path("\\x"), ("", Some("x")));
    }

    #[test]
    fn name_validity() {
        assert!(valid_name("file.txt"));
        assert!(!valid_name(""));
        assert!(!valid_name("a\\b"));
    }
}
