//! The system tree: one rooted, hierarchical namespace of typed kernel
//! objects.
//!
//! Paths are absolute, components separated by `\`. The standard mounts:
//!
//! ```text
//! \mem    RAM file system (create manufactures files)
//! \dev    devices (a null device to begin with)
//! \pipe   create manufactures pipe branches
//! \proc   one node per live process
//! \wait   create manufactures bare wait objects
//! ```

pub mod branch;
pub mod dev;
pub mod iface;
pub mod pipe;
pub mod process_node;
pub mod ramfs;

use crate::error::Result;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use branch::SimpleBranch;
use dev::NullDevice;
use iface::{Branch, TreeNode, PATH_DELIMITER};
use lazy_static::lazy_static;

lazy_static! {
    /// The tree root with its standard mounts, built on first touch.
    static ref ROOT: Arc<SimpleBranch> = {
        let root = Arc::new(SimpleBranch::new());

        let mem = Arc::new(SimpleBranch::with_factory(ramfs::new_ram_file));
        root.add_child("mem", mem).expect("fresh root");

        let dev = Arc::new(SimpleBranch::new());
        dev.add_child("null", Arc::new(NullDevice::new()))
            .expect("fresh dev branch");
        root.add_child("dev", dev).expect("fresh root");

        let pipes = Arc::new(SimpleBranch::with_factory(pipe::new_pipe_branch));
        root.add_child("pipe", pipes).expect("fresh root");

        root.add_child("proc", Arc::new(SimpleBranch::new()))
            .expect("fresh root");

        let waits = Arc::new(SimpleBranch::with_factory(new_wait_object));
        root.add_child("wait", waits).expect("fresh root");

        root
    };
}

fn new_wait_object() -> Result<Arc<dyn TreeNode>> {
    Ok(Arc::new(crate::synch::WaitObject::new()) as Arc<dyn TreeNode>)
}

/// Force the root into existence during boot, before anything races.
pub fn init() {
    lazy_static::initialize(&ROOT);
}

/// The tree root.
pub fn system_tree() -> &'static Arc<SimpleBranch> {
    &ROOT
}

/// Strip the leading delimiter of an absolute path; the root has no name.
fn relative(path: &str) -> &str {
    path.strip_prefix(PATH_DELIMITER).unwrap_or(path)
}

// Convenience wrappers over the root branch, absolute-path flavoured.

pub fn get_node(path: &str) -> Result<Arc<dyn TreeNode>> {
    system_tree().get_child(relative(path))
}

pub fn add_node(path: &str, node: Arc<dyn TreeNode>) -> Result<()> {
    system_tree().add_child(relative(path), node)
}

pub fn create_node(path: &str) -> Result<Arc<dyn TreeNode>> {
    system_tree().create_child(relative(path))
}

pub fn delete_node(path: &str) -> Result<()> {
    system_tree().delete_child(relative(path))
}

pub fn rename_node(old_path: &str, new_path: &str) -> Result<()> {
    system_tree().rename_child(relative(old_path), relative(new_path))
}

pub fn enum_nodes(path: &str, start_after: &str, max: u64) -> Result<Vec<String>> {
    let node = get_node(path)?;
    let branch = node.as_branch().ok_or(crate::error::KernelError::WrongType)?;
    branch.enum_children(start_after, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_mounts_exist() {
        init();
        for mount in ["\\mem", "\\dev", "\\pipe", "\\proc", "\\wait"] {
            assert!(get_node(mount).is_ok(), "missing mount {mount}");
        }
        assert!(get_node("\\dev\\null").is_ok());
    }

    #[test]
    fn create_in_mem_makes_a_file() {
        init();
        let file = create_node("\\mem\\tree_mod_test_file").unwrap();
        assert!(file.as_file().is_some());
        assert!(Arc::ptr_eq(
            &get_node("\\mem\\tree_mod_test_file").unwrap(),
            &file
        ));
        delete_node("\\mem\\tree_mod_test_file").unwrap();
    }

    #[test]
    fn create_in_pipe_makes_a_pipe() {
        init();
        let p = create_node("\\pipe\\tree_mod_test_pipe").unwrap();
        assert!(p.as_branch().is_some());
        assert!(get_node("\\pipe\\tree_mod_test_pipe\\read").is_ok());
        assert!(get_node("\\pipe\\tree_mod_test_pipe\\write").is_ok());
        delete_node("\\pipe\\tree_mod_test_pipe").unwrap();
    }

    #[test]
    fn create_in_wait_makes_a_waitable() {
        init();
        let w = create_node("\\wait\\tree_mod_test_wait").unwrap();
        assert!(w.as_waitable().is_some());
        delete_node("\\wait\\tree_mod_test_wait").unwrap();
    }

    #[test]
    fn leading_delimiter_is_optional_at_the_root() {
        init();
        assert!(get_node("dev\\null").is_ok());
        assert!(get_node("\\dev\\null").is_ok());
    }
}
