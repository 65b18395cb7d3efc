//! The general-purpose interior node of the system tree.
//!
//! A `SimpleBranch` keeps an ordered name → node map under its own
//! spinlock. Multi-component paths are forwarded one component at a time,
//! so each branch only ever reasons about its direct children. A branch
//! may carry a factory, in which case `create_child` manufactures children
//! of that native kind; without one, creation is refused.

use super::iface::{split_path, valid_name, Branch, TreeNode};
use crate::error::{KernelError, Result};
use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Bound;
use spin::Mutex;

type NodeFactory = fn() -> Result<Arc<dyn TreeNode>>;

pub struct SimpleBranch {
    children: Mutex<BTreeMap<String, Arc<dyn TreeNode>>>,
    factory: Option<NodeFactory>,
}

impl core::fmt::Debug for SimpleBranch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("SimpleBranch")
    }
}

impl SimpleBranch {
    /// A plain namespace branch; `create_child` is refused.
    pub fn new() -> Self {
        Self {
            children: Mutex::new(BTreeMap::new()),
            factory: None,
        }
    }

    /// A branch that manufactures children with `factory` on create.
    pub fn with_factory(factory: NodeFactory) -> Self {
        Self {
            children: Mutex::new(BTreeMap::new()),
            factory: Some(factory),
        }
    }

    fn direct_child(&self, name: &str) -> Option<Arc<dyn TreeNode>> {
        self.children.lock().get(name).cloned()
    }

    /// Resolve a direct child that must be a branch for the operation to
    /// continue. Missing child is `NotFound`; a leaf in an intermediate
    /// position is `InvalidOp`.
    fn child_branch(&self, name: &str) -> Result<Arc<dyn TreeNode>> {
        let child = self.direct_child(name).ok_or(KernelError::NotFound)?;
        if child.as_branch().is_none() {
            return Err(KernelError::InvalidOp);
        }
        Ok(child)
    }
}

impl Default for SimpleBranch {
    fn default() -> Self {
        Self::new()
    }
}

impl TreeNode for SimpleBranch {
    fn as_branch(&self) -> Option<&dyn Branch> {
        Some(self)
    }
}

impl Branch for SimpleBranch {
    fn get_child(&self, path: &str) -> Result<Arc<dyn TreeNode>> {
        let (first, rest) = split_path(path);
        match rest {
            None => self.direct_child(first).ok_or(KernelError::NotFound),
            Some(rest) => {
                let child = self.child_branch(first)?;
                let branch = child.as_branch().unwrap();
                branch.get_child(rest)
            }
        }
    }

    fn add_child(&self, path: &str, node: Arc<dyn TreeNode>) -> Result<()> {
        let (first, rest) = split_path(path);
        match rest {
            Some(rest) => {
                let child = self.child_branch(first)?;
                child.as_branch().unwrap().add_child(rest, node)
            }
            None => {
                if !valid_name(first) {
                    return Err(KernelError::InvalidName);
                }
                let mut children = self.children.lock();
                if children.contains_key(first) {
                    return Err(KernelError::AlreadyExists);
                }
                children.insert(first.to_string(), node);
                Ok(())
            }
        }
    }

    fn create_child(&self, path: &str) -> Result<Arc<dyn TreeNode>> {
        let (first, rest) = split_path(path);
        match rest {
            Some(rest) => {
                let child = self.child_branch(first)?;
                child.as_branch().unwrap().create_child(rest)
            }
            None => {
                let factory = self.factory.ok_or(KernelError::InvalidOp)?;
                let node = factory()?;
                self.add_child(first, node.clone())?;
                Ok(node)
            }
        }
    }

    fn rename_child(&self, old_path: &str, new_path: &str) -> Result<()> {
        let (old_first, old_rest) = split_path(old_path);
        let (new_first, new_rest) = split_path(new_path);
        match (old_rest, new_rest) {
            (Some(old_rest), Some(new_rest)) => {
                // Only renames within a single branch are supported; this
                // keeps (e.g.) files from migrating into the device part
                // of the tree.
                if old_first != new_first {
                    return Err(KernelError::InvalidOp);
                }
                let child = self.child_branch(old_first)?;
                child.as_branch().unwrap().rename_child(old_rest, new_rest)
            }
            (None, None) => {
                if !valid_name(new_first) {
                    return Err(KernelError::InvalidName);
                }
                let mut children = self.children.lock();
                if !children.contains_key(old_first) {
                    return Err(KernelError::NotFound);
                }
                if children.contains_key(new_first) {
                    return Err(KernelError::AlreadyExists);
                }
                let node = children.remove(old_first).unwrap();
                children.insert(new_first.to_string(), node);
                Ok(())
            }
            _ => Err(KernelError::InvalidOp),
        }
    }

    fn delete_child(&self, path: &str) -> Result<()> {
        let (first, rest) = split_path(path);
        match rest {
            Some(rest) => {
                let child = self.child_branch(first)?;
                child.as_branch().unwrap().delete_child(rest)
            }
            None => {
                let mut children = self.children.lock();
                children.remove(first).map(|_| ()).ok_or(KernelError::NotFound)
            }
        }
    }

    fn num_children(&self) -> Result<u64> {
        Ok(self.children.lock().len() as u64)
    }

    fn enum_children(&self, start_after: &str, max: u64) -> Result<Vec<String>> {
        let children = self.children.lock();
        let range: alloc::collections::btree_map::Range<'_, String, Arc<dyn TreeNode>> =
            if start_after.is_empty() {
                children.range::<String, _>(..)
            } else {
                children.range::<str, _>((Bound::Excluded(start_after), Bound::Unbounded))
            };
        let mut names = Vec::new();
        for (name, _) in range {
            if max != 0 && names.len() as u64 >= max {
                break;
            }
            names.push(name.clone());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::dev::NullDevice;

    fn leaf() -> Arc<dyn TreeNode> {
        Arc::new(NullDevice::new())
    }

    fn tree_with(names: &[&str]) -> SimpleBranch {
        let b = SimpleBranch::new();
        for n in names {
            b.add_child(n, leaf()).unwrap();
        }
        b
    }

    #[test]
    fn add_then_get_returns_same_node() {
        let b = SimpleBranch::new();
        let node = leaf();
        b.add_child("x", node.clone()).unwrap();
        let got = b.get_child("x").unwrap();
        assert!(Arc::ptr_eq(&got, &node));
    }

    #[test]
    fn nested_paths_walk_branches() {
        let root = SimpleBranch::new();
        let sub: Arc<dyn TreeNode> = Arc::new(SimpleBranch::new());
        root.add_child("sub", sub).unwrap();
        let node = leaf();
        root.add_child("sub\\leaf", node.clone()).unwrap();
        assert!(Arc::ptr_eq(&root.get_child("sub\\leaf").unwrap(), &node));
    }

    #[test]
    fn intermediate_leaf_is_invalid_op() {
        let root = tree_with(&["plain"]);
        assert_eq!(
            root.get_child("plain\\below").unwrap_err(),
            KernelError::InvalidOp
        );
        assert_eq!(
            root.add_child("plain\\below", leaf()).unwrap_err(),
            KernelError::InvalidOp
        );
    }

    #[test]
    fn missing_intermediate_is_not_found() {
        let root = SimpleBranch::new();
        assert_eq!(
            root.add_child("nosuch\\x", leaf()).unwrap_err(),
            KernelError::NotFound
        );
        assert_eq!(root.get_child("nosuch\\x").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn duplicate_and_unnamed_adds_are_rejected() {
        let root = tree_with(&["a"]);
        assert_eq!(root.add_child("a", leaf()).unwrap_err(), KernelError::AlreadyExists);
        assert_eq!(root.add_child("", leaf()).unwrap_err(), KernelError::InvalidName);
    }

    #[test]
    fn rename_within_branch() {
        let root = tree_with(&["old"]);
        root.rename_child("old", "new").unwrap();
        assert!(root.get_child("new").is_ok());
        assert_eq!(root.get_child("old").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn rename_across_branches_is_rejected() {
        let root = SimpleBranch::new();
        root.add_child("a", Arc::new(SimpleBranch::new())).unwrap();
        root.add_child("b", Arc::new(SimpleBranch::new())).unwrap();
        root.add_child("a\\x", leaf()).unwrap();
        assert_eq!(
            root.rename_child("a\\x", "b\\x").unwrap_err(),
            KernelError::InvalidOp
        );
        assert_eq!(root.rename_child("a\\x", "x").unwrap_err(), KernelError::InvalidOp);
    }

    #[test]
    fn delete_keeps_live_references_alive() {
        let root = tree_with(&["gone"]);
        let held = root.get_child("gone").unwrap();
        root.delete_child("gone").unwrap();
        assert_eq!(root.get_child("gone").unwrap_err(), KernelError::NotFound);
        // The node itself survives while we hold it.
        assert!(held.as_readable().is_some());
        assert_eq!(root.delete_child("gone").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn create_without_factory_is_invalid_op() {
        let root = SimpleBranch::new();
        assert_eq!(root.create_child("x").unwrap_err(), KernelError::InvalidOp);
    }

    #[test]
    fn enumeration_resumes_strictly_after() {
        let root = tree_with(&["a", "b", "c", "d", "e"]);
        assert_eq!(root.enum_children("", 2).unwrap(), vec!["a", "b"]);
        assert_eq!(root.enum_children("b", 2).unwrap(), vec!["c", "d"]);
        assert_eq!(root.enum_children("d", 2).unwrap(), vec!["e"]);
        assert_eq!(root.enum_children("e", 2).unwrap(), Vec::<String>::new());
        // A start name that is not itself a child still positions the scan.
        assert_eq!(root.enum_children("bb", 2).unwrap(), vec!["c", "d"]);
        // max == 0 means no limit.
        assert_eq!(root.enum_children("", 0).unwrap().len(), 5);
    }

    #[test]
    fn num_children_counts() {
        let root = tree_with(&["a", "b"]);
        assert_eq!(root.num_children().unwrap(), 2);
    }
}
