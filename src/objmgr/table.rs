//! Per-thread handle tables.
//!
//! Each entry pairs a reference-counted tree node with a per-handle seek
//! cursor. Tables belong to exactly one thread and are never shared, so a
//! seek-cursor update needs no locking beyond the table's own lock.

use super::handles::{self, Handle};
use crate::tree::iface::TreeNode;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;

pub struct ObjectData {
    pub node: Arc<dyn TreeNode>,
    pub seek_position: u64,
}

pub struct HandleTable {
    entries: BTreeMap<Handle, ObjectData>,
}

impl HandleTable {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Store an object, assigning it a fresh handle.
    pub fn store(&mut self, node: Arc<dyn TreeNode>) -> Handle {
        let handle = handles::allocate();
        self.entries.insert(
            handle,
            ObjectData {
                node,
                seek_position: 0,
            },
        );
        handle
    }

    /// The object behind `handle`, if this table owns it.
    pub fn retrieve(&self, handle: Handle) -> Option<&ObjectData> {
        self.entries.get(&handle)
    }

    pub fn retrieve_mut(&mut self, handle: Handle) -> Option<&mut ObjectData> {
        self.entries.get_mut(&handle)
    }

    /// The node alone, cloned out of the entry.
    pub fn retrieve_node(&self, handle: Handle) -> Option<Arc<dyn TreeNode>> {
        self.entries.get(&handle).map(|o| o.node.clone())
    }

    /// Drop the entry. The object lives on while other references exist.
    pub fn remove(&mut self, handle: Handle) -> Option<ObjectData> {
        let removed = self.entries.remove(&handle);
        if removed.is_some() {
            handles::release(handle);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::dev::NullDevice;

    fn node() -> Arc<dyn TreeNode> {
        Arc::new(NullDevice::new())
    }

    #[test]
    fn store_then_lookup_yields_same_object() {
        let mut table = HandleTable::new();
        let n = node();
        let h = table.store(n.clone());
        assert!(h != 0);
        // Repeated lookups agree.
        for _ in 0..3 {
            let got = table.retrieve_node(h).unwrap();
            assert!(Arc::ptr_eq(&got, &n));
        }
    }

    #[test]
    fn closed_handles_never_resolve_again() {
        let mut table = HandleTable::new();
        let h = table.store(node());
        assert!(table.remove(h).is_some());
        assert!(table.retrieve(h).is_none());
        assert!(table.remove(h).is_none());
        // A later allocation cannot land on the retired number.
        let h2 = table.store(node());
        assert!(h2 != h);
    }

    #[test]
    fn object_outlives_its_handle() {
        let mut table = HandleTable::new();
        let n = node();
        let h = table.store(n.clone());
        let entry = table.remove(h).unwrap();
        assert!(Arc::ptr_eq(&entry.node, &n));
    }

    #[test]
    fn seek_cursor_is_per_handle() {
        let mut table = HandleTable::new();
        let n = node();
        let h1 = table.store(n.clone());
        let h2 = table.store(n);
        table.retrieve_mut(h1).unwrap().seek_position = 42;
        assert_eq!(table.retrieve(h1).unwrap().seek_position, 42);
        assert_eq!(table.retrieve(h2).unwrap().seek_position, 0);
    }
}
