// Processes appear in the tree under \proc\<pid>, so process handles can
// be opened like any other object.

use super::iface::TreeNode;
use crate::process::task::Process;
use alloc::sync::Arc;

pub struct ProcessNode {
    process: Arc<Process>,
}

impl core::fmt::Debug for ProcessNode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("ProcessNode")
    }
}

impl ProcessNode {
    pub fn new(process: Arc<Process>) -> Self {
        Self { process }
    }
}

impl TreeNode for ProcessNode {
    fn as_process(&self) -> Option<&Arc<Process>> {
        Some(&self.process)
    }
}
