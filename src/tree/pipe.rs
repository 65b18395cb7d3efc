//! Pipes.
//!
//! A pipe is a branch with two fixed children: a write-only input leaf and
//! a read-only output leaf, backed by one bounded ring buffer, one lock,
//! and a wait object signalled on each successful write. Writes that would
//! overflow are truncated — they never block. Reads return a possibly
//! short count immediately, or block until bytes arrive when the reader
//! leaf is switched to blocking mode.

use super::iface::{Branch, Readable, TreeNode, Waitable, Writable};
use crate::error::{KernelError, Result};
use crate::synch::WaitObject;
use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;

/// Fixed ring capacity.
pub const PIPE_CAPACITY: usize = 64 * 1024;

const READ_LEAF: &str = "read";
const WRITE_LEAF: &str = "write";

struct PipeRing {
    buf: Vec<u8>,
    read_pos: usize,
    used: usize,
}

impl PipeRing {
    fn new() -> Self {
        Self {
            buf: vec![0; PIPE_CAPACITY],
            read_pos: 0,
            used: 0,
        }
    }

    fn read(&mut self, out: &mut [u8]) -> usize {
        let take = out.len().min(self.used);
        for b in out.iter_mut().take(take) {
            *b = self.buf[self.read_pos];
            self.read_pos = (self.read_pos + 1) % PIPE_CAPACITY;
            self.used -= 1;
        }
        take
    }

    fn write(&mut self, data: &[u8]) -> usize {
        let room = PIPE_CAPACITY - self.used;
        let put = data.len().min(room);
        let mut write_pos = (self.read_pos + self.used) % PIPE_CAPACITY;
        for &b in data.iter().take(put) {
            self.buf[write_pos] = b;
            write_pos = (write_pos + 1) % PIPE_CAPACITY;
        }
        self.used += put;
        put
    }

    fn available(&self) -> usize {
        self.used
    }
}

pub struct PipeBranch {
    ring: Mutex<PipeRing>,
    data_ready: WaitObject,
    read_leaf: Arc<PipeReadLeaf>,
    write_leaf: Arc<PipeWriteLeaf>,
}

impl core::fmt::Debug for PipeBranch {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PipeBranch")
    }
}

impl PipeBranch {
    pub fn create() -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<PipeBranch>| Self {
            ring: Mutex::new(PipeRing::new()),
            data_ready: WaitObject::new(),
            read_leaf: Arc::new(PipeReadLeaf {
                parent: weak.clone(),
                block_on_read: AtomicBool::new(false),
            }),
            write_leaf: Arc::new(PipeWriteLeaf {
                parent: weak.clone(),
            }),
        })
    }

    /// Bytes currently buffered.
    pub fn available(&self) -> u64 {
        self.ring.lock().available() as u64
    }
}

/// Factory for pipe-kind branches, e.g. the `\pipe` directory.
pub fn new_pipe_branch() -> Result<Arc<dyn TreeNode>> {
    Ok(PipeBranch::create() as Arc<dyn TreeNode>)
}

impl TreeNode for PipeBranch {
    fn as_branch(&self) -> Option<&dyn Branch> {
        Some(self)
    }

    fn as_waitable(&self) -> Option<&dyn Waitable> {
        Some(&self.data_ready)
    }
}

// The two children are fixed; everything that would change the shape of
// the branch is refused.
impl Branch for PipeBranch {
    fn get_child(&self, path: &str) -> Result<Arc<dyn TreeNode>> {
        match path {
            READ_LEAF => Ok(self.read_leaf.clone() as Arc<dyn TreeNode>),
            WRITE_LEAF => Ok(self.write_leaf.clone() as Arc<dyn TreeNode>),
            _ if path.contains(super::iface::PATH_DELIMITER) => Err(KernelError::InvalidOp),
            _ => Err(KernelError::NotFound),
        }
    }

    fn add_child(&self, _path: &str, _node: Arc<dyn TreeNode>) -> Result<()> {
        Err(KernelError::InvalidOp)
    }

    fn create_child(&self, _path: &str) -> Result<Arc<dyn TreeNode>> {
        Err(KernelError::InvalidOp)
    }

    fn rename_child(&self, _old_path: &str, _new_path: &str) -> Result<()> {
        Err(KernelError::InvalidOp)
    }

    fn delete_child(&self, _path: &str) -> Result<()> {
        Err(KernelError::InvalidOp)
    }

    fn num_children(&self) -> Result<u64> {
        Ok(2)
    }

    fn enum_children(&self, start_after: &str, max: u64) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for name in [READ_LEAF, WRITE_LEAF] {
            if name > start_after && (max == 0 || (names.len() as u64) < max) {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

/// The read-only output leaf.
pub struct PipeReadLeaf {
    parent: Weak<PipeBranch>,
    block_on_read: AtomicBool,
}

impl core::fmt::Debug for PipeReadLeaf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PipeReadLeaf")
    }
}

impl PipeReadLeaf {
    /// Switch this reader between immediate and block-until-data reads.
    pub fn set_block_on_read(&self, block: bool) {
        self.block_on_read.store(block, Ordering::Relaxed);
    }
}

impl TreeNode for PipeReadLeaf {
    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }
}

impl Readable for PipeReadLeaf {
    fn read_bytes(&self, _start: u64, length: u64, buffer: &mut [u8]) -> Result<u64> {
        let parent = self.parent.upgrade().ok_or(KernelError::NotFound)?;
        let wanted = length.min(buffer.len() as u64) as usize;
        if wanted == 0 {
            return Ok(0);
        }
        loop {
            let taken = parent.ring.lock().read(&mut buffer[..wanted]);
            if taken > 0 || !self.block_on_read.load(Ordering::Relaxed) {
                return Ok(taken as u64);
            }
            parent.data_ready.wait_for_signal();
        }
    }
}

/// The write-only input leaf.
pub struct PipeWriteLeaf {
    parent: Weak<PipeBranch>,
}

impl core::fmt::Debug for PipeWriteLeaf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PipeWriteLeaf")
    }
}

impl TreeNode for PipeWriteLeaf {
    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }
}

impl Writable for PipeWriteLeaf {
    fn write_bytes(&self, _start: u64, length: u64, buffer: &[u8]) -> Result<u64> {
        let parent = self.parent.upgrade().ok_or(KernelError::NotFound)?;
        let wanted = length.min(buffer.len() as u64) as usize;
        let written = parent.ring.lock().write(&buffer[..wanted]);
        if written > 0 {
            parent.data_ready.signal_all();
        }
        Ok(written as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ends(pipe: &Arc<PipeBranch>) -> (Arc<dyn TreeNode>, Arc<dyn TreeNode>) {
        (
            pipe.get_child("read").unwrap(),
            pipe.get_child("write").unwrap(),
        )
    }

    #[test]
    fn bytes_come_out_in_order() {
        let pipe = PipeBranch::create();
        let (r, w) = ends(&pipe);
        let written = w
            .as_writable()
            .unwrap()
            .write_bytes(0, 5, &[1, 2, 3, 4, 5])
            .unwrap();
        assert_eq!(written, 5);

        let mut out = [0u8; 5];
        let read = r.as_readable().unwrap().read_bytes(0, 5, &mut out).unwrap();
        assert_eq!(read, 5);
        assert_eq!(out, [1, 2, 3, 4, 5]);

        // Drained pipe: a non-blocking read returns zero bytes.
        assert_eq!(r.as_readable().unwrap().read_bytes(0, 5, &mut out).unwrap(), 0);
    }

    #[test]
    fn capability_split_between_leaves() {
        let pipe = PipeBranch::create();
        let (r, w) = ends(&pipe);
        assert!(r.as_readable().is_some());
        assert!(r.as_writable().is_none());
        assert!(w.as_writable().is_some());
        assert!(w.as_readable().is_none());
    }

    #[test]
    fn overflowing_writes_truncate() {
        let pipe = PipeBranch::create();
        let (_r, w) = ends(&pipe);
        let big = vec![7u8; PIPE_CAPACITY + 100];
        let written = w
            .as_writable()
            .unwrap()
            .write_bytes(0, big.len() as u64, &big)
            .unwrap();
        assert_eq!(written, PIPE_CAPACITY as u64);
        // A second write finds no room at all.
        assert_eq!(w.as_writable().unwrap().write_bytes(0, 1, &[1]).unwrap(), 0);
    }

    #[test]
    fn ring_wraps_correctly() {
        let pipe = PipeBranch::create();
        let (r, w) = ends(&pipe);
        let reader = r.as_readable().unwrap();
        let writer = w.as_writable().unwrap();

        // Fill most of the ring, drain it, then wrap across the boundary.
        let chunk = vec![0xABu8; PIPE_CAPACITY - 10];
        writer.write_bytes(0, chunk.len() as u64, &chunk).unwrap();
        let mut sink = vec![0u8; chunk.len()];
        reader.read_bytes(0, sink.len() as u64, &mut sink).unwrap();

        writer.write_bytes(0, 20, &[5u8; 20]).unwrap();
        let mut out = [0u8; 20];
        assert_eq!(reader.read_bytes(0, 20, &mut out).unwrap(), 20);
        assert_eq!(out, [5u8; 20]);
    }

    #[test]
    fn short_reads_report_what_was_there() {
        let pipe = PipeBranch::create();
        let (r, w) = ends(&pipe);
        w.as_writable().unwrap().write_bytes(0, 3, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 10];
        assert_eq!(r.as_readable().unwrap().read_bytes(0, 10, &mut out).unwrap(), 3);
    }

    #[test]
    fn fixed_shape() {
        let pipe = PipeBranch::create();
        assert_eq!(pipe.num_children().unwrap(), 2);
        assert_eq!(pipe.enum_children("", 0).unwrap(), vec!["read", "write"]);
        assert_eq!(pipe.enum_children("read", 0).unwrap(), vec!["write"]);
        assert_eq!(
            pipe.add_child("x", PipeBranch::create()).unwrap_err(),
            KernelError::InvalidOp
        );
        assert_eq!(pipe.delete_child("read").unwrap_err(), KernelError::InvalidOp);
        assert_eq!(pipe.get_child("nope").unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn write_signals_the_wait_object() {
        let pipe = PipeBranch::create();
        let (_r, w) = ends(&pipe);
        assert!(!pipe.data_ready.is_signalled());
        w.as_writable().unwrap().write_bytes(0, 1, &[9]).unwrap();
        // No waiter was queued, so the signal latched.
        assert!(pipe.data_ready.is_signalled());
    }
}
