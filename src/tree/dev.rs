// Device-style leaves that need no real hardware.

use super::iface::{Readable, TreeNode, Writable};
use crate::error::Result;

/// The null device: reads produce nothing, writes succeed and vanish.
#[derive(Debug)]
pub struct NullDevice;

impl NullDevice {
    pub const fn new() -> Self {
        Self
    }
}

impl TreeNode for NullDevice {
    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }
}

impl Readable for NullDevice {
    fn read_bytes(&self, _start: u64, _length: u64, _buffer: &mut [u8]) -> Result<u64> {
        Ok(0)
    }
}

impl Writable for NullDevice {
    fn write_bytes(&self, _start: u64, length: u64, buffer: &[u8]) -> Result<u64> {
        Ok(length.min(buffer.len() as u64))
    }
}
