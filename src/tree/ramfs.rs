//! RAM-backed files.
//!
//! A `RamFile` is a growable in-memory byte vector exposing the full leaf
//! capability set except waiting. Mount a factory branch
//! (`SimpleBranch::with_factory(new_ram_file)`) and `create_object` gets
//! somewhere to manufacture real files.

use super::iface::{BasicFile, Readable, TreeNode, Writable};
use crate::error::{KernelError, Result};
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

pub struct RamFile {
    data: Mutex<Vec<u8>>,
}

impl core::fmt::Debug for RamFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("RamFile")
    }
}

impl RamFile {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Vec::new()),
        }
    }
}

impl Default for RamFile {
    fn default() -> Self {
        Self::new()
    }
}

/// Factory for file-kind branches.
pub fn new_ram_file() -> Result<Arc<dyn TreeNode>> {
    Ok(Arc::new(RamFile::new()))
}

impl TreeNode for RamFile {
    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }

    fn as_writable(&self) -> Option<&dyn Writable> {
        Some(self)
    }

    fn as_file(&self) -> Option<&dyn BasicFile> {
        Some(self)
    }
}

impl Readable for RamFile {
    fn read_bytes(&self, start: u64, length: u64, buffer: &mut [u8]) -> Result<u64> {
        let data = self.data.lock();
        let wanted = length.min(buffer.len() as u64);
        if wanted == 0 {
            return Ok(0);
        }
        if start >= data.len() as u64 {
            return Ok(0);
        }
        let start = start as usize;
        let take = (wanted as usize).min(data.len() - start);
        buffer[..take].copy_from_slice(&data[start..start + take]);
        Ok(take as u64)
    }
}

impl Writable for RamFile {
    fn write_bytes(&self, start: u64, length: u64, buffer: &[u8]) -> Result<u64> {
        let mut data = self.data.lock();
        let wanted = length.min(buffer.len() as u64) as usize;
        let start = usize::try_from(start).map_err(|_| KernelError::OutOfRange)?;
        let end = start.checked_add(wanted).ok_or(KernelError::OutOfRange)?;
        if end > data.len() {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(&buffer[..wanted]);
        Ok(wanted as u64)
    }
}

impl BasicFile for RamFile {
    fn get_size(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn set_size(&self, size: u64) -> Result<()> {
        let size = usize::try_from(size).map_err(|_| KernelError::OutOfRange)?;
        self.data.lock().resize(size, 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_round_trip() {
        let f = RamFile::new();
        let payload = [1u8, 2, 3, 4, 5];
        assert_eq!(f.write_bytes(0, 5, &payload).unwrap(), 5);
        let mut out = [0u8; 5];
        assert_eq!(f.read_bytes(0, 5, &mut out).unwrap(), 5);
        assert_eq!(out, payload);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let f = RamFile::new();
        f.write_bytes(4, 2, &[9, 9]).unwrap();
        assert_eq!(f.get_size().unwrap(), 6);
        let mut out = [0xAAu8; 6];
        assert_eq!(f.read_bytes(0, 6, &mut out).unwrap(), 6);
        assert_eq!(out, [0, 0, 0, 0, 9, 9]);
    }

    #[test]
    fn read_past_end_is_empty() {
        let f = RamFile::new();
        f.write_bytes(0, 3, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(f.read_bytes(3, 4, &mut out).unwrap(), 0);
        assert_eq!(f.read_bytes(2, 4, &mut out).unwrap(), 1);
        assert_eq!(out[0], 3);
    }

    #[test]
    fn zero_length_read_succeeds() {
        let f = RamFile::new();
        let mut out = [];
        assert_eq!(f.read_bytes(0, 0, &mut out).unwrap(), 0);
    }

    #[test]
    fn set_then_get_size() {
        let f = RamFile::new();
        f.set_size(100).unwrap();
        assert_eq!(f.get_size().unwrap(), 100);
        f.set_size(10).unwrap();
        assert_eq!(f.get_size().unwrap(), 10);
    }
}
