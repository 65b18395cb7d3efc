//! Per-process virtual range bookkeeping.
//!
//! A `RangeMap` records which page-aligned ranges of a virtual window are
//! allocated. Ranges within one map are disjoint. This is pure
//! bookkeeping; installing translations is [`super::paging`]'s job.

use crate::error::{KernelError, Result};
use crate::mem::PAGE_SIZE;
use alloc::collections::BTreeMap;

pub struct RangeMap {
    window_base: u64,
    window_top: u64,
    /// base -> length in pages
    ranges: BTreeMap<u64, u64>,
}

impl RangeMap {
    pub const fn new(window_base: u64, window_top: u64) -> Self {
        Self {
            window_base,
            window_top,
            ranges: BTreeMap::new(),
        }
    }

    /// First-fit search for `pages` unused pages. Fails with
    /// `OutOfResource` when the window is fragmented beyond the request.
    pub fn allocate(&mut self, pages: u64) -> Result<u64> {
        if pages == 0 {
            return Err(KernelError::InvalidParam);
        }
        let wanted = pages * PAGE_SIZE;
        let mut candidate = self.window_base;
        for (&base, &len) in self.ranges.iter() {
            if base.saturating_sub(candidate) >= wanted {
                break;
            }
            candidate = candidate.max(base + len * PAGE_SIZE);
        }
        if candidate + wanted > self.window_top {
            return Err(KernelError::OutOfResource);
        }
        self.ranges.insert(candidate, pages);
        Ok(candidate)
    }

    /// Reserve an exact range. The base must be page aligned and the range
    /// must not overlap any existing allocation.
    pub fn allocate_specific(&mut self, base: u64, pages: u64) -> Result<()> {
        if pages == 0 || base % PAGE_SIZE != 0 || base == 0 {
            return Err(KernelError::InvalidParam);
        }
        let end = base + pages * PAGE_SIZE;
        if end > self.window_top {
            return Err(KernelError::InvalidParam);
        }
        // Overlap check against the neighbour below and everything from
        // `base` up to `end`.
        if let Some((&prev_base, &prev_len)) = self.ranges.range(..=base).next_back() {
            if prev_base + prev_len * PAGE_SIZE > base {
                return Err(KernelError::AlreadyExists);
            }
        }
        if self.ranges.range(base..end).next().is_some() {
            return Err(KernelError::AlreadyExists);
        }
        self.ranges.insert(base, pages);
        Ok(())
    }

    /// Release the allocation starting exactly at `base`, returning its
    /// length in pages.
    pub fn deallocate(&mut self, base: u64) -> Result<u64> {
        self.ranges.remove(&base).ok_or(KernelError::NotFound)
    }

    /// Length of the allocation starting exactly at `base`.
    pub fn size_of(&self, base: u64) -> Option<u64> {
        self.ranges.get(&base).copied()
    }

    /// Lowest-addressed allocation, for teardown loops.
    pub fn first_allocation(&self) -> Option<(u64, u64)> {
        self.ranges.iter().next().map(|(&b, &p)| (b, p))
    }

    pub fn allocation_count(&self) -> usize {
        self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u64 = 0x4000_0000;

    fn map() -> RangeMap {
        RangeMap::new(BASE, BASE + 64 * PAGE_SIZE)
    }

    #[test]
    fn allocations_are_disjoint_and_aligned() {
        let mut m = map();
        let a = m.allocate(2).unwrap();
        let b = m.allocate(3).unwrap();
        assert_eq!(a % PAGE_SIZE, 0);
        assert_eq!(b % PAGE_SIZE, 0);
        assert!(b >= a + 2 * PAGE_SIZE);
    }

    #[test]
    fn first_fit_reuses_freed_holes() {
        let mut m = map();
        let a = m.allocate(2).unwrap();
        let _b = m.allocate(1).unwrap();
        assert_eq!(m.deallocate(a).unwrap(), 2);
        // The two-page hole at the start is reused for a fitting request.
        assert_eq!(m.allocate(2).unwrap(), a);
    }

    #[test]
    fn window_exhaustion() {
        let mut m = RangeMap::new(BASE, BASE + 2 * PAGE_SIZE);
        assert!(m.allocate(2).is_ok());
        assert_eq!(m.allocate(1).unwrap_err(), KernelError::OutOfResource);
    }

    #[test]
    fn specific_rejects_overlap() {
        let mut m = map();
        m.allocate_specific(BASE + 4 * PAGE_SIZE, 2).unwrap();
        assert_eq!(
            m.allocate_specific(BASE + 5 * PAGE_SIZE, 1).unwrap_err(),
            KernelError::AlreadyExists
        );
        assert_eq!(
            m.allocate_specific(BASE + 3 * PAGE_SIZE, 2).unwrap_err(),
            KernelError::AlreadyExists
        );
        m.allocate_specific(BASE + 6 * PAGE_SIZE, 1).unwrap();
    }

    #[test]
    fn deallocate_requires_exact_base() {
        let mut m = map();
        let a = m.allocate(2).unwrap();
        assert_eq!(
            m.deallocate(a + PAGE_SIZE).unwrap_err(),
            KernelError::NotFound
        );
        assert_eq!(m.deallocate(a).unwrap(), 2);
        assert_eq!(m.deallocate(a).unwrap_err(), KernelError::NotFound);
    }

    #[test]
    fn size_lookup() {
        let mut m = map();
        let a = m.allocate(5).unwrap();
        assert_eq!(m.size_of(a), Some(5));
        assert_eq!(m.size_of(a + PAGE_SIZE), None);
    }
}
