//! x86-64 page-table walker.
//!
//! Pages are mapped as 2 MiB PD-level entries, so a translation touches
//! three levels: PML4 → PDPT → PD. Table storage is abstracted behind
//! [`TableArena`] — the kernel hands out 4 KiB tables carved from the
//! physical pool and reaches them through the direct map, while the unit
//! tests use a boxed arena — so the walking and encoding logic is shared
//! and testable.
//!
//! ## Entry layout (2 MiB PD entry)
//!
//! ```text
//! 63  62-52  51-21         20-13  12   8    7    4    3    2    1    0
//! +---+------+-------------+-----+----+----+----+----+----+----+----+----+
//! |NX | Ign  | Phys Addr   | Ign |PAT | G  | PS |PCD |PWT |U/S |R/W | P  |
//! +---+------+-------------+-----+----+----+----+----+----+----+----+----+
//! ```
//!
//! The cache mode is a PAT index spread over PWT/PCD/PAT, see
//! [`super::pat`].

use crate::error::{KernelError, Result};
use crate::mem::pat::{self, CacheMode};
use crate::mem::{phys_to_kernel_virt, PAGE_SIZE};
use alloc::vec::Vec;
use core::ptr::{read_volatile, write_volatile};
use spin::Mutex;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        const PRESENT   = 1 << 0;
        const WRITABLE  = 1 << 1;
        const USER      = 1 << 2;
        const PWT       = 1 << 3;
        const PCD       = 1 << 4;
        const ACCESSED  = 1 << 5;
        const DIRTY     = 1 << 6;
        const PAGE_SIZE = 1 << 7;
        const GLOBAL    = 1 << 8;
        const PAT_LARGE = 1 << 12;
        const NO_EXEC   = 1 << 63;
    }
}

/// Physical-address field of a table entry.
const TABLE_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
/// Physical-address field of a 2 MiB entry (bit 12 is PAT).
const LARGE_ADDR_MASK: u64 = 0x000F_FFFF_FFE0_0000;

/// One 4 KiB page table at any level.
#[repr(C, align(4096))]
pub struct RawTable(pub [u64; 512]);

impl RawTable {
    pub const fn empty() -> Self {
        Self([0; 512])
    }
}

/// Source and sink of 4 KiB tables, plus the means to reach them.
pub trait TableArena {
    /// A zeroed table; returns its physical address.
    fn alloc_table(&mut self) -> Result<u64>;
    fn free_table(&mut self, phys: u64);
    fn table_ptr(&self, phys: u64) -> *mut RawTable;
}

#[inline]
fn pml4_index(virt: u64) -> usize {
    ((virt >> 39) & 0x1FF) as usize
}

#[inline]
fn pdpt_index(virt: u64) -> usize {
    ((virt >> 30) & 0x1FF) as usize
}

#[inline]
fn pd_index(virt: u64) -> usize {
    ((virt >> 21) & 0x1FF) as usize
}

unsafe fn entry(table: *const RawTable, idx: usize) -> u64 {
    read_volatile((*table).0.as_ptr().add(idx))
}

unsafe fn set_entry(table: *mut RawTable, idx: usize, value: u64) {
    write_volatile((*table).0.as_mut_ptr().add(idx), value)
}

/// Follow (or create) the intermediate entry at `idx`, returning the
/// physical address of the next-level table.
fn get_or_create_next(
    arena: &mut dyn TableArena,
    table_phys: u64,
    idx: usize,
    user: bool,
) -> Result<u64> {
    let table = arena.table_ptr(table_phys);
    let e = unsafe { entry(table, idx) };
    if e & EntryFlags::PRESENT.bits() != 0 {
        return Ok(e & TABLE_ADDR_MASK);
    }
    let next = arena.alloc_table()?;
    let mut flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
    if user {
        flags |= EntryFlags::USER;
    }
    unsafe { set_entry(arena.table_ptr(table_phys), idx, next | flags.bits()) };
    Ok(next)
}

fn next_table(arena: &dyn TableArena, table_phys: u64, idx: usize) -> Option<u64> {
    let e = unsafe { entry(arena.table_ptr(table_phys), idx) };
    if e & EntryFlags::PRESENT.bits() != 0 {
        Some(e & TABLE_ADDR_MASK)
    } else {
        None
    }
}

/// Install one 2 MiB mapping. Fails with `AlreadyExists` if the target PD
/// entry is present.
pub fn map_page(
    arena: &mut dyn TableArena,
    pml4_phys: u64,
    virt: u64,
    phys: u64,
    user: bool,
    cache: CacheMode,
) -> Result<()> {
    let pat_idx = pat::pat_index(cache, false)?;

    let pdpt = get_or_create_next(arena, pml4_phys, pml4_index(virt), user)?;
    let pd = get_or_create_next(arena, pdpt, pdpt_index(virt), user)?;

    let pd_ptr = arena.table_ptr(pd);
    let idx = pd_index(virt);
    if unsafe { entry(pd_ptr, idx) } & EntryFlags::PRESENT.bits() != 0 {
        return Err(KernelError::AlreadyExists);
    }

    let mut flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::PAGE_SIZE;
    if user {
        flags |= EntryFlags::USER;
    } else {
        flags |= EntryFlags::GLOBAL;
    }
    if pat_idx & 1 != 0 {
        flags |= EntryFlags::PWT;
    }
    if pat_idx & 2 != 0 {
        flags |= EntryFlags::PCD;
    }
    if pat_idx & 4 != 0 {
        flags |= EntryFlags::PAT_LARGE;
    }

    unsafe { set_entry(pd_ptr, idx, (phys & LARGE_ADDR_MASK) | flags.bits()) };
    Ok(())
}

/// Remove one 2 MiB mapping, returning the physical page it pointed at.
/// Intermediate tables are left in place.
pub fn unmap_page(arena: &mut dyn TableArena, pml4_phys: u64, virt: u64) -> Result<u64> {
    let pdpt = next_table(arena, pml4_phys, pml4_index(virt)).ok_or(KernelError::NotFound)?;
    let pd = next_table(arena, pdpt, pdpt_index(virt)).ok_or(KernelError::NotFound)?;

    let pd_ptr = arena.table_ptr(pd);
    let idx = pd_index(virt);
    let e = unsafe { entry(pd_ptr, idx) };
    if e & EntryFlags::PRESENT.bits() == 0 {
        return Err(KernelError::NotFound);
    }
    unsafe { set_entry(pd_ptr, idx, 0) };
    Ok(e & LARGE_ADDR_MASK)
}

/// Walk the tables for `virt`. None if any level is absent.
pub fn walk(arena: &dyn TableArena, pml4_phys: u64, virt: u64) -> Option<u64> {
    let pdpt = next_table(arena, pml4_phys, pml4_index(virt))?;
    let pd = next_table(arena, pdpt, pdpt_index(virt))?;
    let e = unsafe { entry(arena.table_ptr(pd), pd_index(virt)) };
    if e & EntryFlags::PRESENT.bits() == 0 || e & EntryFlags::PAGE_SIZE.bits() == 0 {
        return None;
    }
    Some((e & LARGE_ADDR_MASK) | (virt & (PAGE_SIZE - 1)))
}

/// Map a run of pages, rolling back on failure so the range is never left
/// partially mapped.
pub fn map_pages(
    arena: &mut dyn TableArena,
    pml4_phys: u64,
    virt_base: u64,
    phys_base: u64,
    pages: u64,
    user: bool,
    cache: CacheMode,
) -> Result<()> {
    for i in 0..pages {
        if walk(arena, pml4_phys, virt_base + i * PAGE_SIZE).is_some() {
            return Err(KernelError::AlreadyExists);
        }
    }
    for i in 0..pages {
        let virt = virt_base + i * PAGE_SIZE;
        let phys = phys_base + i * PAGE_SIZE;
        if let Err(e) = map_page(arena, pml4_phys, virt, phys, user, cache) {
            for j in 0..i {
                let _ = unmap_page(arena, pml4_phys, virt_base + j * PAGE_SIZE);
            }
            return Err(e);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// The kernel's own arena: 4 KiB tables carved out of 2 MiB physical pages,
// reached through the direct map.
// ---------------------------------------------------------------------------

pub struct KernelArena {
    current_page: u64,
    used_in_page: u64,
    free_tables: Vec<u64>,
}

impl KernelArena {
    const fn new() -> Self {
        Self {
            current_page: 0,
            used_in_page: 0,
            free_tables: Vec::new(),
        }
    }
}

impl TableArena for KernelArena {
    fn alloc_table(&mut self) -> Result<u64> {
        if let Some(phys) = self.free_tables.pop() {
            unsafe { (*self.table_ptr(phys)).0 = [0; 512] };
            return Ok(phys);
        }
        if self.current_page == 0 || self.used_in_page >= PAGE_SIZE {
            self.current_page = super::phys::allocate(1)?;
            self.used_in_page = 0;
        }
        let phys = self.current_page + self.used_in_page;
        self.used_in_page += super::TABLE_SIZE as u64;
        unsafe { (*self.table_ptr(phys)).0 = [0; 512] };
        Ok(phys)
    }

    fn free_table(&mut self, phys: u64) {
        self.free_tables.push(phys);
    }

    fn table_ptr(&self, phys: u64) -> *mut RawTable {
        phys_to_kernel_virt(phys) as *mut RawTable
    }
}

static KERNEL_TABLES: Mutex<KernelArena> = Mutex::new(KernelArena::new());

pub fn init_kernel_arena() {
    // Nothing to do beyond the lazily filled statics; kept as an explicit
    // init point so boot ordering stays visible.
}

/// [`map_pages`] against the kernel arena, with TLB maintenance.
pub fn map_pages_kernel_arena(
    pml4_phys: u64,
    virt_base: u64,
    phys_base: u64,
    pages: u64,
    user: bool,
    cache: CacheMode,
) -> Result<()> {
    let mut arena = KERNEL_TABLES.lock();
    map_pages(&mut *arena, pml4_phys, virt_base, phys_base, pages, user, cache)?;
    flush_range(virt_base, pages);
    Ok(())
}

/// [`unmap_page`] against the kernel arena, with TLB maintenance.
pub fn unmap_page_kernel_arena(pml4_phys: u64, virt: u64) -> Result<u64> {
    let mut arena = KERNEL_TABLES.lock();
    let phys = unmap_page(&mut *arena, pml4_phys, virt)?;
    flush_range(virt, 1);
    Ok(phys)
}

/// [`walk`] against the kernel arena.
pub fn walk_kernel_arena(pml4_phys: u64, virt: u64) -> Option<u64> {
    let arena = KERNEL_TABLES.lock();
    walk(&*arena, pml4_phys, virt)
}

fn flush_range(virt_base: u64, pages: u64) {
    use x86_64::instructions::tlb;
    use x86_64::VirtAddr;
    for i in 0..pages {
        tlb::flush(VirtAddr::new_truncate(virt_base + i * PAGE_SIZE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::collections::BTreeMap;

    /// Boxed tables with small fake physical handles.
    struct TestArena {
        tables: BTreeMap<u64, Box<core::cell::UnsafeCell<RawTable>>>,
        next: u64,
    }

    impl TestArena {
        fn new() -> Self {
            Self {
                tables: BTreeMap::new(),
                next: 0x1000,
            }
        }
    }

    impl TableArena for TestArena {
        fn alloc_table(&mut self) -> Result<u64> {
            let phys = self.next;
            self.next += 0x1000;
            self.tables
                .insert(phys, Box::new(core::cell::UnsafeCell::new(RawTable::empty())));
            Ok(phys)
        }

        fn free_table(&mut self, phys: u64) {
            self.tables.remove(&phys);
        }

        fn table_ptr(&self, phys: u64) -> *mut RawTable {
            self.tables.get(&phys).expect("unknown table").get()
        }
    }

    fn root(arena: &mut TestArena) -> u64 {
        arena.alloc_table().unwrap()
    }

    #[test]
    fn map_then_walk() {
        let mut arena = TestArena::new();
        let pml4 = root(&mut arena);
        let virt = 0x4000_0000u64;
        let phys = 0x20_0000u64 * 7;
        map_page(&mut arena, pml4, virt, phys, true, CacheMode::WriteBack).unwrap();
        assert_eq!(walk(&arena, pml4, virt), Some(phys));
        assert_eq!(walk(&arena, pml4, virt + 0x1234), Some(phys + 0x1234));
        assert_eq!(walk(&arena, pml4, virt + PAGE_SIZE), None);
    }

    #[test]
    fn double_map_is_rejected() {
        let mut arena = TestArena::new();
        let pml4 = root(&mut arena);
        let virt = 0x4000_0000u64;
        map_page(&mut arena, pml4, virt, PAGE_SIZE, true, CacheMode::WriteBack).unwrap();
        assert_eq!(
            map_page(&mut arena, pml4, virt, 2 * PAGE_SIZE, true, CacheMode::WriteBack)
                .unwrap_err(),
            KernelError::AlreadyExists
        );
    }

    #[test]
    fn unmap_returns_backing_and_clears() {
        let mut arena = TestArena::new();
        let pml4 = root(&mut arena);
        let virt = 0x4000_0000u64;
        let phys = 3 * PAGE_SIZE;
        map_page(&mut arena, pml4, virt, phys, false, CacheMode::WriteBack).unwrap();
        assert_eq!(unmap_page(&mut arena, pml4, virt).unwrap(), phys);
        assert_eq!(walk(&arena, pml4, virt), None);
        assert_eq!(
            unmap_page(&mut arena, pml4, virt).unwrap_err(),
            KernelError::NotFound
        );
    }

    #[test]
    fn map_pages_rejects_any_present_page_without_side_effects() {
        let mut arena = TestArena::new();
        let pml4 = root(&mut arena);
        let base = 0x4000_0000u64;
        // Pre-map the middle page of a would-be three-page run.
        map_page(&mut arena, pml4, base + PAGE_SIZE, PAGE_SIZE, true, CacheMode::WriteBack)
            .unwrap();
        assert_eq!(
            map_pages(&mut arena, pml4, base, 8 * PAGE_SIZE, 3, true, CacheMode::WriteBack)
                .unwrap_err(),
            KernelError::AlreadyExists
        );
        // Nothing else was installed.
        assert_eq!(walk(&arena, pml4, base), None);
        assert_eq!(walk(&arena, pml4, base + 2 * PAGE_SIZE), None);
    }

    #[test]
    fn cache_mode_bits_land_in_the_entry() {
        let mut arena = TestArena::new();
        let pml4 = root(&mut arena);
        let virt = 0x4000_0000u64;
        map_page(&mut arena, pml4, virt, PAGE_SIZE, true, CacheMode::WriteCombining).unwrap();

        let pdpt = next_table(&arena, pml4, pml4_index(virt)).unwrap();
        let pd = next_table(&arena, pdpt, pdpt_index(virt)).unwrap();
        let e = unsafe { entry(arena.table_ptr(pd), pd_index(virt)) };
        // Write-combining is PAT index 2: PCD set, PWT and PAT clear.
        assert_ne!(e & EntryFlags::PCD.bits(), 0);
        assert_eq!(e & EntryFlags::PWT.bits(), 0);
        assert_eq!(e & EntryFlags::PAT_LARGE.bits(), 0);
        assert_ne!(e & EntryFlags::PAGE_SIZE.bits(), 0);
    }

    #[test]
    fn kernel_mappings_are_global_user_mappings_are_not() {
        let mut arena = TestArena::new();
        let pml4 = root(&mut arena);
        let kvirt = 0xFFFF_9000_0000_0000u64;
        let uvirt = 0x4000_0000u64;
        map_page(&mut arena, pml4, kvirt, PAGE_SIZE, false, CacheMode::WriteBack).unwrap();
        map_page(&mut arena, pml4, uvirt, PAGE_SIZE, true, CacheMode::WriteBack).unwrap();

        let kpd = next_table(
            &arena,
            next_table(&arena, pml4, pml4_index(kvirt)).unwrap(),
            pdpt_index(kvirt),
        )
        .unwrap();
        let ke = unsafe { entry(arena.table_ptr(kpd), pd_index(kvirt)) };
        assert_ne!(ke & EntryFlags::GLOBAL.bits(), 0);
        assert_eq!(ke & EntryFlags::USER.bits(), 0);

        let upd = next_table(
            &arena,
            next_table(&arena, pml4, pml4_index(uvirt)).unwrap(),
            pdpt_index(uvirt),
        )
        .unwrap();
        let ue = unsafe { entry(arena.table_ptr(upd), pd_index(uvirt)) };
        assert_ne!(ue & EntryFlags::USER.bits(), 0);
        assert_eq!(ue & EntryFlags::GLOBAL.bits(), 0);
    }
}
