//! Per-environment address space.
//!
//! Leaf mappings are kept by virtual page number. Every 2 MiB region that
//! holds a mapping owns one page-table frame taken from the pool, so
//! mapping can fail for lack of a table exactly as on hardware. Presence of
//! the upper-level entries is derived from the page tables that exist below
//! them.

use alloc::collections::BTreeMap;

use x86_64::structures::paging::PhysFrame;
use x86_64::VirtAddr;

use super::frames::FramePool;
use super::perm::Perm;
use crate::memlayout::{PAGE_SIZE, PT_SPAN, USER_TOP};
use crate::syscalls::dispatcher::SyscallError;

/// Paging structure levels whose entries point at another table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLevel {
    Four,
    Three,
    Two,
}

impl TableLevel {
    /// Bytes of address space covered by one entry at this level.
    pub const fn span(self) -> u64 {
        match self {
            Self::Four => 1 << 39,
            Self::Three => 1 << 30,
            Self::Two => PT_SPAN,
        }
    }

    pub const WALK: [TableLevel; 3] = [Self::Four, Self::Three, Self::Two];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub frame: PhysFrame,
    pub perm: Perm,
}

#[derive(Default)]
pub struct AddressSpace {
    ptes: BTreeMap<u64, Pte>,
    tables: BTreeMap<u64, PhysFrame>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, va: VirtAddr) -> Option<Pte> {
        self.ptes.get(&vpn(va)).copied()
    }

    /// Whether the level-`level` entry covering `va` points at a table.
    pub fn table_present(&self, level: TableLevel, va: VirtAddr) -> bool {
        let start = va.as_u64() & !(level.span() - 1);
        let first = start / PT_SPAN;
        let last = (start + level.span()) / PT_SPAN;
        self.tables.range(first..last).next().is_some()
    }

    /// Map `frame` at `va`, replacing whatever was there. The new frame gains
    /// its reference before the old one loses it, so remapping a page onto
    /// itself keeps it alive.
    pub fn insert(
        &mut self,
        frames: &mut FramePool,
        va: VirtAddr,
        frame: PhysFrame,
        perm: Perm,
    ) -> Result<(), SyscallError> {
        self.ensure_table(frames, va)?;
        frames.incref(frame);
        if let Some(old) = self.ptes.insert(vpn(va), Pte { frame, perm }) {
            frames.decref(old.frame);
        }
        Ok(())
    }

    /// Remove the mapping at `va`. Unmapping an empty slot is not an error.
    pub fn remove(&mut self, frames: &mut FramePool, va: VirtAddr) {
        if let Some(old) = self.ptes.remove(&vpn(va)) {
            frames.decref(old.frame);
        }
    }

    /// Check that `[va, va + len)` is mapped with at least `perm` and lies
    /// below `USER_TOP`. On failure returns the first offending address.
    pub fn user_mem_check(&self, va: VirtAddr, len: u64, perm: Perm) -> Result<(), VirtAddr> {
        let start = va.as_u64();
        let Some(end) = start.checked_add(len) else {
            return Err(va);
        };
        let mut page = start & !(PAGE_SIZE - 1);
        while page < end {
            let bad = VirtAddr::new_truncate(page.max(start));
            if page >= USER_TOP {
                return Err(bad);
            }
            match self.lookup(VirtAddr::new(page)) {
                Some(pte) if pte.perm.allows(perm) => {}
                _ => return Err(bad),
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy out of the space, ignoring permissions. Fails on a hole.
    pub fn read(&self, frames: &FramePool, va: VirtAddr, buf: &mut [u8]) -> Result<(), VirtAddr> {
        let mut done = 0;
        while done < buf.len() {
            let at = va + done as u64;
            let offset = (at.as_u64() % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - offset).min(buf.len() - done);
            let pte = self.lookup(at).ok_or(at)?;
            let bytes = frames.bytes(pte.frame).ok_or(at)?;
            buf[done..done + chunk].copy_from_slice(&bytes[offset..offset + chunk]);
            done += chunk;
        }
        Ok(())
    }

    /// Copy into the space, ignoring permissions. Fails on a hole.
    pub fn write(&self, frames: &mut FramePool, va: VirtAddr, data: &[u8]) -> Result<(), VirtAddr> {
        let mut done = 0;
        while done < data.len() {
            let at = va + done as u64;
            let offset = (at.as_u64() % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - offset).min(data.len() - done);
            let pte = self.lookup(at).ok_or(at)?;
            let bytes = frames.bytes_mut(pte.frame).ok_or(at)?;
            bytes[offset..offset + chunk].copy_from_slice(&data[done..done + chunk]);
            done += chunk;
        }
        Ok(())
    }

    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, Pte)> + '_ {
        self.ptes
            .iter()
            .map(|(vpn, pte)| (VirtAddr::new(vpn * PAGE_SIZE), *pte))
    }

    pub fn mapped_pages(&self) -> usize {
        self.ptes.len()
    }

    /// Drop every mapping and page table, returning frames to `frames`.
    pub fn clear(&mut self, frames: &mut FramePool) {
        for (_, pte) in core::mem::take(&mut self.ptes) {
            frames.decref(pte.frame);
        }
        for (_, table) in core::mem::take(&mut self.tables) {
            frames.decref(table);
        }
    }

    fn ensure_table(&mut self, frames: &mut FramePool, va: VirtAddr) -> Result<(), SyscallError> {
        let region = va.as_u64() / PT_SPAN;
        if self.tables.contains_key(&region) {
            return Ok(());
        }
        let table = frames.alloc_zeroed()?;
        frames.incref(table);
        self.tables.insert(region, table);
        Ok(())
    }
}

fn vpn(va: VirtAddr) -> u64 {
    va.as_u64() / PAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(addr: u64) -> VirtAddr {
        VirtAddr::new(addr)
    }

    #[test]
    fn insert_replaces_and_releases_old_frame() {
        let mut pool = FramePool::with_capacity(8);
        let mut space = AddressSpace::new();
        let a = pool.alloc_zeroed().unwrap();
        let b = pool.alloc_zeroed().unwrap();

        space.insert(&mut pool, va(0x1000), a, Perm::USER_RW).unwrap();
        space.insert(&mut pool, va(0x1000), b, Perm::USER_RO).unwrap();

        assert_eq!(pool.refcount(a), 0);
        assert_eq!(space.lookup(va(0x1000)).unwrap().frame, b);
    }

    #[test]
    fn remapping_a_page_onto_itself_keeps_it() {
        let mut pool = FramePool::with_capacity(4);
        let mut space = AddressSpace::new();
        let a = pool.alloc_zeroed().unwrap();
        space.insert(&mut pool, va(0x2000), a, Perm::USER_RW).unwrap();
        space.insert(&mut pool, va(0x2000), a, Perm::USER_COW).unwrap();
        assert_eq!(pool.refcount(a), 1);
        assert!(space.lookup(va(0x2000)).unwrap().perm.is_cow());
    }

    #[test]
    fn table_presence_follows_levels() {
        let mut pool = FramePool::with_capacity(4);
        let mut space = AddressSpace::new();
        let frame = pool.alloc_zeroed().unwrap();
        space.insert(&mut pool, va(0x40_0000), frame, Perm::USER_RW).unwrap();

        assert!(space.table_present(TableLevel::Four, va(0)));
        assert!(space.table_present(TableLevel::Three, va(0x1234)));
        assert!(space.table_present(TableLevel::Two, va(0x5f_f000)));
        assert!(!space.table_present(TableLevel::Two, va(0x60_0000)));
        assert!(!space.table_present(TableLevel::Three, va(1 << 30)));
        assert!(!space.table_present(TableLevel::Four, va(1 << 39)));
    }

    #[test]
    fn table_allocation_failure_is_no_memory() {
        let mut pool = FramePool::with_capacity(1);
        let mut space = AddressSpace::new();
        let frame = pool.alloc_zeroed().unwrap();
        assert_eq!(
            space.insert(&mut pool, va(0x1000), frame, Perm::USER_RW),
            Err(SyscallError::NoMemory)
        );
        assert!(space.lookup(va(0x1000)).is_none());
    }

    #[test]
    fn user_mem_check_reports_first_bad_address() {
        let mut pool = FramePool::with_capacity(4);
        let mut space = AddressSpace::new();
        let frame = pool.alloc_zeroed().unwrap();
        space.insert(&mut pool, va(0x3000), frame, Perm::USER_RO).unwrap();

        assert_eq!(space.user_mem_check(va(0x3010), 16, Perm::USER_RO), Ok(()));
        assert_eq!(
            space.user_mem_check(va(0x3010), 16, Perm::USER_RW),
            Err(va(0x3010))
        );
        assert_eq!(
            space.user_mem_check(va(0x3ff0), 32, Perm::USER_RO),
            Err(va(0x4000))
        );
    }

    #[test]
    fn reads_and_writes_cross_pages() {
        let mut pool = FramePool::with_capacity(4);
        let mut space = AddressSpace::new();
        for page in [0x5000, 0x6000] {
            let frame = pool.alloc_zeroed().unwrap();
            space.insert(&mut pool, va(page), frame, Perm::USER_RW).unwrap();
        }
        space.write(&mut pool, va(0x5ffe), &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        space.read(&pool, va(0x5ffe), &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(space.read(&pool, va(0x6ffe), &mut out), Err(va(0x7000)));
    }

    #[test]
    fn clear_returns_every_frame() {
        let mut pool = FramePool::with_capacity(8);
        let mut space = AddressSpace::new();
        for page in [0x1000, 0x40_0000] {
            let frame = pool.alloc_zeroed().unwrap();
            space.insert(&mut pool, va(page), frame, Perm::USER_RW).unwrap();
        }
        space.clear(&mut pool);
        assert_eq!(pool.free_count(), 8);
        assert_eq!(space.mapped_pages(), 0);
    }
}
