use std::sync::{Arc, Mutex, MutexGuard};

use super::block::{BlockList, Dynablock};

pub const PAGE_SHIFT: u32 = 16;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const MAP_SLOTS: usize = 1 << 16;

/// Sparse index from `guest_addr >> 16` to the dynablock list of that
/// 64 KiB page. Slots are created lazily by [`DynaMap::add_range`] and
/// dropped by [`DynaMap::clean_range`]; all slot mutations serialize on the
/// single blocks mutex.
pub struct DynaMap {
    slots: Mutex<Vec<Option<Box<BlockList>>>>,
}

impl DynaMap {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAP_SLOTS);
        slots.resize_with(MAP_SLOTS, || None);
        Self {
            slots: Mutex::new(slots),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<Box<BlockList>>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The block covering `addr`, if its page is tracked and translated.
    #[must_use]
    pub fn lookup(&self, addr: u32) -> Option<Arc<Dynablock>> {
        let slots = self.lock();
        slots[(addr >> PAGE_SHIFT) as usize]
            .as_ref()
            .and_then(|list| list.lookup(addr))
    }

    /// Whether the page containing `addr` is tracked.
    #[must_use]
    pub fn tracks(&self, addr: u32) -> bool {
        self.lock()[(addr >> PAGE_SHIFT) as usize].is_some()
    }

    /// Install a block into its page list. The page must have been tracked
    /// by `add_range` first; untracked code belongs to the context's global
    /// list instead.
    pub fn insert(&self, block: Arc<Dynablock>) -> bool {
        let mut slots = self.lock();
        let idx = (block.start() >> PAGE_SHIFT) as usize;
        match slots[idx].as_mut() {
            Some(list) => {
                list.insert(block);
                true
            }
            None => false,
        }
    }

    /// Lazily create a list for every page intersecting
    /// `[addr, addr + size)`. Idempotent.
    pub fn add_range(&self, addr: u32, size: u32) {
        if size == 0 {
            return;
        }
        log::debug!("add_range {addr:#x} -> {:#x}", u64::from(addr) + u64::from(size));
        let first = (addr >> PAGE_SHIFT) as usize;
        let last = (((u64::from(addr) + u64::from(size) - 1) >> PAGE_SHIFT) as usize).min(MAP_SLOTS - 1);
        let mut slots = self.lock();
        for (i, slot) in slots[first..=last].iter_mut().enumerate() {
            if slot.is_none() {
                let base = ((first + i) as u32) << PAGE_SHIFT;
                *slot = Some(Box::new(BlockList::new(base, PAGE_SIZE as u32)));
            }
        }
    }

    /// Invalidate every block intersecting `[addr, addr + size)`. A page
    /// whose whole tracked window is covered is dropped outright; otherwise
    /// only the intersecting blocks go. Untracked pages short-circuit.
    pub fn clean_range(&self, addr: u32, size: u32) {
        if size == 0 {
            return;
        }
        let lo = u64::from(addr);
        // A size of !0 means the rest of the address space, last byte
        // included, so the top page is fully covered too.
        let hi = if size == u32::MAX {
            1 << 32
        } else {
            lo + u64::from(size)
        };
        log::debug!("clean_range {lo:#x} -> {hi:#x}");
        let first = (addr >> PAGE_SHIFT) as usize;
        let last = (((hi - 1) >> PAGE_SHIFT) as usize).min(MAP_SLOTS - 1);
        let mut slots = self.lock();
        for slot in slots[first..=last].iter_mut() {
            if let Some(list) = slot {
                let (start, end) = list.window();
                if lo <= start && hi >= end {
                    *slot = None;
                } else {
                    list.free_range(addr, hi);
                }
            }
        }
    }

    /// Number of live page lists.
    #[must_use]
    pub fn tracked_pages(&self) -> usize {
        self.lock().iter().filter(|s| s.is_some()).count()
    }
}

impl Default for DynaMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynarec::mem::ExecPool;

    #[test]
    fn test_add_range_lazy() {
        let map = DynaMap::new();
        map.add_range(0x0804_8000, 0x4000);
        assert!(map.tracks(0x0804_8000));
        assert!(map.tracks(0x0804_bfff));
        assert!(!map.tracks(0x0803_0000));
        assert!(!map.tracks(0x0805_0000));
        assert_eq!(1, map.tracked_pages());
        // Idempotent.
        map.add_range(0x0804_8000, 0x4000);
        assert_eq!(1, map.tracked_pages());
    }

    #[test]
    fn test_range_end_is_exclusive() {
        let map = DynaMap::new();
        // Ends exactly on a page boundary: the next page stays untracked.
        map.add_range(0x0001_0000, 0x1_0000);
        assert!(map.tracks(0x0001_ffff));
        assert!(!map.tracks(0x0002_0000));
    }

    #[test]
    fn test_clean_whole_space() {
        let map = DynaMap::new();
        map.add_range(0x0001_0000, 0x100);
        map.add_range(0x9000_0000, 0x2_0000);
        map.add_range(0xffff_ff00, 0x100);
        assert_eq!(4, map.tracked_pages());
        map.clean_range(0, u32::MAX);
        assert_eq!(0, map.tracked_pages());
    }

    #[test]
    fn test_partial_clean_keeps_page() {
        let pool = ExecPool::new();
        let map = DynaMap::new();
        map.add_range(0x0001_0000, 0x1_0000);
        let code = pool.alloc(16, false).unwrap();
        let block = Arc::new(Dynablock::new(0x0001_0100, 0x0001_0110, code, 16, Vec::new()));
        assert!(map.insert(block));
        assert!(map.lookup(0x0001_0105).is_some());

        // Covers the block but not the page: list survives, block goes.
        map.clean_range(0x0001_0100, 0x10);
        assert!(map.lookup(0x0001_0105).is_none());
        assert!(map.tracks(0x0001_0100));

        // Covers the page: slot drops.
        map.clean_range(0x0001_0000, 0x1_0000);
        assert!(!map.tracks(0x0001_0100));
    }

    #[test]
    fn test_insert_requires_tracking() {
        let pool = ExecPool::new();
        let map = DynaMap::new();
        let code = pool.alloc(16, false).unwrap();
        let block = Arc::new(Dynablock::new(0x0002_0000, 0x0002_0010, code, 16, Vec::new()));
        assert!(!map.insert(block));
    }
}
