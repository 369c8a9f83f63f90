use std::collections::BTreeMap;
use std::sync::Arc;

use super::map::PAGE_SIZE;
use super::mem::HostCode;

/// Per-guest-instruction metadata gathered while building a block.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstInfo {
    /// Guest address of the instruction.
    pub addr: u32,
    /// Guest byte length.
    pub size: u8,
    /// Host byte offset of the instruction's entry point.
    pub offset: u32,
    /// Host offset of the fall-through point, the target of "branch to next
    /// instruction".
    pub epilog: u32,
    pub mark: u32,
    pub mark2: u32,
    pub mark3: u32,
    pub markf: u32,
    /// Nonzero when guest-visible state may not be cached across this
    /// instruction.
    pub barrier: u8,
    /// The instruction records a deferred-flags operation.
    pub defs_flags: bool,
    /// The instruction consumes flags.
    pub uses_flags: bool,
    /// A later consumer needs the flags this instruction records, so the
    /// record must actually be stored.
    pub need_flags: bool,
}

/// A contiguous translation of guest code into host code.
///
/// Covers `[start, end)` in guest space; never crosses a 64 KiB page.
#[derive(Debug)]
pub struct Dynablock {
    start: u32,
    end: u32,
    code: HostCode,
    /// Bytes of instructions; the per-call indirection table follows.
    code_len: usize,
    insts: Vec<InstInfo>,
}

impl Dynablock {
    pub(crate) fn new(
        start: u32,
        end: u32,
        code: HostCode,
        code_len: usize,
        insts: Vec<InstInfo>,
    ) -> Self {
        debug_assert!(start < end);
        debug_assert_eq!(start >> 16, (end - 1) >> 16);
        Self {
            start,
            end,
            code,
            code_len,
            insts,
        }
    }

    #[must_use]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> u32 {
        self.end
    }

    #[must_use]
    pub fn contains(&self, addr: u32) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// Host address of the block entry.
    #[must_use]
    pub fn entry(&self) -> usize {
        self.code.addr()
    }

    /// Host address of the translation of the instruction starting exactly
    /// at `addr`, if there is one.
    #[must_use]
    pub fn entry_for(&self, addr: u32) -> Option<usize> {
        self.insts
            .iter()
            .find(|i| i.addr == addr)
            .map(|i| self.code.addr() + i.offset as usize)
    }

    #[must_use]
    pub fn insts(&self) -> &[InstInfo] {
        &self.insts
    }

    #[must_use]
    pub fn host(&self) -> &HostCode {
        &self.code
    }

    /// Bytes of emitted instructions, excluding the indirection table.
    #[must_use]
    pub fn code_len(&self) -> usize {
        self.code_len
    }
}

/// The dynablocks of one 64 KiB guest page, keyed by start address.
///
/// The global variant (`window == None`-like, base and size both zero) holds
/// early and untracked code and is only torn down with the context.
#[derive(Debug, Default)]
pub struct BlockList {
    base: u32,
    size: u32,
    blocks: BTreeMap<u32, Arc<Dynablock>>,
}

impl BlockList {
    #[must_use]
    pub fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            size,
            blocks: BTreeMap::new(),
        }
    }

    /// Tracked guest window as `[base, end)`.
    #[must_use]
    pub fn window(&self) -> (u64, u64) {
        (u64::from(self.base), u64::from(self.base) + u64::from(self.size))
    }

    /// The block whose guest range covers `addr`, if any.
    #[must_use]
    pub fn lookup(&self, addr: u32) -> Option<Arc<Dynablock>> {
        for (start, block) in self.blocks.range(..=addr).rev() {
            if block.contains(addr) {
                return Some(block.clone());
            }
            // Blocks never span a page, so anything starting further back
            // cannot cover addr either.
            if addr.wrapping_sub(*start) as u64 >= PAGE_SIZE {
                break;
            }
        }
        None
    }

    pub fn insert(&mut self, block: Arc<Dynablock>) {
        self.blocks.insert(block.start(), block);
    }

    /// Drop every block whose guest range intersects `[lo, hi)` by even one
    /// byte: any host instruction may have inlined a constant derived from a
    /// guest byte anywhere in its range.
    pub fn free_range(&mut self, lo: u32, hi: u64) {
        self.blocks
            .retain(|_, b| !(u64::from(b.start()) < hi && u64::from(b.end()) > u64::from(lo)));
    }

    pub fn free_all(&mut self) {
        self.blocks.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynarec::mem::ExecPool;

    fn block(pool: &ExecPool, start: u32, len: u32) -> Arc<Dynablock> {
        let code = pool.alloc(16, false).unwrap();
        Arc::new(Dynablock::new(start, start + len, code, 16, Vec::new()))
    }

    #[test]
    fn test_lookup_covers() {
        let pool = ExecPool::new();
        let mut list = BlockList::new(0x10000, 0x10000);
        list.insert(block(&pool, 0x10100, 0x20));
        list.insert(block(&pool, 0x10200, 0x10));

        assert!(list.lookup(0x100ff).is_none());
        assert_eq!(0x10100, list.lookup(0x10100).unwrap().start());
        assert_eq!(0x10100, list.lookup(0x1011f).unwrap().start());
        assert!(list.lookup(0x10120).is_none());
        assert_eq!(0x10200, list.lookup(0x10205).unwrap().start());
    }

    #[test]
    fn test_free_range_overlap() {
        let pool = ExecPool::new();
        let mut list = BlockList::new(0x10000, 0x10000);
        list.insert(block(&pool, 0x10100, 0x20));
        list.insert(block(&pool, 0x10200, 0x10));

        // One byte of overlap is enough to drop a block.
        list.free_range(0x1011f, 0x10120);
        assert!(list.lookup(0x10100).is_none());
        assert_eq!(1, list.len());

        list.free_range(0, 0x1_0000_0000);
        assert!(list.is_empty());
    }

    #[test]
    fn test_entry_for() {
        let pool = ExecPool::new();
        let code = pool.alloc(32, false).unwrap();
        let base = code.addr();
        let insts = vec![
            InstInfo {
                addr: 0x20000,
                size: 2,
                offset: 0,
                ..InstInfo::default()
            },
            InstInfo {
                addr: 0x20002,
                size: 1,
                offset: 12,
                ..InstInfo::default()
            },
        ];
        let b = Dynablock::new(0x20000, 0x20003, code, 32, insts);
        assert_eq!(Some(base), b.entry_for(0x20000));
        assert_eq!(Some(base + 12), b.entry_for(0x20002));
        assert_eq!(None, b.entry_for(0x20001));
    }
}
