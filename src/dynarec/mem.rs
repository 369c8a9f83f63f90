use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Mutex;

use super::error::Error;

/// Slab size for pooled translated code.
pub const SLAB_SIZE: usize = 4 * 1024 * 1024;

/// Every pooled allocation is rounded to this.
pub const ALLOC_ALIGN: usize = 16;

fn map_exec(len: usize) -> Result<NonNull<u8>, Error> {
    let p = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if p == libc::MAP_FAILED {
        log::info!("cannot map {len} bytes of executable memory");
        return Err(Error::OutOfMemory);
    }
    NonNull::new(p.cast::<u8>()).ok_or(Error::OutOfMemory)
}

struct Slab {
    base: NonNull<u8>,
    offset: usize,
}

// The slab base is an anonymous private mapping owned by the pool alone.
unsafe impl Send for Slab {}

/// A standalone executable mapping, released on drop. Used for blocks that
/// must not share a slab because they are invalidated independently.
pub struct ExecMap {
    base: NonNull<u8>,
    len: usize,
}

unsafe impl Send for ExecMap {}
unsafe impl Sync for ExecMap {}

impl Drop for ExecMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

/// Host memory backing one translated block.
pub enum HostCode {
    /// Carved out of a pool slab; never individually reclaimed.
    Pool { base: NonNull<u8>, len: usize },
    /// Owned mapping, unmapped when the block goes away.
    Isolated(ExecMap),
}

// Host code buffers are written during construction only; afterwards they
// are executed, never mutated, except through the linker's aligned
// single-word patch.
unsafe impl Send for HostCode {}
unsafe impl Sync for HostCode {}

impl HostCode {
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        match self {
            Self::Pool { base, .. } => *base,
            Self::Isolated(map) => map.base,
        }
    }

    #[must_use]
    pub fn addr(&self) -> usize {
        self.as_ptr().as_ptr() as usize
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Pool { len, .. } => *len,
            Self::Isolated(map) => map.len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HostCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Pool { .. } => "pool",
            Self::Isolated(_) => "isolated",
        };
        write!(f, "HostCode({kind}, {:#x}+{:#x})", self.addr(), self.len())
    }
}

/// Bump allocator over large W+X slabs.
///
/// Individual allocations are never freed: translated code may be live in
/// another thread's program counter at any time, and reclaiming one block
/// would need a quiescence protocol this design avoids. Reclamation is
/// all-or-nothing when the pool drops.
pub struct ExecPool {
    slabs: Mutex<Vec<Slab>>,
}

impl ExecPool {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slabs: Mutex::new(Vec::new()),
        }
    }

    /// Allocate `size` bytes of executable memory.
    ///
    /// With `nolinker` set the request bypasses the pool and returns a fresh
    /// mapping of exactly `size` bytes that the returned handle owns.
    /// Otherwise the request is rounded to [`ALLOC_ALIGN`] and served from
    /// the first slab with room, appending a new slab when none fits.
    pub fn alloc(&self, size: usize, nolinker: bool) -> Result<HostCode, Error> {
        if nolinker {
            let base = map_exec(size)?;
            return Ok(HostCode::Isolated(ExecMap { base, len: size }));
        }
        let size = (size + ALLOC_ALIGN - 1) & !(ALLOC_ALIGN - 1);
        let mut slabs = self.slabs.lock().unwrap_or_else(|e| e.into_inner());
        for slab in slabs.iter_mut() {
            if slab.offset + size <= SLAB_SIZE {
                let base = unsafe { NonNull::new_unchecked(slab.base.as_ptr().add(slab.offset)) };
                slab.offset += size;
                return Ok(HostCode::Pool { base, len: size });
            }
        }
        log::debug!("growing executable pool to slab #{}", slabs.len() + 1);
        // Map before recording the slab so a failure leaves the pool as it
        // was.
        let base = map_exec(SLAB_SIZE)?;
        slabs.push(Slab { base, offset: size });
        Ok(HostCode::Pool { base, len: size })
    }

    #[must_use]
    pub fn slab_count(&self) -> usize {
        self.slabs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for ExecPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecPool {
    fn drop(&mut self) {
        let slabs = self.slabs.get_mut().unwrap_or_else(|e| e.into_inner());
        for slab in slabs.iter() {
            unsafe {
                libc::munmap(slab.base.as_ptr().cast(), SLAB_SIZE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_bump() {
        let pool = ExecPool::new();
        let a = pool.alloc(100, false).unwrap();
        assert_eq!(0, a.addr() % 16);
        assert_eq!(112, a.len());
        let b = pool.alloc(100, false).unwrap();
        // (100 + 15) & !15 == 112
        assert_eq!(a.addr() + 112, b.addr());
        assert_eq!(1, pool.slab_count());
    }

    #[test]
    fn test_pool_new_slab() {
        let pool = ExecPool::new();
        let a = pool.alloc(SLAB_SIZE - 32, false).unwrap();
        let b = pool.alloc(32, false).unwrap();
        assert_eq!(a.addr() + SLAB_SIZE - 32, b.addr());
        // Slab is now full; the next allocation opens a second one.
        let c = pool.alloc(32, false).unwrap();
        assert_eq!(2, pool.slab_count());
        assert_ne!(0, c.addr());
    }

    #[test]
    fn test_isolated() {
        let pool = ExecPool::new();
        let m = pool.alloc(4096, true).unwrap();
        assert!(matches!(m, HostCode::Isolated(_)));
        assert_eq!(4096, m.len());
        assert_eq!(0, pool.slab_count());
        drop(m);
    }

    #[test]
    fn test_concurrent_allocs_are_disjoint() {
        let pool = ExecPool::new();
        let mut addrs: Vec<usize> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        (0..64)
                            .map(|_| pool.alloc(48, false).unwrap().addr())
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
        });
        assert!(addrs.iter().all(|a| a % 16 == 0));
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(256, addrs.len());
    }

    #[test]
    fn test_alloc_is_writable() {
        let pool = ExecPool::new();
        let m = pool.alloc(16, false).unwrap();
        unsafe {
            m.as_ptr().as_ptr().write(0xe5);
            assert_eq!(0xe5, m.as_ptr().as_ptr().read());
        }
    }
}
