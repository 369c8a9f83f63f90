//! Process-wide emulator context: owns the translation caches, the host
//! bridge, TLS, and every other piece of shared state, and tears them down
//! in order.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use crate::cpu::CpuState;
use crate::dynarec::block::{BlockList, Dynablock};
use crate::dynarec::error::Error;
use crate::dynarec::link::Stubs;
use crate::dynarec::map::DynaMap;
use crate::dynarec::mem::ExecPool;

pub const MAX_SIGNALS: usize = 64;

/// Signal dispositions: 0 is default, 1 is ignore, anything else is a guest
/// handler address.
pub const SIG_DFL: usize = 0;
pub const SIG_IGN: usize = 1;

/// Bytes reserved past the TLS partitions for the thread control block; the
/// stack-guard canary sits at +0x14, where guest code reads `GS:0x14`.
const TLS_HEAD: usize = 0x20;
const TLS_CANARY_OFFSET: usize = 0x14;

thread_local! {
    static TLS_SHADOW: RefCell<Option<Vec<u8>>> = const { RefCell::new(None) };
}

fn random_below(max: u32) -> u32 {
    let mut bytes = [0u8; 4];
    let mut filled = 0;
    while filled < bytes.len() {
        let r = unsafe {
            libc::getrandom(
                bytes[filled..].as_mut_ptr().cast(),
                bytes.len() - filled,
                0,
            )
        };
        if r <= 0 {
            break;
        }
        filled += r as usize;
    }
    u32::from_le_bytes(bytes) % max
}

/// One registered host-call thunk.
#[derive(Debug, Clone, Copy)]
pub struct BridgeThunk {
    pub func: usize,
    /// Bytes the guest-side `ret n` would pop.
    pub retn: u16,
}

/// Host-call thunk table living in a reserved guest address window. A guest
/// `CALL` landing on a thunk address is dispatched to the host function
/// instead of being translated.
pub struct Bridge {
    thunks: Mutex<Vec<BridgeThunk>>,
}

impl Bridge {
    /// Start of the reserved guest window.
    pub const BASE: u32 = 0xfff0_0000;
    const STRIDE: u32 = 8;

    fn new() -> Self {
        Self {
            thunks: Mutex::new(Vec::new()),
        }
    }

    /// Register a host function; returns the guest address of its thunk.
    pub fn add(&self, func: usize, retn: u16) -> u32 {
        let mut thunks = self.thunks.lock().unwrap_or_else(|e| e.into_inner());
        thunks.push(BridgeThunk { func, retn });
        Self::BASE + (thunks.len() as u32 - 1) * Self::STRIDE
    }

    #[must_use]
    pub fn lookup(&self, addr: u32) -> Option<BridgeThunk> {
        let off = addr.checked_sub(Self::BASE)?;
        if off % Self::STRIDE != 0 {
            return None;
        }
        let thunks = self.thunks.lock().unwrap_or_else(|e| e.into_inner());
        thunks.get((off / Self::STRIDE) as usize).copied()
    }

    fn clear(&self) {
        self.thunks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// Guest symbol registry, filled by the loader side and consulted when
/// resolving guest imports.
pub struct Librarian {
    symbols: Mutex<HashMap<String, u32>>,
}

impl Librarian {
    fn new() -> Self {
        Self {
            symbols: Mutex::new(HashMap::new()),
        }
    }

    pub fn declare(&self, name: &str, addr: u32) {
        self.symbols
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_owned(), addr);
    }

    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<u32> {
        self.symbols
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
    }

    fn clear(&self) {
        self.symbols
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

/// A guest function registered as a host-visible callback.
#[derive(Debug, Clone, Copy)]
pub struct Callback {
    pub func: u32,
    pub nargs: u8,
}

/// Spin lock backing the guest `LOCK` prefix when translated code falls
/// back to a mutex.
pub(crate) struct GuestLock {
    flag: AtomicBool,
}

impl GuestLock {
    const fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
        }
    }

    pub(crate) fn lock(&self) {
        while self
            .flag
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub(crate) fn unlock(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Guest thread-local storage, grown at the front so every partition keeps
/// its negative offset from the segment base.
struct TlsZone {
    data: Vec<u8>,
}

impl TlsZone {
    /// Prepend `size` zeroed bytes and return the new partition's negative
    /// offset, `-(total size)`.
    fn add_partition(&mut self, size: usize) -> i32 {
        self.data.splice(0..0, std::iter::repeat_n(0u8, size));
        -(self.data.len() as i32)
    }
}

/// The process-wide emulator context.
///
/// Owns the executable pool, the dynamic map, the global (untracked)
/// dynablock list, the entry/exit stubs, the bridge and librarian, TLS, the
/// canary, and the signal table. Everything the translator produces lives
/// in arenas owned here; the translator itself only borrows the context.
pub struct EmuContext {
    pub pool: ExecPool,
    pub map: DynaMap,
    /// Blocks for untracked code, direct allocation.
    pub blocks: Mutex<BlockList>,
    pub stubs: Stubs,
    pub bridge: Bridge,
    pub maplib: Librarian,
    callbacks: Mutex<Vec<Callback>>,
    /// Guest address of the syscall thunk.
    pub vsyscall: u32,
    argv: Mutex<Vec<String>>,
    envv: Mutex<Vec<String>>,
    tls: Mutex<TlsZone>,
    canary: [u8; 4],
    signals: Mutex<[usize; MAX_SIGNALS]>,
    /// Pending fork shares: teardown is deferred this many times.
    forked: AtomicI32,
    pub mutex_once: Mutex<()>,
    pub mutex_once2: Mutex<()>,
    pub mutex_trace: Mutex<()>,
    pub(crate) lock: GuestLock,
}

impl EmuContext {
    pub fn new(argc: usize) -> Result<Box<Self>, Error> {
        let pool = ExecPool::new();
        let stubs = Stubs::build(&pool)?;
        let bridge = Bridge::new();
        let vsyscall = bridge.add(guest_syscall as usize, 0);

        let mut canary = [0u8; 4];
        for byte in &mut canary {
            *byte = 1 + random_below(255) as u8;
        }
        canary[random_below(4) as usize] = 0;
        log::debug!(
            "stack canary at GS:0x14, value {:08x}",
            u32::from_le_bytes(canary)
        );

        Ok(Box::new(Self {
            pool,
            map: DynaMap::new(),
            blocks: Mutex::new(BlockList::new(0, 0)),
            stubs,
            bridge,
            maplib: Librarian::new(),
            callbacks: Mutex::new(Vec::new()),
            vsyscall,
            argv: Mutex::new(Vec::with_capacity(argc + 1)),
            envv: Mutex::new(Vec::new()),
            tls: Mutex::new(TlsZone { data: Vec::new() }),
            canary,
            signals: Mutex::new([SIG_DFL; MAX_SIGNALS]),
            forked: AtomicI32::new(0),
            mutex_once: Mutex::new(()),
            mutex_once2: Mutex::new(()),
            mutex_trace: Mutex::new(()),
            lock: GuestLock::new(),
        }))
    }

    /// Release the context. Each pending fork share makes this a deferred
    /// no-op; the last release performs the full teardown.
    pub fn free(ctx: Box<Self>) -> Option<Box<Self>> {
        if ctx.forked.fetch_sub(1, Ordering::AcqRel) > 0 {
            return Some(ctx);
        }
        log::info!("freeing translation caches");
        ctx.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .free_all();
        // Reclaim every per-page list.
        ctx.map.clean_range(0, u32::MAX);
        ctx.maplib.clear();
        ctx.bridge.clear();
        ctx.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        TLS_SHADOW.with(|cell| cell.borrow_mut().take());
        let signals = ctx.signals.lock().unwrap_or_else(|e| e.into_inner());
        for (sig, handler) in signals.iter().enumerate() {
            if *handler > SIG_IGN {
                unsafe {
                    libc::signal(sig as i32, libc::SIG_DFL);
                }
            }
        }
        drop(signals);
        // Pool slabs unmap when the context drops.
        None
    }

    /// Note a fork: the child shares the context, so one more release
    /// becomes a no-op.
    pub fn fork(&self) {
        self.forked.fetch_add(1, Ordering::AcqRel);
    }

    /// Tie a CPU state to this context so translated code and helpers can
    /// find their way back.
    pub fn attach_cpu(&self, cpu: &mut CpuState) {
        cpu.ctx = self as *const Self;
    }

    #[must_use]
    pub fn new_cpu(&self) -> Box<CpuState> {
        let mut cpu = Box::new(CpuState::new());
        self.attach_cpu(&mut cpu);
        cpu
    }

    /// The translation covering `addr`, tracked or global.
    #[must_use]
    pub fn block_at(&self, addr: u32) -> Option<Arc<Dynablock>> {
        self.map.lookup(addr).or_else(|| {
            self.blocks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .lookup(addr)
        })
    }

    /// Track `[addr, addr+size)` as code-bearing guest memory. Called by
    /// the memory wrappers when guest pages become executable.
    pub fn add_range(&self, addr: u32, size: u32) {
        self.map.add_range(addr, size);
    }

    /// Invalidate translations intersecting `[addr, addr+size)`. Called by
    /// the memory wrappers on unmap, protection changes, and observed
    /// writes to translated pages.
    pub fn clean_range(&self, addr: u32, size: u32) {
        self.map.clean_range(addr, size);
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .free_range(addr, u64::from(addr) + u64::from(size));
    }

    pub fn push_arg(&self, arg: &str) {
        self.argv
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(arg.to_owned());
    }

    pub fn push_env(&self, env: &str) {
        self.envv
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(env.to_owned());
    }

    #[must_use]
    pub fn args(&self) -> Vec<String> {
        self.argv.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[must_use]
    pub fn envs(&self) -> Vec<String> {
        self.envv.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn add_callback(&self, func: u32, nargs: u8) -> usize {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        callbacks.push(Callback { func, nargs });
        callbacks.len() - 1
    }

    #[must_use]
    pub fn callback(&self, index: usize) -> Option<Callback> {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .copied()
    }

    /// Grow guest TLS at the front by `size` bytes; existing partitions
    /// keep their offsets, the new one is addressed from the returned
    /// negative offset.
    pub fn add_tls_partition(&self, size: usize) -> i32 {
        self.tls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_partition(size)
    }

    #[must_use]
    pub fn tls_size(&self) -> usize {
        self.tls.lock().unwrap_or_else(|e| e.into_inner()).data.len()
    }

    /// This thread's TLS segment base. Negative offsets reach the
    /// partitions, positive ones the control block (canary at +0x14). The
    /// shadow is rebuilt from the shared zone when partitions grew since
    /// the last call; the pointer stays valid until then.
    pub fn thread_tls(&self) -> *mut u8 {
        TLS_SHADOW.with(|cell| {
            let mut shadow = cell.borrow_mut();
            let zone = self.tls.lock().unwrap_or_else(|e| e.into_inner());
            let need = zone.data.len() + TLS_HEAD;
            if shadow.as_ref().is_none_or(|buf| buf.len() != need) {
                let mut buf = vec![0u8; need];
                buf[..zone.data.len()].copy_from_slice(&zone.data);
                buf[zone.data.len() + TLS_CANARY_OFFSET..zone.data.len() + TLS_CANARY_OFFSET + 4]
                    .copy_from_slice(&self.canary);
                *shadow = Some(buf);
            }
            let buf = shadow.as_mut().unwrap();
            let base = buf.len() - TLS_HEAD;
            unsafe { buf.as_mut_ptr().add(base) }
        })
    }

    #[must_use]
    pub fn canary(&self) -> [u8; 4] {
        self.canary
    }

    /// Record a guest signal disposition.
    pub fn set_signal_handler(&self, sig: usize, handler: usize) {
        if sig < MAX_SIGNALS {
            self.signals.lock().unwrap_or_else(|e| e.into_inner())[sig] = handler;
        }
    }

    #[must_use]
    pub fn signal_handler(&self, sig: usize) -> usize {
        if sig < MAX_SIGNALS {
            self.signals.lock().unwrap_or_else(|e| e.into_inner())[sig]
        } else {
            SIG_DFL
        }
    }

    /// Deliver a guest fault as a guest signal: the disposition decides
    /// between the handler, ignoring, and the default action.
    pub fn raise_guest_fault(&self, sig: usize) -> Result<usize, Error> {
        match self.signal_handler(sig) {
            SIG_DFL => Err(Error::GuestFault),
            handler => Ok(handler),
        }
    }
}

fn ctx_of(emu: *mut CpuState) -> Option<&'static EmuContext> {
    unsafe { emu.as_ref().and_then(|cpu| cpu.ctx.as_ref()) }
}

/// Guest `LOCK` prefix support for translated code.
pub extern "C" fn guest_lock(emu: *mut CpuState) {
    if let Some(ctx) = ctx_of(emu) {
        ctx.lock.lock();
    }
}

pub extern "C" fn guest_unlock(emu: *mut CpuState) {
    if let Some(ctx) = ctx_of(emu) {
        ctx.lock.unlock();
    }
}

/// Segment base for guest GS accesses in translated code.
pub extern "C" fn guest_tls_base(emu: *mut CpuState) -> *mut u8 {
    match ctx_of(emu) {
        Some(ctx) => ctx.thread_tls(),
        None => std::ptr::null_mut(),
    }
}

/// The vsyscall thunk target. Syscall emulation lives with the dispatcher;
/// reaching this directly means nothing is installed.
pub extern "C" fn guest_syscall(emu: *mut CpuState) {
    if let Some(cpu) = unsafe { emu.as_ref() } {
        log::warn!("unhandled guest syscall {} at {:#x}", cpu.regs[0], cpu.ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canary_shape() {
        let ctx = EmuContext::new(1).unwrap();
        let canary = ctx.canary();
        assert_eq!(1, canary.iter().filter(|b| **b == 0).count());
        EmuContext::free(ctx);
    }

    #[test]
    fn test_fork_accounting() {
        let ctx = EmuContext::new(0).unwrap();
        ctx.fork();
        ctx.fork();
        let ctx = EmuContext::free(ctx).expect("first release defers");
        let ctx = EmuContext::free(ctx).expect("second release defers");
        assert!(EmuContext::free(ctx).is_none());
    }

    #[test]
    fn test_tls_partitions() {
        let ctx = EmuContext::new(0).unwrap();
        assert_eq!(-8, ctx.add_tls_partition(8));
        assert_eq!(-24, ctx.add_tls_partition(16));
        assert_eq!(24, ctx.tls_size());
        EmuContext::free(ctx);
    }

    #[test]
    fn test_tls_front_growth() {
        let ctx = EmuContext::new(0).unwrap();
        ctx.add_tls_partition(8);
        {
            let mut zone = ctx.tls.lock().unwrap();
            zone.data.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        }
        ctx.add_tls_partition(16);
        let zone = ctx.tls.lock().unwrap();
        assert_eq!(&[0u8; 16], &zone.data[..16]);
        assert_eq!(&[1, 2, 3, 4, 5, 6, 7, 8], &zone.data[16..]);
        drop(zone);
        EmuContext::free(ctx);
    }

    #[test]
    fn test_thread_tls_canary() {
        let ctx = EmuContext::new(0).unwrap();
        ctx.add_tls_partition(8);
        let base = ctx.thread_tls();
        let slot = unsafe { std::slice::from_raw_parts(base.add(0x14), 4) };
        assert_eq!(&ctx.canary()[..], slot);
        EmuContext::free(ctx);
    }

    #[test]
    fn test_bridge_roundtrip() {
        let ctx = EmuContext::new(0).unwrap();
        let addr = ctx.bridge.add(guest_syscall as usize, 4);
        let thunk = ctx.bridge.lookup(addr).unwrap();
        assert_eq!(guest_syscall as usize, thunk.func);
        assert_eq!(4, thunk.retn);
        assert!(ctx.bridge.lookup(0x0804_8000).is_none());
        // The vsyscall thunk registered at creation resolves too.
        assert!(ctx.bridge.lookup(ctx.vsyscall).is_some());
        EmuContext::free(ctx);
    }

    #[test]
    fn test_librarian() {
        let ctx = EmuContext::new(0).unwrap();
        ctx.maplib.declare("malloc", 0x0804_9000);
        assert_eq!(Some(0x0804_9000), ctx.maplib.resolve("malloc"));
        assert_eq!(None, ctx.maplib.resolve("free"));
        EmuContext::free(ctx);
    }

    #[test]
    fn test_signal_table() {
        let ctx = EmuContext::new(0).unwrap();
        ctx.set_signal_handler(11, 0x0804_8123);
        assert_eq!(0x0804_8123, ctx.signal_handler(11));
        assert_eq!(SIG_DFL, ctx.signal_handler(10));
        assert_eq!(Ok(0x0804_8123), ctx.raise_guest_fault(11).map_err(|_| ()));
        assert!(ctx.raise_guest_fault(10).is_err());
        // Avoid resetting a live handler during teardown in the test
        // process.
        ctx.set_signal_handler(11, SIG_DFL);
        EmuContext::free(ctx);
    }
}
