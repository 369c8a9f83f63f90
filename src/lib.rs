//! Usermode x86 to ARM dynamic recompiler core
//!
//! Runs 32-bit x86 code on a 32-bit ARM host by translating guest
//! instructions into blocks of native code, cached per 64 KiB guest page
//! and invalidated when the guest writes or unmaps the memory they came
//! from.

/// Emulator context and process-wide registries
pub mod context;
/// Guest CPU state
pub mod cpu;
/// Deferred EFLAGS
pub mod flags;

/// The translation subsystem
pub mod dynarec {
    /// Host instruction encodings
    pub mod arm;
    /// Translated blocks and their per-page lists
    pub mod block;
    /// The multi-pass block builder
    pub mod builder;
    pub mod error;
    /// x87/MMX/SSE register cache
    pub mod fpu;
    /// Entry/exit stubs and the runtime linker
    pub mod link;
    /// The guest-page index
    pub mod map;
    /// Executable memory pool
    pub mod mem;
    /// Per-opcode-group handlers
    pub mod ops;
    /// Guest instruction fetch
    pub mod stream;
}

pub use self::context::EmuContext;
pub use self::cpu::CpuState;
pub use self::dynarec::block::Dynablock;
pub use self::dynarec::builder::translate;
pub use self::dynarec::error::Error;
pub use self::flags::{DeferredOp, Eflags};
