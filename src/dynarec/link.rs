//! Entry/exit stubs and the runtime linker.
//!
//! The dispatcher enters translated code through the prolog, which loads
//! the cached guest registers and jumps to a block entry; blocks leave
//! through the epilog, which writes the registers back and returns to the
//! dispatcher. Block-to-block branches go through a per-call indirection
//! entry that starts out pointing at the linker stub; the linker resolves
//! the target and patches the entry with one aligned word store.

use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::cpu::{CpuState, layout};

use super::arm::{self, HostReg, R1, R2, R3, R12, R_EMU, xgpr};
use super::builder::Builder;
use super::error::Error;
use super::mem::{ExecPool, HostCode};

/// The fixed stubs, built into the pool at context creation.
#[derive(Debug)]
pub struct Stubs {
    /// `fn(emu: *mut CpuState, entry: usize)`: load guest registers, jump.
    pub prolog: usize,
    /// Write guest registers back, return to the dispatcher.
    pub epilog: usize,
    /// Slow path taken through an unresolved indirection entry.
    pub linker: usize,
    _code: HostCode,
}

impl Stubs {
    pub(crate) fn build(pool: &ExecPool) -> Result<Self, Error> {
        let mut words: Vec<u32> = Vec::new();

        // prolog: r0 = emu, r1 = block entry.
        let prolog = 0usize;
        words.push(arm::push(0x4FF0)); // r4-r11, lr
        for i in 0..8u8 {
            words.push(arm::ldr_imm(xgpr(i), R_EMU, layout::gpr(i as usize) as i32));
        }
        words.push(arm::bx(R1));

        // epilog.
        let epilog = words.len() * 4;
        for i in 0..8u8 {
            words.push(arm::str_imm(xgpr(i), R_EMU, layout::gpr(i as usize) as i32));
        }
        words.push(arm::pop(0x8FF0)); // r4-r11, pc

        // linker: r0 = emu, r1 = &entry. Calls the resolver, then jumps to
        // whatever it returned.
        let linker = words.len() * 4;
        words.push(arm::ldr_imm(R2, R1, 4)); // guest ip from the entry
        words.push(arm::push(0x4007)); // r0-r2, lr
        let resolver = dyna_linker as usize as u32;
        words.push(arm::movw(R12, resolver as u16));
        words.push(arm::movt(R12, (resolver >> 16) as u16));
        words.push(arm::blx_reg(R12));
        words.push(arm::mov_reg(R12, 0));
        words.push(arm::pop(0x4007));
        words.push(arm::bx(R12));

        let code = pool.alloc(words.len() * 4, false)?;
        let base = code.addr();
        unsafe {
            ptr::copy_nonoverlapping(
                words.as_ptr().cast::<u8>(),
                code.as_ptr().as_ptr(),
                words.len() * 4,
            );
        }
        Ok(Self {
            prolog: base + prolog,
            epilog: base + epilog,
            linker: base + linker,
            _code: code,
        })
    }
}

impl Builder<'_> {
    /// Store `ip` as the next guest PC and leave through the epilog.
    pub(crate) fn jump_to_epilog_imm(&mut self, ip: u32) {
        self.mov32(R2, ip);
        self.emit(arm::str_imm(R2, R_EMU, layout::IP as i32));
        self.mov32(R3, self.ctx.stubs.epilog as u32);
        self.emit(arm::bx(R3));
    }

    /// Leave through the epilog with the guest PC taken from a register.
    pub(crate) fn jump_to_epilog_reg(&mut self, reg: HostReg) {
        self.emit(arm::str_imm(reg, R_EMU, layout::IP as i32));
        self.mov32(R3, self.ctx.stubs.epilog as u32);
        self.emit(arm::bx(R3));
    }

    /// Branch to the translation of `ip` through a fresh indirection entry.
    /// Resolved targets are reached directly once the linker has patched
    /// the entry.
    pub(crate) fn jump_to_linker_imm(&mut self, ip: u32) {
        self.mov32(R2, ip);
        self.emit(arm::str_imm(R2, R_EMU, layout::IP as i32));
        let entry = self.table_slot(ip);
        // The entry address depends on the host buffer, known only at emit
        // time; keep the emission shape fixed.
        self.mov32_fixed(R1, entry as u32);
        self.emit(arm::ldr_imm(R3, R1, 0));
        self.emit(arm::bx(R3));
    }

    /// Pop the guest return address (plus `n` callee-cleaned bytes) and
    /// leave through the epilog.
    pub(crate) fn ret_to_epilog(&mut self, n: u32) {
        let esp = xgpr(4);
        self.emit(arm::ldr_imm(R2, esp, 0));
        let bump = 4 + n;
        if bump < 256 {
            self.emit(arm::add_imm(esp, esp, bump));
        } else {
            self.mov32(R3, bump);
            self.emit(arm::add_reg(esp, esp, R3));
        }
        self.emit(arm::str_imm(R2, R_EMU, layout::IP as i32));
        self.mov32(R3, self.ctx.stubs.epilog as u32);
        self.emit(arm::bx(R3));
    }
}

/// Patch one word of published code.
///
/// # Safety
///
/// `at` must be 4-aligned and inside a live host-code buffer. The aligned
/// 32-bit store is atomic on the host ISA, so concurrent executors see
/// either the old word or the new one.
pub unsafe fn patch_word(at: *mut u32, value: u32) {
    unsafe { &*at.cast::<AtomicU32>() }.store(value, Ordering::Release);
}

/// Linker slow path, reached from translated code through an unresolved
/// indirection entry: find (or make) the translation of `ip`, patch the
/// entry so the next pass branches directly, and return the host target.
/// Unresolvable targets fall back to the epilog and the dispatcher.
pub extern "C" fn dyna_linker(emu: *mut CpuState, entry: *mut u32, ip: u32) -> u32 {
    let Some(cpu) = (unsafe { emu.as_mut() }) else {
        return 0;
    };
    cpu.ip = ip;
    let Some(ctx) = (unsafe { cpu.ctx.as_ref() }) else {
        return 0;
    };
    let resolved = ctx.block_at(ip).and_then(|b| b.entry_for(ip));
    #[cfg(target_pointer_width = "32")]
    let resolved = resolved.or_else(|| {
        // Guest addresses are host addresses here; translate straight out
        // of guest memory, up to the end of the page.
        let page_end = ((u64::from(ip) >> super::map::PAGE_SHIFT) + 1) << super::map::PAGE_SHIFT;
        let len = (page_end - u64::from(ip)) as usize;
        let window = unsafe { std::slice::from_raw_parts(ip as usize as *const u8, len) };
        super::builder::translate(ctx, window, ip, ip)
            .ok()
            .and_then(|b| b.entry_for(ip))
    });
    match resolved {
        Some(target) => {
            let target = target as u32;
            if !entry.is_null() {
                unsafe { patch_word(entry, target) };
            }
            target
        }
        None => ctx.stubs.epilog as u32,
    }
}
