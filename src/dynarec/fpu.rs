//! Per-block x87/MMX/SSE register cache.
//!
//! Host register partitioning: `d8`-`d15` (callee saved) back the x87 stack
//! and MMX registers, tagged per slot; `q0`-`q2` cache SSE registers;
//! `d6`/`d7` are float scratch. The cache is purged before any control
//! transfer so the guest state struct is canonical whenever a block is
//! entered from outside.

use crate::cpu::layout;

use super::arm::{self, HostReg, R1, R3, R_EMU};
use super::builder::Builder;

/// Scratch double register.
pub(crate) const D_SCRATCH: HostReg = 7;

/// What a cache slot (d8 + index) currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// x87 stack entry, relative to the current virtual top.
    St(u8),
    /// MMX register.
    Mm(u8),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FpuCache {
    slots: [Option<Slot>; 8],
    /// Cached SSE registers per Q slot (q0..q2).
    sse: [Option<u8>; 3],
    /// Virtual pushes minus pops not yet committed to the status word.
    pub stack: i32,
}

impl FpuCache {
    fn find(&self, want: Slot) -> Option<usize> {
        self.slots.iter().position(|s| *s == Some(want))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack == 0 && self.slots.iter().all(Option::is_none) && self.sse.iter().all(Option::is_none)
    }
}

impl Builder<'_> {
    /// Emit the host address of the x87 slot backing ST(`st`) into r3,
    /// accounting for uncommitted pushes. The value lives at
    /// `emu.st[(TOP - stack + st) & 7]`.
    fn x87_addr(&mut self, st: u8) {
        self.emit(arm::ldrh_imm(R3, R_EMU, layout::SW as i32));
        self.emit(arm::ubfx(R3, R3, 11, 3));
        let adj = (i32::from(st) - self.fpu.stack).rem_euclid(8);
        if adj != 0 {
            self.emit(arm::add_imm(R3, R3, adj as u32));
        }
        self.emit(arm::and_imm(R3, R3, 7));
        self.emit(arm::add_reg_lsl(R3, R_EMU, R3, 3));
    }

    /// Free a slot, writing back whatever occupies it.
    fn fpu_evict(&mut self, index: usize) {
        let d = 8 + index as HostReg;
        match self.fpu.slots[index] {
            Some(Slot::St(st)) => {
                self.x87_addr(st);
                self.emit(arm::vstr_d(d, R3, layout::ST as i32));
            }
            Some(Slot::Mm(mm)) => {
                self.emit(arm::vstr_d(d, R_EMU, layout::mmx(mm as usize) as i32));
            }
            None => {}
        }
        self.fpu.slots[index] = None;
    }

    fn fpu_alloc(&mut self, want: Slot) -> HostReg {
        if let Some(free) = self.fpu.slots.iter().position(Option::is_none) {
            self.fpu.slots[free] = Some(want);
            return 8 + free as HostReg;
        }
        // Prefer evicting an MMX entry; a full set of live ST entries means
        // the guest has overflowed its own stack.
        let victim = self
            .fpu
            .slots
            .iter()
            .position(|s| matches!(s, Some(Slot::Mm(_))))
            .unwrap_or(0);
        self.fpu_evict(victim);
        self.fpu.slots[victim] = Some(want);
        8 + victim as HostReg
    }

    /// Host register caching ST(`st`), loading it on a miss.
    pub(crate) fn x87_get_st(&mut self, st: u8) -> HostReg {
        if let Some(i) = self.fpu.find(Slot::St(st)) {
            return 8 + i as HostReg;
        }
        let d = self.fpu_alloc(Slot::St(st));
        self.x87_addr(st);
        self.emit(arm::vldr_d(d, R3, layout::ST as i32));
        d
    }

    /// Rotate the virtual stack down one and return the register now
    /// caching the new ST(0). The slot is not loaded; the caller fills it.
    pub(crate) fn x87_do_push(&mut self) -> HostReg {
        for slot in self.fpu.slots.iter_mut() {
            if let Some(Slot::St(st)) = slot {
                if *st == 7 {
                    // Guest stack overflow; the oldest entry is gone anyway.
                    *slot = None;
                } else {
                    *st += 1;
                }
            }
        }
        self.fpu.stack += 1;
        self.fpu_alloc(Slot::St(0))
    }

    /// Drop ST(0) and rotate the virtual stack up one.
    pub(crate) fn x87_do_pop(&mut self) {
        if let Some(i) = self.fpu.find(Slot::St(0)) {
            self.fpu.slots[i] = None;
        }
        for slot in self.fpu.slots.iter_mut() {
            if let Some(Slot::St(st)) = slot {
                *st -= 1;
            }
        }
        self.fpu.stack -= 1;
    }

    /// Write a cached ST back to the guest state without dropping it, for
    /// helpers that read the slot through the state struct.
    pub fn x87_refresh(&mut self, st: u8) {
        if let Some(i) = self.fpu.find(Slot::St(st)) {
            let d = 8 + i as HostReg;
            self.x87_addr(st);
            self.emit(arm::vstr_d(d, R3, layout::ST as i32));
        }
    }

    /// Write a cached ST back and forget it.
    pub fn x87_forget(&mut self, st: u8) {
        self.x87_refresh(st);
        if let Some(i) = self.fpu.find(Slot::St(st)) {
            self.fpu.slots[i] = None;
        }
    }

    /// Host register caching MMX register `mm`.
    pub(crate) fn mmx_get_reg(&mut self, mm: u8) -> HostReg {
        if let Some(i) = self.fpu.find(Slot::Mm(mm)) {
            return 8 + i as HostReg;
        }
        let d = self.fpu_alloc(Slot::Mm(mm));
        self.emit(arm::vldr_d(d, R_EMU, layout::mmx(mm as usize) as i32));
        d
    }

    /// Like [`Self::mmx_get_reg`] but skips the load; the caller overwrites
    /// every lane.
    pub(crate) fn mmx_get_reg_empty(&mut self, mm: u8) -> HostReg {
        if let Some(i) = self.fpu.find(Slot::Mm(mm)) {
            return 8 + i as HostReg;
        }
        self.fpu_alloc(Slot::Mm(mm))
    }

    /// First of the two D registers caching SSE register `xmm`.
    pub(crate) fn sse_get_reg(&mut self, xmm: u8) -> HostReg {
        if let Some(q) = self.fpu.sse.iter().position(|s| *s == Some(xmm)) {
            return 2 * q as HostReg;
        }
        let q = match self.fpu.sse.iter().position(Option::is_none) {
            Some(q) => q,
            None => {
                self.sse_writeback(0);
                self.fpu.sse[0] = None;
                0
            }
        };
        self.fpu.sse[q] = Some(xmm);
        let d = 2 * q as HostReg;
        self.emit(arm::vldr_d(d, R_EMU, layout::xmm(xmm as usize) as i32));
        self.emit(arm::vldr_d(d + 1, R_EMU, layout::xmm(xmm as usize) as i32 + 8));
        d
    }

    fn sse_writeback(&mut self, q: usize) {
        if let Some(xmm) = self.fpu.sse[q] {
            let d = 2 * q as HostReg;
            self.emit(arm::vstr_d(d, R_EMU, layout::xmm(xmm as usize) as i32));
            self.emit(arm::vstr_d(d + 1, R_EMU, layout::xmm(xmm as usize) as i32 + 8));
        }
    }

    /// Save caller-saved float state around a host call. Only q0-q2 live in
    /// the caller-saved half; the x87/MMX slots sit in callee-saved
    /// registers the host function must preserve.
    pub(crate) fn fpu_push_cache(&mut self) {
        if self.fpu.sse.iter().any(Option::is_some) {
            self.emit(arm::vpush_d0_d7());
        }
    }

    pub(crate) fn fpu_pop_cache(&mut self) {
        if self.fpu.sse.iter().any(Option::is_some) {
            self.emit(arm::vpop_d0_d7());
        }
    }

    /// Write every cached register back to the guest state, commit the
    /// virtual stack top, and empty the cache. Emits nothing when the cache
    /// is already clean.
    pub(crate) fn fpu_purge_cache(&mut self) {
        if self.fpu.is_empty() {
            return;
        }
        if self.fpu.stack != 0 {
            // TOP -= stack, in the status word.
            let delta = self.fpu.stack.rem_euclid(8) as u32;
            self.emit(arm::ldrh_imm(R3, R_EMU, layout::SW as i32));
            self.emit(arm::ubfx(R1, R3, 11, 3));
            if delta != 0 {
                self.emit(arm::sub_imm(R1, R1, delta));
            }
            self.emit(arm::and_imm(R1, R1, 7));
            self.emit(arm::bfi(R3, R1, 11, 3));
            self.emit(arm::strh_imm(R3, R_EMU, layout::SW as i32));
            self.fpu.stack = 0;
        }
        for i in 0..self.fpu.slots.len() {
            self.fpu_evict(i);
        }
        for q in 0..self.fpu.sse.len() {
            self.sse_writeback(q);
            self.fpu.sse[q] = None;
        }
    }
}
