use std::ptr;
use std::sync::Arc;

use crate::context::EmuContext;
use crate::cpu::layout;
use crate::flags::{self, DeferredOp};

use super::arm::{self, Cond, HostReg, R1, R3, R12, R_EMU, xgpr};
use super::block::{Dynablock, InstInfo};
use super::error::Error;
use super::fpu::FpuCache;
use super::map::PAGE_SHIFT;
use super::mem::HostCode;
use super::ops;
use super::stream::{CodeStream, ModRm, Sib};

/// Translation passes, run in order over the same instruction dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// Walk the stream, count instructions, gather flag liveness and
    /// barriers. Emits nothing.
    Analyze,
    /// Count emission to assign host offsets and labels per instruction.
    Size,
    /// Emit host words using the offsets recorded by the sizing pass.
    Emit,
    /// Resolve what emission could not: publish the words and the
    /// indirection table into the host buffer.
    Fixup,
}

/// Handler outcome for one instruction.
pub(crate) enum Control {
    Next,
    /// The handler emitted its own exit.
    Exit,
    /// Not translated; the block ends before it and the interpreter takes
    /// over.
    Unhandled,
}

/// Named per-instruction label slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkLabel {
    Mark,
    Mark2,
    Mark3,
    MarkF,
}

/// Translation stops after this many guest instructions.
pub const MAX_BLOCK_INSTS: usize = 256;

const CALL_SAVE_MASK: u16 = 0x500F; // r0-r3, r12, lr

/// One block translation in flight. Borrows the context; the context owns
/// everything the translation produces.
pub struct Builder<'a> {
    pub(crate) ctx: &'a EmuContext,
    pub(crate) stream: CodeStream<'a>,
    pass: Pass,
    start: u32,
    end: u32,
    pub(crate) ninst: usize,
    pub(crate) insts: Vec<InstInfo>,
    size: usize,
    code: Vec<u32>,
    /// Guest target per indirection slot, in allocation order.
    table: Vec<u32>,
    table_cursor: usize,
    code_len: usize,
    pub(crate) block_base: usize,
    /// Flags are materialized and current.
    pub(crate) cleanflags: bool,
    pub(crate) fpu: FpuCache,
}

impl<'a> Builder<'a> {
    fn new(ctx: &'a EmuContext, code: &'a [u8], base: u32, start: u32) -> Self {
        Self {
            ctx,
            stream: CodeStream::new(code, base),
            pass: Pass::Analyze,
            start,
            end: start,
            ninst: 0,
            insts: Vec::new(),
            size: 0,
            code: Vec::new(),
            table: Vec::new(),
            table_cursor: 0,
            code_len: 0,
            block_base: 0,
            cleanflags: false,
            fpu: FpuCache::default(),
        }
    }

    pub(crate) fn emit(&mut self, word: u32) {
        match self.pass {
            Pass::Analyze | Pass::Fixup => {}
            Pass::Size => self.size += 4,
            Pass::Emit => {
                self.code.push(word);
                self.size += 4;
            }
        }
    }

    /// Load a 32-bit constant. Emission shape depends only on the value, so
    /// passes stay in step as long as the value does.
    pub(crate) fn mov32(&mut self, d: HostReg, value: u32) {
        self.emit(arm::movw(d, value as u16));
        if value >> 16 != 0 {
            self.emit(arm::movt(d, (value >> 16) as u16));
        }
    }

    /// Load a 32-bit constant that is only known at emit time (host buffer
    /// addresses). Always two words so the sizing pass agrees.
    pub(crate) fn mov32_fixed(&mut self, d: HostReg, value: u32) {
        self.emit(arm::movw(d, value as u16));
        self.emit(arm::movt(d, (value >> 16) as u16));
    }

    // Label plumbing. Labels are recorded by the sizing pass and replayed
    // by the emit pass, which walks the same emission path.

    pub(crate) fn set_label(&mut self, label: MarkLabel) {
        let pos = self.size as u32;
        let inst = &mut self.insts[self.ninst];
        match label {
            MarkLabel::Mark => inst.mark = pos,
            MarkLabel::Mark2 => inst.mark2 = pos,
            MarkLabel::Mark3 => inst.mark3 = pos,
            MarkLabel::MarkF => inst.markf = pos,
        }
    }

    fn label(&self, label: MarkLabel) -> u32 {
        let inst = &self.insts[self.ninst];
        match label {
            MarkLabel::Mark => inst.mark,
            MarkLabel::Mark2 => inst.mark2,
            MarkLabel::Mark3 => inst.mark3,
            MarkLabel::MarkF => inst.markf,
        }
    }

    /// Branch to a label of the current instruction.
    pub(crate) fn b_label(&mut self, cond: Cond, label: MarkLabel) {
        let rel = self.label(label) as i64 - (self.size as i64 + 8);
        self.emit(arm::b_rel(cond, rel as i32));
    }

    /// Branch to the fall-through point of the current instruction.
    pub(crate) fn b_next(&mut self, cond: Cond) {
        let rel = self.insts[self.ninst].epilog as i64 - (self.size as i64 + 8);
        self.emit(arm::b_rel(cond, rel as i32));
    }

    pub(crate) fn note_barrier(&mut self, level: u8) {
        let inst = &mut self.insts[self.ninst];
        if inst.barrier == 0 {
            inst.barrier = level;
        }
    }

    // Deferred-flags plumbing. Stores into the guest state are emitted only
    // when the liveness pass proved a later consumer needs this record.

    fn need_flags(&self) -> bool {
        self.pass != Pass::Analyze && self.insts[self.ninst].need_flags
    }

    pub(crate) fn uflag_op1(&mut self, reg: HostReg) {
        if self.need_flags() {
            self.emit(arm::str_imm(reg, R_EMU, layout::OP1 as i32));
        }
    }

    pub(crate) fn uflag_op2(&mut self, reg: HostReg) {
        if self.need_flags() {
            self.emit(arm::str_imm(reg, R_EMU, layout::OP2 as i32));
        }
    }

    pub(crate) fn uflag_op12(&mut self, op1: HostReg, op2: HostReg) {
        self.uflag_op1(op1);
        self.uflag_op2(op2);
    }

    pub(crate) fn uflag_op2_imm(&mut self, imm: u32) {
        if self.need_flags() {
            self.mov32(R3, imm);
            self.emit(arm::str_imm(R3, R_EMU, layout::OP2 as i32));
        }
    }

    pub(crate) fn uflag_res(&mut self, reg: HostReg) {
        if self.need_flags() {
            self.emit(arm::str_imm(reg, R_EMU, layout::RES as i32));
        }
    }

    /// Record the operation kind, completing a deferred-flags record. The
    /// flag slots are stale from here until the next materialization.
    pub(crate) fn uflag_df(&mut self, scratch: HostReg, op: DeferredOp) {
        self.insts[self.ninst].defs_flags = true;
        if self.need_flags() {
            self.emit(arm::movw(scratch, u32::from(op) as u16));
            self.emit(arm::str_imm(scratch, R_EMU, layout::DF as i32));
        }
        self.cleanflags = false;
    }

    /// Make the flag slots current before a consumer reads them: if a
    /// deferred record is pending, call the materializer.
    pub(crate) fn use_flags(&mut self) {
        self.insts[self.ninst].uses_flags = true;
        if self.cleanflags {
            return;
        }
        self.emit(arm::ldr_imm(R3, R_EMU, layout::DF as i32));
        self.emit(arm::tst_reg(R3, R3));
        self.b_label(Cond::Eq, MarkLabel::MarkF);
        self.call_c(flags::update_flags as usize, None);
        self.set_label(MarkLabel::MarkF);
        self.cleanflags = true;
    }

    /// Call a host helper with the guest state pointer in r0. The optional
    /// result lands in `ret` after the caller-saved set is restored.
    pub(crate) fn call_c(&mut self, func: usize, ret: Option<HostReg>) {
        self.fpu_push_cache();
        self.emit(arm::push(CALL_SAVE_MASK));
        self.mov32_fixed(R12, func as u32);
        self.emit(arm::blx_reg(R12));
        if ret.is_some() {
            self.emit(arm::mov_reg(R12, 0));
        }
        // Restore r0-r3, drop the saved r12 slot, restore lr.
        self.emit(arm::pop(0x000F));
        self.emit(arm::add_imm(arm::SP, arm::SP, 4));
        self.emit(arm::pop(0x4000));
        if let Some(r) = ret {
            if r != R12 {
                self.emit(arm::mov_reg(r, R12));
            }
        }
        self.fpu_pop_cache();
    }

    /// Fold a displacement into a base register, spilling into `dst` when it
    /// does not fit the addressing form.
    fn add_disp(&mut self, dst: HostReg, src: HostReg, disp: i32, absmax: i32) -> (HostReg, i32) {
        if disp == 0 {
            (src, 0)
        } else if disp.abs() <= absmax {
            (src, disp)
        } else if (1..256).contains(&disp) {
            self.emit(arm::add_imm(dst, src, disp as u32));
            (dst, 0)
        } else if (-255..0).contains(&disp) {
            self.emit(arm::sub_imm(dst, src, (-disp) as u32));
            (dst, 0)
        } else {
            // r3 keeps the displacement out of the way; dst may alias src.
            self.mov32(R3, disp as u32);
            self.emit(arm::add_reg(dst, src, R3));
            (dst, 0)
        }
    }

    /// Resolve a ModR/M memory operand. Returns the host register holding
    /// the effective address base and a small displacement usable by the
    /// load/store immediate form (bounded by `absmax`). When the address is
    /// just a guest register plus a fitting displacement, that cached
    /// register is returned directly and nothing is emitted.
    pub(crate) fn geted(
        &mut self,
        modrm: ModRm,
        hint: HostReg,
        absmax: i32,
    ) -> Result<(HostReg, i32), Error> {
        debug_assert!(!modrm.is_direct());
        let md = modrm.md();
        if modrm.rm() == 4 {
            let sib = Sib(self.stream.u8()?);
            let no_base = sib.base() == 5 && md == 0;
            let disp = match md {
                0 if no_base => self.stream.i32()?,
                1 => i32::from(self.stream.i8()?),
                2 => self.stream.i32()?,
                _ => 0,
            };
            let index = (sib.index() != 4).then(|| (xgpr(sib.index()), sib.scale()));
            match (no_base, index) {
                (false, Some((idx, scale))) => {
                    self.emit(arm::add_reg_lsl(hint, xgpr(sib.base()), idx, scale));
                    Ok(self.add_disp(hint, hint, disp, absmax))
                }
                (false, None) => Ok(self.add_disp(hint, xgpr(sib.base()), disp, absmax)),
                (true, Some((idx, scale))) => {
                    self.mov32(hint, disp as u32);
                    self.emit(arm::add_reg_lsl(hint, hint, idx, scale));
                    Ok((hint, 0))
                }
                (true, None) => {
                    self.mov32(hint, disp as u32);
                    Ok((hint, 0))
                }
            }
        } else if md == 0 && modrm.rm() == 5 {
            let disp = self.stream.i32()?;
            self.mov32(hint, disp as u32);
            Ok((hint, 0))
        } else {
            let disp = match md {
                1 => i32::from(self.stream.i8()?),
                2 => self.stream.i32()?,
                _ => 0,
            };
            Ok(self.add_disp(hint, xgpr(modrm.rm()), disp, absmax))
        }
    }

    /// Consume the addressing bytes of a ModR/M operand without emitting
    /// anything.
    pub(crate) fn skip_ed(&mut self, modrm: ModRm) -> Result<(), Error> {
        if modrm.is_direct() {
            return Ok(());
        }
        let md = modrm.md();
        let mut disp32 = md == 2;
        if modrm.rm() == 4 {
            let sib = Sib(self.stream.u8()?);
            disp32 |= sib.base() == 5 && md == 0;
        } else if md == 0 && modrm.rm() == 5 {
            disp32 = true;
        }
        if md == 1 {
            self.stream.i8()?;
        } else if disp32 {
            self.stream.i32()?;
        }
        Ok(())
    }

    /// 32-bit r/m operand: the value register, the writeback base (0 when
    /// the operand is a guest register) and the folded displacement.
    pub(crate) fn get_ed(
        &mut self,
        modrm: ModRm,
        hint: HostReg,
    ) -> Result<(HostReg, HostReg, i32), Error> {
        if modrm.is_direct() {
            return Ok((xgpr(modrm.rm()), 0, 0));
        }
        let (wb, off) = self.geted(modrm, hint, 4095)?;
        self.emit(arm::ldr_imm(R1, wb, off));
        Ok((R1, wb, off))
    }

    /// Write `ed` back where it came from, if it was memory.
    pub(crate) fn wback_ed(&mut self, ed: HostReg, wback: HostReg, off: i32) {
        if wback != 0 {
            self.emit(arm::str_imm(ed, wback, off));
        }
    }

    /// Guest register selected by the reg field.
    #[must_use]
    pub(crate) fn gd(&self, modrm: ModRm) -> HostReg {
        xgpr(modrm.reg())
    }

    /// Host register and byte lane of an 8-bit guest register code.
    #[must_use]
    pub(crate) fn gb(code: u8) -> (HostReg, u32) {
        (xgpr(code & 3), u32::from(code >> 2))
    }

    pub(crate) fn is_native_call(&self, target: u32) -> Option<(usize, u16)> {
        self.ctx.bridge.lookup(target).map(|t| (t.func, t.retn))
    }

    /// Allocate (sizing) or replay (emit) a per-call indirection slot and
    /// return the host address of its entry.
    pub(crate) fn table_slot(&mut self, guest_ip: u32) -> usize {
        let index = match self.pass {
            Pass::Size => {
                self.table.push(guest_ip);
                self.table.len() - 1
            }
            Pass::Emit => {
                let i = self.table_cursor;
                self.table_cursor += 1;
                debug_assert_eq!(self.table[i], guest_ip);
                i
            }
            Pass::Analyze | Pass::Fixup => 0,
        };
        self.block_base + self.code_len + index * 8
    }

    fn run(&mut self, pass: Pass) -> Result<(), Error> {
        self.pass = pass;
        self.stream.seek_to(self.start)?;
        self.size = 0;
        self.ninst = 0;
        self.table_cursor = 0;
        self.cleanflags = false;
        self.fpu = FpuCache::default();
        if pass == Pass::Size {
            self.table.clear();
        }
        if pass == Pass::Emit {
            self.code.clear();
        }

        loop {
            let ip = self.stream.addr();
            if self.ninst >= MAX_BLOCK_INSTS
                || ip >> PAGE_SHIFT != self.start >> PAGE_SHIFT
                || self.stream.remaining() == 0
            {
                // Instruction cap or page boundary: hand the next address to the
                // linker.
                self.fpu_purge_cache();
                self.jump_to_linker_imm(ip);
                break;
            }
            if self.pass == Pass::Analyze {
                self.insts.push(InstInfo {
                    addr: ip,
                    ..InstInfo::default()
                });
            }
            self.insts[self.ninst].offset = self.size as u32;

            let ctl = match ops::step(self, ip) {
                Ok(ctl) => ctl,
                // Decode ran off the window mid-instruction; same treatment
                // as an unknown opcode.
                Err(Error::Untranslatable) => Control::Unhandled,
                Err(e) => return Err(e),
            };
            if matches!(ctl, Control::Unhandled) {
                if self.ninst == 0 {
                    return Err(Error::Untranslatable);
                }
                if self.pass == Pass::Analyze {
                    log::debug!("unhandled opcode at {ip:#x}, ending block");
                }
                self.note_barrier(2);
                self.fpu_purge_cache();
                self.jump_to_epilog_imm(ip);
            }

            let inst = &mut self.insts[self.ninst];
            inst.size = self.stream.addr().wrapping_sub(ip).min(15) as u8;
            inst.epilog = self.size as u32;
            self.ninst += 1;
            match ctl {
                Control::Next => {}
                Control::Exit | Control::Unhandled => break,
            }
        }

        // Every pass must retire at the same guest address.
        if pass == Pass::Analyze {
            self.end = self.stream.addr();
        } else {
            debug_assert_eq!(self.end, self.stream.addr());
        }
        self.insts.truncate(self.ninst);
        Ok(())
    }

    /// Backward liveness over the recorded instruction set: a record is
    /// stored only if a consumer can still see it. Control transfers and
    /// barriers count as consumers because the flags escape the block.
    fn analyze_flags(&mut self) {
        let mut needed = true;
        for inst in self.insts.iter_mut().rev() {
            if inst.barrier != 0 {
                needed = true;
            }
            if inst.defs_flags {
                inst.need_flags = needed;
                needed = false;
            }
            if inst.uses_flags {
                needed = true;
            }
        }
    }

    /// Pass 3: publish the emitted words and the indirection table into the
    /// host buffer. Entries start out pointing at the linker stub; the
    /// linker patches them to resolved blocks at run time. The dispatcher
    /// flushes the instruction cache before first entry.
    fn fixup(&mut self, host: &HostCode) {
        self.pass = Pass::Fixup;
        debug_assert_eq!(self.code.len() * 4, self.code_len);
        debug_assert_eq!(self.table_cursor, self.table.len());
        unsafe {
            let dst = host.as_ptr().as_ptr();
            ptr::copy_nonoverlapping(self.code.as_ptr().cast::<u8>(), dst, self.code_len);
            let table = dst.add(self.code_len).cast::<u32>();
            for (i, guest_ip) in self.table.iter().enumerate() {
                table.add(i * 2).write(self.ctx.stubs.linker as u32);
                table.add(i * 2 + 1).write(*guest_ip);
            }
        }
    }
}

/// Translate guest code starting at `start` into a new dynablock and
/// install it.
///
/// `code` is the guest byte window beginning at guest address `base`; it
/// normally covers the rest of the 64 KiB page. Pages tracked by the
/// dynamic map get pool-backed blocks installed in their page list;
/// untracked addresses go to the context's global list with isolated host
/// memory, so invalidation can unmap them individually.
pub fn translate(
    ctx: &EmuContext,
    code: &[u8],
    base: u32,
    start: u32,
) -> Result<Arc<Dynablock>, Error> {
    let off = start.wrapping_sub(base) as usize;
    if off >= code.len() {
        return Err(Error::Untranslatable);
    }
    // Clip the window at the page boundary so a block can never cover bytes
    // of the next page.
    let page_end = (u64::from(start >> PAGE_SHIFT) + 1) << PAGE_SHIFT;
    let window = (page_end - u64::from(base)) as usize;
    let code = &code[..code.len().min(window)];
    let tracked = ctx.map.tracks(start);

    let mut b = Builder::new(ctx, code, base, start);
    b.run(Pass::Analyze)?;
    b.analyze_flags();
    b.run(Pass::Size)?;
    b.code_len = b.size;
    let total = b.code_len + b.table.len() * 8;
    let host = ctx.pool.alloc(total, !tracked)?;
    b.block_base = host.addr();
    b.run(Pass::Emit)?;
    debug_assert_eq!(b.code_len, b.size);
    b.fixup(&host);

    let block = Arc::new(Dynablock::new(
        b.start,
        b.end,
        host,
        b.code_len,
        std::mem::take(&mut b.insts),
    ));
    if tracked {
        ctx.map.insert(block.clone());
    } else {
        ctx.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(block.clone());
    }
    log::debug!(
        "translated {:#x}..{:#x} into {} host bytes ({} insts)",
        block.start(),
        block.end(),
        block.code_len(),
        block.insts().len()
    );
    Ok(block)
}
