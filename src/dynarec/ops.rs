//! Opcode-group dispatch and instruction handlers.
//!
//! Dispatch is by first byte: base map, 0F, operand/address-size prefixes,
//! the GS override, the x87 escapes D8-DF, LOCK, and the SSE prefix groups.
//! Handlers emit through the builder's vocabulary and report how the block
//! continues. Anything not handled ends the block and leaves the
//! instruction to the interpreter.

use crate::cpu::{Flag, X87Status, layout};
use crate::flags::DeferredOp;

use super::arm::{self, Cond, HostReg, R1, R2, R3, R12, R_EMU, xgpr};
use super::builder::{Builder, Control, MarkLabel};
use super::error::Error;
use super::fpu::D_SCRATCH;
use super::map::PAGE_SHIFT;

const EAX: HostReg = xgpr(0);
const ECX: HostReg = xgpr(1);
const ESP: HostReg = xgpr(4);
const EBP: HostReg = xgpr(5);

pub(crate) fn step(b: &mut Builder, ip: u32) -> Result<Control, Error> {
    let opcode = b.stream.u8()?;
    match opcode {
        0x0F => step_0f(b),
        0x65 => step_gs(b),
        0x66 => step_66(b),
        0x67 => step_67(b),
        0xD8..=0xDF => step_x87(b, opcode),
        0xF0 => step_f0(b),
        0xF2 => step_f2(b),
        0xF3 => step_f3(b),
        _ => step_base(b, opcode, ip),
    }
}

// Shared ALU emission. The destination register receives the result; the
// deferred record captures operands before the operation overwrites them.

impl Builder<'_> {
    fn emit_add32(&mut self, d: HostReg, s: HostReg) {
        self.uflag_op12(d, s);
        self.emit(arm::add_reg(d, d, s));
        self.uflag_res(d);
        self.uflag_df(R3, DeferredOp::Add32);
    }

    fn emit_sub32(&mut self, d: HostReg, s: HostReg) {
        self.uflag_op12(d, s);
        self.emit(arm::sub_reg(d, d, s));
        self.uflag_res(d);
        self.uflag_df(R3, DeferredOp::Sub32);
    }

    fn emit_and32(&mut self, d: HostReg, s: HostReg) {
        self.emit(arm::and_reg(d, d, s));
        self.uflag_res(d);
        self.uflag_df(R3, DeferredOp::And32);
    }

    fn emit_or32(&mut self, d: HostReg, s: HostReg) {
        self.emit(arm::orr_reg(d, d, s));
        self.uflag_res(d);
        self.uflag_df(R3, DeferredOp::Or32);
    }

    fn emit_xor32(&mut self, d: HostReg, s: HostReg) {
        self.emit(arm::eor_reg(d, d, s));
        self.uflag_res(d);
        self.uflag_df(R3, DeferredOp::Xor32);
    }

    fn emit_cmp32(&mut self, a: HostReg, s: HostReg) {
        self.uflag_op12(a, s);
        self.emit(arm::sub_reg(R3, a, s));
        self.uflag_res(R3);
        self.uflag_df(R3, DeferredOp::Sub32);
    }

    fn emit_cmp16(&mut self, a: HostReg, s: HostReg) {
        self.uflag_op12(a, s);
        self.emit(arm::sub_reg(R3, a, s));
        self.uflag_res(R3);
        self.uflag_df(R3, DeferredOp::Sub16);
    }

    fn emit_test32(&mut self, a: HostReg, s: HostReg) {
        self.emit(arm::and_reg(R3, a, s));
        self.uflag_res(R3);
        self.uflag_df(R3, DeferredOp::And32);
    }

    fn emit_inc32(&mut self, d: HostReg) {
        self.uflag_op1(d);
        self.emit(arm::add_imm(d, d, 1));
        self.uflag_res(d);
        self.uflag_df(R3, DeferredOp::Inc32);
    }

    fn emit_dec32(&mut self, d: HostReg) {
        self.uflag_op1(d);
        self.emit(arm::sub_imm(d, d, 1));
        self.uflag_res(d);
        self.uflag_df(R3, DeferredOp::Dec32);
    }

    /// Load the flags a condition code reads and return the host condition
    /// meaning "taken". Flags must be materialized first.
    fn cc_test(&mut self, cc: u8) -> Cond {
        match cc >> 1 {
            0 => self.emit(arm::ldr_imm(R1, R_EMU, layout::flag(Flag::Of) as i32)),
            1 => self.emit(arm::ldr_imm(R1, R_EMU, layout::flag(Flag::Cf) as i32)),
            2 => self.emit(arm::ldr_imm(R1, R_EMU, layout::flag(Flag::Zf) as i32)),
            3 => {
                self.emit(arm::ldr_imm(R1, R_EMU, layout::flag(Flag::Cf) as i32));
                self.emit(arm::ldr_imm(R2, R_EMU, layout::flag(Flag::Zf) as i32));
                self.emit(arm::orr_reg(R1, R1, R2));
            }
            4 => self.emit(arm::ldr_imm(R1, R_EMU, layout::flag(Flag::Sf) as i32)),
            5 => self.emit(arm::ldr_imm(R1, R_EMU, layout::flag(Flag::Pf) as i32)),
            6 => {
                self.emit(arm::ldr_imm(R1, R_EMU, layout::flag(Flag::Sf) as i32));
                self.emit(arm::ldr_imm(R2, R_EMU, layout::flag(Flag::Of) as i32));
                self.emit(arm::eor_reg(R1, R1, R2));
            }
            _ => {
                self.emit(arm::ldr_imm(R1, R_EMU, layout::flag(Flag::Sf) as i32));
                self.emit(arm::ldr_imm(R2, R_EMU, layout::flag(Flag::Of) as i32));
                self.emit(arm::eor_reg(R1, R1, R2));
                self.emit(arm::ldr_imm(R2, R_EMU, layout::flag(Flag::Zf) as i32));
                self.emit(arm::orr_reg(R1, R1, R2));
            }
        }
        self.emit(arm::tst_reg(R1, R1));
        if cc & 1 == 0 { Cond::Ne } else { Cond::Eq }
    }

    fn push_from(&mut self, reg: HostReg) {
        self.emit(arm::sub_imm(ESP, ESP, 4));
        self.emit(arm::str_imm(reg, ESP, 0));
    }

    fn jcc(&mut self, cc: u8, target: u32) {
        self.use_flags();
        self.note_barrier(1);
        self.fpu_purge_cache();
        let taken = self.cc_test(cc);
        self.b_next(taken.invert());
        self.jump_to_linker_imm(target);
    }

    fn grab_tlsdata(&mut self, reg: HostReg) {
        self.call_c(crate::context::guest_tls_base as usize, Some(reg));
    }

    /// x87 status-word update after a VCMP, the FCOM form.
    fn fcom(&mut self, s1: HostReg, s2: HostReg) {
        self.emit(arm::vmrs_apsr());
        self.emit(arm::ldrh_imm(s2, R_EMU, layout::SW as i32));
        self.emit(arm::movw(s1, X87Status::CMP_MASK));
        self.emit(arm::bic_reg(s2, s2, s1));
        self.emit(arm::movw_cond(Cond::Vs, s1, X87Status::CMP_UNORDERED));
        self.emit(arm::movw_cond(Cond::Eq, s1, X87Status::CMP_ZERO));
        self.emit(arm::movw_cond(Cond::Gt, s1, X87Status::CMP_GREATER));
        self.emit(arm::movw_cond(Cond::Cc, s1, X87Status::CMP_LESS));
        self.emit(arm::orr_reg(s2, s2, s1));
        self.emit(arm::strh_imm(s2, R_EMU, layout::SW as i32));
    }

    /// EFLAGS update after a VCMP, the FCOMI form: CF/PF/ZF, and the
    /// deferred record is cleared since the slots are now authoritative.
    fn fcomi(&mut self, s1: HostReg, s2: HostReg) {
        self.emit(arm::vmrs_apsr());
        self.emit(arm::movw_cond(Cond::Vs, s1, 0b111));
        self.emit(arm::movw_cond(Cond::Eq, s1, 0b100));
        self.emit(arm::movw_cond(Cond::Gt, s1, 0b000));
        self.emit(arm::movw_cond(Cond::Cc, s1, 0b001));
        self.emit(arm::ubfx(s2, s1, 0, 1));
        self.emit(arm::str_imm(s2, R_EMU, layout::flag(Flag::Cf) as i32));
        self.emit(arm::ubfx(s2, s1, 1, 1));
        self.emit(arm::str_imm(s2, R_EMU, layout::flag(Flag::Pf) as i32));
        self.emit(arm::ubfx(s2, s1, 2, 1));
        self.emit(arm::str_imm(s2, R_EMU, layout::flag(Flag::Zf) as i32));
        self.emit(arm::movw(s2, u32::from(DeferredOp::None) as u16));
        self.emit(arm::str_imm(s2, R_EMU, layout::DF as i32));
    }
}

fn alu_apply(b: &mut Builder, family: u8, d: HostReg, s: HostReg) {
    match family {
        0 => b.emit_add32(d, s),
        1 => b.emit_or32(d, s),
        4 => b.emit_and32(d, s),
        5 => b.emit_sub32(d, s),
        6 => b.emit_xor32(d, s),
        _ => b.emit_cmp32(d, s),
    }
}

/// The six-opcode ALU families (ADD/OR/AND/SUB/XOR/CMP) share their layout:
/// `family*8 + 1` is Ev,Gv, `+3` is Gv,Ev, `+5` is eAX,imm32.
fn alu_family(b: &mut Builder, family: u8, form: u8) -> Result<Control, Error> {
    let is_cmp = family == 7;
    match form {
        1 => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                alu_apply(b, family, xgpr(modrm.rm()), gd);
            } else {
                let (ed, wb, off) = b.get_ed(modrm, R2)?;
                alu_apply(b, family, ed, gd);
                if !is_cmp {
                    b.wback_ed(ed, wb, off);
                }
            }
        }
        3 => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            let (ed, _, _) = b.get_ed(modrm, R2)?;
            alu_apply(b, family, gd, ed);
        }
        _ => {
            let imm = b.stream.u32()?;
            b.mov32(R3, imm);
            alu_apply(b, family, EAX, R3);
        }
    }
    Ok(Control::Next)
}

fn step_base(b: &mut Builder, opcode: u8, ip: u32) -> Result<Control, Error> {
    match opcode {
        // ALU families.
        0x01 | 0x03 | 0x05 | 0x09 | 0x0B | 0x0D | 0x21 | 0x23 | 0x25 | 0x29 | 0x2B | 0x2D
        | 0x31 | 0x33 | 0x35 | 0x39 | 0x3B | 0x3D => alu_family(b, opcode >> 3, opcode & 7),

        // INC/DEC reg.
        0x40..=0x47 => {
            b.emit_inc32(xgpr(opcode & 7));
            Ok(Control::Next)
        }
        0x48..=0x4F => {
            b.emit_dec32(xgpr(opcode & 7));
            Ok(Control::Next)
        }

        // PUSH/POP reg.
        0x50..=0x57 => {
            let reg = xgpr(opcode & 7);
            if reg == ESP {
                // The value pushed is the pre-decrement ESP.
                b.emit(arm::mov_reg(R3, ESP));
                b.push_from(R3);
            } else {
                b.push_from(reg);
            }
            Ok(Control::Next)
        }
        0x58..=0x5F => {
            let reg = xgpr(opcode & 7);
            if reg == ESP {
                // ESP becomes the popped value.
                b.emit(arm::ldr_imm(R3, ESP, 0));
                b.emit(arm::mov_reg(ESP, R3));
            } else {
                b.emit(arm::ldr_imm(reg, ESP, 0));
                b.emit(arm::add_imm(ESP, ESP, 4));
            }
            Ok(Control::Next)
        }
        0x68 => {
            let imm = b.stream.u32()?;
            b.mov32(R2, imm);
            b.push_from(R2);
            Ok(Control::Next)
        }
        0x6A => {
            let imm = i32::from(b.stream.i8()?) as u32;
            b.mov32(R2, imm);
            b.push_from(R2);
            Ok(Control::Next)
        }

        // Jcc rel8.
        0x70..=0x7F => {
            let off = i32::from(b.stream.i8()?);
            let target = b.stream.addr().wrapping_add(off as u32);
            b.jcc(opcode & 0xF, target);
            Ok(Control::Next)
        }

        // Group 1: ALU r/m, imm.
        0x81 | 0x83 => {
            let modrm = b.stream.modrm()?;
            let family = modrm.reg();
            if !matches!(family, 0 | 1 | 4 | 5 | 6 | 7) {
                return Ok(Control::Unhandled);
            }
            let is_cmp = family == 7;
            if modrm.is_direct() {
                let imm = grp1_imm(b, opcode)?;
                b.mov32(R3, imm);
                alu_apply(b, family, xgpr(modrm.rm()), R3);
            } else {
                let (ed, wb, off) = b.get_ed(modrm, R2)?;
                let imm = grp1_imm(b, opcode)?;
                b.mov32(R3, imm);
                alu_apply(b, family, ed, R3);
                if !is_cmp {
                    b.wback_ed(ed, wb, off);
                }
            }
            Ok(Control::Next)
        }

        0x85 => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            let (ed, _, _) = b.get_ed(modrm, R2)?;
            b.emit_test32(ed, gd);
            Ok(Control::Next)
        }

        // MOV.
        0x88 => {
            let modrm = b.stream.modrm()?;
            let (greg, glane) = Builder::gb(modrm.reg());
            if modrm.is_direct() {
                let (rreg, rlane) = Builder::gb(modrm.rm());
                b.emit(arm::uxtb(R3, greg, glane));
                b.emit(arm::bfi(rreg, R3, rlane * 8, 8));
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                b.emit(arm::uxtb(R3, greg, glane));
                b.emit(arm::strb_imm(R3, wb, off));
            }
            Ok(Control::Next)
        }
        0x8A => {
            let modrm = b.stream.modrm()?;
            let (greg, glane) = Builder::gb(modrm.reg());
            if modrm.is_direct() {
                let (rreg, rlane) = Builder::gb(modrm.rm());
                b.emit(arm::uxtb(R3, rreg, rlane));
                b.emit(arm::bfi(greg, R3, glane * 8, 8));
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                b.emit(arm::ldrb_imm(R3, wb, off));
                b.emit(arm::bfi(greg, R3, glane * 8, 8));
            }
            Ok(Control::Next)
        }
        0x89 => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                b.emit(arm::mov_reg(xgpr(modrm.rm()), gd));
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                b.emit(arm::str_imm(gd, wb, off));
            }
            Ok(Control::Next)
        }
        0x8B => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                b.emit(arm::mov_reg(gd, xgpr(modrm.rm())));
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                b.emit(arm::ldr_imm(gd, wb, off));
            }
            Ok(Control::Next)
        }
        0x8D => {
            let modrm = b.stream.modrm()?;
            if modrm.is_direct() {
                return Ok(Control::Unhandled);
            }
            let gd = b.gd(modrm);
            let (wb, off) = b.geted(modrm, gd, 255)?;
            if off > 0 {
                b.emit(arm::add_imm(gd, wb, off as u32));
            } else if off < 0 {
                b.emit(arm::sub_imm(gd, wb, (-off) as u32));
            } else if wb != gd {
                b.emit(arm::mov_reg(gd, wb));
            }
            Ok(Control::Next)
        }

        0x90 => Ok(Control::Next), // NOP

        // MOV moffs32 forms.
        0xA1 => {
            let moffs = b.stream.u32()?;
            b.mov32(R2, moffs);
            b.emit(arm::ldr_imm(EAX, R2, 0));
            Ok(Control::Next)
        }
        0xA3 => {
            let moffs = b.stream.u32()?;
            b.mov32(R2, moffs);
            b.emit(arm::str_imm(EAX, R2, 0));
            Ok(Control::Next)
        }

        // MOV reg, imm.
        0xB0..=0xB7 => {
            let imm = b.stream.u8()?;
            let (reg, lane) = Builder::gb(opcode & 7);
            b.emit(arm::mov_imm8(R3, u32::from(imm)));
            b.emit(arm::bfi(reg, R3, lane * 8, 8));
            Ok(Control::Next)
        }
        0xB8..=0xBF => {
            let imm = b.stream.u32()?;
            b.mov32(xgpr(opcode & 7), imm);
            Ok(Control::Next)
        }

        // Group 2 shifts, imm8 count.
        0xC1 => {
            let modrm = b.stream.modrm()?;
            if !matches!(modrm.reg(), 4 | 5 | 7) {
                return Ok(Control::Unhandled);
            }
            let (ed, wb, off) = b.get_ed(modrm, R2)?;
            let count = u32::from(b.stream.u8()?) & 31;
            if count != 0 {
                b.uflag_op1(ed);
                b.uflag_op2_imm(count);
                let (word, op) = match modrm.reg() {
                    4 => (arm::lsl_imm(ed, ed, count), DeferredOp::Shl32),
                    5 => (arm::lsr_imm(ed, ed, count), DeferredOp::Shr32),
                    _ => (arm::asr_imm(ed, ed, count), DeferredOp::Sar32),
                };
                b.emit(word);
                b.uflag_res(ed);
                b.uflag_df(R3, op);
                b.wback_ed(ed, wb, off);
            }
            Ok(Control::Next)
        }
        // Group 2 shifts, CL count.
        0xD3 => {
            let modrm = b.stream.modrm()?;
            if !matches!(modrm.reg(), 4 | 5 | 7) {
                return Ok(Control::Unhandled);
            }
            let (ed, wb, off) = b.get_ed(modrm, R2)?;
            b.emit(arm::and_imm(R3, ECX, 31));
            b.emit(arm::tst_reg(R3, R3));
            // A zero count leaves value and flags alone.
            b.b_label(Cond::Eq, MarkLabel::Mark);
            b.uflag_op1(ed);
            b.uflag_op2(R3);
            let (word, op) = match modrm.reg() {
                4 => (arm::lsl_reg(ed, ed, R3), DeferredOp::Shl32),
                5 => (arm::lsr_reg(ed, ed, R3), DeferredOp::Shr32),
                _ => (arm::asr_reg(ed, ed, R3), DeferredOp::Sar32),
            };
            b.emit(word);
            b.uflag_res(ed);
            b.uflag_df(R3, op);
            b.set_label(MarkLabel::Mark);
            b.wback_ed(ed, wb, off);
            Ok(Control::Next)
        }

        // RET.
        0xC2 => {
            let n = b.stream.u16()?;
            b.note_barrier(1);
            b.fpu_purge_cache();
            b.ret_to_epilog(u32::from(n));
            Ok(Control::Exit)
        }
        0xC3 => {
            b.note_barrier(1);
            b.fpu_purge_cache();
            b.ret_to_epilog(0);
            Ok(Control::Exit)
        }

        // MOV r/m, imm.
        0xC6 => {
            let modrm = b.stream.modrm()?;
            if modrm.reg() != 0 {
                return Ok(Control::Unhandled);
            }
            if modrm.is_direct() {
                let imm = b.stream.u8()?;
                let (reg, lane) = Builder::gb(modrm.rm());
                b.emit(arm::mov_imm8(R3, u32::from(imm)));
                b.emit(arm::bfi(reg, R3, lane * 8, 8));
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                let imm = b.stream.u8()?;
                b.emit(arm::mov_imm8(R3, u32::from(imm)));
                b.emit(arm::strb_imm(R3, wb, off));
            }
            Ok(Control::Next)
        }
        0xC7 => {
            let modrm = b.stream.modrm()?;
            if modrm.reg() != 0 {
                return Ok(Control::Unhandled);
            }
            if modrm.is_direct() {
                let imm = b.stream.u32()?;
                b.mov32(xgpr(modrm.rm()), imm);
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                let imm = b.stream.u32()?;
                b.mov32(R3, imm);
                b.emit(arm::str_imm(R3, wb, off));
            }
            Ok(Control::Next)
        }

        0xC9 => {
            // LEAVE
            b.emit(arm::mov_reg(ESP, EBP));
            b.emit(arm::ldr_imm(EBP, ESP, 0));
            b.emit(arm::add_imm(ESP, ESP, 4));
            Ok(Control::Next)
        }

        // INT: the dispatcher resolves it from the interpreter side.
        0xCC => {
            b.note_barrier(2);
            b.fpu_purge_cache();
            b.jump_to_epilog_imm(ip);
            Ok(Control::Exit)
        }
        0xCD => {
            b.stream.u8()?;
            b.note_barrier(2);
            b.fpu_purge_cache();
            b.jump_to_epilog_imm(ip);
            Ok(Control::Exit)
        }

        // CALL rel32.
        0xE8 => {
            let off = b.stream.i32()?;
            let next = b.stream.addr();
            let target = next.wrapping_add(off as u32);
            if let Some((func, retn)) = b.is_native_call(target) {
                // Direct host call: push the return address for the guest's
                // benefit, call, then undo the call frame plus callee-popped
                // bytes.
                b.note_barrier(1);
                b.mov32(R3, next);
                b.push_from(R3);
                b.call_c(func, None);
                let bump = 4 + u32::from(retn);
                if bump < 256 {
                    b.emit(arm::add_imm(ESP, ESP, bump));
                } else {
                    b.mov32(R3, bump);
                    b.emit(arm::add_reg(ESP, ESP, R3));
                }
                return Ok(Control::Next);
            }
            b.note_barrier(1);
            b.fpu_purge_cache();
            b.mov32(R3, next);
            b.push_from(R3);
            b.jump_to_linker_imm(target);
            Ok(Control::Exit)
        }

        // JMP rel.
        0xE9 | 0xEB => {
            let off = if opcode == 0xE9 {
                b.stream.i32()?
            } else {
                i32::from(b.stream.i8()?)
            };
            let next = b.stream.addr();
            let target = next.wrapping_add(off as u32);
            // A forward jump inside the page continues translation at the
            // target; everything else leaves through the linker.
            if target >> PAGE_SHIFT == ip >> PAGE_SHIFT
                && target >= next
                && b.stream.seek_to(target).is_ok()
            {
                return Ok(Control::Next);
            }
            b.note_barrier(1);
            b.fpu_purge_cache();
            b.jump_to_linker_imm(target);
            Ok(Control::Exit)
        }

        // Group 5.
        0xFF => {
            let modrm = b.stream.modrm()?;
            match modrm.reg() {
                0 => {
                    let (ed, wb, off) = b.get_ed(modrm, R2)?;
                    b.emit_inc32(ed);
                    b.wback_ed(ed, wb, off);
                    Ok(Control::Next)
                }
                1 => {
                    let (ed, wb, off) = b.get_ed(modrm, R2)?;
                    b.emit_dec32(ed);
                    b.wback_ed(ed, wb, off);
                    Ok(Control::Next)
                }
                2 => {
                    // CALL r/m: indirect, so exit through the epilog with
                    // the target as next guest PC. Purge before the target
                    // load; the purge sequence uses the scratch registers.
                    b.note_barrier(1);
                    b.fpu_purge_cache();
                    let (ed, _, _) = b.get_ed(modrm, R2)?;
                    let next = b.stream.addr();
                    b.mov32(R3, next);
                    b.push_from(R3);
                    b.jump_to_epilog_reg(ed);
                    Ok(Control::Exit)
                }
                4 => {
                    b.note_barrier(1);
                    b.fpu_purge_cache();
                    let (ed, _, _) = b.get_ed(modrm, R2)?;
                    b.jump_to_epilog_reg(ed);
                    Ok(Control::Exit)
                }
                6 => {
                    let (ed, _, _) = b.get_ed(modrm, R2)?;
                    b.push_from(ed);
                    Ok(Control::Next)
                }
                _ => Ok(Control::Unhandled),
            }
        }

        _ => Ok(Control::Unhandled),
    }
}

fn grp1_imm(b: &mut Builder, opcode: u8) -> Result<u32, Error> {
    Ok(if opcode == 0x81 {
        b.stream.u32()?
    } else {
        i32::from(b.stream.i8()?) as u32
    })
}

fn step_0f(b: &mut Builder) -> Result<Control, Error> {
    let op = b.stream.u8()?;
    match op {
        0x1F => {
            // Multi-byte NOP.
            let modrm = b.stream.modrm()?;
            b.skip_ed(modrm)?;
            Ok(Control::Next)
        }

        // MMX moves and PXOR.
        0x6F => {
            let modrm = b.stream.modrm()?;
            if modrm.is_direct() {
                let s = b.mmx_get_reg(modrm.rm());
                let d = b.mmx_get_reg_empty(modrm.reg());
                b.emit(arm::vmov_d(d, s));
            } else {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                let d = b.mmx_get_reg_empty(modrm.reg());
                b.emit(arm::vldr_d(d, wb, 0));
            }
            Ok(Control::Next)
        }
        0x7F => {
            let modrm = b.stream.modrm()?;
            let s = b.mmx_get_reg(modrm.reg());
            if modrm.is_direct() {
                let d = b.mmx_get_reg_empty(modrm.rm());
                b.emit(arm::vmov_d(d, s));
            } else {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                b.emit(arm::vstr_d(s, wb, 0));
            }
            Ok(Control::Next)
        }
        0xEF => {
            let modrm = b.stream.modrm()?;
            let d = b.mmx_get_reg(modrm.reg());
            if modrm.is_direct() {
                let s = b.mmx_get_reg(modrm.rm());
                b.emit(arm::veor_d(d, d, s));
            } else {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                b.emit(arm::vldr_d(D_SCRATCH, wb, 0));
                b.emit(arm::veor_d(d, d, D_SCRATCH));
            }
            Ok(Control::Next)
        }

        // Jcc rel32.
        0x80..=0x8F => {
            let off = b.stream.i32()?;
            let target = b.stream.addr().wrapping_add(off as u32);
            b.jcc(op & 0xF, target);
            Ok(Control::Next)
        }

        // SETcc.
        0x90..=0x9F => {
            let modrm = b.stream.modrm()?;
            b.use_flags();
            let taken = b.cc_test(op & 0xF);
            b.emit(arm::mov_imm8_cond(taken, R3, 1));
            b.emit(arm::mov_imm8_cond(taken.invert(), R3, 0));
            if modrm.is_direct() {
                let (reg, lane) = Builder::gb(modrm.rm());
                b.emit(arm::bfi(reg, R3, lane * 8, 8));
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                b.emit(arm::strb_imm(R3, wb, off));
            }
            Ok(Control::Next)
        }

        // IMUL Gv, Ev.
        0xAF => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            let (ed, _, _) = b.get_ed(modrm, R2)?;
            b.emit(arm::smull(R2, R3, gd, ed));
            b.uflag_op1(R3);
            b.emit(arm::mov_reg(gd, R2));
            b.uflag_res(gd);
            b.uflag_df(R3, DeferredOp::Imul32);
            Ok(Control::Next)
        }

        // MOVZX/MOVSX.
        0xB6 => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                let (reg, lane) = Builder::gb(modrm.rm());
                b.emit(arm::uxtb(gd, reg, lane));
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                b.emit(arm::ldrb_imm(gd, wb, off));
            }
            Ok(Control::Next)
        }
        0xB7 => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                b.emit(arm::uxth(gd, xgpr(modrm.rm()), 0));
            } else {
                let (wb, off) = b.geted(modrm, R2, 255)?;
                b.emit(arm::ldrh_imm(gd, wb, off));
            }
            Ok(Control::Next)
        }
        0xBE => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                let (reg, lane) = Builder::gb(modrm.rm());
                b.emit(arm::sxtb(gd, reg, lane));
            } else {
                let (wb, off) = b.geted(modrm, R2, 255)?;
                b.emit(arm::ldrsb_imm(gd, wb, off));
            }
            Ok(Control::Next)
        }
        0xBF => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                b.emit(arm::sxth(gd, xgpr(modrm.rm()), 0));
            } else {
                let (wb, off) = b.geted(modrm, R2, 255)?;
                b.emit(arm::ldrsh_imm(gd, wb, off));
            }
            Ok(Control::Next)
        }

        _ => Ok(Control::Unhandled),
    }
}

fn step_66(b: &mut Builder) -> Result<Control, Error> {
    let op = b.stream.u8()?;
    match op {
        0x0F => step_660f(b),
        0x90 => Ok(Control::Next),
        0x89 => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                b.emit(arm::bfi(xgpr(modrm.rm()), gd, 0, 16));
            } else {
                let (wb, off) = b.geted(modrm, R2, 255)?;
                b.emit(arm::strh_imm(gd, wb, off));
            }
            Ok(Control::Next)
        }
        0x8B => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                b.emit(arm::bfi(gd, xgpr(modrm.rm()), 0, 16));
            } else {
                let (wb, off) = b.geted(modrm, R1, 255)?;
                b.emit(arm::ldrh_imm(R1, wb, off));
                b.emit(arm::bfi(gd, R1, 0, 16));
            }
            Ok(Control::Next)
        }
        0x39 => {
            let modrm = b.stream.modrm()?;
            let gd = b.gd(modrm);
            if modrm.is_direct() {
                b.emit(arm::uxth(R1, xgpr(modrm.rm()), 0));
            } else {
                let (wb, off) = b.geted(modrm, R1, 255)?;
                b.emit(arm::ldrh_imm(R1, wb, off));
            }
            b.emit(arm::uxth(R2, gd, 0));
            b.emit_cmp16(R1, R2);
            Ok(Control::Next)
        }
        _ => Ok(Control::Unhandled),
    }
}

// Address-size override: rare in 32-bit code, left to the interpreter.
fn step_67(b: &mut Builder) -> Result<Control, Error> {
    let _ = b;
    Ok(Control::Unhandled)
}

fn step_gs(b: &mut Builder) -> Result<Control, Error> {
    let op = b.stream.u8()?;
    match op {
        // MOV eAX, GS:moffs32 (the stack-guard slot lives at GS:0x14).
        0xA1 => {
            let moffs = b.stream.u32()?;
            b.grab_tlsdata(R12);
            if moffs < 4096 {
                b.emit(arm::ldr_imm(EAX, R12, moffs as i32));
            } else {
                b.mov32(R3, moffs);
                b.emit(arm::ldr_reg_lsl(EAX, R12, R3, 0));
            }
            Ok(Control::Next)
        }
        0xA3 => {
            let moffs = b.stream.u32()?;
            b.grab_tlsdata(R12);
            if moffs < 4096 {
                b.emit(arm::str_imm(EAX, R12, moffs as i32));
            } else {
                b.mov32(R3, moffs);
                b.emit(arm::str_reg_lsl(EAX, R12, R3, 0));
            }
            Ok(Control::Next)
        }
        0x8B => {
            let modrm = b.stream.modrm()?;
            if modrm.is_direct() {
                return Ok(Control::Unhandled);
            }
            let gd = b.gd(modrm);
            let (wb, _) = b.geted(modrm, R2, 0)?;
            b.grab_tlsdata(R12);
            b.emit(arm::ldr_reg_lsl(gd, R12, wb, 0));
            Ok(Control::Next)
        }
        0x89 => {
            let modrm = b.stream.modrm()?;
            if modrm.is_direct() {
                return Ok(Control::Unhandled);
            }
            let gd = b.gd(modrm);
            let (wb, _) = b.geted(modrm, R2, 0)?;
            b.grab_tlsdata(R12);
            b.emit(arm::str_reg_lsl(gd, R12, wb, 0));
            Ok(Control::Next)
        }
        _ => Ok(Control::Unhandled),
    }
}

// LOCK prefix: serialize the few read-modify-write forms we translate
// through the context's guest lock.
fn step_f0(b: &mut Builder) -> Result<Control, Error> {
    if !matches!(b.stream.peek(0), Some(0x01 | 0x09 | 0x21 | 0x29 | 0x31)) {
        return Ok(Control::Unhandled);
    }
    let op = b.stream.u8()?;
    b.note_barrier(2);
    b.call_c(crate::context::guest_lock as usize, None);
    let ctl = alu_family(b, op >> 3, op & 7)?;
    b.call_c(crate::context::guest_unlock as usize, None);
    Ok(ctl)
}

fn step_f2(b: &mut Builder) -> Result<Control, Error> {
    if b.stream.peek(0) != Some(0x0F) {
        return Ok(Control::Unhandled);
    }
    b.stream.u8()?;
    let op = b.stream.u8()?;
    match op {
        // MOVSD.
        0x10 => {
            let modrm = b.stream.modrm()?;
            let d = b.sse_get_reg(modrm.reg());
            if modrm.is_direct() {
                let s = b.sse_get_reg(modrm.rm());
                b.emit(arm::vmov_d(d, s));
            } else {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                b.emit(arm::vldr_d(d, wb, 0));
            }
            Ok(Control::Next)
        }
        0x11 => {
            let modrm = b.stream.modrm()?;
            let s = b.sse_get_reg(modrm.reg());
            if modrm.is_direct() {
                let d = b.sse_get_reg(modrm.rm());
                b.emit(arm::vmov_d(d, s));
            } else {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                b.emit(arm::vstr_d(s, wb, 0));
            }
            Ok(Control::Next)
        }
        _ => Ok(Control::Unhandled),
    }
}

fn step_f3(b: &mut Builder) -> Result<Control, Error> {
    match b.stream.peek(0) {
        Some(0x90) => {
            // PAUSE
            b.stream.u8()?;
            b.emit(arm::nop());
            Ok(Control::Next)
        }
        Some(0x0F) => {
            b.stream.u8()?;
            let op = b.stream.u8()?;
            match op {
                // MOVSS, memory forms.
                0x10 => {
                    let modrm = b.stream.modrm()?;
                    if modrm.is_direct() {
                        return Ok(Control::Unhandled);
                    }
                    let d = b.sse_get_reg(modrm.reg());
                    let (wb, off) = b.geted(modrm, R2, 4095)?;
                    b.emit(arm::ldr_imm(R3, wb, off));
                    b.emit(arm::vmov_core_d(R1, R2, d));
                    b.emit(arm::vmov_d_core(d, R3, R2));
                    Ok(Control::Next)
                }
                0x11 => {
                    let modrm = b.stream.modrm()?;
                    if modrm.is_direct() {
                        return Ok(Control::Unhandled);
                    }
                    let s = b.sse_get_reg(modrm.reg());
                    let (wb, off) = b.geted(modrm, R2, 4095)?;
                    b.emit(arm::vmov_core_d(R1, R3, s));
                    b.emit(arm::str_imm(R1, wb, off));
                    Ok(Control::Next)
                }
                _ => Ok(Control::Unhandled),
            }
        }
        _ => Ok(Control::Unhandled),
    }
}

fn step_660f(b: &mut Builder) -> Result<Control, Error> {
    let op = b.stream.u8()?;
    match op {
        // MOVD xmm, r/m32.
        0x6E => {
            let modrm = b.stream.modrm()?;
            let d = b.sse_get_reg(modrm.reg());
            let (ed, _, _) = b.get_ed(modrm, R2)?;
            b.emit(arm::mov_imm8(R3, 0));
            b.emit(arm::vmov_d_core(d, ed, R3));
            b.emit(arm::veor_d(d + 1, d + 1, d + 1));
            Ok(Control::Next)
        }
        // MOVD r/m32, xmm.
        0x7E => {
            let modrm = b.stream.modrm()?;
            let s = b.sse_get_reg(modrm.reg());
            b.emit(arm::vmov_core_d(R1, R3, s));
            if modrm.is_direct() {
                b.emit(arm::mov_reg(xgpr(modrm.rm()), R1));
            } else {
                let (wb, off) = b.geted(modrm, R2, 4095)?;
                b.emit(arm::str_imm(R1, wb, off));
            }
            Ok(Control::Next)
        }
        // PXOR xmm, xmm/m128.
        0xEF => {
            let modrm = b.stream.modrm()?;
            let d = b.sse_get_reg(modrm.reg());
            if modrm.is_direct() {
                let s = b.sse_get_reg(modrm.rm());
                b.emit(arm::veor_d(d, d, s));
                b.emit(arm::veor_d(d + 1, d + 1, s + 1));
            } else {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                b.emit(arm::vldr_d(6, wb, 0));
                b.emit(arm::vldr_d(D_SCRATCH, wb, 8));
                b.emit(arm::veor_d(d, d, 6));
                b.emit(arm::veor_d(d + 1, d + 1, D_SCRATCH));
            }
            Ok(Control::Next)
        }
        _ => Ok(Control::Unhandled),
    }
}

fn step_x87(b: &mut Builder, opcode: u8) -> Result<Control, Error> {
    let nextop = b.stream.u8()?;
    let modrm = super::stream::ModRm(nextop);
    let i = modrm.rm();
    match opcode {
        0xD8 if modrm.is_direct() => {
            let s0 = b.x87_get_st(0);
            let si = b.x87_get_st(i);
            match modrm.reg() {
                0 => b.emit(arm::vadd_d(s0, s0, si)),
                1 => b.emit(arm::vmul_d(s0, s0, si)),
                2 | 3 => {
                    b.emit(arm::vcmp_d(s0, si));
                    b.fcom(R1, R2);
                    if modrm.reg() == 3 {
                        b.x87_do_pop();
                    }
                }
                4 => b.emit(arm::vsub_d(s0, s0, si)),
                5 => b.emit(arm::vsub_d(s0, si, s0)),
                6 => b.emit(arm::vdiv_d(s0, s0, si)),
                _ => b.emit(arm::vdiv_d(s0, si, s0)),
            }
            Ok(Control::Next)
        }
        0xD8 => {
            // Single-precision memory operand.
            let (wb, _) = b.geted(modrm, R2, 0)?;
            b.emit(arm::vldr_s(12, wb, 0));
            b.emit(arm::vcvt_f64_f32(D_SCRATCH, 12));
            let s0 = b.x87_get_st(0);
            match modrm.reg() {
                0 => b.emit(arm::vadd_d(s0, s0, D_SCRATCH)),
                1 => b.emit(arm::vmul_d(s0, s0, D_SCRATCH)),
                2 | 3 => {
                    b.emit(arm::vcmp_d(s0, D_SCRATCH));
                    b.fcom(R1, R2);
                    if modrm.reg() == 3 {
                        b.x87_do_pop();
                    }
                }
                4 => b.emit(arm::vsub_d(s0, s0, D_SCRATCH)),
                5 => b.emit(arm::vsub_d(s0, D_SCRATCH, s0)),
                6 => b.emit(arm::vdiv_d(s0, s0, D_SCRATCH)),
                _ => b.emit(arm::vdiv_d(s0, D_SCRATCH, s0)),
            }
            Ok(Control::Next)
        }

        0xD9 if modrm.is_direct() => match nextop {
            0xC0..=0xC7 => {
                let src = b.x87_get_st(i);
                let d = b.x87_do_push();
                b.emit(arm::vmov_d(d, src));
                Ok(Control::Next)
            }
            0xC8..=0xCF => {
                let s0 = b.x87_get_st(0);
                let si = b.x87_get_st(i);
                b.emit(arm::vmov_d(D_SCRATCH, s0));
                b.emit(arm::vmov_d(s0, si));
                b.emit(arm::vmov_d(si, D_SCRATCH));
                Ok(Control::Next)
            }
            0xE0 => {
                let s0 = b.x87_get_st(0);
                b.emit(arm::vneg_d(s0, s0));
                Ok(Control::Next)
            }
            0xE1 => {
                let s0 = b.x87_get_st(0);
                b.emit(arm::vabs_d(s0, s0));
                Ok(Control::Next)
            }
            0xE8 => {
                let d = b.x87_do_push();
                b.emit(arm::vmov_d_one(d));
                Ok(Control::Next)
            }
            0xEE => {
                let d = b.x87_do_push();
                b.emit(arm::mov_imm8(R2, 0));
                b.emit(arm::mov_imm8(R3, 0));
                b.emit(arm::vmov_d_core(d, R2, R3));
                Ok(Control::Next)
            }
            _ => Ok(Control::Unhandled),
        },
        0xD9 => match modrm.reg() {
            0 => {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                b.emit(arm::vldr_s(12, wb, 0));
                let d = b.x87_do_push();
                b.emit(arm::vcvt_f64_f32(d, 12));
                Ok(Control::Next)
            }
            2 | 3 => {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                let s0 = b.x87_get_st(0);
                b.emit(arm::vcvt_f32_f64(12, s0));
                b.emit(arm::vstr_s(12, wb, 0));
                if modrm.reg() == 3 {
                    b.x87_do_pop();
                }
                Ok(Control::Next)
            }
            _ => Ok(Control::Unhandled),
        },

        0xDB if (0xF0..=0xF7).contains(&nextop) => {
            // FCOMI ST0, STi.
            b.use_flags();
            let s0 = b.x87_get_st(0);
            let si = b.x87_get_st(i);
            b.emit(arm::vcmp_d(s0, si));
            b.fcomi(R1, R2);
            // The slots are authoritative again: no pending record.
            b.cleanflags = true;
            Ok(Control::Next)
        }

        0xDC if modrm.is_direct() => {
            let s0 = b.x87_get_st(0);
            let si = b.x87_get_st(i);
            match modrm.reg() {
                0 => b.emit(arm::vadd_d(si, si, s0)),
                1 => b.emit(arm::vmul_d(si, si, s0)),
                4 => b.emit(arm::vsub_d(si, s0, si)),
                5 => b.emit(arm::vsub_d(si, si, s0)),
                6 => b.emit(arm::vdiv_d(si, s0, si)),
                7 => b.emit(arm::vdiv_d(si, si, s0)),
                _ => return Ok(Control::Unhandled),
            }
            Ok(Control::Next)
        }
        0xDC => {
            // Double-precision memory operand.
            let (wb, _) = b.geted(modrm, R2, 0)?;
            b.emit(arm::vldr_d(D_SCRATCH, wb, 0));
            let s0 = b.x87_get_st(0);
            match modrm.reg() {
                0 => b.emit(arm::vadd_d(s0, s0, D_SCRATCH)),
                1 => b.emit(arm::vmul_d(s0, s0, D_SCRATCH)),
                2 | 3 => {
                    b.emit(arm::vcmp_d(s0, D_SCRATCH));
                    b.fcom(R1, R2);
                    if modrm.reg() == 3 {
                        b.x87_do_pop();
                    }
                }
                4 => b.emit(arm::vsub_d(s0, s0, D_SCRATCH)),
                5 => b.emit(arm::vsub_d(s0, D_SCRATCH, s0)),
                6 => b.emit(arm::vdiv_d(s0, s0, D_SCRATCH)),
                _ => b.emit(arm::vdiv_d(s0, D_SCRATCH, s0)),
            }
            Ok(Control::Next)
        }

        0xDD if modrm.is_direct() => match nextop {
            0xD0..=0xD7 => {
                let s0 = b.x87_get_st(0);
                let si = b.x87_get_st(i);
                b.emit(arm::vmov_d(si, s0));
                Ok(Control::Next)
            }
            0xD8..=0xDF => {
                let s0 = b.x87_get_st(0);
                let si = b.x87_get_st(i);
                b.emit(arm::vmov_d(si, s0));
                b.x87_do_pop();
                Ok(Control::Next)
            }
            _ => Ok(Control::Unhandled),
        },
        0xDD => match modrm.reg() {
            0 => {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                let d = b.x87_do_push();
                b.emit(arm::vldr_d(d, wb, 0));
                Ok(Control::Next)
            }
            2 | 3 => {
                let (wb, _) = b.geted(modrm, R2, 0)?;
                let s0 = b.x87_get_st(0);
                b.emit(arm::vstr_d(s0, wb, 0));
                if modrm.reg() == 3 {
                    b.x87_do_pop();
                }
                Ok(Control::Next)
            }
            _ => Ok(Control::Unhandled),
        },

        0xDE if modrm.is_direct() => {
            if nextop == 0xD9 {
                // FCOMPP
                let s0 = b.x87_get_st(0);
                let s1 = b.x87_get_st(1);
                b.emit(arm::vcmp_d(s0, s1));
                b.fcom(R1, R2);
                b.x87_do_pop();
                b.x87_do_pop();
                return Ok(Control::Next);
            }
            let s0 = b.x87_get_st(0);
            let si = b.x87_get_st(i);
            match nextop & 0xF8 {
                0xC0 => b.emit(arm::vadd_d(si, si, s0)),
                0xC8 => b.emit(arm::vmul_d(si, si, s0)),
                0xE0 => b.emit(arm::vsub_d(si, s0, si)),
                0xE8 => b.emit(arm::vsub_d(si, si, s0)),
                0xF0 => b.emit(arm::vdiv_d(si, s0, si)),
                0xF8 => b.emit(arm::vdiv_d(si, si, s0)),
                _ => return Ok(Control::Unhandled),
            }
            b.x87_do_pop();
            Ok(Control::Next)
        }

        _ => Ok(Control::Unhandled),
    }
}
