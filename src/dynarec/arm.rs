//! A32 instruction encodings.
//!
//! The emission vocabulary used by the translator passes: each function
//! returns one instruction word. Register conventions for translated code:
//! `r0` holds the guest state pointer, `r1`-`r3` and `r12` are scratch, and
//! `r4`-`r11` permanently cache the eight guest general registers, so guest
//! register `r` lives in host register [`xgpr`]`(r)`. No spilling.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub type HostReg = u8;

/// Guest state pointer.
pub const R_EMU: HostReg = 0;
pub const R1: HostReg = 1;
pub const R2: HostReg = 2;
pub const R3: HostReg = 3;
/// First cached guest register; EAX..EDI live in r4..r11.
pub const R_GPR0: HostReg = 4;
pub const R12: HostReg = 12;
pub const SP: HostReg = 13;
pub const LR: HostReg = 14;
pub const PC: HostReg = 15;

/// Host register caching guest register `r` (0..8).
#[must_use]
pub const fn xgpr(r: u8) -> HostReg {
    R_GPR0 + (r & 7)
}

/// A32 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
    Al,
}

impl Cond {
    /// The opposite condition.
    #[must_use]
    pub fn invert(self) -> Self {
        debug_assert!(self != Self::Al);
        Self::try_from(u8::from(self) ^ 1).unwrap_or(Self::Al)
    }
}

const fn c(cond: Cond) -> u32 {
    (cond as u32) << 28
}

const fn rd(r: HostReg) -> u32 {
    (r as u32) << 12
}

const fn rn(r: HostReg) -> u32 {
    (r as u32) << 16
}

const fn rm(r: HostReg) -> u32 {
    r as u32
}

const fn rs(r: HostReg) -> u32 {
    (r as u32) << 8
}

// Data processing, register operands.

#[must_use]
pub const fn mov_reg_cond(cond: Cond, d: HostReg, m: HostReg) -> u32 {
    c(cond) | 0x01A0_0000 | rd(d) | rm(m)
}

#[must_use]
pub const fn mov_reg(d: HostReg, m: HostReg) -> u32 {
    mov_reg_cond(Cond::Al, d, m)
}

#[must_use]
pub const fn add_reg(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE080_0000 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn add_reg_lsl(d: HostReg, n: HostReg, m: HostReg, lsl: u32) -> u32 {
    0xE080_0000 | rn(n) | rd(d) | (lsl << 7) | rm(m)
}

#[must_use]
pub const fn sub_reg(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE040_0000 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn and_reg(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE000_0000 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn orr_reg(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE180_0000 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn eor_reg(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE020_0000 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn bic_reg(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE1C0_0000 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn cmp_reg(n: HostReg, m: HostReg) -> u32 {
    0xE150_0000 | rn(n) | rm(m)
}

#[must_use]
pub const fn tst_reg(n: HostReg, m: HostReg) -> u32 {
    0xE110_0000 | rn(n) | rm(m)
}

#[must_use]
pub fn lsl_imm(d: HostReg, m: HostReg, shift: u32) -> u32 {
    debug_assert!(shift < 32);
    0xE1A0_0000 | rd(d) | (shift << 7) | rm(m)
}

#[must_use]
pub fn lsr_imm(d: HostReg, m: HostReg, shift: u32) -> u32 {
    debug_assert!(shift >= 1 && shift < 33);
    0xE1A0_0020 | rd(d) | ((shift & 31) << 7) | rm(m)
}

#[must_use]
pub fn asr_imm(d: HostReg, m: HostReg, shift: u32) -> u32 {
    debug_assert!(shift >= 1 && shift < 33);
    0xE1A0_0040 | rd(d) | ((shift & 31) << 7) | rm(m)
}

#[must_use]
pub fn lsl_reg(d: HostReg, m: HostReg, s: HostReg) -> u32 {
    0xE1A0_0010 | rd(d) | rs(s) | rm(m)
}

#[must_use]
pub fn lsr_reg(d: HostReg, m: HostReg, s: HostReg) -> u32 {
    0xE1A0_0030 | rd(d) | rs(s) | rm(m)
}

#[must_use]
pub fn asr_reg(d: HostReg, m: HostReg, s: HostReg) -> u32 {
    0xE1A0_0050 | rd(d) | rs(s) | rm(m)
}

// Data processing, 8-bit immediates (rotation unused).

#[must_use]
pub fn mov_imm8_cond(cond: Cond, d: HostReg, imm: u32) -> u32 {
    debug_assert!(imm < 256);
    c(cond) | 0x03A0_0000 | rd(d) | imm
}

#[must_use]
pub fn mov_imm8(d: HostReg, imm: u32) -> u32 {
    mov_imm8_cond(Cond::Al, d, imm)
}

#[must_use]
pub fn add_imm(d: HostReg, n: HostReg, imm: u32) -> u32 {
    debug_assert!(imm < 256);
    0xE280_0000 | rn(n) | rd(d) | imm
}

#[must_use]
pub fn sub_imm(d: HostReg, n: HostReg, imm: u32) -> u32 {
    debug_assert!(imm < 256);
    0xE240_0000 | rn(n) | rd(d) | imm
}

#[must_use]
pub fn and_imm(d: HostReg, n: HostReg, imm: u32) -> u32 {
    debug_assert!(imm < 256);
    0xE200_0000 | rn(n) | rd(d) | imm
}

#[must_use]
pub fn cmp_imm(n: HostReg, imm: u32) -> u32 {
    debug_assert!(imm < 256);
    0xE350_0000 | rn(n) | imm
}

// Wide moves.

#[must_use]
pub fn movw_cond(cond: Cond, d: HostReg, imm: u16) -> u32 {
    let imm = u32::from(imm);
    c(cond) | 0x0300_0000 | ((imm >> 12) << 16) | rd(d) | (imm & 0xfff)
}

#[must_use]
pub fn movw(d: HostReg, imm: u16) -> u32 {
    movw_cond(Cond::Al, d, imm)
}

#[must_use]
pub fn movt(d: HostReg, imm: u16) -> u32 {
    let imm = u32::from(imm);
    0xE340_0000 | ((imm >> 12) << 16) | rd(d) | (imm & 0xfff)
}

// Multiplies.

#[must_use]
pub const fn mul(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE000_0090 | ((d as u32) << 16) | rs(m) | rm(n)
}

#[must_use]
pub const fn umull(dlo: HostReg, dhi: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE080_0090 | ((dhi as u32) << 16) | rd(dlo) | rs(m) | rm(n)
}

#[must_use]
pub const fn smull(dlo: HostReg, dhi: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xE0C0_0090 | ((dhi as u32) << 16) | rd(dlo) | rs(m) | rm(n)
}

// Loads and stores.

fn mem_word(base: u32, t: HostReg, n: HostReg, off: i32) -> u32 {
    let (u, off) = if off < 0 { (0, -off) } else { (1 << 23, off) };
    debug_assert!(off < 4096);
    base | u | rn(n) | rd(t) | off as u32
}

#[must_use]
pub fn ldr_imm(t: HostReg, n: HostReg, off: i32) -> u32 {
    mem_word(0xE510_0000, t, n, off)
}

#[must_use]
pub fn str_imm(t: HostReg, n: HostReg, off: i32) -> u32 {
    mem_word(0xE500_0000, t, n, off)
}

#[must_use]
pub fn ldrb_imm(t: HostReg, n: HostReg, off: i32) -> u32 {
    mem_word(0xE550_0000, t, n, off)
}

#[must_use]
pub fn strb_imm(t: HostReg, n: HostReg, off: i32) -> u32 {
    mem_word(0xE540_0000, t, n, off)
}

fn mem_half(base: u32, t: HostReg, n: HostReg, off: i32) -> u32 {
    let (u, off) = if off < 0 { (0, -off) } else { (1 << 23, off) };
    debug_assert!(off < 256);
    let off = off as u32;
    base | u | rn(n) | rd(t) | ((off >> 4) << 8) | (off & 0xf)
}

#[must_use]
pub fn ldrh_imm(t: HostReg, n: HostReg, off: i32) -> u32 {
    mem_half(0xE150_00B0, t, n, off)
}

#[must_use]
pub fn strh_imm(t: HostReg, n: HostReg, off: i32) -> u32 {
    mem_half(0xE140_00B0, t, n, off)
}

#[must_use]
pub fn ldrsb_imm(t: HostReg, n: HostReg, off: i32) -> u32 {
    mem_half(0xE150_00D0, t, n, off)
}

#[must_use]
pub fn ldrsh_imm(t: HostReg, n: HostReg, off: i32) -> u32 {
    mem_half(0xE150_00F0, t, n, off)
}

#[must_use]
pub fn ldr_reg_lsl(t: HostReg, n: HostReg, m: HostReg, lsl: u32) -> u32 {
    debug_assert!(lsl < 4);
    0xE790_0000 | rn(n) | rd(t) | (lsl << 7) | rm(m)
}

#[must_use]
pub fn str_reg_lsl(t: HostReg, n: HostReg, m: HostReg, lsl: u32) -> u32 {
    debug_assert!(lsl < 4);
    0xE780_0000 | rn(n) | rd(t) | (lsl << 7) | rm(m)
}

// Extends and bitfields. `ror` selects the source byte lane (0..3 for
// rotations of 0/8/16/24).

#[must_use]
pub fn uxtb(d: HostReg, m: HostReg, ror: u32) -> u32 {
    debug_assert!(ror < 4);
    0xE6EF_0070 | rd(d) | (ror << 10) | rm(m)
}

#[must_use]
pub fn sxtb(d: HostReg, m: HostReg, ror: u32) -> u32 {
    debug_assert!(ror < 4);
    0xE6AF_0070 | rd(d) | (ror << 10) | rm(m)
}

#[must_use]
pub fn uxth(d: HostReg, m: HostReg, ror: u32) -> u32 {
    debug_assert!(ror < 4);
    0xE6FF_0070 | rd(d) | (ror << 10) | rm(m)
}

#[must_use]
pub fn sxth(d: HostReg, m: HostReg, ror: u32) -> u32 {
    debug_assert!(ror < 4);
    0xE6BF_0070 | rd(d) | (ror << 10) | rm(m)
}

#[must_use]
pub fn bfi(d: HostReg, n: HostReg, lsb: u32, width: u32) -> u32 {
    debug_assert!(width >= 1 && lsb + width <= 32);
    0xE7C0_0010 | ((lsb + width - 1) << 16) | rd(d) | (lsb << 7) | rm(n)
}

#[must_use]
pub fn ubfx(d: HostReg, n: HostReg, lsb: u32, width: u32) -> u32 {
    debug_assert!(width >= 1 && lsb + width <= 32);
    0xE7E0_0050 | ((width - 1) << 16) | rd(d) | (lsb << 7) | rm(n)
}

// Branches. `rel` is the byte displacement already adjusted for the
// pipeline, measured from the branch's own address plus 8.

#[must_use]
pub fn b_rel(cond: Cond, rel: i32) -> u32 {
    debug_assert_eq!(0, rel & 3);
    c(cond) | 0x0A00_0000 | ((rel >> 2) as u32 & 0x00ff_ffff)
}

#[must_use]
pub const fn bx(m: HostReg) -> u32 {
    0xE12F_FF10 | rm(m)
}

#[must_use]
pub const fn blx_reg(m: HostReg) -> u32 {
    0xE12F_FF30 | rm(m)
}

// Stack.

#[must_use]
pub const fn push(mask: u16) -> u32 {
    0xE92D_0000 | mask as u32
}

#[must_use]
pub const fn pop(mask: u16) -> u32 {
    0xE8BD_0000 | mask as u32
}

#[must_use]
pub const fn nop() -> u32 {
    0xE320_F000
}

// VFP, double precision. Offsets are in bytes, multiples of 4.

fn vfp_mem(base: u32, d: HostReg, n: HostReg, off: i32) -> u32 {
    let (u, off) = if off < 0 { (0, -off) } else { (1 << 23, off) };
    debug_assert_eq!(0, off & 3);
    debug_assert!(off / 4 < 256);
    base | u | rn(n) | rd(d) | (off as u32 / 4)
}

#[must_use]
pub fn vldr_d(d: HostReg, n: HostReg, off: i32) -> u32 {
    vfp_mem(0xED10_0B00, d, n, off)
}

#[must_use]
pub fn vstr_d(d: HostReg, n: HostReg, off: i32) -> u32 {
    vfp_mem(0xED00_0B00, d, n, off)
}

#[must_use]
pub fn vldr_s(s: HostReg, n: HostReg, off: i32) -> u32 {
    let word = vfp_mem(0xED10_0A00, s >> 1, n, off);
    word | (u32::from(s) & 1) << 22
}

#[must_use]
pub fn vstr_s(s: HostReg, n: HostReg, off: i32) -> u32 {
    let word = vfp_mem(0xED00_0A00, s >> 1, n, off);
    word | (u32::from(s) & 1) << 22
}

#[must_use]
pub const fn vmov_d(d: HostReg, m: HostReg) -> u32 {
    0xEEB0_0B40 | rd(d) | rm(m)
}

/// VMOV.F64 Dd, #1.0
#[must_use]
pub const fn vmov_d_one(d: HostReg) -> u32 {
    0xEEB7_0B00 | rd(d)
}

/// VMOV Dd, Rt, Rt2 (build a double from two core registers).
#[must_use]
pub const fn vmov_d_core(d: HostReg, t: HostReg, t2: HostReg) -> u32 {
    0xEC40_0B10 | rn(t2) | rd(t) | rm(d)
}

/// VMOV Rt, Rt2, Dm (split a double into two core registers).
#[must_use]
pub const fn vmov_core_d(t: HostReg, t2: HostReg, m: HostReg) -> u32 {
    0xEC50_0B10 | rn(t2) | rd(t) | rm(m)
}

#[must_use]
pub const fn vadd_d(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xEE30_0B00 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn vsub_d(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xEE30_0B40 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn vmul_d(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xEE20_0B00 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn vdiv_d(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xEE80_0B00 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn vneg_d(d: HostReg, m: HostReg) -> u32 {
    0xEEB1_0B40 | rd(d) | rm(m)
}

#[must_use]
pub const fn vabs_d(d: HostReg, m: HostReg) -> u32 {
    0xEEB0_0BC0 | rd(d) | rm(m)
}

#[must_use]
pub const fn vcmp_d(d: HostReg, m: HostReg) -> u32 {
    0xEEB4_0B40 | rd(d) | rm(m)
}

/// VMRS APSR_nzcv, FPSCR
#[must_use]
pub const fn vmrs_apsr() -> u32 {
    0xEEF1_FA10
}

/// VCVT.F64.F32 Dd, Sm
#[must_use]
pub const fn vcvt_f64_f32(d: HostReg, s: HostReg) -> u32 {
    0xEEB7_0AC0 | rd(d) | ((s as u32) >> 1) | ((s as u32 & 1) << 5)
}

/// VCVT.F32.F64 Sd, Dm
#[must_use]
pub const fn vcvt_f32_f64(s: HostReg, m: HostReg) -> u32 {
    0xEEB7_0BC0 | rd(s >> 1) | ((s as u32 & 1) << 22) | rm(m)
}

/// VSTMDB sp!, {d0-d7}
#[must_use]
pub const fn vpush_d0_d7() -> u32 {
    0xED2D_0B10
}

/// VLDMIA sp!, {d0-d7}
#[must_use]
pub const fn vpop_d0_d7() -> u32 {
    0xECBD_0B10
}

// NEON, 64-bit logical.

#[must_use]
pub const fn vorr_d(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xF220_0110 | rn(n) | rd(d) | rm(m)
}

#[must_use]
pub const fn veor_d(d: HostReg, n: HostReg, m: HostReg) -> u32 {
    0xF300_0110 | rn(n) | rd(d) | rm(m)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_encodings() {
        assert_eq!(0xE1A0_0001, mov_reg(0, 1));
        assert_eq!(0xE301_1234, movw(1, 0x1234));
        assert_eq!(0xE345_5678, movt(5, 0x5678));
        assert_eq!(0xE081_0002, add_reg(0, 1, 2));
        assert_eq!(0xE281_0004, add_imm(0, 1, 4));
        assert_eq!(0xE041_0002, sub_reg(0, 1, 2));
        assert_eq!(0xE350_0001, cmp_imm(0, 1));
        assert_eq!(0xE110_0001, tst_reg(0, 1));
        assert_eq!(0xE000_0291, mul(0, 1, 2));
        assert_eq!(0xE081_0392, umull(0, 1, 2, 3));
    }

    #[test]
    fn test_mem_encodings() {
        assert_eq!(0xE590_1004, ldr_imm(1, 0, 4));
        assert_eq!(0xE510_1004, ldr_imm(1, 0, -4));
        assert_eq!(0xE580_1004, str_imm(1, 0, 4));
        assert_eq!(0xE5D0_1004, ldrb_imm(1, 0, 4));
        assert_eq!(0xE1D0_10B4, ldrh_imm(1, 0, 4));
        assert_eq!(0xE1C0_10B4, strh_imm(1, 0, 4));
        assert_eq!(0xE1D0_11B2, ldrh_imm(1, 0, 0x12));
        assert_eq!(0xE790_1102, ldr_reg_lsl(1, 0, 2, 2));
    }

    #[test]
    fn test_branch_encodings() {
        assert_eq!(0xE12F_FF1E, bx(LR));
        assert_eq!(0xE12F_FF3C, blx_reg(R12));
        // Branch to self.
        assert_eq!(0xEAFF_FFFE, b_rel(Cond::Al, -8));
        assert_eq!(0x0A00_0000, b_rel(Cond::Eq, 0) & 0xFF00_0000);
        assert_eq!(0xE92D_500F, push(0x500F));
        assert_eq!(0xE8BD_000F, pop(0x000F));
    }

    #[test]
    fn test_bitfield_encodings() {
        assert_eq!(0xE6EF_0071, uxtb(0, 1, 0));
        assert_eq!(0xE6FF_0071, uxth(0, 1, 0));
        assert_eq!(0xE7C7_3012, bfi(3, 2, 0, 8));
        assert_eq!(0xE7E3_0451, ubfx(0, 1, 8, 4));
    }

    #[test]
    fn test_vfp_encodings() {
        assert_eq!(0xED90_0B02, vldr_d(0, 0, 8));
        assert_eq!(0xED80_0B02, vstr_d(0, 0, 8));
        assert_eq!(0xEDD0_0A01, vldr_s(1, 0, 4));
        assert_eq!(0xEEB0_0B41, vmov_d(0, 1));
        assert_eq!(0xEE31_0B02, vadd_d(0, 1, 2));
        assert_eq!(0xEE31_0B42, vsub_d(0, 1, 2));
        assert_eq!(0xEEB4_0B41, vcmp_d(0, 1));
        assert_eq!(0xEEF1_FA10, vmrs_apsr());
        assert_eq!(0xF221_0112, vorr_d(0, 1, 2));
        assert_eq!(0xF301_0112, veor_d(0, 1, 2));
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::Ne, Cond::Eq.invert());
        assert_eq!(Cond::Eq, Cond::Ne.invert());
        assert_eq!(Cond::Ge, Cond::Lt.invert());
    }
}
