use num_enum::TryFromPrimitive;
use std::ptr;

/// x86 general purpose register indices, in encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum GpReg {
    Eax = 0,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

/// Segment register indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SegReg {
    Cs = 0,
    Ds,
    Ss,
    Es,
    Fs,
    Gs,
}

/// Slot indices into the unpacked flags array. The numeric values are the
/// EFLAGS bit positions, reserved positions included, so that
/// `flags[f as usize]` and the packed image never disagree on where a flag
/// lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum Flag {
    Cf = 0,
    Res1,
    Pf,
    Res3,
    Af,
    Res5,
    Zf,
    Sf,
    Tf,
    If,
    Df,
    Of,
    Iopl,
    IoplHi,
    Nt,
    Res15,
    Rf,
    Vm,
    Ac,
    Vif,
    Vip,
    Id,
}

pub const FLAG_COUNT: usize = 22;

/// 80-bit extended-precision image kept alongside each x87 slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct LongDouble {
    pub lower: u64,
    pub upper: u16,
}

/// x87 status word. TOP is a 3-bit field, everything else is a single bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct X87Status(pub u16);

impl X87Status {
    pub const IE: u16 = 1 << 0;
    pub const DE: u16 = 1 << 1;
    pub const ZE: u16 = 1 << 2;
    pub const OE: u16 = 1 << 3;
    pub const UE: u16 = 1 << 4;
    pub const PE: u16 = 1 << 5;
    pub const SF: u16 = 1 << 6;
    pub const ES: u16 = 1 << 7;
    pub const C0: u16 = 1 << 8;
    pub const C1: u16 = 1 << 9;
    pub const C2: u16 = 1 << 10;
    pub const C3: u16 = 1 << 14;
    pub const B: u16 = 1 << 15;

    /// Bits written by a floating compare.
    pub const CMP_MASK: u16 = Self::C3 | Self::C2 | Self::C1 | Self::C0;
    pub const CMP_UNORDERED: u16 = Self::C3 | Self::C2 | Self::C0;
    pub const CMP_ZERO: u16 = Self::C3;
    pub const CMP_GREATER: u16 = 0;
    pub const CMP_LESS: u16 = Self::C0;

    #[must_use]
    pub fn top(self) -> u8 {
        ((self.0 >> 11) & 7) as u8
    }

    pub fn set_top(&mut self, top: u8) {
        self.0 = (self.0 & !(7 << 11)) | (u16::from(top & 7) << 11);
    }

    #[must_use]
    pub fn test(self, bit: u16) -> bool {
        self.0 & bit != 0
    }

    pub fn assign(&mut self, bit: u16, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// One MMX register with its integer views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct MmxReg(pub u64);

impl MmxReg {
    #[must_use]
    pub fn dwords(self) -> [u32; 2] {
        [self.0 as u32, (self.0 >> 32) as u32]
    }

    #[must_use]
    pub fn words(self) -> [u16; 4] {
        let mut w = [0u16; 4];
        for (i, v) in w.iter_mut().enumerate() {
            *v = (self.0 >> (16 * i)) as u16;
        }
        w
    }

    #[must_use]
    pub fn bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

/// One SSE register. Stored as two 64-bit lanes; float views convert on
/// demand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct SseReg {
    pub q: [u64; 2],
}

impl SseReg {
    #[must_use]
    pub fn dwords(self) -> [u32; 4] {
        [
            self.q[0] as u32,
            (self.q[0] >> 32) as u32,
            self.q[1] as u32,
            (self.q[1] >> 32) as u32,
        ]
    }

    #[must_use]
    pub fn singles(self) -> [f32; 4] {
        self.dwords().map(f32::from_bits)
    }

    #[must_use]
    pub fn doubles(self) -> [f64; 2] {
        self.q.map(f64::from_bits)
    }

    pub fn set_dword(&mut self, lane: usize, value: u32) {
        let q = &mut self.q[lane >> 1];
        let shift = (lane & 1) * 32;
        *q = (*q & !(0xffff_ffffu64 << shift)) | (u64::from(value) << shift);
    }
}

/// Guest CPU state.
///
/// The layout is part of the ABI between emitted host code and the helper
/// functions: emitters embed byte offsets of individual fields, so the
/// struct is `repr(C)` and every emitter-visible offset is exported from
/// [`layout`]. Either `eflags` is current and `df` is `none`, or `df`
/// records a pending operation and the flag slots may be stale.
#[repr(C)]
pub struct CpuState {
    /// General registers, indexed by [`GpReg`].
    pub regs: [u32; 8],
    /// Instruction pointer of the next guest instruction.
    pub ip: u32,
    /// Unpacked flags, one word per EFLAGS position, each 0 or 1.
    pub flags: [u32; FLAG_COUNT],
    /// Pending deferred-flags kind, a [`crate::flags::DeferredOp`] value.
    pub df: u32,
    pub op1: u32,
    pub op2: u32,
    pub res: u32,
    /// Segment selectors, indexed by [`SegReg`].
    pub segs: [u16; 6],
    /// x87 control word.
    pub cw: u16,
    /// x87 status word.
    pub sw: X87Status,
    _pad: u16,
    /// x87 slot reference tags.
    pub tags: [u32; 8],
    /// x87 stack slots as doubles; the working representation.
    pub st: [f64; 8],
    /// 80-bit shadows for slots loaded from extended precision.
    pub st_ld: [LongDouble; 8],
    /// Bit image of the double each shadow was taken from.
    pub st_ref: [u64; 8],
    pub mmx: [MmxReg; 8],
    pub xmm: [SseReg; 8],
    /// Owning context, set by [`crate::context::EmuContext::attach_cpu`].
    /// Null for a detached state.
    pub ctx: *const crate::context::EmuContext,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regs: [0; 8],
            ip: 0,
            flags: [0; FLAG_COUNT],
            df: 0,
            op1: 0,
            op2: 0,
            res: 0,
            segs: [0; 6],
            cw: 0x037f,
            sw: X87Status::default(),
            _pad: 0,
            tags: [0; 8],
            st: [0.0; 8],
            st_ld: [LongDouble::default(); 8],
            st_ref: [0; 8],
            mmx: [MmxReg::default(); 8],
            xmm: [SseReg::default(); 8],
            ctx: ptr::null(),
        }
    }

    #[must_use]
    pub fn reg32(&self, r: GpReg) -> u32 {
        self.regs[r as usize]
    }

    pub fn set_reg32(&mut self, r: GpReg, v: u32) {
        self.regs[r as usize] = v;
    }

    #[must_use]
    pub fn reg16(&self, r: GpReg) -> u16 {
        self.regs[r as usize] as u16
    }

    pub fn set_reg16(&mut self, r: GpReg, v: u16) {
        let slot = &mut self.regs[r as usize];
        *slot = (*slot & 0xffff_0000) | u32::from(v);
    }

    /// 8-bit register view in encoding order: 0..4 are AL/CL/DL/BL, 4..8 are
    /// AH/CH/DH/BH.
    #[must_use]
    pub fn reg8(&self, code: u8) -> u8 {
        let shift = (code >> 2) * 8;
        (self.regs[(code & 3) as usize] >> shift) as u8
    }

    pub fn set_reg8(&mut self, code: u8, v: u8) {
        let shift = u32::from(code >> 2) * 8;
        let slot = &mut self.regs[(code & 3) as usize];
        *slot = (*slot & !(0xffu32 << shift)) | (u32::from(v) << shift);
    }

    #[must_use]
    pub fn seg(&self, s: SegReg) -> u16 {
        self.segs[s as usize]
    }

    #[must_use]
    pub fn flag(&self, f: Flag) -> bool {
        self.flags[f as usize] != 0
    }

    pub fn set_flag(&mut self, f: Flag, v: bool) {
        self.flags[f as usize] = u32::from(v);
    }

    /// Record a deferred flags operation, leaving the flag slots stale until
    /// the next materialization.
    pub fn set_deferred(&mut self, op: crate::flags::DeferredOp, op1: u32, op2: u32, res: u32) {
        self.df = op.into();
        self.op1 = op1;
        self.op2 = op2;
        self.res = res;
    }
}

/// Byte offsets of the fields emitted host code addresses directly. Keeping
/// them in one generated table means a layout change cannot desync the
/// emitters from the helpers.
pub mod layout {
    use super::{CpuState, Flag};
    use core::mem::offset_of;

    pub const REGS: usize = offset_of!(CpuState, regs);
    pub const IP: usize = offset_of!(CpuState, ip);
    pub const FLAGS: usize = offset_of!(CpuState, flags);
    pub const DF: usize = offset_of!(CpuState, df);
    pub const OP1: usize = offset_of!(CpuState, op1);
    pub const OP2: usize = offset_of!(CpuState, op2);
    pub const RES: usize = offset_of!(CpuState, res);
    pub const SEGS: usize = offset_of!(CpuState, segs);
    pub const CW: usize = offset_of!(CpuState, cw);
    pub const SW: usize = offset_of!(CpuState, sw);
    pub const TAGS: usize = offset_of!(CpuState, tags);
    pub const ST: usize = offset_of!(CpuState, st);
    pub const MMX: usize = offset_of!(CpuState, mmx);
    pub const XMM: usize = offset_of!(CpuState, xmm);

    #[must_use]
    pub const fn gpr(index: usize) -> usize {
        REGS + 4 * index
    }

    #[must_use]
    pub const fn flag(f: Flag) -> usize {
        FLAGS + 4 * f as usize
    }

    #[must_use]
    pub const fn st(index: usize) -> usize {
        ST + 8 * index
    }

    #[must_use]
    pub const fn mmx(index: usize) -> usize {
        MMX + 8 * index
    }

    #[must_use]
    pub const fn xmm(index: usize) -> usize {
        XMM + 16 * index
    }
}

#[test]
fn test_reg_views() {
    let mut cpu = CpuState::new();
    cpu.set_reg32(GpReg::Eax, 0x1234_5678);
    assert_eq!(0x1234_5678, cpu.reg32(GpReg::Eax));
    assert_eq!(0x5678, cpu.reg16(GpReg::Eax));
    assert_eq!(0x78, cpu.reg8(0)); // AL
    assert_eq!(0x56, cpu.reg8(4)); // AH
    cpu.set_reg8(4, 0xab);
    assert_eq!(0x12ab_5678, cpu.reg32(GpReg::Eax));
    cpu.set_reg16(GpReg::Eax, 0xbeef);
    assert_eq!(0x12ab_beef, cpu.reg32(GpReg::Eax));
}

#[test]
fn test_layout_offsets() {
    // Flag slots are one word apart, in bit-position order.
    assert_eq!(layout::flag(Flag::Cf) + 8, layout::flag(Flag::Pf));
    assert_eq!(layout::flag(Flag::Df), layout::FLAGS + 4 * 10);
    assert_eq!(layout::DF, layout::FLAGS + 4 * FLAG_COUNT);
    assert_eq!(layout::OP1, layout::DF + 4);
    assert_eq!(layout::RES, layout::OP2 + 4);
    // Emitted load/store offsets must fit the immediate forms.
    assert!(layout::xmm(7) + 8 < 4096);
}

#[test]
fn test_status_word() {
    let mut sw = X87Status::default();
    sw.set_top(5);
    assert_eq!(5, sw.top());
    sw.assign(X87Status::C3, true);
    assert!(sw.test(X87Status::C3));
    sw.set_top(2);
    assert_eq!(2, sw.top());
    assert!(sw.test(X87Status::C3));
}
