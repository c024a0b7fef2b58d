//! AArch64 ISA: binary code emission.
//!
//! Register map: `r0..r3` = x0..x3 (doubling as the argument/return
//! registers), `s0..s3` = x19..x22, locals base = sp, encoder temporaries
//! x16/x17 (the linker-scratch pair), floats `fr0..fr3` = d0..d3 with
//! d8..d11 available as callee-saved.
//!
//! All jump stream sizes are fixed at emission except conditional label
//! branches, which may grow from `b.cond` to an inverted-skip plus `b`
//! when the ±1 MiB range is exceeded. Rewritable targets are materialized
//! with a full `movz`/`movk` sequence so patches rewrite instruction
//! immediates in place.

use crate::abi::AbiProfile;
use crate::buffer::{
    ByteSink, CodeBuffer, CodeOffset, CodeSink, Const, FixTarget, FixupKind, Jump, JumpData,
    JumpTarget,
};
use crate::condcodes::{CondCode, FloatCond};
use crate::isa::{Arch, Backend, IsaLimits};
use crate::lir::{FOp1, FOp2, FlagsOp, JumpKind, JumpType, Mods, Op0, Op1, Op2};
use crate::operand::{FOperand, FReg, Mem, Operand, Reg};
use crate::{CodegenResult, Error};

const TMP0: u8 = 16;
const TMP1: u8 = 17;
/// Address-only temporary for far displacements; never carries data.
const TMP2: u8 = 15;
const FTMP: u8 = 30;
const LR: u8 = 30;
const FP: u8 = 29;
const ZR: u8 = 31;
const SP: u8 = 31;

/// Virtual-to-native map: r0..r3, s0..s3, sp.
const MAP: [u8; 9] = [0, 1, 2, 3, 19, 20, 21, 22, SP];

const NOP: u32 = 0xd503_201f;

fn cond_bits(cc: CondCode) -> u32 {
    match cc {
        CondCode::Equal => 0x0,
        CondCode::NotEqual => 0x1,
        CondCode::Carry | CondCode::GreaterEqual => 0x2,
        CondCode::NotCarry | CondCode::Less => 0x3,
        CondCode::Greater => 0x8,
        CondCode::LessEqual => 0x9,
        CondCode::SigGreaterEqual => 0xa,
        CondCode::SigLess => 0xb,
        CondCode::SigGreater => 0xc,
        CondCode::SigLessEqual => 0xd,
        CondCode::Overflow => 0x6,
        CondCode::NotOverflow => 0x7,
    }
}

fn fcond_bits(cc: FloatCond) -> u32 {
    match cc {
        FloatCond::Equal => 0x0,
        FloatCond::NotEqual => 0x1,
        FloatCond::Less => 0x4,      // mi: N set only on an ordered less
        FloatCond::GreaterEqual => 0xa,
        FloatCond::Greater => 0xc,
        FloatCond::LessEqual => 0x9, // ls: !C or Z, false on unordered
        FloatCond::Ordered => 0x7,   // vc
        FloatCond::Unordered => 0x6, // vs
    }
}

fn invert_cond(bits: u32) -> u32 {
    bits ^ 1
}

// ---- word builders ------------------------------------------------------

fn enc_arith_rrr(bits_31_21: u32, rd: u8, rn: u8, rm: u8) -> u32 {
    (bits_31_21 << 21) | (u32::from(rm) << 16) | (u32::from(rn) << 5) | u32::from(rd)
}

fn enc_addsub_imm(op_31_24: u32, imm12: u32, rn: u8, rd: u8) -> u32 {
    debug_assert!(imm12 < (1 << 12));
    (op_31_24 << 24) | (imm12 << 10) | (u32::from(rn) << 5) | u32::from(rd)
}

fn enc_move_wide(op: u32, rd: u8, imm16: u32, shift: u32) -> u32 {
    debug_assert!(imm16 < (1 << 16) && shift < 4);
    op | (shift << 21) | (imm16 << 5) | u32::from(rd)
}

/// Load/store, unsigned scaled offset form.
fn enc_ldst_uimm(size: u32, v: u32, opc: u32, imm12: u32, rn: u8, rt: u8) -> u32 {
    debug_assert!(imm12 < (1 << 12));
    (size << 30)
        | (0b111 << 27)
        | (v << 26)
        | (0b01 << 24)
        | (opc << 22)
        | (imm12 << 10)
        | (u32::from(rn) << 5)
        | u32::from(rt)
}

/// Load/store, unscaled 9-bit signed offset form.
fn enc_ldst_simm9(size: u32, v: u32, opc: u32, simm9: i32, rn: u8, rt: u8) -> u32 {
    debug_assert!((-256..=255).contains(&simm9));
    (size << 30)
        | (0b111 << 27)
        | (v << 26)
        | (opc << 22)
        | (((simm9 as u32) & 0x1ff) << 12)
        | (u32::from(rn) << 5)
        | u32::from(rt)
}

fn enc_jump26(op_31_26: u32, off26: i32) -> u32 {
    debug_assert!((-(1 << 25)..(1 << 25)).contains(&off26));
    (op_31_26 << 26) | ((off26 as u32) & 0x03ff_ffff)
}

fn enc_cbr(off19: i32, cond: u32) -> u32 {
    debug_assert!((-(1 << 18)..(1 << 18)).contains(&off19));
    0x5400_0000 | (((off19 as u32) & 0x7_ffff) << 5) | cond
}

fn enc_fp_rrr(bits_15_10: u32, rd: u8, rn: u8, rm: u8) -> u32 {
    0x1e60_0000
        | (u32::from(rm) << 16)
        | (bits_15_10 << 10)
        | (u32::from(rn) << 5)
        | u32::from(rd)
}

pub(crate) struct A64Backend {
    /// Overflow was synthesized through the zero flag by the last
    /// flag-setting op (wide multiply check); remaps the predicate.
    ov_from_z: bool,
}

impl A64Backend {
    pub(crate) fn new() -> Self {
        A64Backend { ov_from_z: false }
    }

    fn hw(&self, r: Reg) -> u8 {
        MAP[r.index() as usize]
    }

    fn cond_of(&self, cc: CondCode) -> u32 {
        if self.ov_from_z {
            match cc {
                CondCode::Overflow => return 0x1,    // ne
                CondCode::NotOverflow => return 0x0, // eq
                _ => {}
            }
        }
        cond_bits(cc)
    }

    fn put(&self, buf: &mut dyn ByteSink, word: u32) {
        buf.put4(word);
    }

    /// Move a register that may be the stack pointer into a plain GPR
    /// context, returning the usable register number.
    fn reg_or_sp(&self, buf: &mut CodeBuffer, r: Reg, tmp: u8) -> u8 {
        let native = self.hw(r);
        if native == SP {
            // add tmp, sp, #0
            self.put(buf, enc_addsub_imm(0x91, 0, SP, tmp));
            tmp
        } else {
            native
        }
    }

    /// Materialize an arbitrary immediate with the shortest movz/movn +
    /// movk sequence.
    fn load_imm(&self, buf: &mut dyn ByteSink, rd: u8, value: u64) {
        let halves = [
            (value & 0xffff) as u32,
            ((value >> 16) & 0xffff) as u32,
            ((value >> 32) & 0xffff) as u32,
            ((value >> 48) & 0xffff) as u32,
        ];
        let zeros = halves.iter().filter(|h| **h == 0).count();
        let ones = halves.iter().filter(|h| **h == 0xffff).count();
        if ones > zeros {
            // movn seeds all-ones halves.
            let first = halves.iter().position(|h| *h != 0xffff).unwrap_or(0);
            self.put(
                buf,
                enc_move_wide(0x9280_0000, rd, halves[first] ^ 0xffff, first as u32),
            );
            for (i, half) in halves.iter().enumerate() {
                if i != first && *half != 0xffff {
                    self.put(buf, enc_move_wide(0xf280_0000, rd, *half, i as u32));
                }
            }
        } else {
            let first = halves.iter().position(|h| *h != 0).unwrap_or(0);
            self.put(
                buf,
                enc_move_wide(0xd280_0000, rd, halves[first], first as u32),
            );
            for (i, half) in halves.iter().enumerate() {
                if i != first && *half != 0 {
                    self.put(buf, enc_move_wide(0xf280_0000, rd, *half, i as u32));
                }
            }
        }
    }

    /// The fixed-length patchable form: movz + 3×movk.
    fn load_imm_patchable(&self, sink: &mut dyn ByteSink, rd: u8, value: u64) {
        self.put(sink, enc_move_wide(0xd280_0000, rd, (value & 0xffff) as u32, 0));
        for i in 1..4u32 {
            self.put(
                sink,
                enc_move_wide(0xf280_0000, rd, ((value >> (16 * i)) & 0xffff) as u32, i),
            );
        }
    }

    /// mov rd, rm (orr rd, xzr, rm).
    fn mov_rr(&self, buf: &mut dyn ByteSink, rd: u8, rm: u8) {
        self.put(buf, enc_arith_rrr(0b10101010000, rd, ZR, rm));
    }

    /// Resolve a memory operand into (base, disp) with any index folded
    /// into TMP1.
    fn lower_base(&self, buf: &mut CodeBuffer, m: &Mem) -> CodegenResult<(u8, i64)> {
        match (m.base, m.index) {
            (None, None) => {
                self.load_imm(buf, TMP1, m.disp as u64);
                Ok((TMP1, 0))
            }
            (Some(base), None) => Ok((self.hw(base), m.disp)),
            (base, Some((index, shift))) => {
                let bn = match base {
                    Some(b) => self.hw(b),
                    None => ZR,
                };
                // add tmp1, base, index, lsl #shift
                let word = enc_arith_rrr(0b10001011000, TMP1, bn, self.hw(index))
                    | (u32::from(shift) << 10);
                self.put(buf, word);
                Ok((TMP1, m.disp))
            }
        }
    }

    /// Emit a load or store of `rt` at `[m]` with the given access scale
    /// (log2 bytes) and opc (00 store, 01 load, 10 sign-load to 64-bit).
    fn ldst(
        &self,
        buf: &mut CodeBuffer,
        size: u32,
        v: u32,
        opc: u32,
        rt: u8,
        m: &Mem,
    ) -> CodegenResult<()> {
        let (base, disp) = self.lower_base(buf, m)?;
        let scale = size;
        if disp >= 0 && (disp as u64) % (1 << scale) == 0 && (disp >> scale) < (1 << 12) {
            self.put(
                buf,
                enc_ldst_uimm(size, v, opc, (disp >> scale) as u32, base, rt),
            );
        } else if (-256..=255).contains(&disp) {
            // Unscaled simm9 with the "no writeback" bits.
            self.put(
                buf,
                enc_ldst_simm9(size, v, opc, disp as i32, base, rt),
            );
        } else {
            // Far displacement: fold it into the address-only temporary.
            // The extended-register add accepts SP as the base.
            self.load_imm(buf, TMP2, disp as u64);
            self.put(
                buf,
                0x8b20_6000 | (u32::from(TMP2) << 16) | (u32::from(base) << 5) | u32::from(TMP2),
            );
            self.put(buf, enc_ldst_uimm(size, v, opc, 0, TMP2, rt));
        }
        Ok(())
    }

    /// Load an integer operand into a plain register.
    fn load_operand(
        &self,
        buf: &mut CodeBuffer,
        want: u8,
        src: Operand,
    ) -> CodegenResult<u8> {
        match src {
            Operand::Reg(s) => {
                let native = self.hw(s);
                if native == SP {
                    self.put(buf, enc_addsub_imm(0x91, 0, SP, want));
                    Ok(want)
                } else {
                    Ok(native)
                }
            }
            Operand::Imm(v) => {
                self.load_imm(buf, want, v as u64);
                Ok(want)
            }
            Operand::Mem(m) => {
                self.ldst(buf, 0b11, 0, 0b01, want, &m)?;
                Ok(want)
            }
        }
    }

    fn store_result(&self, buf: &mut CodeBuffer, work: u8, dst: Operand) -> CodegenResult<()> {
        match dst {
            Operand::Reg(d) => {
                let native = self.hw(d);
                debug_assert!(native != SP);
                if native != work {
                    self.mov_rr(buf, native, work);
                }
            }
            Operand::Mem(m) => self.ldst(buf, 0b11, 0, 0b00, work, &m)?,
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fhw(&self, r: FReg) -> u8 {
        r.index()
    }

    fn load_foperand(&self, buf: &mut CodeBuffer, want: u8, src: FOperand) -> CodegenResult<u8> {
        match src {
            FOperand::Reg(s) => Ok(self.fhw(s)),
            FOperand::Mem(m) => {
                self.ldst(buf, 0b11, 1, 0b01, want, &m)?;
                Ok(want)
            }
        }
    }

    fn store_fresult(&self, buf: &mut CodeBuffer, work: u8, dst: FOperand) -> CodegenResult<()> {
        match dst {
            FOperand::Reg(d) => {
                if self.fhw(d) != work {
                    // fmov dd, dn
                    self.put(buf, 0x1e60_4000 | (u32::from(work) << 5) | u32::from(self.fhw(d)));
                }
            }
            FOperand::Mem(m) => self.ldst(buf, 0b11, 1, 0b00, work, &m)?,
        }
        Ok(())
    }

    /// Saved-register pairs for the prologue, in push order.
    fn saved_pairs(&self, abi: &AbiProfile) -> (Vec<(u8, Option<u8>)>, Vec<(u8, Option<u8>)>) {
        let mut gp = Vec::new();
        let mut i = 0;
        while i < abi.saveds {
            let a = MAP[4 + i as usize];
            let b = (i + 1 < abi.saveds).then(|| MAP[4 + i as usize + 1]);
            gp.push((a, b));
            i += 2;
        }
        let mut fp = Vec::new();
        let mut i = 0;
        while i < abi.fsaveds {
            let a = 8 + i;
            let b = (i + 1 < abi.fsaveds).then(|| 8 + i + 1);
            fp.push((a, b));
            i += 2;
        }
        (gp, fp)
    }

    fn local_frame(&self, abi: &AbiProfile) -> u32 {
        (abi.local_size + 15) & !15
    }

    fn sub_sp(&self, buf: &mut CodeBuffer, amount: u32, add: bool) {
        if amount == 0 {
            return;
        }
        let op = if add { 0x91 } else { 0xd1 };
        if amount < (1 << 12) {
            self.put(buf, enc_addsub_imm(op, amount, SP, SP));
        } else {
            // Shifted imm12 covers the 1 MiB local-size cap.
            self.put(
                buf,
                enc_addsub_imm(op, amount >> 12, SP, SP) | (1 << 22),
            );
            let rest = amount & 0xfff;
            if rest != 0 {
                self.put(buf, enc_addsub_imm(op, rest, SP, SP));
            }
        }
    }
}

impl Backend for A64Backend {
    fn arch(&self) -> Arch {
        Arch::Aarch64
    }

    fn limits(&self) -> IsaLimits {
        IsaLimits {
            scratches_max: 4,
            saveds_max: 4,
            fscratches_max: 4,
            fsaveds_max: 4,
        }
    }

    fn enter(&mut self, buf: &mut CodeBuffer, abi: &AbiProfile) -> CodegenResult<()> {
        // stp x29, x30, [sp, #-16]!
        self.put(buf, 0xa9bf_7bfd);
        // mov x29, sp
        self.put(buf, enc_addsub_imm(0x91, 0, SP, FP));
        let (gp, fp) = self.saved_pairs(abi);
        for (a, b) in &gp {
            match b {
                Some(b) => self.put(
                    buf,
                    0xa9bf_0000 | (u32::from(*b) << 10) | (u32::from(SP) << 5) | u32::from(*a),
                ),
                None => self.put(
                    buf,
                    // str xa, [sp, #-16]!
                    0xf81f_0c00 | (u32::from(SP) << 5) | u32::from(*a),
                ),
            }
        }
        for (a, b) in &fp {
            match b {
                Some(b) => self.put(
                    buf,
                    0x6dbf_0000 | (u32::from(*b) << 10) | (u32::from(SP) << 5) | u32::from(*a),
                ),
                None => self.put(
                    buf,
                    // str da, [sp, #-16]!
                    0xfc1f_0c00 | (u32::from(SP) << 5) | u32::from(*a),
                ),
            }
        }
        self.sub_sp(buf, self.local_frame(abi), false);
        for i in 0..abi.args.count() {
            self.mov_rr(buf, MAP[4 + i as usize], MAP[i as usize]);
        }
        Ok(())
    }

    fn fake_enter(&mut self, _abi: &AbiProfile) -> CodegenResult<()> {
        Ok(())
    }

    fn ret(
        &mut self,
        buf: &mut CodeBuffer,
        abi: &AbiProfile,
        value: Option<(Op1, Operand)>,
    ) -> CodegenResult<()> {
        if let Some((op, src)) = value {
            self.op1(buf, op, Mods::new(), Some(Operand::Reg(crate::operand::r(0))), src)?;
        }
        self.sub_sp(buf, self.local_frame(abi), true);
        let (gp, fp) = self.saved_pairs(abi);
        for (a, b) in fp.iter().rev() {
            match b {
                Some(b) => self.put(
                    buf,
                    0x6cc1_0000 | (u32::from(*b) << 10) | (u32::from(SP) << 5) | u32::from(*a),
                ),
                None => self.put(
                    buf,
                    0xfc40_0400 | (u32::from(SP) << 5) | u32::from(*a) | (16 << 12),
                ),
            }
        }
        for (a, b) in gp.iter().rev() {
            match b {
                Some(b) => self.put(
                    buf,
                    0xa8c1_0000 | (u32::from(*b) << 10) | (u32::from(SP) << 5) | u32::from(*a),
                ),
                None => self.put(
                    buf,
                    0xf840_0400 | (u32::from(SP) << 5) | u32::from(*a) | (16 << 12),
                ),
            }
        }
        // ldp x29, x30, [sp], #16
        self.put(buf, 0xa8c1_7bfd);
        // ret
        self.put(buf, 0xd65f_03c0);
        Ok(())
    }

    fn op0(&mut self, buf: &mut CodeBuffer, op: Op0) -> CodegenResult<()> {
        match op {
            Op0::Nop => self.put(buf, NOP),
            Op0::Breakpoint => self.put(buf, 0xd420_0000),
            Op0::LMulUw | Op0::LMulSw => {
                let hi_op = if op == Op0::LMulUw {
                    0b10011011110
                } else {
                    0b10011011010
                };
                // mul tmp, x0, x1; xmulh x1, x0, x1; mov x0, tmp
                self.put(buf, enc_arith_rrr(0b10011011000, TMP0, 0, 1) | (0x1f << 10));
                self.put(buf, enc_arith_rrr(hi_op, 1, 0, 1) | (0x1f << 10));
                self.mov_rr(buf, 0, TMP0);
            }
            Op0::DivmodUw | Op0::DivmodSw => {
                let div_bits = if op == Op0::DivmodUw { 0x0800 } else { 0x0c00 };
                // xdiv tmp, x0, x1; msub x1, tmp, x1, x0; mov x0, tmp
                self.put(buf, enc_arith_rrr(0b10011010110, TMP0, 0, 1) | div_bits);
                self.put(
                    buf,
                    enc_arith_rrr(0b10011011000, 1, TMP0, 1) | (1 << 15) | (0 << 10),
                );
                self.mov_rr(buf, 0, TMP0);
            }
        }
        Ok(())
    }

    fn op1(
        &mut self,
        buf: &mut CodeBuffer,
        op: Op1,
        mods: Mods,
        dst: Option<Operand>,
        src: Operand,
    ) -> CodegenResult<()> {
        let dst = dst.ok_or(Error::BadArgument)?;
        if mods.sets_flags() && !op.is_mov() {
            self.ov_from_z = false;
        }
        match op {
            Op1::Mov => {
                // Register/immediate moves avoid a temp; mem goes via one.
                match (dst, src) {
                    (Operand::Reg(d), _) => {
                        let d = self.hw(d);
                        debug_assert!(d != SP);
                        match src {
                            Operand::Reg(s) => {
                                let s = self.reg_or_sp(buf, s, TMP0);
                                if s != d {
                                    self.mov_rr(buf, d, s);
                                }
                            }
                            Operand::Imm(v) => self.load_imm(buf, d, v as u64),
                            Operand::Mem(m) => self.ldst(buf, 0b11, 0, 0b01, d, &m)?,
                        }
                    }
                    (Operand::Mem(dm), _) => {
                        let work = self.load_operand(buf, TMP0, src)?;
                        self.ldst(buf, 0b11, 0, 0b00, work, &dm)?;
                    }
                    (Operand::Imm(_), _) => return Err(Error::BadArgument),
                }
            }
            Op1::MovU8 | Op1::MovS8 | Op1::MovU16 | Op1::MovS16 | Op1::MovU32 | Op1::MovS32 => {
                let (width, signed) = op.mov_width().unwrap();
                let size = match width {
                    1 => 0b00,
                    2 => 0b01,
                    _ => 0b10,
                };
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => TMP0,
                };
                match src {
                    Operand::Mem(m) => {
                        let opc = if signed { 0b10 } else { 0b01 };
                        self.ldst(buf, size, 0, opc, work, &m)?;
                    }
                    Operand::Reg(s) => {
                        let s = self.reg_or_sp(buf, s, TMP1);
                        let word = match (width, signed) {
                            (1, false) => 0x5340_1c00,
                            (1, true) => 0x9340_1c00,
                            (2, false) => 0x5340_3c00,
                            (2, true) => 0x9340_3c00,
                            (4, false) => 0x2a00_03e0 | (u32::from(s) << 16),
                            _ => 0x9340_7c00,
                        };
                        if width == 4 && !signed {
                            // mov wd, ws
                            self.put(buf, word | u32::from(work));
                        } else {
                            self.put(buf, word | (u32::from(s) << 5) | u32::from(work));
                        }
                    }
                    Operand::Imm(v) => {
                        let v = match (width, signed) {
                            (1, false) => (v as u8) as i64,
                            (1, true) => (v as i8) as i64,
                            (2, false) => (v as u16) as i64,
                            (2, true) => (v as i16) as i64,
                            (4, false) => (v as u32) as i64,
                            _ => (v as i32) as i64,
                        };
                        self.load_imm(buf, work, v as u64);
                    }
                }
                if let Operand::Mem(dm) = dst {
                    // Narrow stores write back the access width.
                    self.ldst(buf, size, 0, 0b00, work, &dm)?;
                } else if let Operand::Imm(_) = dst {
                    return Err(Error::BadArgument);
                }
            }
            Op1::Not | Op1::Neg | Op1::Clz => {
                let s = self.load_operand(buf, TMP0, src)?;
                let work = match dst {
                    Operand::Reg(d) if self.hw(d) != SP => self.hw(d),
                    _ => TMP0,
                };
                match op {
                    Op1::Not => {
                        // orn work, xzr, s
                        self.put(buf, enc_arith_rrr(0b10101010001, work, ZR, s));
                        if mods.set_z {
                            // tst work, work
                            self.put(buf, enc_arith_rrr(0b11101010000, ZR, work, work));
                        }
                    }
                    Op1::Neg => {
                        let bits = if mods.sets_flags() {
                            0b11101011000 // subs
                        } else {
                            0b11001011000
                        };
                        self.put(buf, enc_arith_rrr(bits, work, ZR, s));
                    }
                    Op1::Clz => {
                        self.put(buf, 0xdac0_1000 | (u32::from(s) << 5) | u32::from(work));
                    }
                    _ => unreachable!(),
                }
                self.store_result(buf, work, dst)?;
            }
        }
        Ok(())
    }

    fn op2(
        &mut self,
        buf: &mut CodeBuffer,
        op: Op2,
        mods: Mods,
        dst: Option<Operand>,
        src1: Operand,
        src2: Operand,
    ) -> CodegenResult<()> {
        if mods.sets_flags() {
            self.ov_from_z = false;
        }
        let set = mods.sets_flags();
        // addc/subc must not disturb the carry while staging operands.
        let a = self.load_operand(buf, TMP0, src1)?;
        let b = match src2 {
            Operand::Imm(v)
                if matches!(op, Op2::Add | Op2::Sub)
                    && (0..4096).contains(&v)
                    && !matches!(src1, Operand::Reg(r) if self.hw(r) == SP) =>
            {
                // add/sub imm12 fast path.
                let work = self.work_reg(dst, a);
                let opb = match (op, set) {
                    (Op2::Add, false) => 0x91,
                    (Op2::Add, true) => 0xb1,
                    (Op2::Sub, false) => 0xd1,
                    (Op2::Sub, true) => 0xf1,
                    _ => unreachable!(),
                };
                // In the immediate form rd=31 addresses SP, not XZR: a
                // flag-setting form discards via XZR, otherwise a dead
                // result lands in the temporary.
                let rd = match (dst.is_none(), set) {
                    (true, true) => ZR,
                    (true, false) => TMP0,
                    _ => work,
                };
                self.put(buf, enc_addsub_imm(opb, v as u32, a, rd));
                if let Some(d) = dst {
                    self.store_result(buf, work, d)?;
                }
                return Ok(());
            }
            _ => self.load_operand2(buf, TMP1, src2)?,
        };
        let work = self.work_reg(dst, a);
        let rd = if dst.is_none() { ZR } else { work };
        match op {
            Op2::Add | Op2::Addc | Op2::Sub | Op2::Subc => {
                let bits = match (op, set) {
                    (Op2::Add, false) => 0b10001011000,
                    (Op2::Add, true) => 0b10101011000,
                    (Op2::Addc, false) => 0b10011010000,
                    (Op2::Addc, true) => 0b10111010000,
                    (Op2::Sub, false) => 0b11001011000,
                    (Op2::Sub, true) => 0b11101011000,
                    (Op2::Subc, false) => 0b11011010000,
                    (Op2::Subc, true) => 0b11111010000,
                    _ => unreachable!(),
                };
                self.put(buf, enc_arith_rrr(bits, rd, a, b));
            }
            Op2::And => {
                let bits = if set { 0b11101010000 } else { 0b10001010000 };
                self.put(buf, enc_arith_rrr(bits, rd, a, b));
            }
            Op2::Or => {
                self.put(buf, enc_arith_rrr(0b10101010000, rd, a, b));
                if set {
                    self.put(buf, enc_arith_rrr(0b11101010000, ZR, rd, rd));
                }
            }
            Op2::Xor => {
                self.put(buf, enc_arith_rrr(0b11001010000, rd, a, b));
                if set {
                    self.put(buf, enc_arith_rrr(0b11101010000, ZR, rd, rd));
                }
            }
            Op2::Mul => {
                if mods.set_overflow {
                    // smulh check: overflow iff the high half disagrees
                    // with the sign extension of the low half.
                    self.put(buf, enc_arith_rrr(0b10011011010, TMP1, a, b) | (0x1f << 10));
                    self.put(buf, enc_arith_rrr(0b10011011000, rd, a, b) | (0x1f << 10));
                    // cmp tmp1, rd, asr #63
                    self.put(
                        buf,
                        enc_arith_rrr(0b11101011100, ZR, TMP1, rd) | (63 << 10),
                    );
                    self.ov_from_z = true;
                } else {
                    self.put(buf, enc_arith_rrr(0b10011011000, rd, a, b) | (0x1f << 10));
                    if mods.set_z {
                        self.put(buf, enc_arith_rrr(0b11101010000, ZR, rd, rd));
                    }
                }
            }
            Op2::Shl | Op2::Lshr | Op2::Ashr => {
                let bits2 = match op {
                    Op2::Shl => 0x2000,
                    Op2::Lshr => 0x2400,
                    _ => 0x2800,
                };
                self.put(buf, enc_arith_rrr(0b10011010110, rd, a, b) | bits2);
                if set {
                    self.put(buf, enc_arith_rrr(0b11101010000, ZR, rd, rd));
                }
            }
        }
        if let Some(d) = dst {
            self.store_result(buf, work, d)?;
        }
        Ok(())
    }

    fn fop1(
        &mut self,
        buf: &mut CodeBuffer,
        op: FOp1,
        dst: FOperand,
        src: FOperand,
    ) -> CodegenResult<()> {
        match op {
            FOp1::Mov => match (dst, src) {
                (FOperand::Reg(d), FOperand::Reg(s)) => {
                    if d != s {
                        self.put(
                            buf,
                            0x1e60_4000 | (u32::from(self.fhw(s)) << 5) | u32::from(self.fhw(d)),
                        );
                    }
                }
                (FOperand::Reg(d), FOperand::Mem(m)) => {
                    self.ldst(buf, 0b11, 1, 0b01, self.fhw(d), &m)?
                }
                (FOperand::Mem(m), FOperand::Reg(s)) => {
                    self.ldst(buf, 0b11, 1, 0b00, self.fhw(s), &m)?
                }
                (FOperand::Mem(dm), FOperand::Mem(_)) => {
                    let s = self.load_foperand(buf, FTMP, src)?;
                    self.ldst(buf, 0b11, 1, 0b00, s, &dm)?;
                }
            },
            FOp1::Neg | FOp1::Abs => {
                let s = self.load_foperand(buf, FTMP, src)?;
                let work = match dst {
                    FOperand::Reg(d) => self.fhw(d),
                    _ => FTMP,
                };
                let word = if op == FOp1::Neg { 0x1e61_4000 } else { 0x1e60_c000 };
                self.put(buf, word | (u32::from(s) << 5) | u32::from(work));
                self.store_fresult(buf, work, dst)?;
            }
            FOp1::Cmp => {
                let a = self.load_foperand(buf, FTMP, dst)?;
                let b = match src {
                    FOperand::Reg(s) => self.fhw(s),
                    FOperand::Mem(_) => self.load_foperand(buf, 31, src)?,
                };
                // fcmp da, db
                self.put(buf, 0x1e60_2000 | (u32::from(b) << 16) | (u32::from(a) << 5));
            }
        }
        Ok(())
    }

    fn fop2(
        &mut self,
        buf: &mut CodeBuffer,
        op: FOp2,
        dst: FOperand,
        src1: FOperand,
        src2: FOperand,
    ) -> CodegenResult<()> {
        let bits = match op {
            FOp2::Add => 0b001010,
            FOp2::Sub => 0b001110,
            FOp2::Mul => 0b000010,
            FOp2::Div => 0b000110,
        };
        let a = self.load_foperand(buf, FTMP, src1)?;
        let b = match src2 {
            FOperand::Reg(s) => self.fhw(s),
            FOperand::Mem(_) => self.load_foperand(buf, 31, src2)?,
        };
        let work = match dst {
            FOperand::Reg(d) => self.fhw(d),
            _ => FTMP,
        };
        self.put(buf, enc_fp_rrr(bits, work, a, b));
        self.store_fresult(buf, work, dst)
    }

    fn op_flags(
        &mut self,
        buf: &mut CodeBuffer,
        op: FlagsOp,
        dst: Operand,
        cc: CondCode,
    ) -> CodegenResult<()> {
        let cond = self.cond_of(cc);
        // cset tmp0, cond
        self.put(buf, 0x9a9f_07e0 | (invert_cond(cond) << 12) | u32::from(TMP0));
        match op {
            FlagsOp::Mov => self.store_result(buf, TMP0, dst),
            FlagsOp::Or => {
                let cur = self.load_operand2(buf, TMP1, dst)?;
                self.put(buf, enc_arith_rrr(0b10101010000, TMP0, cur, TMP0));
                self.store_result(buf, TMP0, dst)
            }
        }
    }

    fn fast_enter(&mut self, buf: &mut CodeBuffer, dst: Operand) -> CodegenResult<()> {
        match dst {
            Operand::Reg(d) if self.hw(d) != SP => self.mov_rr(buf, self.hw(d), LR),
            Operand::Mem(m) => self.ldst(buf, 0b11, 0, 0b00, LR, &m)?,
            _ => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fast_return(&mut self, buf: &mut CodeBuffer, src: Operand) -> CodegenResult<()> {
        match src {
            Operand::Reg(s) if self.hw(s) != SP => self.mov_rr(buf, LR, self.hw(s)),
            Operand::Mem(m) => self.ldst(buf, 0b11, 0, 0b01, LR, &m)?,
            _ => return Err(Error::BadArgument),
        }
        // ret (through x30)
        self.put(buf, 0xd65f_03c0);
        Ok(())
    }

    fn add_no_flags(&mut self, buf: &mut CodeBuffer, reg: Reg, disp: i64) -> CodegenResult<()> {
        let r = self.hw(reg);
        if (0..4096).contains(&disp) {
            self.put(buf, enc_addsub_imm(0x91, disp as u32, r, r));
        } else if (-4095..0).contains(&disp) {
            self.put(buf, enc_addsub_imm(0xd1, (-disp) as u32, r, r));
        } else {
            self.load_imm(buf, TMP0, disp as u64);
            self.put(buf, enc_arith_rrr(0b10001011000, r, r, TMP0));
        }
        Ok(())
    }

    fn jump(&mut self, buf: &mut CodeBuffer, ty: JumpType) -> CodegenResult<Jump> {
        // Arguments already live in x0..x2; no shuffle needed.
        let data = JumpData {
            kind: ty.kind,
            rewritable: ty.rewritable,
            target: JumpTarget::Unset,
            hint: u32::from(self.ov_from_z),
            delay: None,
        };
        let reserved = *self.jump_encodings(&data).last().unwrap();
        Ok(buf.add_jump(data, reserved))
    }

    fn ijump(&mut self, buf: &mut CodeBuffer, ty: JumpType, src: Operand) -> CodegenResult<()> {
        if let Operand::Imm(target) = src {
            let data = JumpData {
                kind: ty.kind,
                rewritable: false,
                target: JumpTarget::Addr(target as u64),
                hint: 0,
                delay: None,
            };
            let reserved = *self.jump_encodings(&data).last().unwrap();
            buf.add_jump(data, reserved);
            return Ok(());
        }
        let rn = self.load_operand(buf, TMP0, src)?;
        let link = matches!(ty.kind, JumpKind::Call(_) | JumpKind::FastCall);
        let word = if link { 0xd63f_0000 } else { 0xd61f_0000 };
        self.put(buf, word | (u32::from(rn) << 5));
        Ok(())
    }

    fn const_(
        &mut self,
        buf: &mut CodeBuffer,
        dst: Option<Operand>,
        init: i64,
    ) -> CodegenResult<Const> {
        let dst = dst.ok_or(Error::BadArgument)?;
        let work = match dst {
            Operand::Reg(d) if self.hw(d) != SP => self.hw(d),
            _ => TMP0,
        };
        self.load_imm_patchable(buf, work, init as u64);
        let konst = buf.add_const(16);
        if let Operand::Mem(m) = dst {
            self.ldst(buf, 0b11, 0, 0b00, work, &m)?;
        }
        Ok(konst)
    }

    // ---- layout ---------------------------------------------------------

    fn jump_encodings(&self, jump: &JumpData) -> &'static [u32] {
        let label = matches!(jump.target, JumpTarget::Label(_));
        let cond = matches!(jump.kind, JumpKind::Cond(_) | JumpKind::FCond(_));
        if label && !jump.rewritable {
            if cond {
                &[4, 8]
            } else {
                &[4]
            }
        } else if cond {
            &[24]
        } else {
            &[20]
        }
    }

    fn jump_needed_size(
        &self,
        jump: &JumpData,
        at: CodeOffset,
        target: Option<CodeOffset>,
    ) -> u32 {
        let encodings = self.jump_encodings(jump);
        if encodings.len() == 1 {
            return encodings[0];
        }
        let target = match target {
            Some(t) => t,
            None => return *encodings.last().unwrap(),
        };
        let disp = (i64::from(target) - i64::from(at)) / 4;
        if (-(1 << 18)..(1 << 18)).contains(&disp) {
            encodings[0]
        } else {
            *encodings.last().unwrap()
        }
    }

    fn emit_jump(
        &self,
        jump: &JumpData,
        size: u32,
        at: CodeOffset,
        target: Option<CodeOffset>,
        sink: &mut CodeSink,
    ) -> CodeOffset {
        let cond = match jump.kind {
            JumpKind::Cond(cc) => Some(if jump.hint != 0 {
                match cc {
                    CondCode::Overflow => 0x1,
                    CondCode::NotOverflow => 0x0,
                    _ => cond_bits(cc),
                }
            } else {
                cond_bits(cc)
            }),
            JumpKind::FCond(cc) => Some(fcond_bits(cc)),
            _ => None,
        };
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            let target = target.unwrap();
            match cond {
                Some(c) if size == 4 => {
                    let off = (i64::from(target) - i64::from(at)) / 4;
                    sink.put4(enc_cbr(off as i32, c));
                }
                Some(c) => {
                    // Inverted skip + unconditional branch.
                    sink.put4(enc_cbr(2, invert_cond(c)));
                    let off = (i64::from(target) - i64::from(at + 4)) / 4;
                    sink.put4(enc_jump26(0b000101, off as i32));
                }
                None => {
                    let op = match jump.kind {
                        JumpKind::Call(_) | JumpKind::FastCall => 0b100101,
                        _ => 0b000101,
                    };
                    let off = (i64::from(target) - i64::from(at)) / 4;
                    sink.put4(enc_jump26(op, off as i32));
                }
            }
            return at;
        }

        // Long form: movz/movk x17 + br/blr (+ inverted skip when
        // conditional).
        let mut site = at;
        if let Some(c) = cond {
            sink.put4(enc_cbr(6, invert_cond(c)));
            site = at + 4;
        }
        let fix_target = match jump.target {
            JumpTarget::Label(_) => FixTarget::Offset(target.unwrap()),
            JumpTarget::Addr(a) => FixTarget::Addr(a),
            JumpTarget::Unset => FixTarget::Addr(0),
        };
        sink.fixup(FixupKind::A64MovSeq { count: 4 }, fix_target);
        let value = match fix_target {
            FixTarget::Addr(a) => a,
            _ => 0,
        };
        self.load_imm_patchable(sink, TMP1, value);
        let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
        let word = if link { 0xd63f_0000 } else { 0xd61f_0000 };
        sink.put4(word | (u32::from(TMP1) << 5));
        let _ = size;
        site
    }

    fn pad_to(&self, target: CodeOffset, sink: &mut CodeSink) {
        while sink.cur_offset() < target {
            sink.put4(NOP);
        }
    }
}

impl A64Backend {
    fn work_reg(&self, dst: Option<Operand>, _a: u8) -> u8 {
        match dst {
            Some(Operand::Reg(d)) if self.hw(d) != SP => self.hw(d),
            _ => TMP0,
        }
    }

    /// Secondary operand load that leaves TMP0 untouched.
    fn load_operand2(&self, buf: &mut CodeBuffer, want: u8, src: Operand) -> CodegenResult<u8> {
        match src {
            Operand::Reg(s) => {
                let native = self.hw(s);
                if native == SP {
                    self.put(buf, enc_addsub_imm(0x91, 0, SP, want));
                    Ok(want)
                } else {
                    Ok(native)
                }
            }
            Operand::Imm(v) => {
                self.load_imm(buf, want, v as u64);
                Ok(want)
            }
            Operand::Mem(m) => {
                self.ldst(buf, 0b11, 0, 0b01, want, &m)?;
                Ok(want)
            }
        }
    }
}

/// Rewrite the imm16 fields of a `movz`/`movk` run in place.
pub(crate) fn patch_mov_seq(code: &mut [u8], count: u8, value: u64) {
    for i in 0..count as usize {
        let at = i * 4;
        let mut word = u32::from_le_bytes(code[at..at + 4].try_into().unwrap());
        let half = ((value >> (16 * i)) & 0xffff) as u32;
        word = (word & !(0xffff << 5)) | (half << 5);
        code[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::operand::{fr, r, s, sp};

    fn emit(f: impl FnOnce(&mut A64Backend, &mut CodeBuffer)) -> Vec<u32> {
        let mut backend = A64Backend::new();
        let mut buf = CodeBuffer::new();
        f(&mut backend, &mut buf);
        let image = buf.finalize(&mut backend).unwrap();
        image
            .code()
            .chunks(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn mov_and_add() {
        let words = emit(|b, buf| {
            b.op1(buf, Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(r(1)))
                .unwrap();
            b.op2(
                buf,
                Op2::Add,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Reg(r(0)),
                Operand::Reg(r(1)),
            )
            .unwrap();
        });
        // mov x0, x1 ; add x0, x0, x1
        assert_eq!(words, vec![0xaa01_03e0, 0x8b01_0000]);
    }

    #[test]
    fn add_imm12() {
        let words = emit(|b, buf| {
            b.op2(
                buf,
                Op2::Add,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Reg(r(0)),
                Operand::Imm(100),
            )
            .unwrap();
        });
        assert_eq!(words, vec![0x9100_0000 | (100 << 10)]);
    }

    #[test]
    fn load_scaled_offset() {
        let words = emit(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Mem(Mem::base(s(0), 16)),
            )
            .unwrap();
        });
        // ldr x0, [x19, #16]
        assert_eq!(words, vec![0xf940_0000 | (2 << 10) | (19 << 5)]);
    }

    #[test]
    fn store_to_locals() {
        let words = emit(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Mem(Mem::base(sp(), 8))),
                Operand::Reg(r(0)),
            )
            .unwrap();
        });
        // str x0, [sp, #8]
        assert_eq!(words, vec![0xf900_0000 | (1 << 10) | (31 << 5)]);
    }

    #[test]
    fn cmp_sets_flags() {
        let words = emit(|b, buf| {
            let mut mods = Mods::new();
            mods.set_z = true;
            b.op2(
                buf,
                Op2::Sub,
                mods,
                None,
                Operand::Reg(r(0)),
                Operand::Reg(r(1)),
            )
            .unwrap();
        });
        // subs xzr, x0, x1
        assert_eq!(words, vec![0xeb01_001f]);
    }

    #[test]
    fn cset_from_equal() {
        let words = emit(|b, buf| {
            b.op_flags(buf, FlagsOp::Mov, Operand::Reg(r(0)), CondCode::Equal)
                .unwrap();
        });
        // cset x16, eq (csinc x16, xzr, xzr, ne) ; mov x0, x16
        assert_eq!(words, vec![0x9a9f_07e0 | (1 << 12) | 16, 0xaa10_03e0]);
    }

    #[test]
    fn fadd_regs() {
        let words = emit(|b, buf| {
            b.fop2(
                buf,
                FOp2::Add,
                FOperand::Reg(fr(0)),
                FOperand::Reg(fr(0)),
                FOperand::Reg(fr(1)),
            )
            .unwrap();
        });
        // fadd d0, d0, d1
        assert_eq!(words, vec![0x1e61_2800]);
    }

    #[test]
    fn short_cond_branch() {
        let mut backend = A64Backend::new();
        let mut buf = CodeBuffer::new();
        let j = backend
            .jump(&mut buf, JumpType::cond(CondCode::NotEqual))
            .unwrap();
        for _ in 0..4 {
            backend.op0(&mut buf, Op0::Nop).unwrap();
        }
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        let word = u32::from_le_bytes(image.code()[0..4].try_into().unwrap());
        // b.ne +20 bytes = 5 words
        assert_eq!(word, enc_cbr(5, 1));
        assert_eq!(image.label_offset(l), 20);
    }

    #[test]
    fn rewritable_jump_patches() {
        let mut backend = A64Backend::new();
        let mut buf = CodeBuffer::new();
        let j = backend.jump(&mut buf, JumpType::jump().rewritable()).unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        assert_eq!(image.len(), 20);
        assert_eq!(image.jump_offset(j), 0);
        let mut code = image.code().to_vec();
        image.relocate(0x10000, &mut code);
        // movz x17, #(0x10000+20 & 0xffff)
        let w0 = u32::from_le_bytes(code[0..4].try_into().unwrap());
        assert_eq!(w0 >> 23, 0xd280_0000 >> 23);
        assert_eq!((w0 >> 5) & 0xffff, 0x0014);
        let w1 = u32::from_le_bytes(code[4..8].try_into().unwrap());
        assert_eq!((w1 >> 5) & 0xffff, 0x1);
        // br x17
        let w4 = u32::from_le_bytes(code[16..20].try_into().unwrap());
        assert_eq!(w4, 0xd61f_0000 | (17 << 5));
    }

    #[test]
    fn const_sequence_is_patchable() {
        let words = emit(|b, buf| {
            b.const_(buf, Some(Operand::Reg(r(0))), 0x1234).unwrap();
        });
        assert_eq!(words.len(), 4);
        assert_eq!(words[0], 0xd280_0000 | (0x1234 << 5));
        let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        patch_mov_seq(&mut bytes, 4, 0xdead_beef_0000_5678);
        let w0 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        assert_eq!((w0 >> 5) & 0xffff, 0x5678);
    }
}
