//! ARM Thumb-2 ISA: binary code emission.
//!
//! Mixed 16/32-bit encodings; 32-bit words are emitted high halfword
//! first. `movw`/`movt` are always available, so there are no literal
//! pools; rewritable targets are materialized into ip and branched
//! through `bx`/`blx`, predicated by an IT block when conditional. Entry
//! addresses carry the interworking bit (see `Arch::entry_bias`).
//!
//! Register map matches the A32 backend: `r0..r3` = r0..r3, `s0..s3` =
//! r4..r7, locals base = sp, temporaries ip and lr.

use crate::abi::AbiProfile;
use crate::buffer::{
    ByteSink, CodeBuffer, CodeOffset, CodeSink, Const, FixTarget, FixupKind, Jump, JumpData,
    JumpTarget,
};
use crate::condcodes::CondCode;
use crate::isa::{Arch, Backend, IsaLimits};
use crate::lir::{FOp1, FOp2, FlagsOp, JumpKind, JumpType, Mods, Op0, Op1, Op2};
use crate::operand::{FOperand, FReg, Mem, Operand, Reg};
use crate::{CodegenResult, Error};

const IP: u8 = 12;
const SPR: u8 = 13;
const LR: u8 = 14;
const FTMP: u8 = 6;
const FTMP2: u8 = 7;

const MAP: [u8; 9] = [0, 1, 2, 3, 4, 5, 6, 7, SPR];

use super::arm::{cond_bits, fcond_bits};

/// Emit a 32-bit T32 word: high halfword first.
fn emit_32(buf: &mut dyn ByteSink, word: u32) {
    buf.put2((word >> 16) as u16);
    buf.put2((word & 0xffff) as u16);
}

/// 16-bit register move, any registers.
fn enc_16_mov(rd: u8, rm: u8) -> u16 {
    0b0100_0110_0000_0000 | u16::from(rd & 0x7) | (u16::from(rd >> 3) << 7) | (u16::from(rm) << 3)
}

/// T32 data-processing, shifted register, shift amount zero.
fn enc_32_rrr(bits_24_21: u32, s: bool, rd: u8, rn: u8, rm: u8) -> u32 {
    0xea00_0000
        | (bits_24_21 << 21)
        | ((s as u32) << 20)
        | (u32::from(rn) << 16)
        | (u32::from(rd) << 8)
        | u32::from(rm)
}

const T2_AND: u32 = 0b0000;
const T2_ORR: u32 = 0b0010;
const T2_EOR: u32 = 0b0100;
const T2_ADD: u32 = 0b1000;
const T2_ADC: u32 = 0b1010;
const T2_SBC: u32 = 0b1011;
const T2_SUB: u32 = 0b1101;

/// movw/movt: imm16 split into i:imm4:imm3:imm8.
fn enc_32_r_imm16(base: u32, rd: u8, imm16: u32) -> u32 {
    let imm8 = imm16 & 0xff;
    let imm3 = (imm16 >> 8) & 0x7;
    let i = (imm16 >> 11) & 0x1;
    let imm4 = (imm16 >> 12) & 0xf;
    base | imm8 | (imm3 << 12) | (u32::from(rd) << 8) | (imm4 << 16) | (i << 26)
}

/// b.w (T4), ±16 MiB.
fn enc_32_jump(off24: i32) -> u32 {
    let off24 = (off24 as u32) & 0x00ff_ffff;
    let imm11 = off24 & 0x7ff;
    let imm10 = (off24 >> 11) & 0x3ff;
    let i2 = (off24 >> 21) & 0x1;
    let i1 = (off24 >> 22) & 0x1;
    let s = (off24 >> 23) & 0x1;
    let j1 = (i1 ^ s) ^ 1;
    let j2 = (i2 ^ s) ^ 1;
    0b11110_0_0000000000_10_0_1_0_00000000000
        | imm11
        | (j2 << 11)
        | (j1 << 13)
        | (imm10 << 16)
        | (s << 26)
}

/// b<cond>.w (T3), ±1 MiB.
fn enc_32_cond_branch(cond: u32, off20: i32) -> u32 {
    let off20 = (off20 as u32) & 0x000f_ffff;
    let imm11 = off20 & 0x7ff;
    let imm6 = (off20 >> 11) & 0x3f;
    let j1 = (off20 >> 17) & 0x1;
    let j2 = (off20 >> 18) & 0x1;
    let s = (off20 >> 19) & 0x1;
    0b11110_0_0000_000000_10_0_0_0_00000000000
        | imm11
        | (j2 << 11)
        | (j1 << 13)
        | (imm6 << 16)
        | (cond << 22)
        | (s << 26)
}

/// IT block predicating `count` following instructions with `cond`.
fn enc_16_it(cond: u32, count: u32) -> u16 {
    debug_assert!((1..=4).contains(&count));
    let c0 = cond & 1;
    let mut mask = 1u32 << (4 - count);
    for i in (4 - count + 1)..4 {
        mask |= c0 << i;
    }
    (0b1011_1111_0000_0000 | (cond << 4) | mask) as u16
}

pub(crate) struct Thumb2Backend {
    ov_from_z: bool,
}

impl Thumb2Backend {
    pub(crate) fn new() -> Self {
        Thumb2Backend { ov_from_z: false }
    }

    fn hw(&self, r: Reg) -> u8 {
        MAP[r.index() as usize]
    }

    fn movw_movt(&self, buf: &mut dyn ByteSink, rd: u8, value: u32) {
        emit_32(buf, enc_32_r_imm16(0xf240_0000, rd, value & 0xffff));
        emit_32(buf, enc_32_r_imm16(0xf2c0_0000, rd, value >> 16));
    }

    fn load_imm(&self, buf: &mut dyn ByteSink, rd: u8, value: u32) {
        if value < 256 {
            // mov.w rd, #imm8 (flags preserved)
            emit_32(buf, 0xf04f_0000 | (u32::from(rd) << 8) | value);
        } else if value <= 0xffff {
            emit_32(buf, enc_32_r_imm16(0xf240_0000, rd, value));
        } else {
            self.movw_movt(buf, rd, value);
        }
    }

    fn mov_rr(&self, buf: &mut dyn ByteSink, rd: u8, rm: u8) {
        buf.put2(enc_16_mov(rd, rm));
    }

    fn lower_base(
        &mut self,
        buf: &mut CodeBuffer,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<(u8, i64)> {
        match (m.base, m.index) {
            (None, None) => {
                self.load_imm(buf, scratch, m.disp as u32);
                Ok((scratch, 0))
            }
            (Some(base), None) => Ok((self.hw(base), m.disp)),
            (base, Some((index, shift))) => {
                let shifted = ((u32::from(shift) & 3) << 6) | ((u32::from(shift) >> 2) << 12);
                if !(-255..4096).contains(&m.disp) {
                    // Fold the far displacement first so one scratch
                    // register carries the whole address.
                    self.load_imm(buf, scratch, m.disp as u32);
                    emit_32(
                        buf,
                        enc_32_rrr(T2_ADD, false, scratch, scratch, self.hw(index)) | shifted,
                    );
                    if let Some(b) = base {
                        emit_32(buf, enc_32_rrr(T2_ADD, false, scratch, self.hw(b), scratch));
                    }
                    return Ok((scratch, 0));
                }
                let bn = match base {
                    Some(b) => self.hw(b),
                    None => {
                        self.load_imm(buf, scratch, 0);
                        scratch
                    }
                };
                // add.w scratch, base, index, lsl #shift
                emit_32(
                    buf,
                    enc_32_rrr(T2_ADD, false, scratch, bn, self.hw(index)) | shifted,
                );
                Ok((scratch, m.disp))
            }
        }
    }

    /// T32 load/store with the imm12 / negative-imm8 / register forms.
    /// `op` is the f8/f9-family base (e.g. 0xf8d0_0000 for `ldr.w`).
    fn ldst(
        &mut self,
        buf: &mut CodeBuffer,
        op: u32,
        rt: u8,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<()> {
        let (base, disp) = self.lower_base(buf, scratch, m)?;
        if (0..4096).contains(&disp) {
            emit_32(
                buf,
                op | (u32::from(base) << 16) | (u32::from(rt) << 12) | disp as u32,
            );
        } else if (-255..0).contains(&disp) {
            // Negative offset form: clear bit23, PUW = 110.
            emit_32(
                buf,
                (op & !(1 << 23))
                    | 0x0c00
                    | (u32::from(base) << 16)
                    | (u32::from(rt) << 12)
                    | (-disp) as u32,
            );
        } else {
            // Index cases pre-fold far displacements in `lower_base`.
            debug_assert!(base != scratch);
            self.load_imm(buf, scratch, disp as u32);
            emit_32(buf, enc_32_rrr(T2_ADD, false, scratch, base, scratch));
            emit_32(buf, op | (u32::from(scratch) << 16) | (u32::from(rt) << 12));
        }
        Ok(())
    }

    fn load_word(
        &mut self,
        buf: &mut CodeBuffer,
        want: u8,
        scratch: u8,
        src: Operand,
    ) -> CodegenResult<u8> {
        match src {
            Operand::Reg(s) => Ok(self.hw(s)),
            Operand::Imm(v) => {
                self.load_imm(buf, want, v as u32);
                Ok(want)
            }
            Operand::Mem(m) => {
                self.ldst(buf, 0xf8d0_0000, want, scratch, &m)?;
                Ok(want)
            }
        }
    }

    fn store_result(
        &mut self,
        buf: &mut CodeBuffer,
        work: u8,
        dst: Operand,
    ) -> CodegenResult<()> {
        match dst {
            Operand::Reg(d) => {
                let native = self.hw(d);
                if native != work {
                    self.mov_rr(buf, native, work);
                }
            }
            Operand::Mem(m) => {
                let scratch = if work == IP { LR } else { IP };
                self.ldst(buf, 0xf8c0_0000, work, scratch, &m)?;
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fhw(&self, r: FReg) -> u8 {
        r.index()
    }

    fn vldst(&mut self, buf: &mut CodeBuffer, load: bool, dd: u8, m: &Mem) -> CodegenResult<()> {
        let (base, disp) = self.lower_base(buf, IP, m)?;
        let word = 0xed00_0b00 | ((load as u32) << 20) | (u32::from(dd) << 12);
        if disp % 4 == 0 && (-1020..=1020).contains(&disp) {
            let (u, off) = if disp >= 0 {
                (1u32, (disp / 4) as u32)
            } else {
                (0, (-disp / 4) as u32)
            };
            emit_32(buf, word | (u << 23) | (u32::from(base) << 16) | off);
        } else {
            if base == IP {
                self.load_imm(buf, LR, disp as u32);
                emit_32(buf, enc_32_rrr(T2_ADD, false, IP, IP, LR));
            } else {
                self.load_imm(buf, IP, disp as u32);
                emit_32(buf, enc_32_rrr(T2_ADD, false, IP, base, IP));
            }
            emit_32(buf, word | (1 << 23) | (u32::from(IP) << 16));
        }
        Ok(())
    }

    fn load_fop(&mut self, buf: &mut CodeBuffer, want: u8, src: FOperand) -> CodegenResult<u8> {
        match src {
            FOperand::Reg(s) => Ok(self.fhw(s)),
            FOperand::Mem(m) => {
                self.vldst(buf, true, want, &m)?;
                Ok(want)
            }
        }
    }

    fn saved_mask(&self, abi: &AbiProfile) -> u16 {
        let mut mask = 0u16;
        for i in 0..abi.saveds {
            mask |= 1 << MAP[4 + i as usize];
        }
        mask
    }

    fn local_frame(&self, abi: &AbiProfile) -> u32 {
        let pushes = (self.saved_mask(abi).count_ones() + 1 + 2 * u32::from(abi.fsaveds)) * 4;
        let mut l = (abi.local_size + 3) & !3;
        if (pushes + l) % 8 != 0 {
            l += 4;
        }
        l
    }

    fn add_sp(&mut self, buf: &mut CodeBuffer, amount: u32, add: bool) {
        if amount == 0 {
            return;
        }
        if amount <= 508 && amount % 4 == 0 {
            let op = if add { 0xb000 } else { 0xb080 };
            buf.put2(op | (amount / 4) as u16);
        } else if amount < 4096 {
            let base = if add { 0xf20d_0d00 } else { 0xf2ad_0d00 };
            let imm8 = amount & 0xff;
            let imm3 = (amount >> 8) & 0x7;
            let i = (amount >> 11) & 0x1;
            emit_32(buf, base | imm8 | (imm3 << 12) | (i << 26));
        } else {
            self.load_imm(buf, IP, amount);
            let op = if add { T2_ADD } else { T2_SUB };
            emit_32(buf, enc_32_rrr(op, false, SPR, SPR, IP));
        }
    }
}

impl Backend for Thumb2Backend {
    fn arch(&self) -> Arch {
        Arch::Thumb2
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
        // push {saveds, lr}
        buf.put2(0xb500 | self.saved_mask(abi));
        if abi.fsaveds > 0 {
            emit_32(buf, 0xed2d_8b00 | u32::from(abi.fsaveds) * 2);
        }
        self.add_sp(buf, self.local_frame(abi), false);
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
        self.add_sp(buf, self.local_frame(abi), true);
        if abi.fsaveds > 0 {
            emit_32(buf, 0xecbd_8b00 | u32::from(abi.fsaveds) * 2);
        }
        // pop {saveds, pc}
        buf.put2(0xbd00 | self.saved_mask(abi));
        Ok(())
    }

    fn op0(&mut self, buf: &mut CodeBuffer, op: Op0) -> CodegenResult<()> {
        match op {
            Op0::Nop => buf.put2(0xbf00),
            Op0::Breakpoint => buf.put2(0xbe00),
            Op0::LMulUw | Op0::LMulSw => {
                let base = if op == Op0::LMulUw { 0xfba0_0000 } else { 0xfb80_0000 };
                // xmull ip(lo), r1(hi), r0, r1 ; mov r0, ip
                emit_32(
                    buf,
                    base | (0 << 16) | (u32::from(IP) << 12) | (1 << 8) | 1,
                );
                self.mov_rr(buf, 0, IP);
            }
            Op0::DivmodUw | Op0::DivmodSw => {
                let div = if op == Op0::DivmodUw { 0xfbb0_f0f0 } else { 0xfb90_f0f0 };
                // xdiv ip, r0, r1 ; mls r1, ip, r1, r0 ; mov r0, ip
                emit_32(buf, div | (0 << 16) | (u32::from(IP) << 8) | 1);
                emit_32(
                    buf,
                    0xfb00_0010 | (u32::from(IP) << 16) | (0 << 12) | (1 << 8) | 1,
                );
                self.mov_rr(buf, 0, IP);
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
            Op1::Mov | Op1::MovU32 | Op1::MovS32 => match (dst, src) {
                (Operand::Reg(d), Operand::Reg(s)) => {
                    let (d, s) = (self.hw(d), self.hw(s));
                    if d != s {
                        self.mov_rr(buf, d, s);
                    }
                }
                (Operand::Reg(d), Operand::Imm(v)) => self.load_imm(buf, self.hw(d), v as u32),
                (Operand::Reg(d), Operand::Mem(m)) => {
                    let d = self.hw(d);
                    self.ldst(buf, 0xf8d0_0000, d, if d == IP { LR } else { IP }, &m)?;
                }
                (Operand::Mem(dm), _) => {
                    let work = self.load_word(buf, IP, LR, src)?;
                    let scratch = if work == IP { LR } else { IP };
                    self.ldst(buf, 0xf8c0_0000, work, scratch, &dm)?;
                }
                (Operand::Imm(_), _) => return Err(Error::BadArgument),
            },
            Op1::MovU8 | Op1::MovS8 | Op1::MovU16 | Op1::MovS16 => {
                let (width, signed) = op.mov_width().unwrap();
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => IP,
                };
                match src {
                    Operand::Mem(m) => {
                        let op = match (width, signed) {
                            (1, false) => 0xf890_0000,
                            (1, true) => 0xf990_0000,
                            (2, false) => 0xf8b0_0000,
                            _ => 0xf9b0_0000,
                        };
                        self.ldst(buf, op, work, LR, &m)?;
                    }
                    Operand::Reg(s) => {
                        let s = self.hw(s);
                        let base: u32 = match (width, signed) {
                            (1, false) => 0xfa5f_f080,
                            (1, true) => 0xfa4f_f080,
                            (2, false) => 0xfa1f_f080,
                            _ => 0xfa0f_f080,
                        };
                        emit_32(buf, base | (u32::from(work) << 8) | u32::from(s));
                    }
                    Operand::Imm(v) => {
                        let v = match (width, signed) {
                            (1, false) => (v as u8) as i64,
                            (1, true) => (v as i8) as i64,
                            (2, false) => (v as u16) as i64,
                            _ => (v as i16) as i64,
                        };
                        self.load_imm(buf, work, v as u32);
                    }
                }
                if let Operand::Mem(dm) = dst {
                    let op = match width {
                        1 => 0xf880_0000,
                        _ => 0xf8a0_0000,
                    };
                    self.ldst(buf, op, work, LR, &dm)?;
                }
            }
            Op1::Not | Op1::Neg => {
                let s = self.load_word(buf, IP, LR, src)?;
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => IP,
                };
                let set = mods.sets_flags();
                if op == Op1::Not {
                    // mvn.w work, s
                    emit_32(
                        buf,
                        0xea6f_0000 | ((set as u32) << 20) | (u32::from(work) << 8) | u32::from(s),
                    );
                } else {
                    // rsb.w work, s, #0
                    emit_32(
                        buf,
                        0xf1c0_0000 | ((set as u32) << 20) | (u32::from(s) << 16) | (u32::from(work) << 8),
                    );
                }
                self.store_result(buf, work, dst)?;
            }
            Op1::Clz => {
                let s = self.load_word(buf, IP, LR, src)?;
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => IP,
                };
                emit_32(
                    buf,
                    0xfab0_f080 | (u32::from(s) << 16) | (u32::from(work) << 8) | u32::from(s),
                );
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
        let a = self.load_word(buf, IP, LR, src1)?;
        let work = match dst {
            Some(Operand::Reg(d)) => self.hw(d),
            _ => IP,
        };
        match op {
            Op2::Shl | Op2::Lshr | Op2::Ashr => {
                let b = self.load_word(buf, LR, LR, src2)?;
                let base: u32 = match op {
                    Op2::Shl => 0xfa00_f000,
                    Op2::Lshr => 0xfa20_f000,
                    _ => 0xfa40_f000,
                };
                emit_32(
                    buf,
                    base | ((set as u32) << 20) | (u32::from(a) << 16) | (u32::from(work) << 8) | u32::from(b),
                );
            }
            Op2::Mul => {
                let b = self.load_word(buf, LR, LR, src2)?;
                if mods.set_overflow {
                    // smull lo(work), hi(lr), a, b ; cmp lr, lo asr #31
                    emit_32(
                        buf,
                        0xfb80_0000
                            | (u32::from(a) << 16)
                            | (u32::from(work) << 12)
                            | (u32::from(LR) << 8)
                            | u32::from(b),
                    );
                    // cmp.w lr, work, asr #31
                    emit_32(
                        buf,
                        0xebb0_0f00
                            | (u32::from(LR) << 16)
                            | u32::from(work)
                            | (0b10 << 4)
                            | ((31 & 3) << 6)
                            | ((31 >> 2) << 12),
                    );
                    self.ov_from_z = true;
                } else {
                    emit_32(
                        buf,
                        0xfb00_f000 | (u32::from(a) << 16) | (u32::from(work) << 8) | u32::from(b),
                    );
                    if set {
                        // T32 muls does not exist; retest.
                        emit_32(buf, 0xea10_0f00 | (u32::from(work) << 16) | u32::from(work));
                    }
                }
            }
            _ => {
                let bits = match op {
                    Op2::Add => T2_ADD,
                    Op2::Addc => T2_ADC,
                    Op2::Sub => T2_SUB,
                    Op2::Subc => T2_SBC,
                    Op2::And => T2_AND,
                    Op2::Or => T2_ORR,
                    Op2::Xor => T2_EOR,
                    _ => unreachable!(),
                };
                let b = self.load_word(buf, LR, LR, src2)?;
                if dst.is_none() {
                    match op {
                        Op2::Sub => {
                            // cmp.w a, b
                            emit_32(buf, 0xebb0_0f00 | (u32::from(a) << 16) | u32::from(b));
                            return Ok(());
                        }
                        Op2::And => {
                            // tst.w a, b
                            emit_32(buf, 0xea10_0f00 | (u32::from(a) << 16) | u32::from(b));
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                emit_32(buf, enc_32_rrr(bits, set, work, a, b));
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
                        emit_32(
                            buf,
                            0xeeb0_0b40 | (u32::from(self.fhw(d)) << 12) | u32::from(self.fhw(s)),
                        );
                    }
                }
                (FOperand::Reg(d), FOperand::Mem(m)) => self.vldst(buf, true, self.fhw(d), &m)?,
                (FOperand::Mem(m), FOperand::Reg(s)) => self.vldst(buf, false, self.fhw(s), &m)?,
                (FOperand::Mem(dm), FOperand::Mem(_)) => {
                    let s = self.load_fop(buf, FTMP, src)?;
                    self.vldst(buf, false, s, &dm)?;
                }
            },
            FOp1::Neg | FOp1::Abs => {
                let s = self.load_fop(buf, FTMP, src)?;
                let work = match dst {
                    FOperand::Reg(d) => self.fhw(d),
                    _ => FTMP,
                };
                let base = if op == FOp1::Neg { 0xeeb1_0b40 } else { 0xeeb0_0bc0 };
                emit_32(buf, base | (u32::from(work) << 12) | u32::from(s));
                if let FOperand::Mem(dm) = dst {
                    self.vldst(buf, false, work, &dm)?;
                }
            }
            FOp1::Cmp => {
                let a = self.load_fop(buf, FTMP, dst)?;
                let b = self.load_fop(buf, FTMP2, src)?;
                emit_32(buf, 0xeeb4_0b40 | (u32::from(a) << 12) | u32::from(b));
                emit_32(buf, 0xeef1_fa10);
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
        let base = match op {
            FOp2::Add => 0xee30_0b00,
            FOp2::Sub => 0xee30_0b40,
            FOp2::Mul => 0xee20_0b00,
            FOp2::Div => 0xee80_0b00,
        };
        let a = self.load_fop(buf, FTMP, src1)?;
        let b = self.load_fop(buf, FTMP2, src2)?;
        let work = match dst {
            FOperand::Reg(d) => self.fhw(d),
            _ => FTMP,
        };
        emit_32(
            buf,
            base | (u32::from(a) << 16) | (u32::from(work) << 12) | u32::from(b),
        );
        if let FOperand::Mem(dm) = dst {
            self.vldst(buf, false, work, &dm)?;
        }
        Ok(())
    }

    fn op_flags(
        &mut self,
        buf: &mut CodeBuffer,
        op: FlagsOp,
        dst: Operand,
        cc: CondCode,
    ) -> CodegenResult<()> {
        let cond = if self.ov_from_z {
            match cc {
                CondCode::Overflow => 0x1,
                CondCode::NotOverflow => 0x0,
                _ => cond_bits(cc),
            }
        } else {
            cond_bits(cc)
        };
        match op {
            FlagsOp::Mov => {
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => IP,
                };
                emit_32(buf, 0xf04f_0000 | (u32::from(work) << 8));
                buf.put2(enc_16_it(cond, 1));
                emit_32(buf, 0xf04f_0001 | (u32::from(work) << 8));
                self.store_result(buf, work, dst)?;
            }
            FlagsOp::Or => {
                let cur = self.load_word(buf, IP, LR, dst)?;
                buf.put2(enc_16_it(cond, 1));
                // orr.w cur, cur, #1
                emit_32(buf, 0xf040_0001 | (u32::from(cur) << 16) | (u32::from(cur) << 8));
                self.store_result(buf, cur, dst)?;
            }
        }
        Ok(())
    }

    fn fast_enter(&mut self, buf: &mut CodeBuffer, dst: Operand) -> CodegenResult<()> {
        match dst {
            Operand::Reg(d) => self.mov_rr(buf, self.hw(d), LR),
            Operand::Mem(m) => self.ldst(buf, 0xf8c0_0000, LR, IP, &m)?,
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fast_return(&mut self, buf: &mut CodeBuffer, src: Operand) -> CodegenResult<()> {
        let target = self.load_word(buf, IP, LR, src)?;
        // bx target
        buf.put2(0x4700 | (u16::from(target) << 3));
        Ok(())
    }

    fn add_no_flags(&mut self, buf: &mut CodeBuffer, reg: Reg, disp: i64) -> CodegenResult<()> {
        let r = self.hw(reg);
        let amount = disp.unsigned_abs() as u32;
        if amount < 4096 {
            // addw/subw
            let base = if disp >= 0 { 0xf200_0000 } else { 0xf2a0_0000 };
            let imm8 = amount & 0xff;
            let imm3 = (amount >> 8) & 0x7;
            let i = (amount >> 11) & 0x1;
            emit_32(
                buf,
                base | (u32::from(r) << 16) | (u32::from(r) << 8) | imm8 | (imm3 << 12) | (i << 26),
            );
        } else {
            self.load_imm(buf, IP, amount);
            let op = if disp >= 0 { T2_ADD } else { T2_SUB };
            emit_32(buf, enc_32_rrr(op, false, r, r, IP));
        }
        Ok(())
    }

    fn jump(&mut self, buf: &mut CodeBuffer, ty: JumpType) -> CodegenResult<Jump> {
        let kind = match ty.kind {
            JumpKind::Cond(CondCode::Overflow) if self.ov_from_z => {
                JumpKind::Cond(CondCode::NotEqual)
            }
            JumpKind::Cond(CondCode::NotOverflow) if self.ov_from_z => {
                JumpKind::Cond(CondCode::Equal)
            }
            k => k,
        };
        let data = JumpData {
            kind,
            rewritable: ty.rewritable,
            target: JumpTarget::Unset,
            hint: 0,
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
        let target = self.load_word(buf, IP, LR, src)?;
        let link = matches!(ty.kind, JumpKind::Call(_) | JumpKind::FastCall);
        let op: u16 = if link { 0x4780 } else { 0x4700 };
        buf.put2(op | (u16::from(target) << 3));
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
            Operand::Reg(d) => self.hw(d),
            _ => IP,
        };
        self.movw_movt(buf, work, init as u32);
        let konst = buf.add_const(8);
        if let Operand::Mem(m) = dst {
            let scratch = if work == IP { LR } else { IP };
            self.ldst(buf, 0xf8c0_0000, work, scratch, &m)?;
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
            &[12]
        } else {
            &[10]
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
        // b<cond>.w displacement is from pc = at + 4, in halfwords.
        let off = (i64::from(target) - i64::from(at) - 4) / 2;
        if (-(1 << 19)..(1 << 19)).contains(&off) {
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
            JumpKind::Cond(cc) => Some(cond_bits(cc)),
            JumpKind::FCond(cc) => Some(fcond_bits(cc)),
            _ => None,
        };
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            let target = target.unwrap();
            match cond {
                Some(c) if size == 4 => {
                    let off = (i64::from(target) - i64::from(at) - 4) / 2;
                    emit_32(sink, enc_32_cond_branch(c, off as i32));
                }
                Some(c) => {
                    // Inverted skip over a full-range b.w.
                    emit_32(sink, enc_32_cond_branch(c ^ 1, 0));
                    let off = (i64::from(target) - i64::from(at + 4) - 4) / 2;
                    emit_32(sink, enc_32_jump(off as i32));
                }
                None => {
                    let off = (i64::from(target) - i64::from(at) - 4) / 2;
                    let mut word = enc_32_jump(off as i32);
                    if matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall) {
                        word |= 1 << 14; // bl
                    }
                    emit_32(sink, word);
                }
            }
            return at;
        }

        // movw/movt ip; bx/blx ip, IT-predicated when conditional.
        let mut site = at;
        if let Some(c) = cond {
            sink.put2(enc_16_it(c, 3));
            site = at + 2;
        }
        let fix = match jump.target {
            JumpTarget::Label(_) => FixTarget::Offset(target.unwrap()),
            JumpTarget::Addr(a) => FixTarget::Addr(a),
            JumpTarget::Unset => FixTarget::Addr(0),
        };
        sink.fixup(FixupKind::Thumb2MovSeq, fix);
        let value = match fix {
            FixTarget::Addr(a) => (a as u32) | 1,
            _ => 0,
        };
        self.movw_movt(sink, IP, value);
        let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
        let op: u16 = if link { 0x4780 } else { 0x4700 };
        sink.put2(op | (u16::from(IP) << 3));
        let _ = size;
        site
    }

    fn pad_to(&self, target: CodeOffset, sink: &mut CodeSink) {
        while sink.cur_offset() < target {
            sink.put2(0xbf00);
        }
    }
}

/// Rewrite a Thumb-2 `movw`/`movt` pair in place (halfword-swapped words).
pub(crate) fn patch_movw_movt(code: &mut [u8], value: u32) {
    for (i, imm16) in [(0usize, value & 0xffff), (4, value >> 16)] {
        let hi = u16::from_le_bytes(code[i..i + 2].try_into().unwrap());
        let lo = u16::from_le_bytes(code[i + 2..i + 4].try_into().unwrap());
        let mut word = (u32::from(hi) << 16) | u32::from(lo);
        let imm8 = imm16 & 0xff;
        let imm3 = (imm16 >> 8) & 0x7;
        let ibit = (imm16 >> 11) & 0x1;
        let imm4 = (imm16 >> 12) & 0xf;
        word = (word & 0xfbf0_8f00) | imm8 | (imm3 << 12) | (imm4 << 16) | (ibit << 26);
        code[i..i + 2].copy_from_slice(&((word >> 16) as u16).to_le_bytes());
        code[i + 2..i + 4].copy_from_slice(&((word & 0xffff) as u16).to_le_bytes());
    }
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::operand::{r, s};

    fn emit(f: impl FnOnce(&mut Thumb2Backend, &mut CodeBuffer)) -> Vec<u8> {
        let mut backend = Thumb2Backend::new();
        let mut buf = CodeBuffer::new();
        f(&mut backend, &mut buf);
        buf.finalize(&mut backend).unwrap().code().to_vec()
    }

    fn halfwords(code: &[u8]) -> Vec<u16> {
        code.chunks(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    #[test]
    fn mov_is_16bit() {
        let code = emit(|b, buf| {
            b.op1(buf, Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(r(1)))
                .unwrap();
        });
        assert_eq!(halfwords(&code), vec![enc_16_mov(0, 1)]);
    }

    #[test]
    fn movw_movt_wide_imm() {
        let code = emit(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Imm(0x12345678),
            )
            .unwrap();
        });
        let hw = halfwords(&code);
        assert_eq!(hw.len(), 4);
        // movw r0, #0x5678: f245 6078
        assert_eq!(hw[0], 0xf245);
        assert_eq!(hw[1], 0x6078);
        // movt r0, #0x1234: f2c1 2034
        assert_eq!(hw[2], 0xf2c1);
        assert_eq!(hw[3], 0x2034);
    }

    #[test]
    fn add_three_regs() {
        let code = emit(|b, buf| {
            b.op2(
                buf,
                Op2::Add,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Reg(r(1)),
                Operand::Reg(r(2)),
            )
            .unwrap();
        });
        let hw = halfwords(&code);
        // add.w r0, r1, r2 = eb01 0002
        assert_eq!(hw, vec![0xeb01, 0x0002]);
    }

    #[test]
    fn load_from_saved() {
        let code = emit(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Mem(Mem::base(s(0), 16)),
            )
            .unwrap();
        });
        let hw = halfwords(&code);
        // ldr.w r0, [r4, #16] = f8d4 0010
        assert_eq!(hw, vec![0xf8d4, 0x0010]);
    }

    #[test]
    fn cond_branch_in_range() {
        let mut backend = Thumb2Backend::new();
        let mut buf = CodeBuffer::new();
        let j = backend
            .jump(&mut buf, JumpType::cond(CondCode::Equal))
            .unwrap();
        for _ in 0..4 {
            backend.op0(&mut buf, Op0::Nop).unwrap();
        }
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        let hw = halfwords(image.code());
        // beq.w +12: off = (12 - 4) / 2 = 4
        assert_eq!(
            (u32::from(hw[0]) << 16) | u32::from(hw[1]),
            enc_32_cond_branch(0, 4)
        );
    }

    #[test]
    fn rewritable_jump_sets_thumb_bit() {
        let mut backend = Thumb2Backend::new();
        let mut buf = CodeBuffer::new();
        let j = backend.jump(&mut buf, JumpType::jump().rewritable()).unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        assert_eq!(image.len(), 10);
        let mut code = image.code().to_vec();
        image.relocate(0x8000, &mut code);
        // movw imm16 low half carries the interworking bit: 0x800a | 1.
        let hi = u16::from_le_bytes(code[0..2].try_into().unwrap());
        let lo = u16::from_le_bytes(code[2..4].try_into().unwrap());
        let word = (u32::from(hi) << 16) | u32::from(lo);
        let imm = (word & 0xff)
            | ((word >> 12) & 0x7) << 8
            | ((word >> 26) & 1) << 11
            | ((word >> 16) & 0xf) << 12;
        assert_eq!(imm, 0x800b);
    }
}
