//! S390x ISA: binary code emission.
//!
//! Big-endian, mixed 2/4/6-byte formats. Register map: `r0..r3` =
//! %r2..%r5 (argument/return positions), `s0..s3` = %r8..%r11, locals
//! base = %r15 above the 160-byte register save area, temporaries %r1
//! (addressing) and %r0 (data only; %r0 as a base reads as zero).
//!
//! The 2-bit condition code is context dependent: compare, arithmetic and
//! logical (carry) instructions distribute the same predicates over
//! different masks, so the backend records which flavor last ran. The
//! zero flag additionally survives in a dedicated flag register (%r12)
//! so a zero test never has to trust a clobbered CC, and wide multiplies
//! synthesize their overflow through an explicit sign check.

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

const R0: u8 = 0;
const TMP1: u8 = 1;
const SPR: u8 = 15;
const LINK: u8 = 14;
const FTMP: u8 = 1;
const FTMP2: u8 = 3;

/// Virtual-to-native map: r0..r3 = %r2..%r5, s0..s3 = %r8..%r11, sp = %r15.
const MAP: [u8; 9] = [2, 3, 4, 5, 8, 9, 10, 11, SPR];

/// The register save area the ABI reserves at the bottom of each frame.
const RESERVED: u32 = 160;

/// The dedicated zero-flag register (kept callee-saved by the prologue's
/// full `stmg`). Routing every use through this type keeps the encoder
/// from clobbering the slot between a flag-setting op and its branch.
struct FlagSlot;

impl FlagSlot {
    const REG: u8 = 12;
}

// Callee-saved helpers the wide-multiply sequences borrow (restored by
// the epilogue's lmg like everything else).
const HELP1: u8 = 6;
const HELP2: u8 = 7;

/// Which instruction flavor last set the condition code.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CcFlavor {
    /// c/cl compare: CC = 0 eq, 1 low, 2 high.
    Cmp,
    /// Signed arithmetic: CC = 0 zero, 1 neg, 2 pos, 3 overflow.
    Arith,
    /// Logical (carry) arithmetic: CC bit1 = carry.
    Logical,
    /// cdbr float compare: CC = 0 eq, 1 low, 2 high, 3 unordered.
    FCmp,
    /// Overflow synthesized through a zero test.
    OvFromZ,
}

pub(crate) struct S390xBackend {
    flavor: CcFlavor,
}

fn rr(op: u8, r1: u8, r2: u8) -> u16 {
    (u16::from(op) << 8) | (u16::from(r1) << 4) | u16::from(r2)
}

fn rre(op: u16, r1: u8, r2: u8) -> u32 {
    (u32::from(op) << 16) | (u32::from(r1) << 4) | u32::from(r2)
}

fn ri(op2: u8, r1: u8, imm16: u16) -> u32 {
    0xa700_0000 | (u32::from(r1) << 20) | (u32::from(op2) << 16) | u32::from(imm16)
}

/// RIL format (6 bytes): opcode A, r1/mask, opcode B, imm32.
fn ril(op_hi: u8, r1: u8, op_lo: u8, imm32: u32) -> u64 {
    (u64::from(op_hi) << 40)
        | (u64::from(r1) << 36)
        | (u64::from(op_lo) << 32)
        | u64::from(imm32)
}

/// RXY format (6 bytes): opcode, r1, x2, b2, 20-bit displacement, opcode2.
fn rxy(op: u8, r1: u8, x2: u8, b2: u8, disp: i32, op2: u8) -> u64 {
    debug_assert!((-(1 << 19)..(1 << 19)).contains(&disp));
    let d = (disp as u32) & 0xf_ffff;
    (u64::from(op) << 40)
        | (u64::from(r1) << 36)
        | (u64::from(x2) << 32)
        | (u64::from(b2) << 28)
        | (u64::from(d & 0xfff) << 16)
        | (u64::from(d >> 12) << 8)
        | u64::from(op2)
}

/// RSY format (6 bytes) for shifts and stmg/lmg.
fn rsy(r1: u8, r3: u8, b2: u8, disp: i32, op2: u8) -> u64 {
    let d = (disp as u32) & 0xf_ffff;
    (0xebu64 << 40)
        | (u64::from(r1) << 36)
        | (u64::from(r3) << 32)
        | (u64::from(b2) << 28)
        | (u64::from(d & 0xfff) << 16)
        | (u64::from(d >> 12) << 8)
        | u64::from(op2)
}

impl S390xBackend {
    pub(crate) fn new() -> Self {
        S390xBackend {
            flavor: CcFlavor::Arith,
        }
    }

    fn hw(&self, r: Reg) -> u8 {
        MAP[r.index() as usize]
    }

    fn put2(&self, buf: &mut dyn ByteSink, hw: u16) {
        buf.put2_be(hw);
    }

    fn put4(&self, buf: &mut dyn ByteSink, w: u32) {
        buf.put4_be(w);
    }

    fn put6(&self, buf: &mut dyn ByteSink, w: u64) {
        buf.put6_be(w);
    }

    fn mov_rr(&self, buf: &mut dyn ByteSink, r1: u8, r2: u8) {
        self.put4(buf, rre(0xb904, r1, r2)); // lgr
    }

    /// Materialize a 64-bit immediate with the facility-selected shortest
    /// sequence: lghi, llill/llilh/llihl/llihh, lgfi, llilf, or the
    /// iihf/iilf pair.
    fn load_imm(&self, buf: &mut dyn ByteSink, rd: u8, value: i64) {
        if (-0x8000..0x8000).contains(&value) {
            self.put4(buf, ri(0x9, rd, value as u16)); // lghi
            return;
        }
        let v = value as u64;
        let halves = [
            (v >> 48) as u16,
            (v >> 32) as u16,
            (v >> 16) as u16,
            v as u16,
        ];
        let nonzero = halves.iter().filter(|h| **h != 0).count();
        if nonzero == 1 {
            // One halfword insert covers it.
            let ops: [u32; 4] = [0xc, 0xd, 0xe, 0xf]; // llihh, llihl, llilh, llill
            for (i, half) in halves.iter().enumerate() {
                if *half != 0 {
                    self.put4(
                        buf,
                        0xa500_0000 | (u32::from(rd) << 20) | (ops[i] << 16) | u32::from(*half),
                    );
                    return;
                }
            }
        }
        if (i32::MIN as i64..=i32::MAX as i64).contains(&value) {
            self.put6(buf, ril(0xc0, rd, 0x1, value as u32)); // lgfi
            return;
        }
        if v >> 32 == 0 {
            self.put6(buf, ril(0xc0, rd, 0xf, v as u32)); // llilf
            return;
        }
        self.put6(buf, ril(0xc0, rd, 0xe, (v >> 32) as u32)); // llihf
        self.put6(buf, ril(0xc0, rd, 0x9, v as u32)); // iilf
    }

    /// Fixed patchable form: iihf + iilf.
    fn load_imm_patchable(&self, sink: &mut dyn ByteSink, rd: u8, value: u64) {
        self.put6(sink, ril(0xc0, rd, 0x8, (value >> 32) as u32)); // iihf
        self.put6(sink, ril(0xc0, rd, 0x9, value as u32)); // iilf
    }

    /// Resolve a memory operand to `(base, index, disp)` within RXY range.
    fn lower_mem(
        &self,
        buf: &mut CodeBuffer,
        m: &Mem,
    ) -> CodegenResult<(u8, u8, i32)> {
        let bias = if m.base == Some(crate::operand::sp()) {
            i64::from(RESERVED)
        } else {
            0
        };
        let mut base = match m.base {
            Some(b) => self.hw(b),
            None => 0,
        };
        let mut index = match m.index {
            Some((i, 0)) => self.hw(i),
            Some((i, shift)) => {
                // sllg tmp1, index, shift
                self.put6(buf, rsy(TMP1, self.hw(i), 0, i32::from(shift), 0x0d));
                TMP1
            }
            None => 0,
        };
        let mut disp = m.disp + bias;
        if !(-(1 << 19)..(1 << 19)).contains(&disp) {
            // Fold the far displacement into the address temporary.
            if index == TMP1 {
                self.load_imm(buf, R0, disp);
                self.put4(buf, rre(0xb908, TMP1, R0)); // agr
            } else {
                self.load_imm(buf, TMP1, disp);
                if index != 0 {
                    self.put4(buf, rre(0xb908, TMP1, index));
                }
            }
            index = base;
            base = TMP1;
            disp = 0;
        }
        Ok((base, index, disp as i32))
    }

    fn load_operand(
        &mut self,
        buf: &mut CodeBuffer,
        want: u8,
        src: Operand,
    ) -> CodegenResult<u8> {
        match src {
            Operand::Reg(s) => {
                let native = self.hw(s);
                if native == SPR {
                    // la want, RESERVED(%r15): the locals base.
                    self.put4(
                        buf,
                        0x4100_0000 | (u32::from(want) << 20) | (u32::from(SPR) << 12) | RESERVED,
                    );
                    Ok(want)
                } else {
                    Ok(native)
                }
            }
            Operand::Imm(v) => {
                self.load_imm(buf, want, v);
                Ok(want)
            }
            Operand::Mem(m) => {
                let (b, x, d) = self.lower_mem(buf, &m)?;
                self.put6(buf, rxy(0xe3, want, x, b, d, 0x04)); // lg
                Ok(want)
            }
        }
    }

    fn store_result(&mut self, buf: &mut CodeBuffer, work: u8, dst: Operand) -> CodegenResult<()> {
        match dst {
            Operand::Reg(d) => {
                let native = self.hw(d);
                debug_assert!(native != SPR);
                if native != work {
                    self.mov_rr(buf, native, work);
                }
            }
            Operand::Mem(m) => {
                let (b, x, d) = self.lower_mem(buf, &m)?;
                self.put6(buf, rxy(0xe3, work, x, b, d, 0x24)); // stg
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fhw(&self, r: FReg) -> u8 {
        r.index() * 2
    }

    fn fldst(&mut self, buf: &mut CodeBuffer, load: bool, f: u8, m: &Mem) -> CodegenResult<()> {
        let (b, x, d) = self.lower_mem(buf, &m)?;
        if (0..4096).contains(&d) {
            let op = if load { 0x68u32 } else { 0x60 };
            self.put4(
                buf,
                (op << 24) | (u32::from(f) << 20) | (u32::from(x) << 16) | (u32::from(b) << 12) | d as u32,
            );
        } else {
            let op2 = if load { 0x65 } else { 0x67 }; // ldy/stdy
            self.put6(buf, rxy(0xed, f, x, b, d, op2));
        }
        Ok(())
    }

    fn load_fop(&mut self, buf: &mut CodeBuffer, want: u8, src: FOperand) -> CodegenResult<u8> {
        match src {
            FOperand::Reg(s) => Ok(self.fhw(s)),
            FOperand::Mem(m) => {
                self.fldst(buf, true, want, &m)?;
                Ok(want)
            }
        }
    }

    /// Branch mask implementing `cc` under the current flavor.
    fn cond_mask(&self, cc: CondCode) -> u32 {
        match self.flavor {
            CcFlavor::Cmp => match cc {
                CondCode::Equal => 8,
                CondCode::NotEqual => 6,
                CondCode::Less | CondCode::SigLess => 4,
                CondCode::GreaterEqual | CondCode::SigGreaterEqual => 10,
                CondCode::Greater | CondCode::SigGreater => 2,
                CondCode::LessEqual | CondCode::SigLessEqual => 12,
                // Overflow/carry do not survive a pure compare.
                _ => 0,
            },
            CcFlavor::Arith => match cc {
                CondCode::Equal => 8,
                CondCode::NotEqual => 7,
                CondCode::SigLess => 4,
                CondCode::SigGreaterEqual => 11,
                CondCode::SigGreater => 2,
                CondCode::SigLessEqual => 13,
                CondCode::Overflow => 1,
                CondCode::NotOverflow => 14,
                _ => 0,
            },
            CcFlavor::Logical => match cc {
                // CC bit 1 distinguishes carry; bit 0 zero/non-zero.
                CondCode::Carry => 3,
                CondCode::NotCarry => 12,
                CondCode::Equal => 10,
                CondCode::NotEqual => 5,
                _ => 0,
            },
            CcFlavor::FCmp => 0,
            // After the synthesized cgr: equal means no overflow.
            CcFlavor::OvFromZ => match cc {
                CondCode::Overflow => 6,
                CondCode::NotOverflow => 8,
                _ => 0,
            },
        }
    }

    fn fcond_mask(fc: FloatCond) -> u32 {
        match fc {
            FloatCond::Equal => 8,
            FloatCond::NotEqual => 7,
            FloatCond::Less => 4,
            FloatCond::GreaterEqual => 10,
            FloatCond::Greater => 2,
            FloatCond::LessEqual => 12,
            FloatCond::Unordered => 1,
            FloatCond::Ordered => 14,
        }
    }

    /// Resolve a predicate to a branch mask, synthesizing the zero test
    /// from the flag register when the CC cannot answer it.
    fn branch_mask(&self, buf: &mut CodeBuffer, cc: CondCode) -> u32 {
        if matches!(self.flavor, CcFlavor::Arith | CcFlavor::Logical)
            && matches!(cc, CondCode::Equal | CondCode::NotEqual)
        {
            // cghi flag, 0: the slot always has the last Z-relevant value.
            self.put4(buf, ri(0xf, FlagSlot::REG, 0));
            return if cc == CondCode::Equal { 8 } else { 6 };
        }
        self.cond_mask(cc)
    }

    fn frame_size(&self, abi: &AbiProfile) -> u32 {
        (RESERVED + abi.local_size + 7) & !7
    }
}

impl Backend for S390xBackend {
    fn arch(&self) -> Arch {
        Arch::S390x
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
        // stmg %r6, %r15, 48(%r15): the caller's save area holds every
        // callee-saved register, the link register and the old sp.
        self.put6(buf, rsy(6, 15, SPR, 48, 0x24));
        for i in 0..abi.fsaveds {
            // std f8+2i into the f8..f15 slots of the save area.
            let f = 8 + 2 * i;
            self.put4(
                buf,
                (0x60u32 << 24) | (u32::from(f) << 20) | (u32::from(SPR) << 12) | (128 + 8 * u32::from(i)),
            );
        }
        let frame = self.frame_size(abi);
        if frame < 0x8000 {
            self.put4(buf, ri(0xb, SPR, (-(frame as i64)) as u16)); // aghi
        } else {
            self.put6(buf, ril(0xc2, SPR, 0x8, (-(frame as i64)) as u32)); // agfi
        }
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
        let frame = self.frame_size(abi);
        for i in 0..abi.fsaveds {
            let f = 8 + 2 * i;
            self.put4(
                buf,
                (0x68u32 << 24)
                    | (u32::from(f) << 20)
                    | (u32::from(SPR) << 12)
                    | (frame + 128 + 8 * u32::from(i)),
            );
        }
        // lmg %r6, %r15, frame+48(%r15): restores the old sp too.
        self.put6(buf, rsy(6, 15, SPR, (frame + 48) as i32, 0x04));
        // br %r14
        self.put2(buf, rr(0x07, 0xf, LINK));
        Ok(())
    }

    fn op0(&mut self, buf: &mut CodeBuffer, op: Op0) -> CodegenResult<()> {
        match op {
            Op0::Nop => self.put4(buf, 0x4700_0000), // bc 0, 0
            Op0::Breakpoint => self.put2(buf, 0x0001),
            Op0::LMulUw => {
                // mlgr wants an even/odd pair: r0:r1 = r1 * operand.
                self.mov_rr(buf, 1, MAP[0]);
                self.put4(buf, rre(0xb986, R0, MAP[1])); // mlgr r0, r3
                self.mov_rr(buf, MAP[0], 1);
                self.mov_rr(buf, MAP[1], R0);
            }
            Op0::LMulSw => {
                // Unsigned widening plus the two sign corrections; the
                // originals survive in r2/r3 until the final moves.
                self.mov_rr(buf, 1, MAP[0]);
                self.put4(buf, rre(0xb986, R0, MAP[1]));
                // srag h, a, 63; ngr h, b; sgr r0, h
                self.put6(buf, rsy(HELP1, MAP[0], 0, 63, 0x0a));
                self.put4(buf, rre(0xb980, HELP1, MAP[1]));
                self.put4(buf, rre(0xb909, R0, HELP1));
                self.put6(buf, rsy(HELP1, MAP[1], 0, 63, 0x0a));
                self.put4(buf, rre(0xb980, HELP1, MAP[0]));
                self.put4(buf, rre(0xb909, R0, HELP1));
                self.mov_rr(buf, MAP[0], 1);
                self.mov_rr(buf, MAP[1], R0);
            }
            Op0::DivmodUw => {
                // dlgr: r0:r1 / operand -> quotient r1, remainder r0.
                self.load_imm(buf, R0, 0);
                self.mov_rr(buf, 1, MAP[0]);
                self.put4(buf, rre(0xb987, R0, MAP[1]));
                self.mov_rr(buf, MAP[0], 1);
                self.mov_rr(buf, MAP[1], R0);
            }
            Op0::DivmodSw => {
                // dsgr: dividend in r1.
                self.mov_rr(buf, 1, MAP[0]);
                self.put4(buf, rre(0xb90d, R0, MAP[1]));
                self.mov_rr(buf, MAP[0], 1);
                self.mov_rr(buf, MAP[1], R0);
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
        match op {
            Op1::Mov => match (dst, src) {
                (Operand::Reg(d), _) => {
                    let d = self.hw(d);
                    let s = self.load_operand(buf, d, src)?;
                    if s != d {
                        self.mov_rr(buf, d, s);
                    }
                }
                (Operand::Mem(_), _) => {
                    let work = self.load_operand(buf, R0, src)?;
                    self.store_result(buf, work, dst)?;
                }
                (Operand::Imm(_), _) => return Err(Error::BadArgument),
            },
            Op1::MovU8 | Op1::MovS8 | Op1::MovU16 | Op1::MovS16 | Op1::MovU32 | Op1::MovS32 => {
                let (width, signed) = op.mov_width().unwrap();
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => R0,
                };
                match src {
                    Operand::Mem(m) => {
                        let (b, x, d) = self.lower_mem(buf, &m)?;
                        let op2 = match (width, signed) {
                            (1, false) => 0x90, // llgc
                            (1, true) => 0x77,  // lgb
                            (2, false) => 0x91, // llgh
                            (2, true) => 0x15,  // lgh
                            (4, false) => 0x16, // llgf
                            _ => 0x14,          // lgf
                        };
                        self.put6(buf, rxy(0xe3, work, x, b, d, op2));
                    }
                    Operand::Reg(s) => {
                        let s = self.hw(s);
                        let ext = match (width, signed) {
                            (1, false) => 0xb984, // llgcr
                            (1, true) => 0xb906,  // lgbr
                            (2, false) => 0xb985, // llghr
                            (2, true) => 0xb907,  // lghr
                            (4, false) => 0xb916, // llgfr
                            _ => 0xb914,          // lgfr
                        };
                        self.put4(buf, rre(ext, work, s));
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
                        self.load_imm(buf, work, v);
                    }
                }
                if let Operand::Mem(dm) = dst {
                    let (b, x, d) = self.lower_mem(buf, &dm)?;
                    let op2 = match width {
                        1 => 0x72, // stcy
                        2 => 0x70, // sthy
                        4 => 0x50, // sty
                        _ => 0x24,
                    };
                    self.put6(buf, rxy(0xe3, work, x, b, d, op2));
                }
            }
            Op1::Not | Op1::Neg | Op1::Clz => {
                let s = self.load_operand(buf, R0, src)?;
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => R0,
                };
                match op {
                    Op1::Not => {
                        // x ^ -1 via xilf/xihf pair.
                        if work != s {
                            self.mov_rr(buf, work, s);
                        }
                        self.put6(buf, ril(0xc0, work, 0x6, !0)); // xihf
                        self.put6(buf, ril(0xc0, work, 0x7, !0)); // xilf
                        if mods.set_z {
                            self.mov_rr(buf, FlagSlot::REG, work);
                            self.flavor = CcFlavor::Arith;
                        }
                    }
                    Op1::Neg => {
                        self.put4(buf, rre(0xb903, work, s)); // lcgr
                        if mods.sets_flags() {
                            self.mov_rr(buf, FlagSlot::REG, work);
                            self.flavor = CcFlavor::Arith;
                        }
                    }
                    Op1::Clz => {
                        // flogr writes the r0/r1 pair.
                        self.put4(buf, rre(0xb983, R0, s));
                        if work != R0 {
                            self.mov_rr(buf, work, R0);
                        }
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
        // Pure compare.
        if dst.is_none() && op == Op2::Sub {
            let a = self.load_operand(buf, R0, src1)?;
            let signed = mods.cmp.map_or(true, |cc| cc.is_signed());
            match src2 {
                Operand::Imm(v) if signed && (-0x8000..0x8000).contains(&v) => {
                    self.put4(buf, ri(0xf, a, v as u16)); // cghi
                }
                Operand::Imm(v) if signed && (i32::MIN as i64..=i32::MAX as i64).contains(&v) => {
                    self.put6(buf, ril(0xc2, a, 0xc, v as u32)); // cgfi
                }
                Operand::Imm(v) if !signed && (0..=u32::MAX as i64).contains(&v) => {
                    self.put6(buf, ril(0xc2, a, 0xe, v as u32)); // clgfi
                }
                _ => {
                    let b = self.load_operand(buf, TMP1, src2)?;
                    let opc = if signed { 0xb920 } else { 0xb921 }; // cgr/clgr
                    self.put4(buf, rre(opc, a, b));
                }
            }
            self.flavor = CcFlavor::Cmp;
            return Ok(());
        }

        let a = self.load_operand(buf, TMP1, src1)?;
        // Two-operand forms overwrite the first operand: when the
        // destination aliases src2, work in the temporary instead.
        let work = match dst {
            Some(Operand::Reg(d)) if dst != Some(src2) => self.hw(d),
            _ => TMP1,
        };
        if work != a {
            self.mov_rr(buf, work, a);
        }
        match op {
            Op2::Add | Op2::Sub | Op2::Addc | Op2::Subc => {
                let logical = mods.set_carry || matches!(op, Op2::Addc | Op2::Subc);
                let b = self.load_operand(buf, R0, src2)?;
                let opc = match (op, logical) {
                    (Op2::Add, false) => 0xb908, // agr
                    (Op2::Add, true) => 0xb90a,  // algr
                    (Op2::Sub, false) => 0xb909, // sgr
                    (Op2::Sub, true) => 0xb90b,  // slgr
                    (Op2::Addc, _) => 0xb988,    // alcgr
                    (Op2::Subc, _) => 0xb989,    // slbgr
                    _ => unreachable!(),
                };
                self.put4(buf, rre(opc, work, b));
                if mods.sets_flags() {
                    self.flavor = if logical { CcFlavor::Logical } else { CcFlavor::Arith };
                    if mods.set_z {
                        self.mov_rr(buf, FlagSlot::REG, work);
                    }
                }
            }
            Op2::And | Op2::Or | Op2::Xor => {
                let b = self.load_operand(buf, R0, src2)?;
                let opc = match op {
                    Op2::And => 0xb980,
                    Op2::Or => 0xb981,
                    _ => 0xb982,
                };
                self.put4(buf, rre(opc, work, b));
                if mods.set_z {
                    self.mov_rr(buf, FlagSlot::REG, work);
                    self.flavor = CcFlavor::Arith;
                }
            }
            Op2::Mul => {
                if mods.set_overflow {
                    // Widening multiply with sign corrections, then the
                    // signed high half is compared against the low half's
                    // sign extension: equal means no overflow.
                    let b = self.load_operand(buf, R0, src2)?;
                    self.mov_rr(buf, HELP1, work);
                    self.mov_rr(buf, HELP2, b);
                    self.mov_rr(buf, 1, HELP1);
                    self.put4(buf, rre(0xb986, R0, HELP2)); // mlgr
                    self.put6(buf, rsy(FlagSlot::REG, HELP1, 0, 63, 0x0a));
                    self.put4(buf, rre(0xb980, FlagSlot::REG, HELP2));
                    self.put4(buf, rre(0xb909, R0, FlagSlot::REG));
                    self.put6(buf, rsy(FlagSlot::REG, HELP2, 0, 63, 0x0a));
                    self.put4(buf, rre(0xb980, FlagSlot::REG, HELP1));
                    self.put4(buf, rre(0xb909, R0, FlagSlot::REG));
                    self.mov_rr(buf, work, 1);
                    self.put6(buf, rsy(FlagSlot::REG, work, 0, 63, 0x0a));
                    self.put4(buf, rre(0xb920, R0, FlagSlot::REG)); // cgr
                    self.flavor = CcFlavor::OvFromZ;
                } else {
                    let b = self.load_operand(buf, R0, src2)?;
                    self.put4(buf, rre(0xb90c, work, b)); // msgr
                    if mods.set_z {
                        self.mov_rr(buf, FlagSlot::REG, work);
                        self.flavor = CcFlavor::Arith;
                    }
                }
            }
            Op2::Shl | Op2::Lshr | Op2::Ashr => {
                let op2 = match op {
                    Op2::Shl => 0x0d,  // sllg
                    Op2::Lshr => 0x0c, // srlg
                    _ => 0x0a,         // srag
                };
                match src2 {
                    Operand::Imm(v) => {
                        self.put6(buf, rsy(work, a, 0, (v as i32) & 63, op2));
                    }
                    _ => {
                        // The shift amount register is a base field: %r0
                        // there means "none", so stage counts elsewhere.
                        let b = self.load_operand(buf, HELP1, src2)?;
                        self.put6(buf, rsy(work, a, b, 0, op2));
                    }
                }
                if mods.set_z {
                    self.mov_rr(buf, FlagSlot::REG, work);
                    self.flavor = CcFlavor::Arith;
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
                        self.put2(buf, rr(0x28, self.fhw(d), self.fhw(s))); // ldr
                    }
                }
                (FOperand::Reg(d), FOperand::Mem(m)) => self.fldst(buf, true, self.fhw(d), &m)?,
                (FOperand::Mem(m), FOperand::Reg(s)) => self.fldst(buf, false, self.fhw(s), &m)?,
                (FOperand::Mem(dm), FOperand::Mem(_)) => {
                    let s = self.load_fop(buf, FTMP, src)?;
                    self.fldst(buf, false, s, &dm)?;
                }
            },
            FOp1::Neg | FOp1::Abs => {
                let s = self.load_fop(buf, FTMP, src)?;
                let work = match dst {
                    FOperand::Reg(d) => self.fhw(d),
                    _ => FTMP,
                };
                let opc = if op == FOp1::Neg { 0xb313 } else { 0xb310 };
                self.put4(buf, rre(opc, work, s));
                if let FOperand::Mem(dm) = dst {
                    self.fldst(buf, false, work, &dm)?;
                }
            }
            FOp1::Cmp => {
                let a = self.load_fop(buf, FTMP, dst)?;
                let b = self.load_fop(buf, FTMP2, src)?;
                self.put4(buf, rre(0xb319, a, b)); // cdbr
                self.flavor = CcFlavor::FCmp;
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
        let a = self.load_fop(buf, FTMP, src1)?;
        let b = self.load_fop(buf, FTMP2, src2)?;
        let work = match dst {
            FOperand::Reg(d) => self.fhw(d),
            _ => FTMP,
        };
        if work != a {
            self.put2(buf, rr(0x28, work, a));
        }
        let opc = match op {
            FOp2::Add => 0xb31a,
            FOp2::Sub => 0xb31b,
            FOp2::Mul => 0xb31c,
            FOp2::Div => 0xb31d,
        };
        self.put4(buf, rre(opc, work, b));
        if let FOperand::Mem(dm) = dst {
            self.fldst(buf, false, work, &dm)?;
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
        let mask = self.branch_mask(buf, cc);
        // lghi r0, 0; brc mask, +8 (skip); lghi r0, 1... inverted: set 1
        // first so the taken path keeps it.
        self.put4(buf, ri(0x9, R0, 1));
        // brc mask, over the clear (2 halfwords for brc + 2 for lghi).
        self.put4(buf, 0xa704_0000 | (mask << 20) | 4);
        self.put4(buf, ri(0x9, R0, 0));
        match op {
            FlagsOp::Mov => self.store_result(buf, R0, dst),
            FlagsOp::Or => {
                let cur = self.load_operand(buf, TMP1, dst)?;
                self.put4(buf, rre(0xb981, R0, cur)); // ogr r0, cur
                self.store_result(buf, R0, dst)
            }
        }
    }

    fn fast_enter(&mut self, buf: &mut CodeBuffer, dst: Operand) -> CodegenResult<()> {
        self.store_result(buf, LINK, dst)
    }

    fn fast_return(&mut self, buf: &mut CodeBuffer, src: Operand) -> CodegenResult<()> {
        let s = self.load_operand(buf, TMP1, src)?;
        self.put2(buf, rr(0x07, 0xf, s)); // br
        Ok(())
    }

    fn add_no_flags(&mut self, buf: &mut CodeBuffer, reg: Reg, disp: i64) -> CodegenResult<()> {
        let r = self.hw(reg);
        // la leaves the condition code alone.
        if (0..4096).contains(&disp) {
            self.put4(buf, 0x4100_0000 | (u32::from(r) << 20) | (u32::from(r) << 12) | disp as u32);
        } else if (-(1 << 19)..(1 << 19)).contains(&disp) {
            self.put6(buf, rxy(0xe3, r, 0, r, disp as i32, 0x71)); // lay
        } else {
            self.load_imm(buf, TMP1, disp);
            // la r, 0(r, tmp1)
            self.put4(buf, 0x4100_0000 | (u32::from(r) << 20) | (u32::from(TMP1) << 16) | (u32::from(r) << 12));
        }
        Ok(())
    }

    fn jump(&mut self, buf: &mut CodeBuffer, ty: JumpType) -> CodegenResult<Jump> {
        let hint = match ty.kind {
            JumpKind::Cond(cc) => self.branch_mask(buf, cc),
            JumpKind::FCond(fc) => Self::fcond_mask(fc),
            _ => 15,
        };
        let data = JumpData {
            kind: ty.kind,
            rewritable: ty.rewritable,
            target: JumpTarget::Unset,
            hint,
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
                hint: 15,
                delay: None,
            };
            let reserved = *self.jump_encodings(&data).last().unwrap();
            buf.add_jump(data, reserved);
            return Ok(());
        }
        let s = self.load_operand(buf, TMP1, src)?;
        if matches!(ty.kind, JumpKind::Call(_) | JumpKind::FastCall) {
            self.put2(buf, rr(0x0d, LINK, s)); // basr
        } else {
            self.put2(buf, rr(0x07, 0xf, s)); // br
        }
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
            _ => R0,
        };
        self.load_imm_patchable(buf, work, init as u64);
        let konst = buf.add_const(12);
        if let Operand::Mem(_) = dst {
            self.store_result(buf, work, dst)?;
        }
        Ok(konst)
    }

    // ---- layout ---------------------------------------------------------

    fn jump_encodings(&self, jump: &JumpData) -> &'static [u32] {
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            // brcl/brasl reach ±4 GiB; one size fits.
            &[6]
        } else {
            // iihf/iilf + bcr/basr.
            &[14]
        }
    }

    fn jump_needed_size(
        &self,
        jump: &JumpData,
        _at: CodeOffset,
        _target: Option<CodeOffset>,
    ) -> u32 {
        self.jump_encodings(jump)[0]
    }

    fn emit_jump(
        &self,
        jump: &JumpData,
        size: u32,
        at: CodeOffset,
        target: Option<CodeOffset>,
        sink: &mut CodeSink,
    ) -> CodeOffset {
        let label = matches!(jump.target, JumpTarget::Label(_));
        let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
        if label && !jump.rewritable {
            let target = target.unwrap();
            let off = ((i64::from(target) - i64::from(at)) / 2) as u32;
            let word = if link {
                ril(0xc0, LINK, 0x5, off) // brasl
            } else {
                ril(0xc0, jump.hint as u8, 0x4, off) // brcl
            };
            sink.put6_be(word);
            return at;
        }
        let fix = match jump.target {
            JumpTarget::Label(_) => FixTarget::Offset(target.unwrap()),
            JumpTarget::Addr(a) => FixTarget::Addr(a),
            JumpTarget::Unset => FixTarget::Addr(0),
        };
        sink.fixup(FixupKind::S390xImm64, fix);
        let value = match fix {
            FixTarget::Addr(a) => a,
            _ => 0,
        };
        self.load_imm_patchable(sink, TMP1, value);
        if link {
            sink.put2_be(rr(0x0d, LINK, TMP1));
        } else {
            sink.put2_be(rr(0x07, jump.hint as u8, TMP1));
        }
        let _ = size;
        at
    }

    fn pad_to(&self, target: CodeOffset, sink: &mut CodeSink) {
        while sink.cur_offset() < target {
            sink.put2_be(0x0707); // bcr 0, %r7 nop
        }
    }
}

/// Rewrite an `iihf`/`iilf` pair in place (big-endian, 6-byte each).
pub(crate) fn patch_imm64(code: &mut [u8], value: u64) {
    code[2..6].copy_from_slice(&((value >> 32) as u32).to_be_bytes());
    code[8..12].copy_from_slice(&(value as u32).to_be_bytes());
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::operand::{r, s};

    fn emit(f: impl FnOnce(&mut S390xBackend, &mut CodeBuffer)) -> Vec<u8> {
        let mut backend = S390xBackend::new();
        let mut buf = CodeBuffer::new();
        f(&mut backend, &mut buf);
        buf.finalize(&mut backend).unwrap().code().to_vec()
    }

    #[test]
    fn mov_is_lgr() {
        let code = emit(|b, buf| {
            b.op1(buf, Op1::Mov, Mods::new(), Some(Operand::Reg(r(0))), Operand::Reg(r(1)))
                .unwrap();
        });
        // lgr %r2, %r3
        assert_eq!(code, vec![0xb9, 0x04, 0x00, 0x23]);
    }

    #[test]
    fn small_imm_is_lghi() {
        let code = emit(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Imm(100),
            )
            .unwrap();
        });
        // lghi %r2, 100
        assert_eq!(code, vec![0xa7, 0x29, 0x00, 0x64]);
    }

    #[test]
    fn single_halfword_uses_insert() {
        let code = emit(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Imm(0x1234_0000),
            )
            .unwrap();
        });
        // llilh %r2, 0x1234
        assert_eq!(code, vec![0xa5, 0x2e, 0x12, 0x34]);
    }

    #[test]
    fn load_from_locals_biases() {
        let code = emit(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Mem(Mem::base(crate::operand::sp(), 8)),
            )
            .unwrap();
        });
        // lg %r2, 168(%r15)
        assert_eq!(code, vec![0xe3, 0x20, 0xf0, 0xa8, 0x00, 0x04]);
    }

    #[test]
    fn compare_picks_logical() {
        let code = emit(|b, buf| {
            let mut mods = Mods::new();
            mods.cmp = Some(CondCode::Less);
            b.op2(buf, Op2::Sub, mods, None, Operand::Reg(r(0)), Operand::Reg(r(1)))
                .unwrap();
        });
        // clgr %r2, %r3
        assert_eq!(code, vec![0xb9, 0x21, 0x00, 0x23]);
    }

    #[test]
    fn label_branch_is_brcl() {
        let mut backend = S390xBackend::new();
        let mut buf = CodeBuffer::new();
        let j = backend
            .jump(&mut buf, JumpType::cond(CondCode::SigLess))
            .unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        // brcl 4, +3 halfwords (cmp-flavor default applies at jump time).
        assert_eq!(image.code()[0], 0xc0);
        assert_eq!(image.len(), 6);
    }

    #[test]
    fn rewritable_jump_patches() {
        let mut backend = S390xBackend::new();
        let mut buf = CodeBuffer::new();
        let j = backend.jump(&mut buf, JumpType::jump().rewritable()).unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        assert_eq!(image.len(), 14);
        let mut code = image.code().to_vec();
        image.relocate(0x2_0000_0000, &mut code);
        let hi = u32::from_be_bytes(code[2..6].try_into().unwrap());
        let lo = u32::from_be_bytes(code[8..12].try_into().unwrap());
        assert_eq!(u64::from(hi) << 32 | u64::from(lo), 0x2_0000_000e);
    }
}
