//! SPARC-32 ISA: binary code emission.
//!
//! Big-endian instruction words, register windows and branch delay slots.
//! Register map: `r0..r3` = %o0..%o3 (outgoing argument/return positions,
//! so calls need no shuffle), `s0..s3` = %i0..%i3 (the incoming arguments
//! land there, so the prologue copies nothing), locals base = %sp with the
//! V8 reserved area below the locals, temporaries %g1 and %l0.
//!
//! The backend keeps a one-instruction staging window: the last emitted
//! word, when marked movable, is swapped into the delay slot of the next
//! branch instead of a `nop`. Flag-setting words, loads/stores of the
//! staging temporaries and control transfers are unmovable.

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

const G0: u8 = 0;
const TMP1: u8 = 1; // %g1
const TMP2: u8 = 16; // %l0
/// Address-only temporary for far displacements; never carries data.
const TMP3: u8 = 17; // %l1
const SPR: u8 = 14; // %o6
const O7: u8 = 15;
const I7: u8 = 31;
const FTMP: u8 = 8; // %f8/%f9
const FTMP2: u8 = 10;

/// Virtual-to-native map: r0..r3 = %o0..%o3, s0..s3 = %i0..%i3, sp = %o6.
const MAP: [u8; 9] = [8, 9, 10, 11, 24, 25, 26, 27, SPR];

/// V8 minimum frame (register-window save area + hidden struct pointer +
/// outgoing argument words is 92 bytes), rounded up so doubles in the
/// local frame stay 8-byte aligned.
const RESERVED: u32 = 96;

const NOP: u32 = 0x0100_0000; // sethi 0, %g0

/// icc branch condition field.
fn cond_bits(cc: CondCode) -> u32 {
    match cc {
        CondCode::Equal => 0x1,
        CondCode::NotEqual => 0x9,
        CondCode::SigLess => 0x3,
        CondCode::SigGreaterEqual => 0xb,
        CondCode::SigGreater => 0xa,
        CondCode::SigLessEqual => 0x2,
        CondCode::Less | CondCode::Carry => 0x5,
        CondCode::GreaterEqual | CondCode::NotCarry => 0xd,
        CondCode::Greater => 0xc,
        CondCode::LessEqual => 0x4,
        CondCode::Overflow => 0x7,
        CondCode::NotOverflow => 0xf,
    }
}

/// fcc branch condition field.
fn fcond_bits(cc: FloatCond) -> u32 {
    match cc {
        FloatCond::Equal => 0x9,
        FloatCond::NotEqual => 0x1,
        FloatCond::Less => 0x4,
        FloatCond::GreaterEqual => 0xb,
        FloatCond::Greater => 0x6,
        FloatCond::LessEqual => 0xd,
        FloatCond::Ordered => 0xf,
        FloatCond::Unordered => 0x7,
    }
}

/// Format-3 instruction (op=2 or 3).
fn enc_f3(op: u32, rd: u8, op3: u32, rs1: u8, rs2: u8) -> u32 {
    (op << 30) | (u32::from(rd) << 25) | (op3 << 19) | (u32::from(rs1) << 14) | u32::from(rs2)
}

fn enc_f3_imm(op: u32, rd: u8, op3: u32, rs1: u8, simm13: i32) -> u32 {
    debug_assert!((-4096..4096).contains(&simm13));
    (op << 30)
        | (u32::from(rd) << 25)
        | (op3 << 19)
        | (u32::from(rs1) << 14)
        | (1 << 13)
        | ((simm13 as u32) & 0x1fff)
}

fn enc_sethi(rd: u8, imm22: u32) -> u32 {
    (u32::from(rd) << 25) | (0b100 << 22) | (imm22 & 0x003f_ffff)
}

const OP3_ADD: u32 = 0x00;
const OP3_AND: u32 = 0x01;
const OP3_OR: u32 = 0x02;
const OP3_XOR: u32 = 0x03;
const OP3_SUB: u32 = 0x04;
const OP3_ADDX: u32 = 0x08;
const OP3_SUBX: u32 = 0x0c;
const OP3_UMUL: u32 = 0x0a;
const OP3_SMUL: u32 = 0x0b;
const OP3_UDIV: u32 = 0x0e;
const OP3_SDIV: u32 = 0x0f;
const OP3_SLL: u32 = 0x25;
const OP3_SRL: u32 = 0x26;
const OP3_SRA: u32 = 0x27;
const OP3_JMPL: u32 = 0x38;
const OP3_SAVE: u32 = 0x3c;
const OP3_RESTORE: u32 = 0x3d;
const OP3_RDY: u32 = 0x28;
const OP3_WRY: u32 = 0x30;
const CC: u32 = 0x10; // the cc-setting op3 bit

const OP3_LD: u32 = 0x00;
const OP3_LDUB: u32 = 0x01;
const OP3_LDUH: u32 = 0x02;
const OP3_LDSB: u32 = 0x09;
const OP3_LDSH: u32 = 0x0a;
const OP3_ST: u32 = 0x04;
const OP3_STB: u32 = 0x05;
const OP3_STH: u32 = 0x06;
const OP3_LDDF: u32 = 0x23;
const OP3_STDF: u32 = 0x27;

pub(crate) struct SparcBackend {
    /// One-instruction lookahead window for delay-slot filling.
    staged: Option<(u32, bool)>,
    ov_from_z: bool,
}

impl SparcBackend {
    pub(crate) fn new() -> Self {
        SparcBackend {
            staged: None,
            ov_from_z: false,
        }
    }

    fn hw(&self, r: Reg) -> u8 {
        MAP[r.index() as usize]
    }

    /// Emit through the staging window. `movable` marks words that may be
    /// hoisted into a branch delay slot.
    fn put_ins(&mut self, buf: &mut CodeBuffer, word: u32, movable: bool) {
        if let Some((prev, _)) = self.staged.replace((word, movable)) {
            buf.put4_be(prev);
        }
    }

    fn flush(&mut self, buf: &mut CodeBuffer) {
        if let Some((word, _)) = self.staged.take() {
            buf.put4_be(word);
        }
    }

    /// Take the staged word if it can fill a delay slot.
    fn take_movable(&mut self, buf: &mut CodeBuffer) -> Option<u32> {
        match self.staged {
            Some((word, true)) => {
                self.staged = None;
                Some(word)
            }
            _ => {
                self.flush(buf);
                None
            }
        }
    }

    fn load_imm(&mut self, buf: &mut CodeBuffer, rd: u8, value: i64) {
        let v = value as i32;
        if (-4096..4096).contains(&v) {
            self.put_ins(buf, enc_f3_imm(2, rd, OP3_OR, G0, v), true);
        } else {
            self.put_ins(buf, enc_sethi(rd, (v as u32) >> 10), true);
            if v as u32 & 0x3ff != 0 {
                self.put_ins(
                    buf,
                    enc_f3_imm(2, rd, OP3_OR, rd, (v as u32 & 0x3ff) as i32),
                    true,
                );
            }
        }
    }

    fn mov_rr(&mut self, buf: &mut CodeBuffer, rd: u8, rs: u8) {
        self.put_ins(buf, enc_f3(2, rd, OP3_OR, G0, rs), true);
    }

    fn lower_base(
        &mut self,
        buf: &mut CodeBuffer,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<(u8, i64)> {
        let bias = if m.base == Some(crate::operand::sp()) {
            i64::from(RESERVED)
        } else {
            0
        };
        match (m.base, m.index) {
            (None, None) => {
                self.load_imm(buf, scratch, m.disp);
                Ok((scratch, 0))
            }
            (Some(base), None) => Ok((self.hw(base), m.disp + bias)),
            (base, Some((index, shift))) => {
                let idx = self.hw(index);
                let folded = if shift != 0 {
                    self.put_ins(
                        buf,
                        enc_f3_imm(2, scratch, OP3_SLL, idx, i32::from(shift)),
                        true,
                    );
                    scratch
                } else {
                    idx
                };
                match base {
                    Some(b) => {
                        self.put_ins(buf, enc_f3(2, scratch, OP3_ADD, self.hw(b), folded), true);
                        Ok((scratch, m.disp + bias))
                    }
                    None => Ok((folded, m.disp)),
                }
            }
        }
    }

    /// Memory access; op=3 format with simm13 or register offset.
    fn ldst(
        &mut self,
        buf: &mut CodeBuffer,
        op3: u32,
        rt: u8,
        scratch: u8,
        m: &Mem,
    ) -> CodegenResult<()> {
        let (base, disp) = self.lower_base(buf, scratch, m)?;
        // Loads and stores never fill delay slots here: the staging
        // temporaries may alias the address math.
        if (-4096..4096).contains(&disp) {
            self.put_ins(buf, enc_f3_imm(3, rt, op3, base, disp as i32), false);
        } else {
            self.load_imm(buf, TMP3, disp);
            self.put_ins(buf, enc_f3(3, rt, op3, base, TMP3), false);
        }
        Ok(())
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
                    self.put_ins(
                        buf,
                        enc_f3_imm(2, want, OP3_ADD, SPR, RESERVED as i32),
                        true,
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
                self.ldst(buf, OP3_LD, want, want, &m)?;
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
                let scratch = if work == TMP1 { TMP2 } else { TMP1 };
                self.ldst(buf, OP3_ST, work, scratch, &m)?;
            }
            Operand::Imm(_) => return Err(Error::BadArgument),
        }
        Ok(())
    }

    fn fhw(&self, r: FReg) -> u8 {
        r.index() * 2
    }

    fn fldst(&mut self, buf: &mut CodeBuffer, load: bool, frt: u8, m: &Mem) -> CodegenResult<()> {
        let op3 = if load { OP3_LDDF } else { OP3_STDF };
        self.ldst(buf, op3, frt, TMP1, m)
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

    /// FPop (op=2, op3=0x34) double-precision operation.
    fn fpop(&mut self, buf: &mut CodeBuffer, rd: u8, rs1: u8, opf: u32, rs2: u8) {
        self.put_ins(
            buf,
            (2 << 30) | (u32::from(rd) << 25) | (0x34 << 19) | (u32::from(rs1) << 14) | (opf << 5) | u32::from(rs2),
            false,
        );
    }

    fn frame_size(&self, abi: &AbiProfile) -> u32 {
        (RESERVED + abi.local_size + 7) & !7
    }
}

impl Backend for SparcBackend {
    fn arch(&self) -> Arch {
        Arch::Sparc32
    }

    fn limits(&self) -> IsaLimits {
        IsaLimits {
            scratches_max: 4,
            saveds_max: 4,
            fscratches_max: 4,
            // %f registers are not preserved by the register window.
            fsaveds_max: 0,
        }
    }

    fn enter(&mut self, buf: &mut CodeBuffer, abi: &AbiProfile) -> CodegenResult<()> {
        // save %sp, -frame, %sp: the window gives us fresh %l/%o registers
        // and the arguments arrive in %i0..%i2 where s0..s2 live.
        let frame = self.frame_size(abi);
        if frame < 4096 {
            self.put_ins(buf, enc_f3_imm(2, SPR, OP3_SAVE, SPR, -(frame as i32)), false);
        } else {
            // sethi/or into %g1, then save with a register operand.
            self.load_imm(buf, TMP1, -i64::from(frame));
            self.put_ins(buf, enc_f3(2, SPR, OP3_SAVE, SPR, TMP1), false);
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
        let _ = abi;
        if let Some((op, src)) = value {
            // The caller sees the window-rotated %o0.
            self.op1(buf, op, Mods::new(), Some(Operand::Reg(crate::operand::r(0))), src)?;
        }
        // The return value computed into %o0 must survive the window
        // rotation: move it to %i0 before restore.
        if value.is_some() {
            self.mov_rr(buf, 24, 8);
        }
        self.flush(buf);
        // jmpl %i7+8, %g0 ; restore
        buf.put4_be(enc_f3_imm(2, G0, OP3_JMPL, I7, 8));
        buf.put4_be(enc_f3(2, G0, OP3_RESTORE, G0, G0));
        Ok(())
    }

    fn op0(&mut self, buf: &mut CodeBuffer, op: Op0) -> CodegenResult<()> {
        match op {
            Op0::Nop => self.put_ins(buf, NOP, true),
            Op0::Breakpoint => self.put_ins(buf, 0x91d0_2001, false), // ta 1
            Op0::LMulUw | Op0::LMulSw => {
                let op3 = if op == Op0::LMulUw { OP3_UMUL } else { OP3_SMUL };
                let (a, b) = (MAP[0], MAP[1]);
                // xmul lo -> %g1, %y holds the high half.
                self.put_ins(buf, enc_f3(2, TMP1, op3, a, b), false);
                self.put_ins(buf, enc_f3(2, b, OP3_RDY, G0, G0), false);
                self.mov_rr(buf, a, TMP1);
            }
            Op0::DivmodUw | Op0::DivmodSw => {
                let (a, b) = (MAP[0], MAP[1]);
                if op == Op0::DivmodUw {
                    // wr %g0, %y
                    self.put_ins(buf, enc_f3(2, 0, OP3_WRY, G0, G0), false);
                } else {
                    // %y = sign extension of the dividend.
                    self.put_ins(buf, enc_f3_imm(2, TMP1, OP3_SRA, a, 31), false);
                    self.put_ins(buf, enc_f3(2, 0, OP3_WRY, TMP1, G0), false);
                }
                let div = if op == Op0::DivmodUw { OP3_UDIV } else { OP3_SDIV };
                let mul = if op == Op0::DivmodUw { OP3_UMUL } else { OP3_SMUL };
                self.put_ins(buf, enc_f3(2, TMP1, div, a, b), false);
                self.put_ins(buf, enc_f3(2, TMP2, mul, TMP1, b), false);
                self.put_ins(buf, enc_f3(2, b, OP3_SUB, a, TMP2), false);
                self.mov_rr(buf, a, TMP1);
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
                (Operand::Reg(d), _) => {
                    let d = self.hw(d);
                    let s = self.load_operand(buf, d, src)?;
                    if s != d {
                        self.mov_rr(buf, d, s);
                    }
                }
                (Operand::Mem(_), _) => {
                    let work = self.load_operand(buf, TMP1, src)?;
                    self.store_result(buf, work, dst)?;
                }
                (Operand::Imm(_), _) => return Err(Error::BadArgument),
            },
            Op1::MovU8 | Op1::MovS8 | Op1::MovU16 | Op1::MovS16 => {
                let (width, signed) = op.mov_width().unwrap();
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => TMP1,
                };
                match src {
                    Operand::Mem(m) => {
                        let op3 = match (width, signed) {
                            (1, false) => OP3_LDUB,
                            (1, true) => OP3_LDSB,
                            (2, false) => OP3_LDUH,
                            _ => OP3_LDSH,
                        };
                        self.ldst(buf, op3, work, TMP2, &m)?;
                    }
                    Operand::Reg(s) => {
                        // Shift up and back down.
                        let s = self.hw(s);
                        let sh = 32 - 8 * i32::from(width);
                        self.put_ins(buf, enc_f3_imm(2, work, OP3_SLL, s, sh), true);
                        let down = if signed { OP3_SRA } else { OP3_SRL };
                        self.put_ins(buf, enc_f3_imm(2, work, down, work, sh), true);
                    }
                    Operand::Imm(v) => {
                        let v = match (width, signed) {
                            (1, false) => (v as u8) as i64,
                            (1, true) => (v as i8) as i64,
                            (2, false) => (v as u16) as i64,
                            _ => (v as i16) as i64,
                        };
                        self.load_imm(buf, work, v);
                    }
                }
                if let Operand::Mem(dm) = dst {
                    let op3 = match width {
                        1 => OP3_STB,
                        _ => OP3_STH,
                    };
                    self.ldst(buf, op3, work, TMP2, &dm)?;
                }
            }
            Op1::Not | Op1::Neg => {
                let s = self.load_operand(buf, TMP1, src)?;
                let work = match dst {
                    Operand::Reg(d) => self.hw(d),
                    _ => TMP1,
                };
                let cc = if mods.sets_flags() { CC } else { 0 };
                if op == Op1::Not {
                    // xnor work, s, %g0
                    self.put_ins(buf, enc_f3(2, work, 0x07 | cc, s, G0), cc == 0);
                } else {
                    // sub %g0, s, work
                    self.put_ins(buf, enc_f3(2, work, OP3_SUB | cc, G0, s), cc == 0);
                }
                self.store_result(buf, work, dst)?;
            }
            Op1::Clz => {
                // V8 has no count-leading-zeros instruction.
                return Err(Error::Unsupported);
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
        let a = self.load_operand(buf, TMP1, src1)?;
        let work = match dst {
            Some(Operand::Reg(d)) => self.hw(d),
            _ => TMP1,
        };
        let rd = if dst.is_none() { G0 } else { work };
        let (op3, movable) = match op {
            Op2::Add => (OP3_ADD, !set),
            Op2::Addc => (OP3_ADDX, false),
            Op2::Sub => (OP3_SUB, !set),
            Op2::Subc => (OP3_SUBX, false),
            Op2::And => (OP3_AND, !set),
            Op2::Or => (OP3_OR, !set),
            Op2::Xor => (OP3_XOR, !set),
            Op2::Shl => (OP3_SLL, true),
            Op2::Lshr => (OP3_SRL, true),
            Op2::Ashr => (OP3_SRA, true),
            Op2::Mul => (OP3_UMUL, false),
        };
        let shift_like = matches!(op, Op2::Shl | Op2::Lshr | Op2::Ashr);
        let cc = if set && !shift_like { CC } else { 0 };
        if op == Op2::Mul && mods.set_overflow {
            let b = self.load_operand(buf, TMP2, src2)?;
            // smul + compare the sign of %y with the result's sign. The
            // sign extraction must not alias the result register.
            self.put_ins(buf, enc_f3(2, rd, OP3_SMUL, a, b), false);
            self.put_ins(buf, enc_f3(2, TMP2, OP3_RDY, G0, G0), false);
            self.put_ins(buf, enc_f3_imm(2, TMP3, OP3_SRA, rd, 31), false);
            self.put_ins(buf, enc_f3(2, G0, OP3_SUB | CC, TMP2, TMP3), false);
            self.ov_from_z = true;
        } else {
            match src2 {
                Operand::Imm(v) if (-4096..4096).contains(&v) && !shift_like => {
                    self.put_ins(buf, enc_f3_imm(2, rd, op3 | cc, a, v as i32), movable);
                }
                Operand::Imm(v) if shift_like => {
                    self.put_ins(
                        buf,
                        enc_f3_imm(2, rd, op3, a, (v as i32) & 31),
                        true,
                    );
                    if set {
                        self.put_ins(buf, enc_f3(2, G0, OP3_OR | CC, G0, rd), false);
                    }
                }
                _ => {
                    let b = self.load_operand(buf, TMP2, src2)?;
                    self.put_ins(buf, enc_f3(2, rd, op3 | cc, a, b), movable);
                    if shift_like && set {
                        self.put_ins(buf, enc_f3(2, G0, OP3_OR | CC, G0, rd), false);
                    }
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
                        let (d, s) = (self.fhw(d), self.fhw(s));
                        // fmovs twice: V8 has no double move.
                        self.fpop_mov(buf, d, s);
                        self.fpop_mov(buf, d + 1, s + 1);
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
                let opf = if op == FOp1::Neg { 0x005 } else { 0x009 };
                // The sign lives in the even (high) single.
                self.fpop(buf, work, 0, opf, s);
                if work != s {
                    self.fpop_mov(buf, work + 1, s + 1);
                }
                if let FOperand::Mem(dm) = dst {
                    self.fldst(buf, false, work, &dm)?;
                }
            }
            FOp1::Cmp => {
                let a = self.load_fop(buf, FTMP, dst)?;
                let b = self.load_fop(buf, FTMP2, src)?;
                // fcmpd, then the mandated one-instruction gap.
                self.put_ins(
                    buf,
                    (2 << 30) | (0x35 << 19) | (u32::from(a) << 14) | (0x052 << 5) | u32::from(b),
                    false,
                );
                self.put_ins(buf, NOP, false);
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
        let opf = match op {
            FOp2::Add => 0x042,
            FOp2::Sub => 0x046,
            FOp2::Mul => 0x04a,
            FOp2::Div => 0x04e,
        };
        self.fpop(buf, work, a, opf, b);
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
        let cond = self.resolve_cond(cc);
        // Annulled-branch materialization: the set sits in the delay slot,
        // executed when the branch is taken and annulled when it is not.
        //   or %g0, 0, tmp
        //   b<cond>,a +2
        //   or %g0, 1, tmp   (delay)
        self.flush(buf);
        buf.put4_be(enc_f3_imm(2, TMP2, OP3_OR, G0, 0));
        buf.put4_be((cond << 25) | (1 << 29) | (0b010 << 22) | 2);
        buf.put4_be(enc_f3_imm(2, TMP2, OP3_OR, G0, 1));
        match op {
            FlagsOp::Mov => self.store_result(buf, TMP2, dst),
            FlagsOp::Or => {
                let cur = self.load_operand(buf, TMP1, dst)?;
                self.put_ins(buf, enc_f3(2, TMP2, OP3_OR, cur, TMP2), false);
                self.store_result(buf, TMP2, dst)
            }
        }
    }

    fn fast_enter(&mut self, buf: &mut CodeBuffer, dst: Operand) -> CodegenResult<()> {
        // The fast-call return address lives in %o7.
        self.store_result(buf, O7, dst)
    }

    fn fast_return(&mut self, buf: &mut CodeBuffer, src: Operand) -> CodegenResult<()> {
        let s = self.load_operand(buf, TMP1, src)?;
        self.flush(buf);
        // jmpl s+8, %g0 with a nop slot.
        buf.put4_be(enc_f3_imm(2, G0, OP3_JMPL, s, 8));
        buf.put4_be(NOP);
        Ok(())
    }

    fn add_no_flags(&mut self, buf: &mut CodeBuffer, reg: Reg, disp: i64) -> CodegenResult<()> {
        let r = self.hw(reg);
        if (-4096..4096).contains(&disp) {
            self.put_ins(buf, enc_f3_imm(2, r, OP3_ADD, r, disp as i32), true);
        } else {
            self.load_imm(buf, TMP1, disp);
            self.put_ins(buf, enc_f3(2, r, OP3_ADD, r, TMP1), true);
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
        let delay = self.take_movable(buf);
        let data = JumpData {
            kind,
            rewritable: ty.rewritable,
            target: JumpTarget::Unset,
            hint: 0,
            delay,
        };
        let reserved = *self.jump_encodings(&data).last().unwrap();
        Ok(buf.add_jump(data, reserved))
    }

    fn ijump(&mut self, buf: &mut CodeBuffer, ty: JumpType, src: Operand) -> CodegenResult<()> {
        if let Operand::Imm(target) = src {
            let delay = self.take_movable(buf);
            let data = JumpData {
                kind: ty.kind,
                rewritable: false,
                target: JumpTarget::Addr(target as u64),
                hint: 0,
                delay,
            };
            let reserved = *self.jump_encodings(&data).last().unwrap();
            buf.add_jump(data, reserved);
            return Ok(());
        }
        let s = self.load_operand(buf, TMP1, src)?;
        let link = matches!(ty.kind, JumpKind::Call(_) | JumpKind::FastCall);
        let rd = if link { O7 } else { G0 };
        self.flush(buf);
        buf.put4_be(enc_f3_imm(2, rd, OP3_JMPL, s, 0));
        buf.put4_be(NOP);
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
            _ => TMP1,
        };
        // Always the full sethi/or pair so the value stays patchable.
        self.flush(buf);
        buf.put4_be(enc_sethi(work, (init as u32) >> 10));
        buf.put4_be(enc_f3_imm(2, work, OP3_OR, work, (init as u32 & 0x3ff) as i32));
        let konst = buf.add_const(8);
        if let Operand::Mem(_) = dst {
            self.store_result(buf, work, dst)?;
        }
        Ok(konst)
    }

    // ---- layout ---------------------------------------------------------

    fn pre_label(&mut self, buf: &mut CodeBuffer) {
        // A staged instruction must not drift past a label.
        self.flush(buf);
    }

    fn before_layout(&mut self, buf: &mut CodeBuffer) -> CodegenResult<()> {
        self.flush(buf);
        Ok(())
    }

    fn jump_encodings(&self, jump: &JumpData) -> &'static [u32] {
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            // Branch plus delay slot.
            &[8]
        } else {
            // sethi/or + jmpl + slot.
            &[16]
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
        let delay = jump.delay.unwrap_or(NOP);
        let label = matches!(jump.target, JumpTarget::Label(_));
        if label && !jump.rewritable {
            let target = target.unwrap();
            let disp = (i64::from(target) - i64::from(at)) / 4;
            let word = match jump.kind {
                JumpKind::Cond(cc) => {
                    (cond_bits(cc) << 25) | (0b010 << 22) | ((disp as u32) & 0x003f_ffff)
                }
                JumpKind::FCond(fc) => {
                    (fcond_bits(fc) << 25) | (0b110 << 22) | ((disp as u32) & 0x003f_ffff)
                }
                JumpKind::Jump => {
                    (0x8 << 25) | (0b010 << 22) | ((disp as u32) & 0x003f_ffff)
                }
                JumpKind::Call(_) | JumpKind::FastCall => {
                    (1 << 30) | (((disp as u32) & 0x3fff_ffff))
                }
            };
            sink.put4_be(word);
            sink.put4_be(delay);
            return at;
        }

        // sethi/or the absolute target, jmpl, delay.
        let fix = match jump.target {
            JumpTarget::Label(_) => FixTarget::Offset(target.unwrap()),
            JumpTarget::Addr(a) => FixTarget::Addr(a),
            JumpTarget::Unset => FixTarget::Addr(0),
        };
        sink.fixup(FixupKind::SparcHiLo, fix);
        let value = match fix {
            FixTarget::Addr(a) => a as u32,
            _ => 0,
        };
        sink.put4_be(enc_sethi(TMP1, value >> 10));
        sink.put4_be(enc_f3_imm(2, TMP1, OP3_OR, TMP1, (value & 0x3ff) as i32));
        let link = matches!(jump.kind, JumpKind::Call(_) | JumpKind::FastCall);
        let rd = if link { O7 } else { G0 };
        sink.put4_be(enc_f3_imm(2, rd, OP3_JMPL, TMP1, 0));
        sink.put4_be(delay);
        let _ = size;
        at
    }

    fn pad_to(&self, target: CodeOffset, sink: &mut CodeSink) {
        while sink.cur_offset() < target {
            sink.put4_be(NOP);
        }
    }
}

impl SparcBackend {
    fn resolve_cond(&self, cc: CondCode) -> u32 {
        if self.ov_from_z {
            match cc {
                CondCode::Overflow => return cond_bits(CondCode::NotEqual),
                CondCode::NotOverflow => return cond_bits(CondCode::Equal),
                _ => {}
            }
        }
        cond_bits(cc)
    }

    fn fpop_mov(&mut self, buf: &mut CodeBuffer, rd: u8, rs2: u8) {
        self.fpop(buf, rd, 0, 0x001, rs2);
    }
}

/// Rewrite a `sethi`/`or` pair in place (big-endian words).
pub(crate) fn patch_hi_lo(code: &mut [u8], value: u32) {
    let mut w0 = u32::from_be_bytes(code[0..4].try_into().unwrap());
    w0 = (w0 & 0xffc0_0000) | (value >> 10);
    code[0..4].copy_from_slice(&w0.to_be_bytes());
    let mut w1 = u32::from_be_bytes(code[4..8].try_into().unwrap());
    w1 = (w1 & 0xffff_e000) | (1 << 13) | (value & 0x3ff);
    code[4..8].copy_from_slice(&w1.to_be_bytes());
}

#[cfg(test)]
mod emit_tests {
    use super::*;
    use crate::operand::{r, s};

    fn emit(f: impl FnOnce(&mut SparcBackend, &mut CodeBuffer)) -> Vec<u32> {
        let mut backend = SparcBackend::new();
        let mut buf = CodeBuffer::new();
        f(&mut backend, &mut buf);
        let image = buf.finalize(&mut backend).unwrap();
        image
            .code()
            .chunks(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
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
        // or %g0, %o1, %o0 ; add %o0, %o1, %o0
        assert_eq!(
            words,
            vec![enc_f3(2, 8, OP3_OR, 0, 9), enc_f3(2, 8, OP3_ADD, 8, 9)]
        );
    }

    #[test]
    fn locals_bias() {
        let words = emit(|b, buf| {
            b.op1(
                buf,
                Op1::Mov,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Mem(Mem::base(crate::operand::sp(), 4)),
            )
            .unwrap();
        });
        // ld [%sp + 100], %o0
        assert_eq!(words, vec![enc_f3_imm(3, 8, OP3_LD, SPR, 100)]);
    }

    #[test]
    fn branch_gets_delay_slot_filled() {
        let mut backend = SparcBackend::new();
        let mut buf = CodeBuffer::new();
        // A movable add, then a branch: the add must land in the slot.
        backend
            .op2(
                &mut buf,
                Op2::Add,
                Mods::new(),
                Some(Operand::Reg(r(0))),
                Operand::Reg(r(0)),
                Operand::Imm(1),
            )
            .unwrap();
        let j = backend.jump(&mut buf, JumpType::jump()).unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        let words: Vec<u32> = image
            .code()
            .chunks(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        // ba +2 ; add %o0, 1, %o0 (hoisted into the slot)
        assert_eq!(words.len(), 2);
        assert_eq!(words[0] >> 22, (0x8 << 3) | 0b010);
        assert_eq!(words[1], enc_f3_imm(2, 8, OP3_ADD, 8, 1));
    }

    #[test]
    fn cmp_branch_keeps_nop_slot() {
        let mut backend = SparcBackend::new();
        let mut buf = CodeBuffer::new();
        let mut mods = Mods::new();
        mods.cmp = Some(CondCode::Equal);
        mods.set_z = true;
        backend
            .op2(
                &mut buf,
                Op2::Sub,
                mods,
                None,
                Operand::Reg(r(0)),
                Operand::Reg(s(0)),
            )
            .unwrap();
        let j = backend
            .jump(&mut buf, JumpType::cond(CondCode::Equal))
            .unwrap();
        let l = buf.emit_label();
        buf.jump_data_mut(j).target = JumpTarget::Label(l);
        let image = buf.finalize(&mut backend).unwrap();
        let words: Vec<u32> = image
            .code()
            .chunks(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        // subcc (unmovable) ; be ; nop
        assert_eq!(words.len(), 3);
        assert_eq!(words[0], enc_f3(2, 0, OP3_SUB | CC, 8, 24));
        assert_eq!(words[2], NOP);
    }

    #[test]
    fn const_is_sethi_or() {
        let words = emit(|b, buf| {
            b.const_(buf, Some(Operand::Reg(r(0))), 0x12345678).unwrap();
        });
        assert_eq!(words[0], enc_sethi(8, 0x12345678 >> 10));
        assert_eq!(
            words[1],
            enc_f3_imm(2, 8, OP3_OR, 8, (0x12345678u32 & 0x3ff) as i32)
        );
    }
}
